//! evtree command-line driver
//!
//! Runs a script of positional commands against one tree backed by an
//! in-memory pool, printing what each command returns.
//!
//! Example:
//!   evtree create:4 add:0-0@1:a add:1-2@2:bc list:visible find:0-2@2

use std::sync::Arc;

use clap::Parser;
use evtree::iter::{
    IterOptions, Probe, EVT_ITER_COVERED, EVT_ITER_EMBEDDED, EVT_ITER_REVERSE, EVT_ITER_SKIP_HOLES,
    EVT_ITER_VISIBLE,
};
use evtree::{
    Allocator, EntryIn, EvTree, EvtConfig, EvtError, EvtFilter, EvtIter, EvtRoot, Extent, FreeCallback,
    ImmediateFree, MemPool, Rect, Result,
};
use tracing::{debug, Level};

/// Largest write a single `add` accepts
const MAX_ADD_BYTES: u64 = 1 << 20;

#[derive(Parser)]
#[command(name = "evtree")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a versioned extent tree from a command script")]
#[command(long_about = "evtree - Versioned Extent Tree driver\n\n\
    Commands run in order against one in-memory tree:\n\
      create[:order]                    create a tree (default order 16)\n\
      open | close | destroy            reopen, close or destroy it\n\
      add:lo-hi@epoch[.minor][:value]   write value (repeated to fill), punch if no value\n\
      delete:lo-hi@epoch[.minor]        remove one record\n\
      remove:lo-hi@epr_lo-epr_hi        remove every overlapping record\n\
      aggregate:lo-hi@epr_lo-epr_hi     drop fully covered records\n\
      find:lo-hi@epoch                  print visible entries\n\
      list[:flag,...]                   iterate; flags embedded visible covered skip reverse\n\
      max:epoch                         highest live offset\n\
      debug:level                       node dump verbosity after mutations\n\
      dump[:level]                      print the tree\n\n\
    Example:\n\
      evtree create:4 add:0-0@1:a add:1-2@2:bc list:visible find:0-2@2")]
struct Cli {
    /// Log level for diagnostics on stderr
    #[arg(short, long, value_name = "LEVEL")]
    debug: Option<Level>,

    /// Capacity of the in-memory pool in bytes
    #[arg(long, default_value_t = 64 << 20, value_name = "BYTES")]
    pool_size: u64,

    /// Commands to run
    #[arg(required = true, value_name = "COMMAND")]
    commands: Vec<String>,
}

/// State carried between commands
struct Driver {
    pool: Arc<MemPool>,
    free_cb: Arc<dyn FreeCallback>,
    tree: Option<EvTree>,
    /// Root of the last closed tree
    closed: Option<EvtRoot>,
}

impl Driver {
    fn new(pool_size: u64) -> Self {
        Self {
            pool: Arc::new(MemPool::with_capacity(pool_size)),
            free_cb: Arc::new(ImmediateFree),
            tree: None,
            closed: None,
        }
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.pool.clone()
    }

    fn tree(&mut self) -> Result<&mut EvTree> {
        self.tree.as_mut().ok_or(EvtError::InvalidHandle)
    }

    fn run(&mut self, command: &str) -> Result<()> {
        let (name, arg) = match command.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (command, None),
        };
        debug!(command, "running");

        match name {
            "create" => self.create(arg),
            "open" => self.open(),
            "close" => {
                let root = self.tree()?.close()?;
                self.tree = None;
                self.closed = Some(root);
                println!("closed");
                Ok(())
            }
            "destroy" => {
                self.tree()?.destroy()?;
                self.tree = None;
                println!("destroyed, {} bytes still allocated", self.pool.used());
                Ok(())
            }
            "add" => self.add(required(name, arg)?),
            "delete" => {
                let rect: Rect = required(name, arg)?.parse()?;
                let alloc = self.allocator();
                let cb = self.free_cb.clone();
                let record = self.tree()?.delete(&rect)?;
                record.free(&*alloc, &*cb)?;
                println!("deleted {}", rect);
                Ok(())
            }
            "remove" => {
                let (extent, epr_lo, epr_hi) = parse_epoch_range(required(name, arg)?)?;
                let removed = self.tree()?.remove_all(extent, epr_lo, epr_hi)?;
                println!("removed {} records", removed);
                Ok(())
            }
            "aggregate" => {
                let (extent, epr_lo, epr_hi) = parse_epoch_range(required(name, arg)?)?;
                let removed = self.tree()?.aggregate(extent, epr_lo, epr_hi)?;
                println!("aggregated {} records", removed);
                Ok(())
            }
            "find" => {
                let rect: Rect = required(name, arg)?.parse()?;
                let filter = EvtFilter::new(rect.ex_lo, rect.ex_hi, rect.epoch);
                let entries = self.tree()?.find(&filter)?;
                println!("find {}: {} entries", rect, entries.len());
                for entry in &entries {
                    println!("  {}", entry);
                }
                Ok(())
            }
            "list" => self.list(arg),
            "max" => {
                let epoch = parse_num(required(name, arg)?)?;
                match self.tree()?.max_offset(epoch) {
                    Ok(offset) => println!("max offset @{}: {}", epoch, offset),
                    Err(EvtError::NotFound) => println!("max offset @{}: none", epoch),
                    Err(err) => return Err(err),
                }
                Ok(())
            }
            "debug" => {
                let level = required(name, arg)?
                    .parse::<i32>()
                    .map_err(|_| EvtError::InvalidArgument(format!("bad debug level in '{}'", command)))?;
                self.tree()?.set_debug(Some(level));
                Ok(())
            }
            "dump" => {
                let level = match arg {
                    Some(arg) => arg
                        .parse::<i32>()
                        .map_err(|_| EvtError::InvalidArgument(format!("bad dump level in '{}'", command)))?,
                    None => -2,
                };
                print!("{}", self.tree()?.debug_dump(level)?);
                Ok(())
            }
            _ => Err(EvtError::InvalidArgument(format!("unknown command '{}'", command))),
        }
    }

    fn create(&mut self, arg: Option<&str>) -> Result<()> {
        if self.tree.is_some() {
            return Err(EvtError::InvalidOperation("a tree is already open"));
        }
        let config = match arg {
            Some(order) => EvtConfig::with_order(
                order
                    .parse()
                    .map_err(|_| EvtError::InvalidArgument(format!("bad order '{}'", order)))?,
            ),
            None => EvtConfig::default(),
        };
        let order = config.order;
        self.tree = Some(EvTree::create(config, self.allocator(), self.free_cb.clone())?);
        self.closed = None;
        println!("created tree of order {}", order);
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        if self.tree.is_some() {
            return Err(EvtError::InvalidOperation("a tree is already open"));
        }
        let root = self.closed.take().ok_or(EvtError::InvalidHandle)?;
        let tree = EvTree::open(root, self.allocator(), self.free_cb.clone())?;
        println!("opened tree with {} records", tree.len()?);
        self.tree = Some(tree);
        Ok(())
    }

    fn add(&mut self, arg: &str) -> Result<()> {
        let (rect, value) = match arg.split_once(':') {
            Some((rect, value)) => (rect.parse::<Rect>()?, Some(value)),
            None => (arg.parse::<Rect>()?, None),
        };

        let outcome = match value {
            None => self.tree()?.insert(EntryIn::punch(rect))?,
            Some(value) => {
                if value.is_empty() || rect.width() > MAX_ADD_BYTES {
                    return Err(EvtError::InvalidArgument(format!("cannot write '{}' to {}", value, rect)));
                }
                let bytes: Vec<u8> = value.bytes().cycle().take(rect.width() as usize).collect();
                self.tree()?.insert(EntryIn::data(rect, 1, &bytes))?
            }
        };
        println!("added {} ({:?})", rect, outcome);
        Ok(())
    }

    fn list(&mut self, arg: Option<&str>) -> Result<()> {
        let mut flags = 0;
        for flag in arg.into_iter().flat_map(|a| a.split(',')).filter(|f| !f.is_empty()) {
            flags |= match flag {
                "embedded" => EVT_ITER_EMBEDDED,
                "visible" => EVT_ITER_VISIBLE,
                "covered" => EVT_ITER_COVERED,
                "skip" => EVT_ITER_SKIP_HOLES,
                "reverse" => EVT_ITER_REVERSE,
                _ => return Err(EvtError::InvalidArgument(format!("unknown list flag '{}'", flag))),
            };
        }
        let options = IterOptions::from_flags(flags)?;
        let alloc = self.allocator();
        let mut iter = EvtIter::prepare(self.tree()?, options, EvtFilter::all())?;

        match iter.probe(Probe::First) {
            Ok(()) => {}
            Err(err) if err.is_end() => {
                println!("list: empty");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let mut count = 0;
        loop {
            let (entry, _, _) = iter.fetch()?;
            if entry.is_punch() {
                println!("  {}", entry);
            } else {
                let bytes = alloc.read(entry.phys.addr(), entry.payload_size())?;
                println!("  {} '{}'", entry, String::from_utf8_lossy(&bytes));
            }
            count += 1;
            match iter.next() {
                Ok(()) => {}
                Err(err) if err.is_end() => break,
                Err(err) => return Err(err),
            }
        }
        iter.finish();
        println!("list: {} entries", count);
        Ok(())
    }
}

fn required<'a>(name: &str, arg: Option<&'a str>) -> Result<&'a str> {
    arg.filter(|a| !a.is_empty())
        .ok_or_else(|| EvtError::InvalidArgument(format!("'{}' needs an argument", name)))
}

fn parse_num(s: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| EvtError::InvalidArgument(format!("'{}' is not a number", s)))
}

/// Parse `lo-hi@epr_lo-epr_hi`
fn parse_epoch_range(s: &str) -> Result<(Extent, u64, u64)> {
    let bad = || EvtError::InvalidArgument(format!("malformed range '{}'", s));
    let (range, epochs) = s.split_once('@').ok_or_else(bad)?;
    let (lo, hi) = range.split_once('-').ok_or_else(bad)?;
    let (epr_lo, epr_hi) = epochs.split_once('-').ok_or_else(bad)?;
    let extent = Extent::new(parse_num(lo)?, parse_num(hi)?);
    if !extent.is_valid() {
        return Err(bad());
    }
    Ok((extent, parse_num(epr_lo)?, parse_num(epr_hi)?))
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.debug.unwrap_or(Level::WARN))
        .with_writer(std::io::stderr)
        .init();

    let mut driver = Driver::new(cli.pool_size);
    for command in &cli.commands {
        if let Err(err) = driver.run(command) {
            eprintln!("Error: {}: {}", command, err);
            std::process::exit(1);
        }
    }
}
