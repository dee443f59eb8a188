//! Cursors over the tree
//!
//! An iterator is prepared with a fixed mode, direction and filter, then
//! positioned with [`EvtIter::probe`]. The sequence it walks is taken when it
//! is probed; the iterator borrows the tree mutably, so the only changes it
//! can observe are its own deletes.
//!
//! Positions can be saved as [`Anchor`]s and restored by a later iterator,
//! even across other mutations of the tree.

use tracing::trace;

use crate::error::{EvtError, Result};
use crate::interval::{EvtFilter, Extent, Rect};
use crate::storage::ExtentRecord;
use crate::tree::{EvTree, EvtEntry};

/// Walk raw records in tree order
pub const EVT_ITER_EMBEDDED: u32 = 1 << 0;
/// Walk visible sub-ranges sorted by offset
pub const EVT_ITER_VISIBLE: u32 = 1 << 1;
/// Walk covered sub-ranges in tree order
pub const EVT_ITER_COVERED: u32 = 1 << 2;
/// With `VISIBLE`, leave out punched ranges
pub const EVT_ITER_SKIP_HOLES: u32 = 1 << 3;
/// Walk backwards
pub const EVT_ITER_REVERSE: u32 = 1 << 4;

const EVT_ITER_ALL: u32 =
    EVT_ITER_EMBEDDED | EVT_ITER_VISIBLE | EVT_ITER_COVERED | EVT_ITER_SKIP_HOLES | EVT_ITER_REVERSE;

/// What an iterator walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationMode {
    /// Raw records, unresolved
    Embedded,
    /// Authoritative sub-ranges
    Visible {
        /// Leave out punched ranges
        skip_holes: bool,
    },
    /// Shadowed sub-ranges
    Covered,
}

/// Order of iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Tree order, or offset order for visible entries
    Forward,
    /// The reverse of `Forward`
    Reverse,
}

/// Mode and direction of an iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterOptions {
    /// What to walk
    pub mode: IterationMode,
    /// Which way
    pub direction: Direction,
}

impl IterOptions {
    /// Options from their parts
    pub fn new(mode: IterationMode, direction: Direction) -> Self {
        Self { mode, direction }
    }

    /// Decode an `EVT_ITER_*` bitmask
    pub fn from_flags(flags: u32) -> Result<Self> {
        let bad = |why: &str| EvtError::InvalidArgument(format!("iterator flags {:#x}: {}", flags, why));

        if flags & !EVT_ITER_ALL != 0 {
            return Err(bad("unknown bits"));
        }
        let embedded = flags & EVT_ITER_EMBEDDED != 0;
        let visible = flags & EVT_ITER_VISIBLE != 0;
        let covered = flags & EVT_ITER_COVERED != 0;
        let skip_holes = flags & EVT_ITER_SKIP_HOLES != 0;

        if visible && covered {
            return Err(bad("visible and covered are exclusive"));
        }
        if embedded && (visible || covered) {
            return Err(bad("embedded excludes visibility modes"));
        }
        if skip_holes && !visible {
            return Err(bad("skip holes requires visible"));
        }

        let mode = if visible {
            IterationMode::Visible { skip_holes }
        } else if covered {
            IterationMode::Covered
        } else {
            IterationMode::Embedded
        };
        let direction = if flags & EVT_ITER_REVERSE != 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        Ok(Self { mode, direction })
    }

    /// Encode as an `EVT_ITER_*` bitmask
    pub fn to_flags(&self) -> u32 {
        let mode = match self.mode {
            IterationMode::Embedded => EVT_ITER_EMBEDDED,
            IterationMode::Visible { skip_holes: false } => EVT_ITER_VISIBLE,
            IterationMode::Visible { skip_holes: true } => EVT_ITER_VISIBLE | EVT_ITER_SKIP_HOLES,
            IterationMode::Covered => EVT_ITER_COVERED,
        };
        match self.direction {
            Direction::Forward => mode,
            Direction::Reverse => mode | EVT_ITER_REVERSE,
        }
    }
}

impl Default for IterOptions {
    fn default() -> Self {
        Self::new(IterationMode::Embedded, Direction::Forward)
    }
}

/// Saved iterator position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Anchor {
    /// Key of the record the entry came from
    pub rect: Rect,
    /// Sub-range of that record
    pub selected: Extent,
    /// Tree generation when the anchor was taken
    pub generation: u64,
    /// Position in the iteration sequence, trusted while the generation matches
    pub hint: usize,
}

impl Anchor {
    fn matches(&self, entry: &EvtEntry) -> bool {
        entry.full == self.rect && entry.selected == self.selected
    }
}

/// Where to position an iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// First entry in iteration order
    First,
    /// Last entry in iteration order
    Last,
    /// First entry of the record stored under this key
    Exact(Rect),
    /// A saved position
    Anchor(Anchor),
}

/// Cursor over a tree
pub struct EvtIter<'t> {
    tree: &'t mut EvTree,
    options: IterOptions,
    filter: EvtFilter,
    entries: Vec<EvtEntry>,
    /// `None` until probed; `Some(len)` once exhausted
    pos: Option<usize>,
}

impl<'t> EvtIter<'t> {
    /// Bind an iterator to an open tree
    pub fn prepare(tree: &'t mut EvTree, options: IterOptions, filter: EvtFilter) -> Result<Self> {
        tree.generation()?;
        filter.validate()?;
        Ok(Self {
            tree,
            options,
            filter,
            entries: Vec::new(),
            pos: None,
        })
    }

    /// Options the iterator was prepared with
    pub fn options(&self) -> IterOptions {
        self.options
    }

    /// Position the cursor, loading the sequence to walk
    pub fn probe(&mut self, probe: Probe) -> Result<()> {
        let mut entries = self.tree.gather(&self.options.mode, &self.filter)?;
        if self.options.direction == Direction::Reverse {
            entries.reverse();
        }
        self.entries = entries;
        self.pos = None;

        if self.entries.is_empty() {
            return Err(EvtError::NotFound);
        }

        let pos = match probe {
            Probe::First => 0,
            Probe::Last => self.entries.len() - 1,
            Probe::Exact(rect) => self
                .entries
                .iter()
                .position(|e| e.full == rect)
                .ok_or(EvtError::NotFound)?,
            Probe::Anchor(anchor) => self.locate(&anchor)?,
        };
        trace!(pos, len = self.entries.len(), "probed");
        self.pos = Some(pos);
        Ok(())
    }

    fn locate(&self, anchor: &Anchor) -> Result<usize> {
        let generation = self.tree.generation()?;
        if anchor.generation == generation {
            if let Some(entry) = self.entries.get(anchor.hint) {
                if anchor.matches(entry) {
                    return Ok(anchor.hint);
                }
            }
        }
        trace!(%anchor.rect, "anchor is stale, searching by key");
        self.entries
            .iter()
            .position(|e| anchor.matches(e))
            .ok_or(EvtError::NotFound)
    }

    fn current(&self) -> Result<usize> {
        match self.pos {
            Some(pos) if pos < self.entries.len() => Ok(pos),
            _ => Err(EvtError::EndOfSequence),
        }
    }

    /// Entry under the cursor, its bytes per index, and an anchor for it
    pub fn fetch(&self) -> Result<(EvtEntry, u32, Anchor)> {
        let pos = self.current()?;
        let entry = self.entries[pos];
        let anchor = Anchor {
            rect: entry.full,
            selected: entry.selected,
            generation: self.tree.generation()?,
            hint: pos,
        };
        Ok((entry, entry.inob, anchor))
    }

    /// Step in iteration order
    pub fn next(&mut self) -> Result<()> {
        let pos = self.current()?;
        if pos + 1 >= self.entries.len() {
            self.pos = Some(self.entries.len());
            return Err(EvtError::EndOfSequence);
        }
        self.pos = Some(pos + 1);
        Ok(())
    }

    /// Step back; only reverse iterators can
    pub fn prev(&mut self) -> Result<()> {
        if self.options.direction != Direction::Reverse {
            return Err(EvtError::InvalidOperation("prev requires a reverse iterator"));
        }
        match self.pos {
            None => Err(EvtError::EndOfSequence),
            Some(0) => Err(EvtError::EndOfSequence),
            Some(pos) => {
                self.pos = Some(pos.min(self.entries.len()) - 1);
                Ok(())
            }
        }
    }

    /// Remove the record under the cursor from the tree and hand it to the
    /// caller. The cursor moves to the following entry.
    pub fn delete(&mut self) -> Result<ExtentRecord> {
        if self.options.mode != IterationMode::Embedded {
            return Err(EvtError::InvalidOperation("delete requires embedded iteration"));
        }
        let pos = self.current()?;
        let record = self.tree.delete(&self.entries[pos].full)?;
        self.entries.remove(pos);
        Ok(record)
    }

    /// Collect every entry from the cursor to the end, probing `First` if
    /// the iterator is not positioned yet. Leaves the cursor exhausted.
    pub fn drain_entries(&mut self) -> Result<Vec<EvtEntry>> {
        if self.pos.is_none() {
            match self.probe(Probe::First) {
                Ok(()) => {}
                Err(EvtError::NotFound) => return Ok(Vec::new()),
                Err(err) => return Err(err),
            }
        }
        let mut out = Vec::new();
        loop {
            match self.fetch() {
                Ok((entry, _, _)) => out.push(entry),
                Err(EvtError::EndOfSequence) => return Ok(out),
                Err(err) => return Err(err),
            }
            match self.next() {
                Ok(()) => {}
                Err(EvtError::EndOfSequence) => return Ok(out),
                Err(err) => return Err(err),
            }
        }
    }

    /// End the iteration
    pub fn finish(self) {}
}
