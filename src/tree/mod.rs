//! Tree module for evtree
//!
//! [`EvTree`] is the handle callers work with. It owns the persisted root
//! while open, applies the insert policy (duplicates, punches, in-place
//! replacement), reserves space before mutating so a failed insert leaves no
//! trace, and runs the resolver for visibility queries.

pub mod entry;
pub mod node;
pub mod root;

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::EvtConfig;
use crate::error::{EvtError, Result};
use crate::interval::{classify, EvtFilter, Extent, RangeOverlap, Rect, TimeOverlap, EPOCH_MAX};
use crate::iter::IterationMode;
use crate::resolve::{Candidate, Resolution, Resolver};
use crate::storage::{Allocator, DataRef, ExtentRecord, FreeCallback};
use root::Reservations;

pub use entry::{coalesce, EntryIn, EvtEntry, InsertOutcome, Visibility};
pub use node::{node_size, NodeId};
pub use root::{EvtRoot, RootState, EVT_MAGIC, EVT_MAX_DEPTH};

/// Largest buffer `read_extent` will assemble
pub const MAX_READ_BYTES: u64 = 1 << 30;

/// Handle to an open versioned extent tree
///
/// Once closed or destroyed every operation fails with `InvalidHandle`.
pub struct EvTree {
    root: Option<EvtRoot>,
    config: EvtConfig,
    alloc: Arc<dyn Allocator>,
    free_cb: Arc<dyn FreeCallback>,
    resolver: Mutex<Resolver>,
}

impl EvTree {
    /// Create an empty tree
    pub fn create(
        config: EvtConfig,
        alloc: Arc<dyn Allocator>,
        free_cb: Arc<dyn FreeCallback>,
    ) -> Result<Self> {
        config.validate()?;
        debug!(order = config.order, feats = config.feats, "created tree");
        Ok(Self {
            root: Some(EvtRoot::new(&config)),
            config,
            alloc,
            free_cb,
            resolver: Mutex::new(Resolver::new()),
        })
    }

    /// Reopen a tree from the root handed out by [`EvTree::close`]
    pub fn open(
        root: EvtRoot,
        alloc: Arc<dyn Allocator>,
        free_cb: Arc<dyn FreeCallback>,
    ) -> Result<Self> {
        if let Err(err) = root.validate() {
            warn!(%err, "refusing to open root");
            return Err(err);
        }
        let config = EvtConfig {
            order: root.order,
            feats: root.feats,
            debug_level: None,
        };
        debug!(order = root.order, depth = root.depth, "opened tree");
        Ok(Self {
            root: Some(root),
            config,
            alloc,
            free_cb,
            resolver: Mutex::new(Resolver::new()),
        })
    }

    /// Hand back the persisted root; the handle becomes unusable
    pub fn close(&mut self) -> Result<EvtRoot> {
        let root = self.root.take().ok_or(EvtError::InvalidHandle)?;
        debug!(generation = root.generation, "closed tree");
        Ok(root)
    }

    /// Release every record and node; the handle becomes unusable
    pub fn destroy(&mut self) -> Result<()> {
        let mut root = self.root.take().ok_or(EvtError::InvalidHandle)?;
        let released = root.release_all(&*self.alloc, &*self.free_cb)?;
        debug!(released, "destroyed tree");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.root.is_some()
    }

    fn root(&self) -> Result<&EvtRoot> {
        self.root.as_ref().ok_or(EvtError::InvalidHandle)
    }

    pub fn config(&self) -> &EvtConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.alloc
    }

    /// Dump verbosity applied after every mutation, `None` to disable
    pub fn set_debug(&mut self, level: Option<i32>) {
        self.config.debug_level = level;
    }

    pub fn order(&self) -> Result<u16> {
        Ok(self.root()?.order)
    }

    /// Node levels, zero while empty or holding a single record
    pub fn depth(&self) -> Result<u16> {
        Ok(self.root()?.depth)
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.root()?.generation)
    }

    /// Number of stored records
    pub fn len(&self) -> Result<usize> {
        self.root()?.record_count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root()?.is_empty())
    }

    /// True if any record is stored
    pub fn has_data(&self) -> Result<bool> {
        Ok(!self.root()?.is_empty())
    }

    /// Insert a record.
    ///
    /// All space the insert needs is reserved before the tree changes, so an
    /// `OutOfMemory` failure leaves the tree as it was.
    pub fn insert(&mut self, entry: EntryIn<'_>) -> Result<InsertOutcome> {
        let alloc = &*self.alloc;
        let root = self.root.as_mut().ok_or(EvtError::InvalidHandle)?;
        let rect = entry.rect;
        let punch = entry.data.is_hole();
        ExtentRecord::validate(&rect, entry.inob, &entry.data, entry.bound)?;

        let same_epoch = EvtFilter::with_epoch_range(rect.ex_lo, rect.ex_hi, rect.epoch, rect.epoch);
        let mut replace = false;
        for existing in root.collect(&same_epoch)? {
            match classify(&existing.rect, &rect) {
                (RangeOverlap::Same, Some(TimeOverlap::Same)) => {
                    if existing.is_punch() == punch {
                        warn!(%rect, "identical extent already present");
                        return Err(EvtError::Duplicate(rect));
                    }
                    replace = true;
                }
                (RangeOverlap::Included | RangeOverlap::Includes | RangeOverlap::Partial, Some(TimeOverlap::Same))
                    if !existing.is_punch() && !punch =>
                {
                    warn!(%rect, conflict = %existing.rect, "overlapping write at the same epoch");
                    return Err(EvtError::Duplicate(rect));
                }
                _ => {}
            }
        }

        if replace {
            let record = ExtentRecord::create(alloc, rect, entry.inob, entry.data, entry.version, entry.bound)?;
            let old = root.replace(record)?;
            root.bump();
            debug!(%rect, punch, "replaced in place");
            old.free(alloc, &*self.free_cb)?;
            self.after_mutation();
            return Ok(InsertOutcome::Inserted);
        }

        let needed = root.nodes_needed(&rect)?;
        let size = node_size(root.order);
        let record = ExtentRecord::create(alloc, rect, entry.inob, entry.data, entry.version, entry.bound)?;
        let mut reserved = Reservations::with_capacity(needed);
        for _ in 0..needed {
            match alloc.alloc(size) {
                Ok(addr) => reserved.push(addr),
                Err(err) => {
                    for addr in reserved {
                        alloc.free(addr, size);
                    }
                    // Adopted addresses stay with the caller
                    if matches!(entry.data, DataRef::Bytes(_)) {
                        alloc.free(record.phys.addr(), record.payload_size());
                    }
                    warn!(%rect, needed, "insert aborted: {}", err);
                    return Err(err);
                }
            }
        }

        let merged = Self::continues_neighbour(root, &record)?;
        root.insert_record(record, &mut reserved)?;
        for addr in reserved {
            alloc.free(addr, size);
        }
        root.bump();
        trace!(%rect, merged, "inserted");
        self.after_mutation();

        Ok(if merged {
            InsertOutcome::Merged
        } else {
            InsertOutcome::Inserted
        })
    }

    /// An older data record with the same `inob` ends where `record` starts
    /// (or starts where it ends), both in offset and in physical address
    fn continues_neighbour(root: &EvtRoot, record: &ExtentRecord) -> Result<bool> {
        if record.is_punch() {
            return Ok(false);
        }
        let r = record.rect;
        let addr = record.phys.addr().0;
        let around = EvtFilter::with_epoch_range(r.ex_lo.saturating_sub(1), r.ex_hi.saturating_add(1), 0, r.epoch);

        Ok(root.collect(&around)?.iter().any(|n| {
            if n.is_punch() || n.inob != record.inob || n.rect.is_newer_than(&r) {
                return false;
            }
            if !n.rect.extent().touches(&r.extent()) {
                return false;
            }
            let n_addr = n.phys.addr().0;
            if n.rect.ex_hi < r.ex_lo {
                n_addr.checked_add(n.payload_size()) == Some(addr)
            } else {
                addr.checked_add(record.payload_size()) == Some(n_addr)
            }
        }))
    }

    /// Remove the record whose extent is exactly that of `rect` and hand it
    /// to the caller, who becomes responsible for its payload.
    ///
    /// The stamp of `rect` only matters when several records share the
    /// extent; it must then match one of them.
    pub fn delete(&mut self, rect: &Rect) -> Result<ExtentRecord> {
        let alloc = &*self.alloc;
        let root = self.root.as_mut().ok_or(EvtError::InvalidHandle)?;
        if !rect.is_valid() {
            return Err(EvtError::InvalidArgument(format!("{} has lo > hi", rect)));
        }

        let key = {
            let same: Vec<Rect> = root
                .collect(&EvtFilter::with_epoch_range(rect.ex_lo, rect.ex_hi, 0, EPOCH_MAX))?
                .iter()
                .map(|r| r.rect)
                .filter(|r| r.same_extent(rect))
                .collect();
            match same.as_slice() {
                [] => return Err(EvtError::NotFound),
                [only] => *only,
                several => *several
                    .iter()
                    .find(|r| r.stamp() == rect.stamp())
                    .ok_or(EvtError::NotFound)?,
            }
        };

        let record = root.remove_record(&key, alloc)?;
        root.bump();
        trace!(rect = %key, "deleted");
        self.after_mutation();
        Ok(record)
    }

    /// Remove every record overlapping `extent` with an epoch in
    /// `epr_lo..=epr_hi`, releasing payloads through the free callback
    pub fn remove_all(&mut self, extent: Extent, epr_lo: u64, epr_hi: u64) -> Result<usize> {
        let filter = EvtFilter::with_epoch_range(extent.lo, extent.hi, epr_lo, epr_hi);
        filter.validate()?;
        let victims: Vec<Rect> = self.root()?.collect(&filter)?.iter().map(|r| r.rect).collect();

        let removed = self.discard(&victims)?;
        debug!(%extent, epr_lo, epr_hi, removed, "removed records");
        Ok(removed)
    }

    /// Discard records inside `extent` with an epoch in `epr_lo..=epr_hi`
    /// that are entirely covered as of `epr_hi`. Returns how many went.
    pub fn aggregate(&mut self, extent: Extent, epr_lo: u64, epr_hi: u64) -> Result<usize> {
        let filter = EvtFilter::with_epoch_range(extent.lo, extent.hi, 0, epr_hi);
        filter.validate()?;
        if epr_lo > epr_hi {
            return Err(EvtError::InvalidArgument(format!(
                "epoch range {}-{} is inverted",
                epr_lo, epr_hi
            )));
        }

        let victims: Vec<Rect> = {
            let records = self.root()?.collect(&filter)?;
            let res = self.resolve_records(&records, &filter);
            records
                .iter()
                .enumerate()
                .filter(|(idx, r)| {
                    r.rect.epoch >= epr_lo
                        && extent.contains(&r.rect.extent())
                        && res.visible_of(*idx).next().is_none()
                })
                .map(|(_, r)| r.rect)
                .collect()
        };

        let removed = self.discard(&victims)?;
        debug!(%extent, epr_lo, epr_hi, removed, "aggregated");
        Ok(removed)
    }

    fn discard(&mut self, victims: &[Rect]) -> Result<usize> {
        let alloc = &*self.alloc;
        let cb = &*self.free_cb;
        let root = self.root.as_mut().ok_or(EvtError::InvalidHandle)?;
        for rect in victims {
            let record = root.remove_record(rect, alloc)?;
            root.bump();
            record.free(alloc, cb)?;
        }
        if !victims.is_empty() {
            self.after_mutation();
        }
        Ok(victims.len())
    }

    fn resolve_records(&self, records: &[&ExtentRecord], filter: &EvtFilter) -> Resolution {
        let candidates: Vec<Candidate> = records
            .iter()
            .map(|r| Candidate {
                rect: r.rect.clip(&filter.extent).unwrap_or(r.rect),
                punch: r.is_punch(),
            })
            .collect();
        self.resolver.lock().resolve(&candidates, filter.punch)
    }

    /// Entries selected by `filter` under an iteration mode, in forward order
    pub(crate) fn gather(&self, mode: &IterationMode, filter: &EvtFilter) -> Result<Vec<EvtEntry>> {
        filter.validate()?;
        let records = self.root()?.collect(filter)?;

        let entries = match mode {
            IterationMode::Embedded => records
                .iter()
                .map(|r| {
                    let selected = r.rect.extent().intersect(&filter.extent).unwrap_or(r.rect.extent());
                    EvtEntry::from_record(r, selected, Visibility::Unknown)
                })
                .collect(),
            IterationMode::Visible { skip_holes } => {
                let res = self.resolve_records(&records, filter);
                res.visible()
                    .iter()
                    .map(|(ext, idx)| EvtEntry::from_record(records[*idx], *ext, Visibility::Visible))
                    .filter(|e| !(*skip_holes && e.is_punch()))
                    .collect()
            }
            IterationMode::Covered => {
                let res = self.resolve_records(&records, filter);
                res.covered_runs()
                    .map(|(idx, ext)| EvtEntry::from_record(records[idx], ext, Visibility::Covered))
                    .collect()
            }
        };
        Ok(entries)
    }

    /// Visible entries at or below `filter.epr_hi`, sorted by offset and
    /// clipped to the filter. Punched ranges come back as hole entries.
    pub fn find(&self, filter: &EvtFilter) -> Result<Vec<EvtEntry>> {
        self.gather(&IterationMode::Visible { skip_holes: false }, filter)
    }

    /// Every record admitted by `filter`, unresolved, in tree order
    pub fn find_all(&self, filter: &EvtFilter) -> Result<Vec<EvtEntry>> {
        self.gather(&IterationMode::Embedded, filter)
    }

    /// The record stored under exactly `rect`
    pub fn find_same(&self, rect: &Rect) -> Result<EvtEntry> {
        let record = self.root()?.lookup(rect)?;
        Ok(EvtEntry::from_record(record, record.rect.extent(), Visibility::Unknown))
    }

    /// Highest offset holding live data as of `epoch`
    pub fn max_offset(&self, epoch: u64) -> Result<u64> {
        self.find(&EvtFilter::new(0, u64::MAX, epoch))?
            .iter()
            .rev()
            .find(|e| !e.is_punch())
            .map(|e| e.selected.hi)
            .ok_or(EvtError::NotFound)
    }

    /// Assemble the visible bytes of `filter.extent`; holes read as zeros
    pub fn read_extent(&self, filter: &EvtFilter, inob: u32) -> Result<Vec<u8>> {
        filter.validate()?;
        if inob == 0 {
            return Err(EvtError::InvalidArgument("inob must be non-zero".to_string()));
        }
        let len = filter
            .extent
            .width()
            .checked_mul(inob as u64)
            .filter(|&n| n <= MAX_READ_BYTES)
            .ok_or_else(|| EvtError::InvalidArgument(format!("{} is too large to read", filter.extent)))?;

        let mut buf = vec![0u8; len as usize];
        for entry in self.find(filter)?.iter().filter(|e| !e.is_punch()) {
            if entry.inob != inob {
                return Err(EvtError::InvalidArgument(format!(
                    "{} has {} bytes per index, read asked for {}",
                    entry.full, entry.inob, inob
                )));
            }
            let bytes = self.alloc.read(entry.phys.addr(), entry.payload_size())?;
            let at = ((entry.selected.lo - filter.extent.lo) * inob as u64) as usize;
            buf[at..at + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(buf)
    }

    /// Render the tree. `level` limits the node levels shown (root is 0);
    /// `-1` shows all of them and `-2` adds the leaf records.
    pub fn debug_dump(&self, level: i32) -> Result<String> {
        let root = self.root()?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "evtree order={} depth={} generation={} feats={:#x}",
            root.order, root.depth, root.generation, root.feats
        );
        match root.state() {
            RootState::Empty => out.push_str("empty\n"),
            RootState::Single(record) => {
                let _ = writeln!(out, "single {}", record);
            }
            RootState::Node(id) => root.dump_below(*id, 0, level, &mut out)?,
        }
        Ok(out)
    }

    fn after_mutation(&self) {
        if let Some(level) = self.config.debug_level {
            if let Ok(dump) = self.debug_dump(level) {
                debug!("\n{}", dump);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Stamp;
    use crate::storage::{BioAddr, DeferredFree, ImmediateFree, MemPool, NoFree};
    use quickcheck::{quickcheck, TestResult};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn new_tree(order: u16, capacity: u64) -> (EvTree, Arc<MemPool>) {
        let pool = Arc::new(MemPool::new(capacity, 16));
        let alloc: Arc<dyn Allocator> = pool.clone();
        let tree = EvTree::create(EvtConfig::with_order(order), alloc, Arc::new(ImmediateFree)).unwrap();
        (tree, pool)
    }

    fn rect(lo: u64, hi: u64, epoch: u64) -> Rect {
        Rect::new(lo, hi, epoch, 0)
    }

    fn fill(r: Rect) -> Vec<u8> {
        (r.ex_lo..=r.ex_hi).map(|i| b'a' + (i % 26) as u8).collect()
    }

    fn insert_data(tree: &mut EvTree, r: Rect) -> Result<InsertOutcome> {
        let bytes = fill(r);
        tree.insert(EntryIn::data(r, 1, &bytes))
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let pool: Arc<dyn Allocator> = Arc::new(MemPool::new(1024, 16));
        let result = EvTree::create(EvtConfig::with_order(2), pool, Arc::new(NoFree));
        assert!(matches!(result, Err(EvtError::InvalidArgument(_))));
    }

    #[test]
    fn test_insert_find_round_trip() {
        let (mut tree, pool) = new_tree(8, 4096);
        let r = rect(0, 3, 1);

        assert_eq!(tree.insert(EntryIn::data(r, 1, b"abcd").version(5)).unwrap(), InsertOutcome::Inserted);
        assert!(tree.has_data().unwrap());

        let found = tree.find(&EvtFilter::new(0, 3, 1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].full, r);
        assert_eq!(found[0].version, 5);
        assert_eq!(found[0].visibility, Visibility::Visible);
        assert_eq!(pool.read(found[0].phys.addr(), 4).unwrap(), b"abcd");

        assert_eq!(tree.find_same(&r).unwrap().phys, found[0].phys);
        assert_eq!(tree.read_extent(&EvtFilter::new(0, 3, 1), 1).unwrap(), b"abcd");

        // Before the write there is nothing
        assert!(tree.find(&EvtFilter::new(0, 3, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_adjacent_writes_read_back_together() {
        let (mut tree, _pool) = new_tree(8, 4096);
        tree.insert(EntryIn::data(rect(0, 0, 1), 1, b"a")).unwrap();
        tree.insert(EntryIn::data(rect(1, 2, 2), 1, b"bc")).unwrap();

        let filter = EvtFilter::new(0, 2, 2);
        let visible = tree.find(&filter).unwrap();
        let extents: Vec<Extent> = visible.iter().map(|e| e.selected).collect();
        assert_eq!(extents, vec![Extent::new(0, 0), Extent::new(1, 2)]);
        assert_eq!(coalesce(&visible), vec![Extent::new(0, 2)]);
        assert_eq!(tree.read_extent(&filter, 1).unwrap(), b"abc");
        assert!(tree.gather(&IterationMode::Covered, &filter).unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_splits_visibility() {
        let (mut tree, _pool) = new_tree(8, 4096);
        tree.insert(EntryIn::data(rect(0, 7, 1), 1, b"AAAAAAAA")).unwrap();
        tree.insert(EntryIn::data(rect(2, 4, 2), 1, b"bbb")).unwrap();

        assert_eq!(tree.read_extent(&EvtFilter::new(0, 7, 2), 1).unwrap(), b"AAbbbAAA");
        assert_eq!(tree.read_extent(&EvtFilter::new(0, 7, 1), 1).unwrap(), b"AAAAAAAA");

        let covered = tree.gather(&IterationMode::Covered, &EvtFilter::new(0, 7, 2)).unwrap();
        assert_eq!(covered.len(), 1);
        assert_eq!(covered[0].selected, Extent::new(2, 4));
        assert_eq!(covered[0].full, rect(0, 7, 1));
    }

    #[test]
    fn test_punch_semantics() {
        let (mut tree, _pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 9, 1)).unwrap();
        tree.insert(EntryIn::punch(rect(0, 9, 2))).unwrap();

        assert_eq!(
            tree.insert(EntryIn::punch(rect(0, 9, 2))),
            Err(EvtError::Duplicate(rect(0, 9, 2)))
        );
        tree.insert(EntryIn::punch(rect(0, 9, 3))).unwrap();

        let filter = EvtFilter::new(0, 9, 3);
        let visible = tree.find(&filter).unwrap();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].is_punch());
        assert_eq!(tree.read_extent(&filter, 1).unwrap(), vec![0u8; 10]);

        let covered = tree.gather(&IterationMode::Covered, &filter).unwrap();
        let covered_keys: Vec<Rect> = covered.iter().map(|e| e.full).collect();
        assert_eq!(covered_keys, vec![rect(0, 9, 2), rect(0, 9, 1)]);
    }

    #[test]
    fn test_same_stamp_conflicts() {
        let (mut tree, pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 9, 4)).unwrap();

        assert_eq!(insert_data(&mut tree, rect(0, 9, 4)), Err(EvtError::Duplicate(rect(0, 9, 4))));
        assert_eq!(insert_data(&mut tree, rect(5, 14, 4)), Err(EvtError::Duplicate(rect(5, 14, 4))));
        assert_eq!(insert_data(&mut tree, rect(2, 3, 4)), Err(EvtError::Duplicate(rect(2, 3, 4))));
        assert_eq!(insert_data(&mut tree, rect(0, 19, 4)), Err(EvtError::Duplicate(rect(0, 19, 4))));

        // Another minor epoch is a different stamp
        insert_data(&mut tree, Rect::new(5, 14, 4, 1)).unwrap();
        // A punch may partially overlap at the same stamp
        tree.insert(EntryIn::punch(rect(8, 20, 4))).unwrap();
        assert_eq!(tree.len().unwrap(), 3);

        // Two payloads and the root node; failed inserts reserve nothing
        assert_eq!(pool.live_allocations(), 3);
    }

    #[test]
    fn test_punch_and_data_replace_in_place() {
        let (mut tree, pool) = new_tree(8, 4096);
        let r = rect(0, 3, 2);

        tree.insert(EntryIn::punch(r)).unwrap();
        let before = tree.generation().unwrap();
        assert_eq!(tree.insert(EntryIn::data(r, 1, b"wxyz")).unwrap(), InsertOutcome::Inserted);
        assert!(tree.generation().unwrap() > before);
        assert_eq!(tree.len().unwrap(), 1);
        assert!(!tree.find_same(&r).unwrap().is_punch());
        assert_eq!(pool.live_allocations(), 1);

        // Punching over the data releases its payload
        tree.insert(EntryIn::punch(r)).unwrap();
        assert_eq!(tree.len().unwrap(), 1);
        assert!(tree.find_same(&r).unwrap().is_punch());
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn test_insert_argument_checks() {
        let (mut tree, _pool) = new_tree(8, 4096);

        let low_bound = EntryIn::data(rect(0, 0, 5), 1, b"a").bound(4);
        assert!(matches!(tree.insert(low_bound), Err(EvtError::InvalidArgument(_))));

        let inverted = EntryIn::punch(Rect::new(9, 1, 5, 0));
        assert!(matches!(tree.insert(inverted), Err(EvtError::InvalidArgument(_))));

        tree.insert(EntryIn::data(rect(0, 0, 5), 1, b"a").bound(9)).unwrap();
        assert_eq!(tree.find_same(&rect(0, 0, 5)).unwrap().bound, 9);

        // An adopted payload whose size overflows is refused up front
        let too_wide = EntryIn::addr(Rect::new(10, u64::MAX / 2, 2, 0), 4, BioAddr(40));
        assert!(matches!(tree.insert(too_wide), Err(EvtError::InvalidArgument(_))));
        assert_eq!(tree.len().unwrap(), 1);
        let far = EvtFilter::new(u64::MAX / 2, u64::MAX / 2, 2);
        assert!(tree.find(&far).unwrap().is_empty());
    }

    #[test]
    fn test_read_extent_argument_checks() {
        let (mut tree, _pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 3, 1)).unwrap();

        let inverted = EvtFilter::new(9, 1, 1);
        assert!(matches!(tree.read_extent(&inverted, 1), Err(EvtError::InvalidArgument(_))));
        assert!(matches!(tree.find(&inverted), Err(EvtError::InvalidArgument(_))));

        let epochs = EvtFilter::with_epoch_range(0, 3, 5, 1);
        assert!(matches!(tree.read_extent(&epochs, 1), Err(EvtError::InvalidArgument(_))));
        assert!(matches!(tree.read_extent(&EvtFilter::new(0, 3, 1), 0), Err(EvtError::InvalidArgument(_))));
        assert!(matches!(tree.read_extent(&EvtFilter::all(), 1), Err(EvtError::InvalidArgument(_))));
    }

    #[test]
    fn test_merged_is_advisory() {
        let pool = Arc::new(MemPool::new(4096, 16));
        let alloc: Arc<dyn Allocator> = pool.clone();
        let mut tree = EvTree::create(EvtConfig::default(), alloc, Arc::new(NoFree)).unwrap();

        let base = pool.alloc(8).unwrap();
        let first = EntryIn::addr(rect(0, 3, 1), 1, base);
        let second = EntryIn::addr(rect(4, 7, 2), 1, base.offset(4));
        let elsewhere = EntryIn::addr(rect(8, 9, 3), 1, BioAddr(512));

        assert_eq!(tree.insert(first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(tree.insert(second).unwrap(), InsertOutcome::Merged);
        assert_eq!(tree.insert(elsewhere).unwrap(), InsertOutcome::Inserted);

        // Contiguous, but the neighbour is newer than the insert
        let older = EntryIn::addr(rect(10, 11, 1), 1, BioAddr(514));
        assert_eq!(tree.insert(older).unwrap(), InsertOutcome::Inserted);
        assert_eq!(tree.len().unwrap(), 4);
    }

    #[test]
    fn test_split_grows_depth() {
        let (mut tree, _pool) = new_tree(4, 1 << 20);
        for i in 0..100u64 {
            insert_data(&mut tree, rect(i * 10, i * 10 + 4, i % 7 + 1)).unwrap();
        }

        assert!(tree.depth().unwrap() >= 2);
        assert_eq!(tree.len().unwrap(), 100);
        tree.root().unwrap().validate().unwrap();

        for i in 0..100u64 {
            let r = rect(i * 10, i * 10 + 4, i % 7 + 1);
            assert_eq!(tree.find_same(&r).unwrap().full, r);
            let hit = tree.find(&EvtFilter::new(r.ex_lo, r.ex_hi, 7)).unwrap();
            assert_eq!(hit.len(), 1);
            assert_eq!(hit[0].full, r);
        }
        assert_eq!(tree.find_all(&EvtFilter::all()).unwrap().len(), 100);
    }

    #[test]
    fn test_delete_shrinks_to_empty() {
        let (mut tree, pool) = new_tree(4, 1 << 20);
        let rects: Vec<Rect> = (0..40u64).map(|i| rect(i * 3, i * 3 + 1, 40 - i)).collect();
        for r in &rects {
            insert_data(&mut tree, *r).unwrap();
        }
        let nodes_held = pool.live_allocations() - rects.len();
        assert!(nodes_held > 1);

        for r in rects.iter().rev() {
            let record = tree.delete(r).unwrap();
            assert_eq!(record.rect, *r);
            // The caller owns the payload now
            record.free(&*pool, &ImmediateFree).unwrap();
            tree.root().unwrap().validate().unwrap();
        }

        assert!(!tree.has_data().unwrap());
        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(pool.live_allocations(), 0);
        assert_eq!(tree.delete(&rects[0]).unwrap_err(), EvtError::NotFound);
    }

    #[test]
    fn test_delete_stamp_disambiguates_shared_extent() {
        let (mut tree, _pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 3, 1)).unwrap();
        insert_data(&mut tree, rect(0, 3, 2)).unwrap();
        insert_data(&mut tree, rect(0, 4, 7)).unwrap();

        assert_eq!(tree.delete(&rect(0, 3, 3)).unwrap_err(), EvtError::NotFound);
        assert_eq!(tree.delete(&rect(0, 3, 2)).unwrap().rect, rect(0, 3, 2));
        assert_eq!(tree.find_same(&rect(0, 3, 1)).unwrap().full, rect(0, 3, 1));

        // One record left with this extent: any stamp selects it
        assert_eq!(tree.delete(&rect(0, 3, 9)).unwrap().rect, rect(0, 3, 1));
        assert_eq!(tree.delete(&rect(0, 3, 1)).unwrap_err(), EvtError::NotFound);
        assert_eq!(tree.delete(&rect(1, 4, 7)).unwrap_err(), EvtError::NotFound);
        assert_eq!(tree.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_sole_extent_ignores_stamp() {
        let (mut tree, pool) = new_tree(4, 4096);
        insert_data(&mut tree, rect(0, 3, 1)).unwrap();

        let record = tree.delete(&Rect::new(0, 3, 5, 0)).unwrap();
        assert_eq!(record.rect, rect(0, 3, 1));
        record.free(&*pool, &ImmediateFree).unwrap();
        assert!(tree.is_empty().unwrap());
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn test_root_reactivation() {
        let (mut tree, _pool) = new_tree(8, 4096);
        let r = rect(0, 0, 1);

        insert_data(&mut tree, r).unwrap();
        assert!(matches!(tree.root().unwrap().state(), RootState::Single(_)));
        let first_gen = tree.generation().unwrap();

        tree.delete(&r).unwrap();
        assert!(matches!(tree.root().unwrap().state(), RootState::Empty));
        assert!(tree.find(&EvtFilter::all()).unwrap().is_empty());

        insert_data(&mut tree, r).unwrap();
        assert!(tree.generation().unwrap() > first_gen);
        assert_eq!(tree.find(&EvtFilter::new(0, 0, 1)).unwrap()[0].full, r);

        insert_data(&mut tree, rect(1, 1, 1)).unwrap();
        assert!(matches!(tree.root().unwrap().state(), RootState::Node(_)));
        assert_eq!(tree.depth().unwrap(), 1);
    }

    #[test]
    fn test_out_of_space_leaves_tree_intact() {
        let (mut tree, pool) = new_tree(4, 4096);
        let mut stored = Vec::new();

        let failed = loop {
            let r = rect(stored.len() as u64 * 20, stored.len() as u64 * 20 + 15, 1);
            let used = pool.used();
            match insert_data(&mut tree, r) {
                Ok(_) => stored.push(r),
                Err(err) => {
                    assert_eq!(err, EvtError::OutOfMemory);
                    assert_eq!(pool.used(), used);
                    break r;
                }
            }
        };

        assert!(!stored.is_empty());
        assert_eq!(tree.len().unwrap(), stored.len());
        assert_eq!(tree.find_same(&failed).unwrap_err(), EvtError::NotFound);
        for r in &stored {
            assert_eq!(tree.read_extent(&EvtFilter::new(r.ex_lo, r.ex_hi, 1), 1).unwrap(), fill(*r));
        }
        tree.root().unwrap().validate().unwrap();
    }

    #[test]
    fn test_closed_handle() {
        let (mut tree, pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 3, 1)).unwrap();

        let root = tree.close().unwrap();
        assert!(!tree.is_open());
        assert_eq!(tree.close().unwrap_err(), EvtError::InvalidHandle);
        assert_eq!(tree.find(&EvtFilter::all()).unwrap_err(), EvtError::InvalidHandle);
        assert_eq!(insert_data(&mut tree, rect(5, 6, 1)).unwrap_err(), EvtError::InvalidHandle);
        assert_eq!(tree.destroy().unwrap_err(), EvtError::InvalidHandle);

        let alloc: Arc<dyn Allocator> = pool.clone();
        let mut reopened = EvTree::open(root, alloc, Arc::new(ImmediateFree)).unwrap();
        assert_eq!(reopened.read_extent(&EvtFilter::new(0, 3, 1), 1).unwrap(), b"abcd");

        reopened.destroy().unwrap();
        assert_eq!(pool.live_allocations(), 0);
        assert_eq!(reopened.has_data().unwrap_err(), EvtError::InvalidHandle);
    }

    #[test]
    fn test_open_rejects_corrupt_roots() {
        let (mut tree, pool) = new_tree(4, 1 << 16);
        for i in 0..20u64 {
            insert_data(&mut tree, rect(i * 4, i * 4 + 1, 1)).unwrap();
        }
        let alloc: Arc<dyn Allocator> = pool.clone();

        let mut root = tree.close().unwrap();
        root.magic ^= 1;
        let err = EvTree::open(root, alloc.clone(), Arc::new(NoFree)).err().unwrap();
        assert!(matches!(err, EvtError::CorruptState(_)));

        let (mut tree, _) = new_tree(4, 1 << 16);
        for i in 0..20u64 {
            insert_data(&mut tree, rect(i * 4, i * 4 + 1, 1)).unwrap();
        }
        let mut root = tree.close().unwrap();
        root.depth += 1;
        let err = EvTree::open(root, alloc.clone(), Arc::new(NoFree)).err().unwrap();
        assert!(matches!(err, EvtError::CorruptState(_)));

        let (mut tree, _) = new_tree(4, 4096);
        let mut root = tree.close().unwrap();
        root.order = 500;
        let err = EvTree::open(root, alloc, Arc::new(NoFree)).err().unwrap();
        assert!(matches!(err, EvtError::CorruptState(_)));
    }

    #[test]
    fn test_remove_all() {
        let (mut tree, pool) = new_tree(4, 1 << 16);
        for epoch in 1..=4u64 {
            for i in 0..5u64 {
                insert_data(&mut tree, rect(i * 10, i * 10 + 5, epoch)).unwrap();
            }
        }

        let removed = tree.remove_all(Extent::new(0, 25), 2, 3).unwrap();
        assert_eq!(removed, 6);
        assert_eq!(tree.len().unwrap(), 14);
        assert!(tree.find_all(&EvtFilter::with_epoch_range(0, 25, 2, 3)).unwrap().is_empty());

        let removed = tree.remove_all(Extent::all(), 0, u64::MAX).unwrap();
        assert_eq!(removed, 14);
        assert!(!tree.has_data().unwrap());
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn test_remove_all_with_deferred_free() {
        let pool = Arc::new(MemPool::new(4096, 16));
        let alloc: Arc<dyn Allocator> = pool.clone();
        let deferred = Arc::new(DeferredFree::new());
        let mut tree = EvTree::create(EvtConfig::default(), alloc, deferred.clone()).unwrap();

        insert_data(&mut tree, rect(0, 3, 1)).unwrap();
        insert_data(&mut tree, rect(4, 7, 1)).unwrap();
        assert_eq!(tree.remove_all(Extent::all(), 0, 10).unwrap(), 2);

        assert_eq!(deferred.pending(), 2);
        assert_eq!(pool.live_allocations(), 2);
        deferred.drain(&*pool);
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn test_aggregate_drops_covered_history() {
        let (mut tree, _pool) = new_tree(8, 1 << 16);
        insert_data(&mut tree, rect(0, 9, 1)).unwrap();
        insert_data(&mut tree, rect(0, 9, 2)).unwrap();
        insert_data(&mut tree, rect(3, 5, 3)).unwrap();
        insert_data(&mut tree, rect(20, 29, 1)).unwrap();
        insert_data(&mut tree, rect(20, 29, 9)).unwrap();

        let before = tree.read_extent(&EvtFilter::new(0, 29, 5), 1).unwrap();
        assert_eq!(tree.aggregate(Extent::new(0, 100), 0, 5).unwrap(), 1);
        assert_eq!(tree.find_same(&rect(0, 9, 1)).unwrap_err(), EvtError::NotFound);
        // Covered only by a write past the range: kept
        assert!(tree.find_same(&rect(20, 29, 1)).is_ok());
        assert_eq!(tree.read_extent(&EvtFilter::new(0, 29, 5), 1).unwrap(), before);

        // Nothing left to aggregate
        assert_eq!(tree.aggregate(Extent::new(0, 100), 0, 5).unwrap(), 0);
    }

    #[test]
    fn test_max_offset() {
        let (mut tree, _pool) = new_tree(8, 4096);
        assert_eq!(tree.max_offset(10).unwrap_err(), EvtError::NotFound);

        insert_data(&mut tree, rect(0, 9, 1)).unwrap();
        insert_data(&mut tree, rect(50, 59, 2)).unwrap();
        tree.insert(EntryIn::punch(rect(40, 70, 3))).unwrap();

        assert_eq!(tree.max_offset(1).unwrap(), 9);
        assert_eq!(tree.max_offset(2).unwrap(), 59);
        assert_eq!(tree.max_offset(3).unwrap(), 9);
    }

    #[test]
    fn test_outer_punch_filter() {
        let (mut tree, _pool) = new_tree(8, 4096);
        insert_data(&mut tree, rect(0, 9, 1)).unwrap();
        insert_data(&mut tree, rect(5, 9, 4)).unwrap();

        let filter = EvtFilter::new(0, 9, 10).punched_at(Stamp::new(2, 0));
        let visible = tree.find(&filter).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].selected, Extent::new(5, 9));
        assert_eq!(tree.read_extent(&filter, 1).unwrap(), b"\0\0\0\0\0fghij");
    }

    #[test]
    fn test_debug_dump() {
        let (mut tree, _pool) = new_tree(4, 1 << 16);
        assert!(tree.debug_dump(-2).unwrap().contains("empty"));

        insert_data(&mut tree, rect(0, 1, 1)).unwrap();
        assert!(tree.debug_dump(-2).unwrap().contains("single 0-1@1.0"));

        for i in 1..12u64 {
            insert_data(&mut tree, rect(i * 2, i * 2 + 1, 1)).unwrap();
        }
        tree.set_debug(Some(-1));
        insert_data(&mut tree, rect(100, 101, 1)).unwrap();

        let shallow = tree.debug_dump(0).unwrap();
        let full = tree.debug_dump(-2).unwrap();
        assert!(shallow.contains("branch"));
        assert!(!shallow.contains("leaf"));
        assert!(full.contains("leaf"));
        assert!(full.contains("100-101@1.0"));
    }

    #[test]
    fn test_random_insert_delete_stress() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let (mut tree, pool) = new_tree(4, 1 << 22);
        let mut model: BTreeSet<(u64, u64, u64)> = BTreeSet::new();

        for step in 0..2000 {
            if model.is_empty() || rng.gen_bool(0.6) {
                let lo = rng.gen_range(0..500u64);
                let r = rect(lo, lo + rng.gen_range(0..8u64), rng.gen_range(1..50u64));
                match tree.insert(EntryIn::punch(r)) {
                    Ok(_) => assert!(model.insert((r.ex_lo, r.ex_hi, r.epoch))),
                    Err(EvtError::Duplicate(_)) => assert!(model.contains(&(r.ex_lo, r.ex_hi, r.epoch))),
                    Err(err) => panic!("step {}: {}", step, err),
                }
            } else {
                let pick = rng.gen_range(0..model.len());
                let (lo, hi, epoch) = *model.iter().nth(pick).unwrap();
                tree.delete(&rect(lo, hi, epoch)).unwrap();
                model.remove(&(lo, hi, epoch));
            }

            if step % 100 == 0 {
                tree.root().unwrap().validate().unwrap();
            }
        }

        tree.root().unwrap().validate().unwrap();
        assert_eq!(tree.len().unwrap(), model.len());
        let mut keys: Vec<(u64, u64, u64)> = tree
            .find_all(&EvtFilter::all())
            .unwrap()
            .iter()
            .map(|e| (e.full.ex_lo, e.full.ex_hi, e.full.epoch))
            .collect();
        keys.sort();
        assert_eq!(keys, model.iter().copied().collect::<Vec<_>>());

        tree.destroy().unwrap();
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn prop_visible_never_older_than_covering_write() {
        fn prop(raw: Vec<(u8, u8, u8)>, query: u8) -> TestResult {
            if raw.is_empty() || raw.len() > 30 {
                return TestResult::discard();
            }
            let (mut tree, _pool) = new_tree(4, 1 << 20);
            let mut written = Vec::new();
            for (i, &(lo, len, epoch)) in raw.iter().enumerate() {
                // Unique minor epochs avoid same-stamp conflicts
                let r = Rect::new(lo as u64, lo as u64 + (len % 16) as u64, (epoch % 20) as u64 + 1, i as u32);
                let bytes = fill(r);
                tree.insert(EntryIn::data(r, 1, &bytes)).unwrap();
                written.push(r);
            }

            let epoch = (query % 22) as u64;
            for entry in tree.find(&EvtFilter::new(0, u64::MAX, epoch)).unwrap() {
                if entry.stamp().epoch > epoch {
                    return TestResult::failed();
                }
                let newer_covering = written.iter().any(|w| {
                    w.epoch <= epoch
                        && w.stamp() > entry.stamp()
                        && w.extent().overlaps(&entry.selected)
                });
                if newer_covering {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        quickcheck(prop as fn(Vec<(u8, u8, u8)>, u8) -> TestResult);
    }

    #[test]
    fn prop_visible_widths_match_union() {
        fn prop(raw: Vec<(u8, u8)>) -> TestResult {
            if raw.len() > 30 {
                return TestResult::discard();
            }
            let (mut tree, _pool) = new_tree(4, 1 << 20);
            let mut offsets = BTreeSet::new();
            for (i, &(lo, len)) in raw.iter().enumerate() {
                let r = Rect::new(lo as u64, lo as u64 + (len % 16) as u64, i as u64 + 1, 0);
                tree.insert(EntryIn::punch(r)).unwrap();
                offsets.extend(r.ex_lo..=r.ex_hi);
            }

            let filter = EvtFilter::all();
            let visible: u64 = tree.find(&filter).unwrap().iter().map(|e| e.selected.width()).sum();
            let embedded = tree.find_all(&filter).unwrap();
            let covered = tree.gather(&IterationMode::Covered, &filter).unwrap();
            let visible_entries = tree.find(&filter).unwrap();

            // Each record is split exactly into its visible and covered parts
            let partitioned = embedded.iter().all(|rec| {
                let parts: u64 = visible_entries
                    .iter()
                    .chain(covered.iter())
                    .filter(|e| e.full == rec.full)
                    .map(|e| e.selected.width())
                    .sum();
                parts == rec.full.width()
            });
            TestResult::from_bool(visible == offsets.len() as u64 && partitioned)
        }
        quickcheck(prop as fn(Vec<(u8, u8)>) -> TestResult);
    }
}
