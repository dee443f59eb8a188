//! Persisted root of a tree and the structural operations on it
//!
//! The root owns the node arena. Everything here is about shape: locating
//! records by key, placing new ones, splitting full nodes, and rebalancing
//! after removal. Policy (duplicates, punches, freeing payloads) lives in the
//! handle.

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use crate::config::{EvtConfig, EVT_FEATS_SUPPORTED, EVT_FEAT_SORT_SOFF, EVT_ORDER_MAX, EVT_ORDER_MIN};
use crate::error::{EvtError, Result};
use crate::interval::{ssof_cmp, EvtFilter, Mbr, Rect};
use crate::storage::{Allocator, BioAddr, ExtentRecord, FreeCallback};
use crate::tree::node::{node_size, route, ChildSlot, Node, NodeArena, NodeBody, NodeId};

/// Node space reserved for one insert, at most one per level plus a new root
pub(crate) type Reservations = SmallVec<[BioAddr; 4]>;

/// Magic number of a persisted root
pub const EVT_MAGIC: u32 = 0x8a3b_e71d;

/// Deepest tree a root may describe
pub const EVT_MAX_DEPTH: u16 = 32;

/// Where the records of a tree live
#[derive(Debug)]
pub enum RootState {
    /// No records
    Empty,
    /// Exactly one record, held without a node
    Single(ExtentRecord),
    /// Root node of a tree of depth >= 1
    Node(NodeId),
}

/// Persisted state of a tree, handed out by `close` and taken by `open`
#[derive(Debug)]
pub struct EvtRoot {
    pub magic: u32,
    pub feats: u64,
    pub order: u16,
    /// Node levels; zero while the root is empty or single
    pub depth: u16,
    /// Bumped on every mutation
    pub generation: u64,
    pub(crate) state: RootState,
    pub(crate) arena: NodeArena,
}

impl EvtRoot {
    pub(crate) fn new(config: &EvtConfig) -> Self {
        Self {
            magic: EVT_MAGIC,
            feats: config.feats,
            order: config.order,
            depth: 0,
            generation: 0,
            state: RootState::Empty,
            arena: NodeArena::new(),
        }
    }

    pub fn state(&self) -> &RootState {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, RootState::Empty)
    }

    fn min_fill(&self) -> usize {
        (self.order as usize).div_ceil(2)
    }

    pub(crate) fn bump(&mut self) {
        self.generation += 1;
    }

    /// Check the header and the shape of the whole tree
    pub fn validate(&self) -> Result<()> {
        if self.magic != EVT_MAGIC {
            return Err(EvtError::CorruptState(format!("bad magic {:#x}", self.magic)));
        }
        if !(EVT_ORDER_MIN..=EVT_ORDER_MAX).contains(&self.order) {
            return Err(EvtError::CorruptState(format!("bad order {}", self.order)));
        }
        if self.feats & !EVT_FEATS_SUPPORTED != 0 || self.feats & EVT_FEAT_SORT_SOFF == 0 {
            return Err(EvtError::CorruptState(format!("bad feature bits {:#x}", self.feats)));
        }
        if self.depth > EVT_MAX_DEPTH {
            return Err(EvtError::CorruptState(format!("depth {} too large", self.depth)));
        }

        match &self.state {
            RootState::Empty | RootState::Single(_) => {
                if self.depth != 0 || self.arena.live() != 0 {
                    return Err(EvtError::CorruptState(format!(
                        "node-less root with depth {} and {} nodes",
                        self.depth,
                        self.arena.live()
                    )));
                }
                if let RootState::Single(record) = &self.state {
                    if !record.rect.is_valid() {
                        return Err(EvtError::CorruptState(format!("bad record {}", record)));
                    }
                }
                Ok(())
            }
            RootState::Node(id) => {
                let mut visited = 0;
                let height = self
                    .check_subtree(*id, true, &mut visited)
                    .map_err(|err| EvtError::CorruptState(err.to_string()))?;
                if height != self.depth as usize {
                    return Err(EvtError::CorruptState(format!(
                        "depth {} recorded, {} found",
                        self.depth, height
                    )));
                }
                if visited != self.arena.live() {
                    return Err(EvtError::CorruptState(format!(
                        "{} nodes reachable, {} allocated",
                        visited,
                        self.arena.live()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Height of the subtree at `id`, checking fill, order and routing keys
    fn check_subtree(&self, id: NodeId, is_root: bool, visited: &mut usize) -> Result<usize> {
        *visited += 1;
        if *visited > self.arena.live() {
            return Err(EvtError::CorruptTree("node reachable twice".to_string()));
        }
        let node = self.arena.get(id)?;
        let len = node.len();
        if len > self.order as usize || len == 0 || (!is_root && len < self.min_fill()) {
            return Err(EvtError::CorruptTree(format!("node {} holds {} entries", id, len)));
        }

        match &node.body {
            NodeBody::Leaf(records) => {
                if records.windows(2).any(|w| ssof_cmp(&w[0].rect, &w[1].rect).is_ge()) {
                    return Err(EvtError::CorruptTree(format!("leaf {} out of order", id)));
                }
                Ok(1)
            }
            NodeBody::Branch(slots) => {
                let mut height = None;
                for slot in slots {
                    if self.arena.get(slot.id)?.min_key() != Some(slot.key) {
                        return Err(EvtError::CorruptTree(format!(
                            "stale routing key {} in node {}",
                            slot.key, id
                        )));
                    }
                    let h = self.check_subtree(slot.id, false, visited)?;
                    if height.is_some_and(|prev| prev != h) {
                        return Err(EvtError::CorruptTree(format!("node {} is unbalanced", id)));
                    }
                    height = Some(h);
                }
                if slots.windows(2).any(|w| ssof_cmp(&w[0].key, &w[1].key).is_ge()) {
                    return Err(EvtError::CorruptTree(format!("branch {} out of order", id)));
                }
                Ok(height.unwrap_or(0) + 1)
            }
        }
    }

    /// Number of records
    pub fn record_count(&self) -> Result<usize> {
        match &self.state {
            RootState::Empty => Ok(0),
            RootState::Single(_) => Ok(1),
            RootState::Node(id) => self.count_below(*id),
        }
    }

    fn count_below(&self, id: NodeId) -> Result<usize> {
        match &self.arena.get(id)?.body {
            NodeBody::Leaf(records) => Ok(records.len()),
            NodeBody::Branch(slots) => slots.iter().map(|s| self.count_below(s.id)).sum(),
        }
    }

    /// Record stored under exactly `rect`
    pub(crate) fn lookup(&self, rect: &Rect) -> Result<&ExtentRecord> {
        let mut id = match &self.state {
            RootState::Single(record) if record.rect == *rect => return Ok(record),
            RootState::Node(id) => *id,
            _ => return Err(EvtError::NotFound),
        };
        loop {
            match &self.arena.get(id)?.body {
                NodeBody::Branch(slots) => {
                    let idx = route(slots, rect).ok_or(EvtError::NotFound)?;
                    id = slots[idx].id;
                }
                NodeBody::Leaf(records) => {
                    let pos = records
                        .binary_search_by(|r| ssof_cmp(&r.rect, rect))
                        .map_err(|_| EvtError::NotFound)?;
                    return Ok(&records[pos]);
                }
            }
        }
    }

    fn lookup_mut(&mut self, rect: &Rect) -> Result<&mut ExtentRecord> {
        let mut id = match &mut self.state {
            RootState::Single(record) if record.rect == *rect => return Ok(record),
            RootState::Node(id) => *id,
            _ => return Err(EvtError::NotFound),
        };
        loop {
            if let NodeBody::Branch(slots) = &self.arena.get(id)?.body {
                let idx = route(slots, rect).ok_or(EvtError::NotFound)?;
                id = slots[idx].id;
                continue;
            }
            let records = self.arena.get_mut(id)?.body.records_mut()?;
            let pos = records
                .binary_search_by(|r| ssof_cmp(&r.rect, rect))
                .map_err(|_| EvtError::NotFound)?;
            return Ok(&mut records[pos]);
        }
    }

    /// Swap the record stored under `record.rect` for `record`
    pub(crate) fn replace(&mut self, record: ExtentRecord) -> Result<ExtentRecord> {
        let slot = self.lookup_mut(&record.rect)?;
        Ok(std::mem::replace(slot, record))
    }

    /// Records admitted by `filter`, in SSOF order
    pub(crate) fn collect(&self, filter: &EvtFilter) -> Result<Vec<&ExtentRecord>> {
        let mut out = Vec::new();
        match &self.state {
            RootState::Empty => {}
            RootState::Single(record) => {
                if filter.admits(&record.rect) {
                    out.push(record);
                }
            }
            RootState::Node(id) => self.collect_below(*id, filter, &mut out)?,
        }
        Ok(out)
    }

    fn collect_below<'a>(
        &'a self,
        id: NodeId,
        filter: &EvtFilter,
        out: &mut Vec<&'a ExtentRecord>,
    ) -> Result<()> {
        let node = self.arena.get(id)?;
        if !node.mbr.may_match(filter) {
            trace!(node = id, mbr = %node.mbr, "pruned");
            return Ok(());
        }
        match &node.body {
            NodeBody::Leaf(records) => {
                out.extend(records.iter().filter(|r| filter.admits(&r.rect)));
            }
            NodeBody::Branch(slots) => {
                for slot in slots {
                    self.collect_below(slot.id, filter, out)?;
                }
            }
        }
        Ok(())
    }

    /// Node reservations an insert of `rect` will consume
    pub(crate) fn nodes_needed(&self, rect: &Rect) -> Result<usize> {
        let mut id = match &self.state {
            RootState::Empty => return Ok(0),
            RootState::Single(_) => return Ok(1),
            RootState::Node(id) => *id,
        };

        let order = self.order as usize;
        let mut full_run = 0;
        let mut path_len = 0;
        loop {
            let node = self.arena.get(id)?;
            path_len += 1;
            if node.len() >= order {
                full_run += 1;
            } else {
                full_run = 0;
            }
            match &node.body {
                NodeBody::Branch(slots) => {
                    id = slots[route(slots, rect).unwrap_or(0)].id;
                }
                NodeBody::Leaf(_) => break,
            }
        }

        // A split that reaches the root also needs a new root
        Ok(if full_run == path_len { full_run + 1 } else { full_run })
    }

    /// Place `record`, drawing new nodes from `reserved`
    pub(crate) fn insert_record(&mut self, record: ExtentRecord, reserved: &mut Reservations) -> Result<()> {
        match &self.state {
            RootState::Empty => {
                debug!(rect = %record.rect, "root: empty -> single");
                self.state = RootState::Single(record);
                Ok(())
            }
            RootState::Single(_) => {
                let addr = take_reservation(reserved)?;
                let RootState::Single(existing) = std::mem::replace(&mut self.state, RootState::Empty) else {
                    return Err(EvtError::CorruptTree("root changed shape".to_string()));
                };
                let mut records = vec![existing, record];
                records.sort_by(|a, b| ssof_cmp(&a.rect, &b.rect));

                let id = self.arena.insert(Node::new(NodeBody::Leaf(records), addr));
                self.refresh_mbr(id)?;
                self.state = RootState::Node(id);
                self.depth = 1;
                debug!(node = id, "root: single -> node");
                Ok(())
            }
            RootState::Node(id) => {
                let id = *id;
                if let Some(sibling) = self.insert_below(id, record, reserved)? {
                    let addr = take_reservation(reserved)?;
                    let key = self
                        .arena
                        .get(id)?
                        .min_key()
                        .ok_or_else(|| EvtError::CorruptTree("empty root after split".to_string()))?;
                    let slots = vec![ChildSlot { key, id }, sibling];
                    let new_root = self.arena.insert(Node::new(NodeBody::Branch(slots), addr));
                    self.refresh_mbr(new_root)?;
                    self.state = RootState::Node(new_root);
                    self.depth += 1;
                    debug!(node = new_root, depth = self.depth, "root split, tree grows");
                }
                Ok(())
            }
        }
    }

    /// Insert into the subtree at `id`; returns the new right sibling if it split
    fn insert_below(
        &mut self,
        id: NodeId,
        record: ExtentRecord,
        reserved: &mut Reservations,
    ) -> Result<Option<ChildSlot>> {
        if self.arena.get(id)?.is_leaf() {
            let rect = record.rect;
            let records = self.arena.get_mut(id)?.body.records_mut()?;
            let pos = match records.binary_search_by(|r| ssof_cmp(&r.rect, &rect)) {
                Ok(_) => {
                    error!(%rect, node = id, "key already present at placement");
                    return Err(EvtError::CorruptTree(format!("{} placed twice", rect)));
                }
                Err(pos) => pos,
            };
            records.insert(pos, record);
            self.arena.get_mut(id)?.mbr.merge_rect(&rect);
        } else {
            let rect = record.rect;
            let (idx, child) = {
                let slots = self.arena.get(id)?.body.slots()?;
                let idx = route(slots, &rect).unwrap_or(0);
                (idx, slots[idx].id)
            };

            let split = self.insert_below(child, record, reserved)?;
            let child_key = self.arena.get(child)?.min_key();

            let node = self.arena.get_mut(id)?;
            if node.mbr.is_wider(&rect) {
                node.mbr.merge_rect(&rect);
            }
            let slots = node.body.slots_mut()?;
            if let Some(key) = child_key {
                slots[idx].key = key;
            }
            if let Some(sibling) = split {
                slots.insert(idx + 1, sibling);
            }
        }

        if self.arena.get(id)?.len() > self.order as usize {
            return self.split(id, reserved).map(Some);
        }
        Ok(None)
    }

    /// Move the upper half of an overfull node into a new right sibling
    fn split(&mut self, id: NodeId, reserved: &mut Reservations) -> Result<ChildSlot> {
        let addr = take_reservation(reserved)?;
        let node = self.arena.get_mut(id)?;
        let at = node.len().div_ceil(2);
        let right = node.body.split_off(at);

        let sibling = self.arena.insert(Node::new(right, addr));
        self.refresh_mbr(id)?;
        self.refresh_mbr(sibling)?;

        let key = self
            .arena
            .get(sibling)?
            .min_key()
            .ok_or_else(|| EvtError::CorruptTree("empty node after split".to_string()))?;
        debug!(node = id, sibling, at, "split node");
        Ok(ChildSlot { key, id: sibling })
    }

    /// Recompute the bounding rectangle of a node from its entries
    fn refresh_mbr(&mut self, id: NodeId) -> Result<()> {
        let mut mbr = Mbr::empty();
        match &self.arena.get(id)?.body {
            NodeBody::Leaf(records) => {
                for record in records {
                    mbr.merge_rect(&record.rect);
                }
            }
            NodeBody::Branch(slots) => {
                for slot in slots {
                    mbr.merge(&self.arena.get(slot.id)?.mbr);
                }
            }
        }
        self.arena.get_mut(id)?.mbr = mbr;
        Ok(())
    }

    /// Unlink the record stored under exactly `rect`
    pub(crate) fn remove_record(&mut self, rect: &Rect, alloc: &dyn Allocator) -> Result<ExtentRecord> {
        match &self.state {
            RootState::Empty => Err(EvtError::NotFound),
            RootState::Single(record) if record.rect != *rect => Err(EvtError::NotFound),
            RootState::Single(_) => match std::mem::replace(&mut self.state, RootState::Empty) {
                RootState::Single(record) => {
                    debug!(%rect, "root: single -> empty");
                    Ok(record)
                }
                _ => Err(EvtError::CorruptTree("root changed shape".to_string())),
            },
            RootState::Node(id) => {
                let id = *id;
                let record = self.remove_below(id, rect, alloc)?;
                self.collapse_root(alloc)?;
                Ok(record)
            }
        }
    }

    fn remove_below(&mut self, id: NodeId, rect: &Rect, alloc: &dyn Allocator) -> Result<ExtentRecord> {
        if self.arena.get(id)?.is_leaf() {
            let records = self.arena.get_mut(id)?.body.records_mut()?;
            let pos = records
                .binary_search_by(|r| ssof_cmp(&r.rect, rect))
                .map_err(|_| EvtError::NotFound)?;
            let record = records.remove(pos);
            self.refresh_mbr(id)?;
            return Ok(record);
        }

        let (idx, child) = {
            let slots = self.arena.get(id)?.body.slots()?;
            let idx = route(slots, rect).ok_or(EvtError::NotFound)?;
            (idx, slots[idx].id)
        };
        let record = self.remove_below(child, rect, alloc)?;

        let child_node = self.arena.get(child)?;
        if child_node.len() < self.min_fill() {
            self.rebalance(id, idx, alloc)?;
        } else if let Some(key) = child_node.min_key() {
            self.arena.get_mut(id)?.body.slots_mut()?[idx].key = key;
        }
        self.refresh_mbr(id)?;
        Ok(record)
    }

    /// Restore the fill of child `idx` of `parent` by borrowing or merging
    fn rebalance(&mut self, parent: NodeId, idx: usize, alloc: &dyn Allocator) -> Result<()> {
        let min = self.min_fill();
        let (child, left, right) = {
            let slots = self.arena.get(parent)?.body.slots()?;
            (
                slots[idx].id,
                idx.checked_sub(1).map(|i| slots[i].id),
                slots.get(idx + 1).map(|s| s.id),
            )
        };
        let left_len = left.map(|l| self.arena.get(l).map(Node::len)).transpose()?;
        let right_len = right.map(|r| self.arena.get(r).map(Node::len)).transpose()?;

        match (left, left_len, right, right_len) {
            (Some(l), Some(len), _, _) if len > min => {
                let moved = self.arena.get_mut(l)?.body.split_off(len - 1);
                self.arena.get_mut(child)?.body.prepend(moved)?;
                self.refresh_mbr(l)?;
                self.refresh_mbr(child)?;
                trace!(node = child, from = l, "borrowed from left sibling");
            }
            (_, _, Some(r), Some(len)) if len > min => {
                let moved = self.arena.get_mut(r)?.body.take_front(1);
                self.arena.get_mut(child)?.body.append(moved)?;
                self.refresh_mbr(r)?;
                self.refresh_mbr(child)?;
                let key = self.min_key_of(r)?;
                self.arena.get_mut(parent)?.body.slots_mut()?[idx + 1].key = key;
                trace!(node = child, from = r, "borrowed from right sibling");
            }
            (Some(l), _, _, _) => {
                let gone = self.arena.remove(child)?;
                alloc.free(gone.reservation, node_size(self.order));
                self.arena.get_mut(l)?.body.append(gone.body)?;
                self.refresh_mbr(l)?;
                self.arena.get_mut(parent)?.body.slots_mut()?.remove(idx);
                debug!(node = child, into = l, "merged into left sibling");
                return Ok(());
            }
            (_, _, Some(r), _) => {
                let gone = self.arena.remove(r)?;
                alloc.free(gone.reservation, node_size(self.order));
                self.arena.get_mut(child)?.body.append(gone.body)?;
                self.refresh_mbr(child)?;
                self.arena.get_mut(parent)?.body.slots_mut()?.remove(idx + 1);
                debug!(node = r, into = child, "merged right sibling");
            }
            _ => {
                error!(node = child, parent, "underfull node without siblings");
                return Err(EvtError::CorruptTree(format!(
                    "node {} has no sibling to rebalance with",
                    child
                )));
            }
        }

        let key = self.min_key_of(child)?;
        self.arena.get_mut(parent)?.body.slots_mut()?[idx].key = key;
        Ok(())
    }

    fn min_key_of(&self, id: NodeId) -> Result<Rect> {
        self.arena.get(id)?.min_key().ok_or_else(|| {
            error!(node = id, "empty non-root node");
            EvtError::CorruptTree(format!("node {} is empty", id))
        })
    }

    /// Shrink the root while it has a single child or at most one record
    fn collapse_root(&mut self, alloc: &dyn Allocator) -> Result<()> {
        while let RootState::Node(id) = self.state {
            let node = self.arena.get(id)?;
            match &node.body {
                NodeBody::Branch(slots) if slots.len() == 1 => {
                    let child = slots[0].id;
                    let old = self.arena.remove(id)?;
                    alloc.free(old.reservation, node_size(self.order));
                    self.state = RootState::Node(child);
                    self.depth -= 1;
                    debug!(node = child, depth = self.depth, "root shrinks");
                }
                NodeBody::Leaf(records) if records.len() <= 1 => {
                    let old = self.arena.remove(id)?;
                    alloc.free(old.reservation, node_size(self.order));
                    let NodeBody::Leaf(mut records) = old.body else {
                        return Err(EvtError::CorruptTree("root changed shape".to_string()));
                    };
                    self.state = match records.pop() {
                        Some(record) => RootState::Single(record),
                        None => RootState::Empty,
                    };
                    self.depth = 0;
                    debug!("root: node -> single");
                }
                NodeBody::Branch(slots) if slots.is_empty() => {
                    error!(node = id, "empty branch root");
                    return Err(EvtError::CorruptTree("empty branch root".to_string()));
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Free every record through `cb` and every node reservation
    pub(crate) fn release_all(&mut self, alloc: &dyn Allocator, cb: &dyn FreeCallback) -> Result<usize> {
        let mut released = 0;
        match std::mem::replace(&mut self.state, RootState::Empty) {
            RootState::Empty => {}
            RootState::Single(record) => {
                record.free(alloc, cb)?;
                released += 1;
            }
            RootState::Node(_) => {
                for node in self.arena.drain() {
                    alloc.free(node.reservation, node_size(self.order));
                    if let NodeBody::Leaf(records) = node.body {
                        for record in records {
                            record.free(alloc, cb)?;
                            released += 1;
                        }
                    }
                }
            }
        }
        self.depth = 0;
        self.bump();
        Ok(released)
    }

    /// Append a textual rendering of the subtree at `id` to `out`
    pub(crate) fn dump_below(&self, id: NodeId, level: usize, max: i32, out: &mut String) -> Result<()> {
        use std::fmt::Write;

        let node = self.arena.get(id)?;
        let indent = "  ".repeat(level);
        let kind = if node.is_leaf() { "leaf" } else { "branch" };
        let _ = writeln!(
            out,
            "{}[{}] node {} {} {}/{} mbr={}",
            indent,
            level,
            id,
            kind,
            node.len(),
            self.order,
            node.mbr
        );

        match &node.body {
            NodeBody::Leaf(records) => {
                if max == -2 {
                    for record in records {
                        let _ = writeln!(out, "{}  {}", indent, record);
                    }
                }
            }
            NodeBody::Branch(slots) => {
                if max < 0 || (level as i32) < max {
                    for slot in slots {
                        self.dump_below(slot.id, level + 1, max, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn take_reservation(reserved: &mut Reservations) -> Result<BioAddr> {
    reserved.pop().ok_or_else(|| {
        error!("node reservation missing");
        EvtError::CorruptTree("node reservation missing".to_string())
    })
}
