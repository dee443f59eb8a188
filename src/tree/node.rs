//! Tree nodes and the arena that owns them
//!
//! Nodes are addressed by stable indices into a slab. Released slots are
//! recycled through a free list, so an index is only meaningful while the
//! node it names is live.

use std::cmp::Ordering;

use crate::error::{EvtError, Result};
use crate::interval::{ssof_cmp, Mbr, Rect};
use crate::storage::{BioAddr, ExtentRecord};

/// Index of a node in the arena
pub type NodeId = usize;

/// Fixed per-node bookkeeping reserved from the allocator
pub const NODE_HEADER_SIZE: u64 = 64;

/// Reserved bytes per slot: rectangle, address, version, inob and bound
pub const NODE_SLOT_SIZE: u64 = 56;

/// Bytes a node of the given order reserves from the allocator
pub fn node_size(order: u16) -> u64 {
    NODE_HEADER_SIZE + order as u64 * NODE_SLOT_SIZE
}

/// Routing entry of a branch node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    /// Smallest key stored in the child's subtree
    pub key: Rect,
    pub id: NodeId,
}

/// Ordered content of a node
#[derive(Debug)]
pub enum NodeBody {
    Leaf(Vec<ExtentRecord>),
    Branch(Vec<ChildSlot>),
}

impl NodeBody {
    pub fn len(&self) -> usize {
        match self {
            NodeBody::Leaf(records) => records.len(),
            NodeBody::Branch(slots) => slots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Result<&Vec<ExtentRecord>> {
        match self {
            NodeBody::Leaf(records) => Ok(records),
            NodeBody::Branch(_) => Err(EvtError::CorruptTree("expected a leaf node".to_string())),
        }
    }

    pub fn records_mut(&mut self) -> Result<&mut Vec<ExtentRecord>> {
        match self {
            NodeBody::Leaf(records) => Ok(records),
            NodeBody::Branch(_) => Err(EvtError::CorruptTree("expected a leaf node".to_string())),
        }
    }

    pub fn slots(&self) -> Result<&Vec<ChildSlot>> {
        match self {
            NodeBody::Branch(slots) => Ok(slots),
            NodeBody::Leaf(_) => Err(EvtError::CorruptTree("expected a branch node".to_string())),
        }
    }

    pub fn slots_mut(&mut self) -> Result<&mut Vec<ChildSlot>> {
        match self {
            NodeBody::Branch(slots) => Ok(slots),
            NodeBody::Leaf(_) => Err(EvtError::CorruptTree("expected a branch node".to_string())),
        }
    }

    /// Smallest key in this node
    pub fn min_key(&self) -> Option<Rect> {
        match self {
            NodeBody::Leaf(records) => records.first().map(|r| r.rect),
            NodeBody::Branch(slots) => slots.first().map(|s| s.key),
        }
    }

    /// Keep `[..at]`, return `[at..]`
    pub fn split_off(&mut self, at: usize) -> NodeBody {
        match self {
            NodeBody::Leaf(records) => NodeBody::Leaf(records.split_off(at)),
            NodeBody::Branch(slots) => NodeBody::Branch(slots.split_off(at)),
        }
    }

    /// Keep `[n..]`, return `[..n]`
    pub fn take_front(&mut self, n: usize) -> NodeBody {
        let rest = self.split_off(n);
        std::mem::replace(self, rest)
    }

    /// Move every entry of `other` after the entries of `self`
    pub fn append(&mut self, other: NodeBody) -> Result<()> {
        match (self, other) {
            (NodeBody::Leaf(a), NodeBody::Leaf(mut b)) => a.append(&mut b),
            (NodeBody::Branch(a), NodeBody::Branch(mut b)) => a.append(&mut b),
            _ => {
                return Err(EvtError::CorruptTree(
                    "cannot join a leaf with a branch".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Move every entry of `front` before the entries of `self`
    pub fn prepend(&mut self, mut front: NodeBody) -> Result<()> {
        std::mem::swap(self, &mut front);
        self.append(front)
    }
}

/// A tree node
#[derive(Debug)]
pub struct Node {
    pub body: NodeBody,
    /// Bounding rectangle of everything below this node
    pub mbr: Mbr,
    /// Space reserved from the allocator on behalf of this node
    pub reservation: BioAddr,
}

impl Node {
    pub fn new(body: NodeBody, reservation: BioAddr) -> Self {
        Self {
            body,
            mbr: Mbr::empty(),
            reservation,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    pub fn min_key(&self) -> Option<Rect> {
        self.body.min_key()
    }
}

/// Index of the child whose subtree may hold `key`.
///
/// `None` when `key` sorts before every child.
pub fn route(slots: &[ChildSlot], key: &Rect) -> Option<usize> {
    let past = slots.partition_point(|s| ssof_cmp(&s.key, key) != Ordering::Greater);
    past.checked_sub(1)
}

/// Slab of nodes with recycled indices
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Result<Node> {
        let node = self
            .nodes
            .get_mut(id)
            .and_then(Option::take)
            .ok_or_else(|| dangling(id))?;
        self.free.push(id);
        Ok(node)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(id))
    }

    /// Number of live nodes
    pub fn live(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Remove and return every live node
    pub fn drain(&mut self) -> Vec<Node> {
        self.free.clear();
        self.nodes.drain(..).flatten().collect()
    }
}

fn dangling(id: NodeId) -> EvtError {
    EvtError::CorruptTree(format!("dangling node id {}", id))
}
