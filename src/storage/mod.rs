//! Storage module for evtree
//!
//! This module provides the record store of the tree: extent records and
//! their physical references, plus the allocator and free-policy interfaces
//! through which every byte of space is reserved and released.

pub mod extent;
pub mod pool;

// Re-export key types
pub use extent::{
    BioAddr,
    DataRef,
    ExtentRecord,
    PhysicalRef,
};

pub use pool::{
    Allocator,
    DeferredFree,
    FreeCallback,
    ImmediateFree,
    MemPool,
    NoFree,
    DEFAULT_BLOCK_SIZE,
};
