//! evtree: Versioned Extent Tree
//!
//! This crate provides an epoch-aware interval index that maps byte ranges of
//! a logical object to physical storage locations. Every write is stamped with
//! an epoch and a minor epoch; newer writes shadow older ones, punches mark
//! ranges as absent, and queries resolve which record is authoritative for
//! each sub-range at a given epoch.
//!
//! The tree itself never touches payload bytes except through the
//! [`storage::Allocator`] capability it is created with, and releases physical
//! extents through an injected [`storage::FreeCallback`].

#![warn(missing_docs)]

/// Rectangle arithmetic, SSOF ordering and query filters
pub mod interval;

/// Extent records, physical references and the allocator interfaces
pub mod storage;

/// The balanced extent tree and its persisted root
pub mod tree;

/// Visibility resolution over overlapping records
pub mod resolve;

/// Cursors over the tree
pub mod iter;

// Re-exports
pub use config::EvtConfig;
pub use error::{EvtError, Result};
pub use interval::{EvtFilter, Extent, Rect, Stamp};
pub use iter::{Anchor, Direction, EvtIter, IterOptions, IterationMode, Probe};
pub use resolve::{Resolution, Resolver};
pub use storage::{
    Allocator, BioAddr, DataRef, DeferredFree, ExtentRecord, FreeCallback, ImmediateFree, MemPool,
    NoFree, PhysicalRef,
};
pub use tree::{EntryIn, EvTree, EvtEntry, EvtRoot, InsertOutcome, Visibility};

/// Error types for tree operations
pub mod error {
    use thiserror::Error;

    use crate::interval::Rect;

    /// Errors that can occur in evtree operations
    ///
    /// `NotFound` and `EndOfSequence` double as control-flow signals for
    /// lookups and cursors; see [`EvtError::is_end`].
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum EvtError {
        /// Malformed rectangle, filter, option set or configuration
        #[error("invalid argument: {0}")]
        InvalidArgument(String),

        /// The allocator could not satisfy a reservation
        #[error("out of space")]
        OutOfMemory,

        /// A record with a conflicting key already exists
        #[error("duplicate extent {0}")]
        Duplicate(Rect),

        /// No record or anchor matched
        #[error("not found")]
        NotFound,

        /// Cursor ran off the end, or was never positioned
        #[error("end of sequence")]
        EndOfSequence,

        /// Operation is not allowed in the current mode
        #[error("invalid operation: {0}")]
        InvalidOperation(&'static str),

        /// Handle was closed or destroyed
        #[error("invalid tree handle")]
        InvalidHandle,

        /// Internal structural invariant violated
        #[error("tree is corrupt: {0}")]
        CorruptTree(String),

        /// Persisted root failed validation
        #[error("persisted root is corrupt: {0}")]
        CorruptState(String),
    }

    impl EvtError {
        /// True for the "nothing (more) here" signals
        pub fn is_end(&self) -> bool {
            matches!(self, EvtError::NotFound | EvtError::EndOfSequence)
        }
    }

    /// Result alias used throughout the crate
    pub type Result<T> = std::result::Result<T, EvtError>;
}

/// Configuration options for a tree
pub mod config {
    use crate::error::{EvtError, Result};

    /// Smallest supported tree order
    pub const EVT_ORDER_MIN: u16 = 4;

    /// Largest supported tree order
    pub const EVT_ORDER_MAX: u16 = 128;

    /// Records are sorted by start offset
    pub const EVT_FEAT_SORT_SOFF: u64 = 1 << 0;

    /// Every feature bit this implementation understands
    pub const EVT_FEATS_SUPPORTED: u64 = EVT_FEAT_SORT_SOFF;

    /// Configuration for an evtree instance
    #[derive(Debug, Clone, PartialEq, Eq)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct EvtConfig {
        /// Maximum number of entries per node
        pub order: u16,
        /// Feature bits persisted in the root
        pub feats: u64,
        /// Node dump verbosity after each mutation: `None` disables dumping,
        /// `-1` dumps every level, `-2` adds leaf records
        pub debug_level: Option<i32>,
    }

    impl EvtConfig {
        /// Default configuration with a specific order
        pub fn with_order(order: u16) -> Self {
            Self {
                order,
                ..Self::default()
            }
        }

        /// Check order and feature bits
        pub fn validate(&self) -> Result<()> {
            if !(EVT_ORDER_MIN..=EVT_ORDER_MAX).contains(&self.order) {
                return Err(EvtError::InvalidArgument(format!(
                    "order {} outside {}..={}",
                    self.order, EVT_ORDER_MIN, EVT_ORDER_MAX
                )));
            }
            if self.feats & !EVT_FEATS_SUPPORTED != 0 {
                return Err(EvtError::InvalidArgument(format!(
                    "unknown feature bits {:#x}",
                    self.feats & !EVT_FEATS_SUPPORTED
                )));
            }
            if self.feats & EVT_FEAT_SORT_SOFF == 0 {
                return Err(EvtError::InvalidArgument(
                    "a sort policy feature bit is required".to_string(),
                ));
            }
            Ok(())
        }
    }

    impl Default for EvtConfig {
        fn default() -> Self {
            Self {
                order: 16,
                feats: EVT_FEAT_SORT_SOFF,
                debug_level: None,
            }
        }
    }
}
