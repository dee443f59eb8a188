//! Extent records for the evtree
//!
//! An extent record is the leaf payload of the tree: a rectangle key plus a
//! reference to the physical bytes backing it. Records are moved, never
//! copied, so the physical extent they own is released at most once.

use std::fmt;

use tracing::trace;

use crate::error::{EvtError, Result};
use crate::interval::Rect;
use crate::storage::pool::{Allocator, FreeCallback};

/// Opaque physical address handed out by an [`Allocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BioAddr(
    /// Byte address
    pub u64,
);

impl BioAddr {
    /// Reserved address meaning "no data"
    pub const HOLE: BioAddr = BioAddr(u64::MAX);

    /// True for the reserved hole address
    pub fn is_hole(&self) -> bool {
        *self == Self::HOLE
    }

    /// Address `bytes` further into the same allocation, saturating at the
    /// top of the address space
    pub fn offset(&self, bytes: u64) -> BioAddr {
        BioAddr(self.0.saturating_add(bytes))
    }
}

impl fmt::Display for BioAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            write!(f, "hole")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// What a record points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PhysicalRef {
    /// Punched range, no bytes behind it
    Hole,
    /// Bytes owned by the record
    Owned(BioAddr),
}

impl PhysicalRef {
    /// True for punched ranges
    pub fn is_hole(&self) -> bool {
        matches!(self, PhysicalRef::Hole)
    }

    /// Address of the first byte, [`BioAddr::HOLE`] for punches
    pub fn addr(&self) -> BioAddr {
        match self {
            PhysicalRef::Hole => BioAddr::HOLE,
            PhysicalRef::Owned(addr) => *addr,
        }
    }

    /// Reference to the bytes of index `skip` within the extent
    pub fn advance(&self, skip: u64, inob: u32) -> PhysicalRef {
        match self {
            PhysicalRef::Hole => PhysicalRef::Hole,
            PhysicalRef::Owned(addr) => PhysicalRef::Owned(addr.offset(skip.saturating_mul(inob as u64))),
        }
    }
}

impl fmt::Display for PhysicalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Payload supplied with an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRef<'a> {
    /// Punch the range
    Hole,
    /// Reserve space through the allocator and copy these bytes in
    Bytes(&'a [u8]),
    /// Adopt an already reserved address; ownership passes to the tree
    Addr(BioAddr),
}

impl DataRef<'_> {
    /// True for punches, including an adopted hole address
    pub fn is_hole(&self) -> bool {
        match self {
            DataRef::Hole => true,
            DataRef::Addr(addr) => addr.is_hole(),
            DataRef::Bytes(_) => false,
        }
    }
}

/// A record stored in a leaf of the tree
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtentRecord {
    /// Key
    pub rect: Rect,
    /// Physical location of the bytes
    pub phys: PhysicalRef,
    /// Caller supplied version tag
    pub version: u32,
    /// Upper validity limit for the epoch of this record
    pub bound: u64,
    /// Bytes per index, zero for punches
    pub inob: u32,
}

impl ExtentRecord {
    /// Build a record, reserving payload space for [`DataRef::Bytes`].
    ///
    /// Fails with `InvalidArgument` when the rectangle is malformed, the bound
    /// is below the epoch, or `inob` disagrees with the hole-ness of `data`.
    pub fn create(
        alloc: &dyn Allocator,
        rect: Rect,
        inob: u32,
        data: DataRef<'_>,
        version: u32,
        bound: u64,
    ) -> Result<Self> {
        Self::validate(&rect, inob, &data, bound)?;

        let phys = match data {
            DataRef::Hole => PhysicalRef::Hole,
            DataRef::Addr(addr) if addr.is_hole() => PhysicalRef::Hole,
            DataRef::Addr(addr) => PhysicalRef::Owned(addr),
            DataRef::Bytes(bytes) => {
                let addr = alloc.alloc(bytes.len() as u64)?;
                if let Err(err) = alloc.write(addr, bytes) {
                    alloc.free(addr, bytes.len() as u64);
                    return Err(err);
                }
                PhysicalRef::Owned(addr)
            }
        };

        trace!(%rect, %phys, inob, "created extent record");
        Ok(Self {
            rect,
            phys,
            version,
            bound,
            inob,
        })
    }

    /// Argument checks shared by create and the tree's pre-flight
    pub fn validate(rect: &Rect, inob: u32, data: &DataRef<'_>, bound: u64) -> Result<()> {
        if !rect.is_valid() {
            return Err(EvtError::InvalidArgument(format!("{} has lo > hi", rect)));
        }
        if bound < rect.epoch {
            return Err(EvtError::InvalidArgument(format!(
                "bound {} is below epoch of {}",
                bound, rect
            )));
        }
        if data.is_hole() != (inob == 0) {
            return Err(EvtError::InvalidArgument(format!(
                "{}: inob {} does not match {} payload",
                rect,
                inob,
                if data.is_hole() { "hole" } else { "data" }
            )));
        }
        if data.is_hole() {
            return Ok(());
        }
        let expected = payload_len(rect, inob).ok_or_else(|| {
            EvtError::InvalidArgument(format!("{}: {} bytes per index overflows the payload size", rect, inob))
        })?;
        match data {
            DataRef::Addr(addr) if addr.0.checked_add(expected).is_none() => Err(EvtError::InvalidArgument(
                format!("{}: payload at {} runs past the address space", rect, addr),
            )),
            DataRef::Bytes(bytes) if bytes.len() as u64 != expected => Err(EvtError::InvalidArgument(format!(
                "{}: payload is {} bytes, expected {}",
                rect,
                bytes.len(),
                expected
            ))),
            _ => Ok(()),
        }
    }

    /// True if the record punches its range
    pub fn is_punch(&self) -> bool {
        self.phys.is_hole()
    }

    /// Bytes owned by this record
    pub fn payload_size(&self) -> u64 {
        if self.is_punch() {
            0
        } else {
            payload_len(&self.rect, self.inob).unwrap_or(u64::MAX)
        }
    }

    /// Release the owned bytes through `cb`; punches release nothing
    pub fn free(self, alloc: &dyn Allocator, cb: &dyn FreeCallback) -> Result<()> {
        if let PhysicalRef::Owned(addr) = self.phys {
            trace!(rect = %self.rect, %addr, "releasing extent");
            cb.free(alloc, addr, self.payload_size())?;
        }
        Ok(())
    }
}

/// Payload bytes behind `rect`, `None` if the size does not fit in a `u64`
fn payload_len(rect: &Rect, inob: u32) -> Option<u64> {
    (rect.ex_hi - rect.ex_lo).checked_add(1)?.checked_mul(inob as u64)
}

impl fmt::Display for ExtentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ver={} inob={}",
            self.rect, self.phys, self.version, self.inob
        )
    }
}
