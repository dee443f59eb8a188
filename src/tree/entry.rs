//! Values passed into and out of the tree

use std::fmt;

use crate::interval::{Extent, Rect, Stamp};
use crate::storage::{BioAddr, DataRef, ExtentRecord, PhysicalRef};

/// Arguments of an insert
#[derive(Debug, Clone, Copy)]
pub struct EntryIn<'a> {
    pub rect: Rect,
    /// Bytes per index, zero for punches
    pub inob: u32,
    pub data: DataRef<'a>,
    pub version: u32,
    /// Upper validity epoch, defaults to the record's own epoch
    pub bound: u64,
}

impl<'a> EntryIn<'a> {
    /// Write `bytes`, `inob` bytes per index
    pub fn data(rect: Rect, inob: u32, bytes: &'a [u8]) -> Self {
        Self::with(rect, inob, DataRef::Bytes(bytes))
    }

    /// Adopt bytes the caller already reserved at `addr`
    pub fn addr(rect: Rect, inob: u32, addr: BioAddr) -> Self {
        Self::with(rect, inob, DataRef::Addr(addr))
    }

    /// Punch the range
    pub fn punch(rect: Rect) -> Self {
        Self::with(rect, 0, DataRef::Hole)
    }

    fn with(rect: Rect, inob: u32, data: DataRef<'a>) -> Self {
        Self {
            rect,
            inob,
            data,
            version: 0,
            bound: rect.epoch,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn bound(mut self, bound: u64) -> Self {
        self.bound = bound;
        self
    }
}

/// Result of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Inserted, and the new record continues an older neighbour both in
    /// offset and in physical address. Advisory only: the records stay
    /// separate in the tree.
    Merged,
}

/// Visibility of a returned entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Visibility {
    /// Raw record, not resolved
    Unknown,
    Visible,
    Covered,
}

/// A record, or the part of it selected by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct EvtEntry {
    /// Sub-range this entry stands for
    pub selected: Extent,
    /// Key of the whole record
    pub full: Rect,
    /// Physical location of `selected.lo`
    pub phys: PhysicalRef,
    pub inob: u32,
    pub version: u32,
    pub bound: u64,
    pub visibility: Visibility,
}

impl EvtEntry {
    pub(crate) fn from_record(record: &ExtentRecord, selected: Extent, visibility: Visibility) -> Self {
        Self {
            selected,
            full: record.rect,
            phys: record
                .phys
                .advance(selected.lo - record.rect.ex_lo, record.inob),
            inob: record.inob,
            version: record.version,
            bound: record.bound,
            visibility,
        }
    }

    pub fn is_punch(&self) -> bool {
        self.phys.is_hole()
    }

    pub fn stamp(&self) -> Stamp {
        self.full.stamp()
    }

    /// Selected range with the record's stamp
    pub fn rect(&self) -> Rect {
        Rect::from_extent(self.selected, self.stamp())
    }

    /// Payload bytes behind `selected`
    pub fn payload_size(&self) -> u64 {
        if self.is_punch() {
            0
        } else {
            self.selected.width() * self.inob as u64
        }
    }
}

impl fmt::Display for EvtEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vis = match self.visibility {
            Visibility::Unknown => "",
            Visibility::Visible => " visible",
            Visibility::Covered => " covered",
        };
        write!(
            f,
            "{}@{} (full {}) {} ver={} inob={}{}",
            self.selected,
            self.stamp(),
            self.full,
            self.phys,
            self.version,
            self.inob,
            vis
        )
    }
}

/// Collapse adjacent data entries into maximal live ranges.
///
/// Punched entries break a run; input must be sorted by offset.
pub fn coalesce(entries: &[EvtEntry]) -> Vec<Extent> {
    let mut runs: Vec<Extent> = Vec::new();
    for entry in entries.iter().filter(|e| !e.is_punch()) {
        match runs.last_mut() {
            Some(last) if last.hi.checked_add(1) == Some(entry.selected.lo) => {
                last.hi = entry.selected.hi;
            }
            _ => runs.push(entry.selected),
        }
    }
    runs
}
