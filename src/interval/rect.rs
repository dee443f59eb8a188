//! Rectangles: versioned extents and the arithmetic over them
//!
//! A rectangle is an inclusive byte-offset range paired with the epoch stamp
//! of the write that produced it. The tree is keyed by rectangles sorted by
//! start offset (SSOF): low offset first, then newest stamp first, then the
//! narrower extent first.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::EvtError;

/// Highest representable epoch
pub const EPOCH_MAX: u64 = u64::MAX;

/// Version stamp of a write: the epoch plus an intra-epoch sequence number.
///
/// Stamps order by epoch first and minor epoch second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Stamp {
    /// Major epoch
    pub epoch: u64,
    /// Minor (intra-epoch) epoch
    pub minor: u32,
}

impl Stamp {
    /// Highest possible stamp
    pub const MAX: Stamp = Stamp {
        epoch: EPOCH_MAX,
        minor: u32::MAX,
    };

    /// Stamp from its two parts
    pub const fn new(epoch: u64, minor: u32) -> Self {
        Self { epoch, minor }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.minor)
    }
}

/// Inclusive offset range without a time dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Extent {
    /// First offset (inclusive)
    pub lo: u64,
    /// Last offset (inclusive)
    pub hi: u64,
}

impl Extent {
    /// Extent `[lo, hi]`
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// The whole offset space
    pub const fn all() -> Self {
        Self { lo: 0, hi: u64::MAX }
    }

    /// False for inverted extents
    pub fn is_valid(&self) -> bool {
        self.lo <= self.hi
    }

    /// Number of indices covered. Saturates for the full offset space and is
    /// zero for an inverted extent.
    pub fn width(&self) -> u64 {
        match self.hi.checked_sub(self.lo) {
            Some(span) => span.saturating_add(1),
            None => 0,
        }
    }

    /// Offset ranges intersect
    pub fn overlaps(&self, other: &Extent) -> bool {
        !(other.hi < self.lo || other.lo > self.hi)
    }

    /// True if `other` lies entirely inside `self`
    pub fn contains(&self, other: &Extent) -> bool {
        self.lo <= other.lo && self.hi >= other.hi
    }

    /// Intersection of two extents, `None` when they are disjoint
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Extent::new(self.lo.max(other.lo), self.hi.min(other.hi)))
    }

    /// True if the two extents do not overlap but share a boundary
    pub fn touches(&self, other: &Extent) -> bool {
        (self.hi != u64::MAX && self.hi + 1 == other.lo)
            || (other.hi != u64::MAX && other.hi + 1 == self.lo)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// A versioned extent, the key type of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Rect {
    /// First offset (inclusive)
    pub ex_lo: u64,
    /// Last offset (inclusive)
    pub ex_hi: u64,
    /// Epoch of the write
    pub epoch: u64,
    /// Minor epoch of the write
    pub minor_epoch: u32,
}

impl Rect {
    /// Rectangle `[ex_lo, ex_hi]` written at `epoch.minor_epoch`
    pub const fn new(ex_lo: u64, ex_hi: u64, epoch: u64, minor_epoch: u32) -> Self {
        Self {
            ex_lo,
            ex_hi,
            epoch,
            minor_epoch,
        }
    }

    /// Rectangle over `extent` written at `stamp`
    pub fn from_extent(extent: Extent, stamp: Stamp) -> Self {
        Self::new(extent.lo, extent.hi, stamp.epoch, stamp.minor)
    }

    /// False for inverted offset ranges
    pub fn is_valid(&self) -> bool {
        self.ex_lo <= self.ex_hi
    }

    /// Offset range without the stamp
    pub fn extent(&self) -> Extent {
        Extent::new(self.ex_lo, self.ex_hi)
    }

    /// Version stamp of the write
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.epoch, self.minor_epoch)
    }

    /// Number of indices covered
    pub fn width(&self) -> u64 {
        self.extent().width()
    }

    /// Offset ranges intersect, epochs are not considered
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.extent().overlaps(&other.extent())
    }

    /// The offset range of `inner` is a subset of this one
    pub fn contains(&self, inner: &Rect) -> bool {
        self.extent().contains(&inner.extent())
    }

    /// Truncate the rectangle to `bounds`, keeping its stamp
    pub fn clip(&self, bounds: &Extent) -> Option<Rect> {
        self.extent()
            .intersect(bounds)
            .map(|ext| Rect::from_extent(ext, self.stamp()))
    }

    /// Same offset range, stamps not compared
    pub fn same_extent(&self, other: &Rect) -> bool {
        self.ex_lo == other.ex_lo && self.ex_hi == other.ex_hi
    }

    /// Written with a higher stamp than `other`
    pub fn is_newer_than(&self, other: &Rect) -> bool {
        self.stamp() > other.stamp()
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}@{}.{}",
            self.ex_lo, self.ex_hi, self.epoch, self.minor_epoch
        )
    }
}

/// Parses `lo-hi@epoch[.minor]`
impl FromStr for Rect {
    type Err = EvtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || EvtError::InvalidArgument(format!("malformed rectangle '{}'", s));

        let (range, stamp) = s.split_once('@').ok_or_else(bad)?;
        let (lo, hi) = range.split_once('-').ok_or_else(bad)?;
        let (epoch, minor) = match stamp.split_once('.') {
            Some((e, m)) => (e, m),
            None => (stamp, "0"),
        };

        let rect = Rect::new(
            lo.trim().parse().map_err(|_| bad())?,
            hi.trim().parse().map_err(|_| bad())?,
            epoch.trim().parse().map_err(|_| bad())?,
            minor.trim().parse().map_err(|_| bad())?,
        );
        if !rect.is_valid() {
            return Err(EvtError::InvalidArgument(format!(
                "rectangle {} has lo > hi",
                rect
            )));
        }
        Ok(rect)
    }
}

/// SSOF ordering: start offset ascending, stamp descending, end offset ascending
pub fn ssof_cmp(a: &Rect, b: &Rect) -> Ordering {
    a.ex_lo
        .cmp(&b.ex_lo)
        .then_with(|| b.stamp().cmp(&a.stamp()))
        .then_with(|| a.ex_hi.cmp(&b.ex_hi))
}

/// How the offset range of an in-tree rectangle relates to a query rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOverlap {
    /// Offsets do not intersect
    No,
    /// Identical offset ranges
    Same,
    /// In-tree range includes the query range
    Included,
    /// Query range includes the in-tree range
    Includes,
    /// Ranges intersect, neither includes the other
    Partial,
}

/// How the stamp of an in-tree rectangle relates to a query rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOverlap {
    /// Equal stamps
    Same,
    /// In-tree rectangle is older than the query
    Over,
    /// In-tree rectangle is newer than the query
    Under,
}

/// Classify the overlap of an in-tree rectangle with a query rectangle.
///
/// Not symmetric: `in_tree` is the stored rectangle and `query` the one being
/// searched for or inserted. Returns `None` for the time dimension when the
/// offsets do not intersect.
pub fn classify(in_tree: &Rect, query: &Rect) -> (RangeOverlap, Option<TimeOverlap>) {
    if !in_tree.overlaps(query) {
        return (RangeOverlap::No, None);
    }

    let time = match in_tree.stamp().cmp(&query.stamp()) {
        Ordering::Equal => TimeOverlap::Same,
        Ordering::Less => TimeOverlap::Over,
        Ordering::Greater => TimeOverlap::Under,
    };

    let range = if in_tree.same_extent(query) {
        RangeOverlap::Same
    } else if in_tree.contains(query) {
        RangeOverlap::Included
    } else if query.contains(in_tree) {
        RangeOverlap::Includes
    } else {
        RangeOverlap::Partial
    };

    (range, Some(time))
}

/// Minimum bounding rectangle of a subtree: offset hull plus epoch range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Mbr {
    /// Offset hull
    pub extent: Extent,
    /// Oldest epoch in the subtree
    pub epc_lo: u64,
    /// Newest epoch in the subtree
    pub epc_hi: u64,
}

impl Mbr {
    /// Identity for `merge`; matches no filter
    pub const fn empty() -> Self {
        Self {
            extent: Extent::new(u64::MAX, 0),
            epc_lo: u64::MAX,
            epc_hi: 0,
        }
    }

    /// True until something is merged in
    pub fn is_empty(&self) -> bool {
        !self.extent.is_valid()
    }

    /// Bounds of a single rectangle
    pub fn from_rect(rect: &Rect) -> Self {
        Self {
            extent: rect.extent(),
            epc_lo: rect.epoch,
            epc_hi: rect.epoch,
        }
    }

    /// Enlarge to include `rect`; returns true if the MBR changed
    pub fn merge_rect(&mut self, rect: &Rect) -> bool {
        self.merge(&Mbr::from_rect(rect))
    }

    /// Enlarge to include `other`; returns true if the MBR changed
    pub fn merge(&mut self, other: &Mbr) -> bool {
        let before = *self;
        self.extent.lo = self.extent.lo.min(other.extent.lo);
        self.extent.hi = self.extent.hi.max(other.extent.hi);
        self.epc_lo = self.epc_lo.min(other.epc_lo);
        self.epc_hi = self.epc_hi.max(other.epc_hi);
        before != *self
    }

    /// True if merging `rect` would enlarge the MBR
    pub fn is_wider(&self, rect: &Rect) -> bool {
        let mut merged = *self;
        merged.merge_rect(rect)
    }

    /// Could any rectangle inside this MBR be admitted by `filter`
    pub fn may_match(&self, filter: &EvtFilter) -> bool {
        !self.is_empty()
            && self.extent.overlaps(&filter.extent)
            && self.epc_lo <= filter.epr_hi
            && self.epc_hi >= filter.epr_lo
    }
}

impl fmt::Display for Mbr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}-{}", self.extent, self.epc_lo, self.epc_hi)
    }
}

/// Selection criteria for find, iteration and range removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct EvtFilter {
    /// Offsets of interest; results are clipped to it
    pub extent: Extent,
    /// Lowest epoch considered (inclusive)
    pub epr_lo: u64,
    /// Highest epoch considered (inclusive)
    pub epr_hi: u64,
    /// Outer punch: every record at or below this stamp is treated as punched
    pub punch: Option<Stamp>,
}

impl EvtFilter {
    /// Everything in `[lo, hi]` written at or below `epoch`
    pub fn new(lo: u64, hi: u64, epoch: u64) -> Self {
        Self::with_epoch_range(lo, hi, 0, epoch)
    }

    /// Everything in `[lo, hi]` written in `epr_lo..=epr_hi`
    pub fn with_epoch_range(lo: u64, hi: u64, epr_lo: u64, epr_hi: u64) -> Self {
        Self {
            extent: Extent::new(lo, hi),
            epr_lo,
            epr_hi,
            punch: None,
        }
    }

    /// All offsets at all epochs
    pub fn all() -> Self {
        Self::with_epoch_range(0, u64::MAX, 0, EPOCH_MAX)
    }

    /// Treat everything at or below `stamp` as punched
    pub fn punched_at(mut self, stamp: Stamp) -> Self {
        self.punch = Some(stamp);
        self
    }

    /// Reject inverted offset or epoch ranges
    pub fn validate(&self) -> Result<(), EvtError> {
        if !self.extent.is_valid() {
            return Err(EvtError::InvalidArgument(format!(
                "filter extent {} has lo > hi",
                self.extent
            )));
        }
        if self.epr_lo > self.epr_hi {
            return Err(EvtError::InvalidArgument(format!(
                "filter epoch range {}-{} is inverted",
                self.epr_lo, self.epr_hi
            )));
        }
        Ok(())
    }

    /// Rectangle overlaps the filter extent and its epoch is in range
    pub fn admits(&self, rect: &Rect) -> bool {
        self.extent.overlaps(&rect.extent())
            && rect.epoch >= self.epr_lo
            && rect.epoch <= self.epr_hi
    }

    /// Rectangle is hidden by the outer punch
    pub fn is_outer_punched(&self, rect: &Rect) -> bool {
        self.punch.is_some_and(|p| rect.stamp() <= p)
    }
}

impl Default for EvtFilter {
    fn default() -> Self {
        Self::all()
    }
}
