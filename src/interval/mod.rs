//! Interval module for evtree
//!
//! This module provides the rectangle arithmetic the tree is built on:
//! versioned extents, their SSOF ordering, overlap classification, bounding
//! rectangles and query filters.

pub mod rect;

// Re-export key types and functions
pub use rect::{
    classify,
    ssof_cmp,
    EvtFilter,
    Extent,
    Mbr,
    RangeOverlap,
    Rect,
    Stamp,
    TimeOverlap,
    EPOCH_MAX,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_integration() {
        // A newer write inside an older one: classified from both sides
        let old = Rect::new(0, 99, 1, 0);
        let new = Rect::new(10, 19, 2, 0);

        assert_eq!(classify(&old, &new), (RangeOverlap::Included, Some(TimeOverlap::Over)));
        assert_eq!(classify(&new, &old), (RangeOverlap::Includes, Some(TimeOverlap::Under)));
        assert_eq!(ssof_cmp(&old, &new), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_filter_clip_integration() {
        let filter = EvtFilter::new(50, 60, 10);
        let rect = Rect::new(0, 99, 3, 0);

        assert!(filter.admits(&rect));
        assert_eq!(rect.clip(&filter.extent).unwrap().width(), 11);
    }
}
