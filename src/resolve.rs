//! Visibility resolution
//!
//! Given the records that overlap a query, decide for every offset which
//! record is authoritative. The offset space is cut at every record boundary
//! into atomic sub-ranges; inside each one the record with the highest stamp
//! is visible and every other record is covered. At equal stamps a punch
//! beats data.
//!
//! An outer punch stamp covers every record at or below it without being
//! stored anywhere.

use std::collections::BTreeSet;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::interval::{Extent, Rect, Stamp};

/// One record taking part in a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Record key, already clipped to the query
    pub rect: Rect,
    pub punch: bool,
}

/// Outcome of a resolution. Candidates are referred to by their index in the
/// input slice.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    visible: Vec<(Extent, usize)>,
    covered: Vec<Vec<Extent>>,
}

impl Resolution {
    /// Visible runs sorted by offset; neighbouring runs of the same
    /// candidate are merged
    pub fn visible(&self) -> &[(Extent, usize)] {
        &self.visible
    }

    /// Covered runs of one candidate, sorted by offset
    pub fn covered(&self, idx: usize) -> &[Extent] {
        self.covered.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every covered run in candidate order
    pub fn covered_runs(&self) -> impl Iterator<Item = (usize, Extent)> + '_ {
        self.covered
            .iter()
            .enumerate()
            .flat_map(|(idx, runs)| runs.iter().map(move |ext| (idx, *ext)))
    }

    /// Visible runs of one candidate
    pub fn visible_of(&self, idx: usize) -> impl Iterator<Item = Extent> + '_ {
        self.visible
            .iter()
            .filter(move |(_, owner)| *owner == idx)
            .map(|(ext, _)| *ext)
    }

    /// Sum of the widths of all visible runs
    pub fn visible_width(&self) -> u64 {
        self.visible.iter().map(|(ext, _)| ext.width()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    /// First offset after the boundary; `u64::MAX + 1` is representable
    at: u128,
    start: bool,
    idx: usize,
}

/// Reusable resolver; scratch memory is recycled between calls
#[derive(Debug, Default)]
pub struct Resolver {
    scratch: Bump,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `candidates` into visible and covered runs
    pub fn resolve(&mut self, candidates: &[Candidate], outer_punch: Option<Stamp>) -> Resolution {
        self.scratch.reset();

        let mut bounds = BumpVec::with_capacity_in(candidates.len() * 2, &self.scratch);
        for (idx, c) in candidates.iter().enumerate() {
            bounds.push(Boundary {
                at: c.rect.ex_lo as u128,
                start: true,
                idx,
            });
            bounds.push(Boundary {
                at: c.rect.ex_hi as u128 + 1,
                start: false,
                idx,
            });
        }
        // Ends sort before starts at the same offset
        bounds.sort_unstable_by_key(|b| (b.at, b.start, b.idx));

        let mut out = Resolution {
            visible: Vec::new(),
            covered: vec![Vec::new(); candidates.len()],
        };
        // Highest element is the winner: newest stamp, then punch over data
        let mut active: BTreeSet<(Stamp, bool, usize)> = BTreeSet::new();

        let mut i = 0;
        while i < bounds.len() {
            let at = bounds[i].at;
            while i < bounds.len() && bounds[i].at == at {
                let b = bounds[i];
                let c = &candidates[b.idx];
                let key = (c.rect.stamp(), c.punch, b.idx);
                if b.start {
                    active.insert(key);
                } else {
                    active.remove(&key);
                }
                i += 1;
            }

            let Some(&(top_stamp, _, top)) = active.last() else {
                continue;
            };
            let Some(next) = bounds.get(i) else {
                break;
            };
            let segment = Extent::new(at as u64, (next.at - 1) as u64);
            let hidden = outer_punch.is_some_and(|p| top_stamp <= p);

            for &(_, _, idx) in &active {
                if idx == top && !hidden {
                    push_run(&mut out.visible, segment, idx);
                } else {
                    extend_run(&mut out.covered[idx], segment);
                }
            }
        }

        out
    }
}

fn push_run(runs: &mut Vec<(Extent, usize)>, segment: Extent, idx: usize) {
    match runs.last_mut() {
        Some((last, owner)) if *owner == idx && last.hi + 1 == segment.lo => {
            last.hi = segment.hi;
        }
        _ => runs.push((segment, idx)),
    }
}

fn extend_run(runs: &mut Vec<Extent>, segment: Extent) {
    match runs.last_mut() {
        Some(last) if last.hi + 1 == segment.lo => last.hi = segment.hi,
        _ => runs.push(segment),
    }
}
