/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Life intervals of values, as produced by liveness analysis and
//! refined by the register allocator (locations, splits).

use crate::{FxHashMap, InstId, LifeNumber, Location, PReg, ValueType};
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

/// A half-open range `[begin, end)` of life numbers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct LiveRange {
    pub begin: LifeNumber,
    pub end: LifeNumber,
}

impl LiveRange {
    #[inline(always)]
    pub fn new(begin: LifeNumber, end: LifeNumber) -> Self {
        debug_assert!(begin <= end);
        LiveRange { begin, end }
    }

    #[inline(always)]
    pub fn contains(self, ln: LifeNumber) -> bool {
        self.begin <= ln && ln < self.end
    }

    #[inline(always)]
    pub fn overlaps(self, other: LiveRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

impl fmt::Debug for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

define_index!(IntervalIndex);

/// One piece of a value's lifetime spent in a single location.
///
/// A value starts as one interval; every split made by the allocator
/// appends a sibling that takes over the tail of the ranges. Siblings
/// are linked in ascending order of their ranges.
#[derive(Clone, Debug)]
pub struct LifeInterval {
    inst: InstId,
    ty: ValueType,
    ranges: SmallVec<[LiveRange; 2]>,
    location: Location,
    sibling: Option<IntervalIndex>,
    is_split_sibling: bool,
}

impl LifeInterval {
    fn new(inst: InstId, ty: ValueType) -> Self {
        LifeInterval {
            inst,
            ty,
            ranges: SmallVec::new(),
            location: Location::None,
            sibling: None,
            is_split_sibling: false,
        }
    }

    #[inline(always)]
    pub fn inst(&self) -> InstId {
        self.inst
    }

    #[inline(always)]
    pub fn ty(&self) -> ValueType {
        self.ty
    }

    #[inline(always)]
    pub fn ranges(&self) -> &[LiveRange] {
        &self.ranges
    }

    #[inline(always)]
    pub fn begin(&self) -> LifeNumber {
        self.ranges.first().map_or(0, |r| r.begin)
    }

    #[inline(always)]
    pub fn end(&self) -> LifeNumber {
        self.ranges.last().map_or(0, |r| r.end)
    }

    #[inline(always)]
    pub fn location(&self) -> Location {
        self.location
    }

    #[inline(always)]
    pub fn reg(&self) -> Option<PReg> {
        self.location.reg()
    }

    #[inline(always)]
    pub fn has_reg(&self) -> bool {
        self.location.is_reg()
    }

    #[inline(always)]
    pub fn sibling(&self) -> Option<IntervalIndex> {
        self.sibling
    }

    #[inline(always)]
    pub fn is_split_sibling(&self) -> bool {
        self.is_split_sibling
    }

    /// Does this interval hold the value at `ln`?
    ///
    /// With `LIVE_INPUTS` the end of the value's very last range is
    /// included: a value whose last use is the instruction at `ln` still
    /// has to be preserved while that instruction runs. Without it the
    /// check is the plain half-open one. A split boundary always belongs
    /// to the later sibling.
    pub fn split_cover<const LIVE_INPUTS: bool>(&self, ln: LifeNumber) -> bool {
        let last = self.ranges.len().wrapping_sub(1);
        self.ranges.iter().enumerate().any(|(i, r)| {
            r.contains(ln) || (LIVE_INPUTS && i == last && self.sibling.is_none() && ln == r.end)
        })
    }

    /// First life number at which both intervals are live, if any.
    pub fn intersects(&self, other: &LifeInterval) -> Option<LifeNumber> {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.overlaps(b) {
                return Some(core::cmp::max(a.begin, b.begin));
            }
            if a.end <= b.begin {
                i += 1;
            } else {
                j += 1;
            }
        }
        None
    }

    fn add_range(&mut self, range: LiveRange) {
        if range.begin == range.end {
            return;
        }
        let pos = self.ranges.partition_point(|r| r.end < range.begin);
        let mut merged = range;
        let mut end_pos = pos;
        while end_pos < self.ranges.len() && self.ranges[end_pos].begin <= merged.end {
            merged.begin = core::cmp::min(merged.begin, self.ranges[end_pos].begin);
            merged.end = core::cmp::max(merged.end, self.ranges[end_pos].end);
            end_pos += 1;
        }
        self.ranges.drain(pos..end_pos);
        self.ranges.insert(pos, merged);
    }
}

/// All intervals of a method.
///
/// Intervals live in one arena and refer to each other by
/// [`IntervalIndex`]. The head of each value (its first interval) is
/// found through the defining instruction.
#[derive(Clone, Debug, Default)]
pub struct LifeIntervals {
    intervals: Vec<LifeInterval>,
    /// Heads in creation order.
    heads: Vec<IntervalIndex>,
    head_of: FxHashMap<InstId, IntervalIndex>,
    life_numbers: FxHashMap<InstId, LifeNumber>,
    inst_life_numbers: Vec<(InstId, LifeNumber)>,
}

impl LifeIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Creates the head interval of the value defined by `inst`.
    pub fn add_interval(&mut self, inst: InstId, ty: ValueType) -> IntervalIndex {
        assert!(
            !self.head_of.contains_key(&inst),
            "{:?} already has an interval",
            inst
        );
        let idx = IntervalIndex::new(self.intervals.len());
        self.intervals.push(LifeInterval::new(inst, ty));
        self.heads.push(idx);
        self.head_of.insert(inst, idx);
        idx
    }

    /// Adds `[begin, end)` to an interval, merging with overlapping or
    /// adjacent ranges.
    pub fn add_range(&mut self, idx: IntervalIndex, begin: LifeNumber, end: LifeNumber) {
        self.intervals[idx.index()].add_range(LiveRange::new(begin, end));
    }

    pub fn set_location(&mut self, idx: IntervalIndex, location: Location) {
        self.intervals[idx.index()].location = location;
    }

    /// Records the life number of an instruction.
    pub fn set_life_number(&mut self, inst: InstId, ln: LifeNumber) {
        if self.life_numbers.insert(inst, ln).is_none() {
            self.inst_life_numbers.push((inst, ln));
        } else if let Some(entry) = self.inst_life_numbers.iter_mut().find(|e| e.0 == inst) {
            entry.1 = ln;
        }
    }

    #[inline]
    pub fn life_number(&self, inst: InstId) -> Option<LifeNumber> {
        self.life_numbers.get(&inst).copied()
    }

    #[inline]
    pub fn head_of(&self, inst: InstId) -> Option<IntervalIndex> {
        self.head_of.get(&inst).copied()
    }

    /// Head intervals, one per value, in creation order.
    pub fn heads(&self) -> impl Iterator<Item = IntervalIndex> + '_ {
        self.heads.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IntervalIndex, &LifeInterval)> + '_ {
        self.intervals
            .iter()
            .enumerate()
            .map(|(i, interval)| (IntervalIndex::new(i), interval))
    }

    /// An interval and all of its later siblings.
    pub fn siblings(&self, idx: IntervalIndex) -> Siblings<'_> {
        Siblings {
            intervals: self,
            next: Some(idx),
        }
    }

    /// Splits the interval at `ln`: ranges from `ln` onwards move into a
    /// new sibling, which has no location yet and is linked right after
    /// `idx`.
    pub fn split_at(&mut self, idx: IntervalIndex, ln: LifeNumber) -> IntervalIndex {
        let child_idx = IntervalIndex::new(self.intervals.len());
        let parent = &mut self.intervals[idx.index()];
        assert!(
            parent.begin() < ln && ln < parent.end(),
            "split position {} outside of ({}, {})",
            ln,
            parent.begin(),
            parent.end()
        );

        let mut child = LifeInterval::new(parent.inst, parent.ty);
        let first_moved = parent.ranges.partition_point(|r| r.end <= ln);
        let moved: SmallVec<[LiveRange; 2]> = parent.ranges.drain(first_moved..).collect();
        for range in moved {
            if range.begin < ln {
                parent.ranges.push(LiveRange::new(range.begin, ln));
                child.ranges.push(LiveRange::new(ln, range.end));
            } else {
                child.ranges.push(range);
            }
        }
        child.sibling = parent.sibling;
        child.is_split_sibling = true;
        parent.sibling = Some(child_idx);

        trace!(
            "split {:?} of {:?} at {}: {:?} / {:?}",
            idx,
            child.inst,
            ln,
            parent.ranges,
            child.ranges
        );
        self.intervals.push(child);
        child_idx
    }

    /// The sibling of the value headed by `head` that holds it at `ln`.
    pub fn find_sibling_at(&self, head: IntervalIndex, ln: LifeNumber) -> Option<IntervalIndex> {
        self.siblings(head)
            .find(|(_, sibling)| sibling.split_cover::<true>(ln))
            .map(|(idx, _)| idx)
    }

    /// Location of the value defined by `inst` at `ln`.
    pub fn location_at(&self, inst: InstId, ln: LifeNumber) -> Option<Location> {
        let head = self.head_of(inst)?;
        let idx = self.find_sibling_at(head, ln)?;
        Some(self[idx].location)
    }

    /// Every register the allocator assigned, once, with the widest type
    /// it held. Sorted by register index.
    pub fn used_registers(&self) -> Vec<(PReg, ValueType)> {
        let mut used: FxHashMap<PReg, ValueType> = FxHashMap::default();
        for interval in &self.intervals {
            if let Some(reg) = interval.reg() {
                let ty = interval.ty;
                used.entry(reg)
                    .and_modify(|old| {
                        if ty == ValueType::Int64 || ty == ValueType::Float64 {
                            *old = ty;
                        }
                    })
                    .or_insert(ty);
            }
        }
        let mut used: Vec<_> = used.into_iter().collect();
        used.sort_unstable_by_key(|(reg, _)| reg.index());
        used
    }

    /// Highest spill slot in use.
    pub fn max_stack_slot(&self) -> Option<u32> {
        self.intervals
            .iter()
            .filter_map(|i| match i.location {
                Location::Stack(slot) => Some(slot),
                _ => None,
            })
            .max()
    }

    /// Instructions with known life numbers, in the order they were added.
    pub fn inst_life_numbers(&self) -> &[(InstId, LifeNumber)] {
        &self.inst_life_numbers
    }

    /// Checks the sibling chains: ranges ascending and disjoint, and
    /// siblings in order.
    pub fn validate(&self) -> bool {
        self.heads.iter().all(|&head| {
            let mut last_end = None;
            for (_, interval) in self.siblings(head) {
                for range in interval.ranges() {
                    if range.begin >= range.end {
                        return false;
                    }
                    if let Some(end) = last_end {
                        if range.begin < end {
                            return false;
                        }
                    }
                    last_end = Some(range.end);
                }
            }
            true
        })
    }
}

impl core::ops::Index<IntervalIndex> for LifeIntervals {
    type Output = LifeInterval;

    #[inline(always)]
    fn index(&self, idx: IntervalIndex) -> &LifeInterval {
        &self.intervals[idx.index()]
    }
}

/// Iterator over a sibling chain.
pub struct Siblings<'a> {
    intervals: &'a LifeIntervals,
    next: Option<IntervalIndex>,
}

impl<'a> Iterator for Siblings<'a> {
    type Item = (IntervalIndex, &'a LifeInterval);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let interval = &self.intervals[idx];
        self.next = interval.sibling;
        Some((idx, interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn inst(i: usize) -> InstId {
        InstId::new(i)
    }

    #[test]
    fn ranges_merge() {
        let mut intervals = LifeIntervals::new();
        let i = intervals.add_interval(inst(0), ValueType::Int32);
        intervals.add_range(i, 10, 12);
        intervals.add_range(i, 0, 4);
        intervals.add_range(i, 4, 6);
        intervals.add_range(i, 11, 20);
        assert_eq!(
            intervals[i].ranges(),
            &[LiveRange::new(0, 6), LiveRange::new(10, 20)]
        );
        assert_eq!(intervals[i].begin(), 0);
        assert_eq!(intervals[i].end(), 20);
    }

    #[test]
    fn split_moves_tail_ranges() {
        let mut intervals = LifeIntervals::new();
        let head = intervals.add_interval(inst(0), ValueType::Int64);
        intervals.add_range(head, 0, 6);
        intervals.add_range(head, 10, 20);
        intervals.set_location(head, Location::Reg(PReg::int(0)));

        let child = intervals.split_at(head, 4);
        assert_eq!(intervals[head].ranges(), &[LiveRange::new(0, 4)]);
        assert_eq!(
            intervals[child].ranges(),
            &[LiveRange::new(4, 6), LiveRange::new(10, 20)]
        );
        assert!(intervals[child].is_split_sibling());
        assert_eq!(intervals[child].location(), Location::None);
        assert_eq!(intervals[head].sibling(), Some(child));

        let grandchild = intervals.split_at(child, 12);
        assert_eq!(intervals[child].sibling(), Some(grandchild));
        assert_eq!(intervals[grandchild].ranges(), &[LiveRange::new(12, 20)]);
        let chain: Vec<_> = intervals.siblings(head).map(|(i, _)| i).collect();
        assert_eq!(chain, vec![head, child, grandchild]);
        assert!(intervals.validate());
    }

    #[test]
    fn split_boundary_belongs_to_later_sibling() {
        let mut intervals = LifeIntervals::new();
        let head = intervals.add_interval(inst(0), ValueType::Int32);
        intervals.add_range(head, 0, 30);
        let child = intervals.split_at(head, 9);
        assert!(intervals[head].split_cover::<true>(8));
        assert!(!intervals[head].split_cover::<true>(9));
        assert!(intervals[child].split_cover::<true>(9));
        assert!(intervals[child].split_cover::<true>(30));
        assert!(!intervals[child].split_cover::<false>(30));
        assert_eq!(intervals.find_sibling_at(head, 9), Some(child));
        assert_eq!(intervals.find_sibling_at(head, 31), None);
    }

    #[test]
    fn intersection_point() {
        let mut intervals = LifeIntervals::new();
        let a = intervals.add_interval(inst(0), ValueType::Int32);
        intervals.add_range(a, 0, 4);
        intervals.add_range(a, 8, 12);
        let b = intervals.add_interval(inst(1), ValueType::Int32);
        intervals.add_range(b, 4, 9);
        let c = intervals.add_interval(inst(2), ValueType::Int32);
        intervals.add_range(c, 4, 8);
        assert_eq!(intervals[a].intersects(&intervals[b]), Some(8));
        assert_eq!(intervals[a].intersects(&intervals[c]), None);
    }

    #[test]
    fn used_registers_keep_widest_type() {
        let mut intervals = LifeIntervals::new();
        let a = intervals.add_interval(inst(0), ValueType::Int32);
        intervals.set_location(a, Location::Reg(PReg::int(2)));
        let b = intervals.add_interval(inst(1), ValueType::Int64);
        intervals.set_location(b, Location::Reg(PReg::int(2)));
        let c = intervals.add_interval(inst(2), ValueType::Float64);
        intervals.set_location(c, Location::Reg(PReg::float(1)));
        let d = intervals.add_interval(inst(3), ValueType::Int32);
        intervals.set_location(d, Location::Stack(3));
        assert_eq!(
            intervals.used_registers(),
            vec![
                (PReg::int(2), ValueType::Int64),
                (PReg::float(1), ValueType::Float64)
            ]
        );
        assert_eq!(intervals.max_stack_slot(), Some(3));
    }
}
