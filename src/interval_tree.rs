/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Centered interval tree over the register-carrying values of a method.
//!
//! Each node picks a midpoint (the median of its values' endpoints) and
//! keeps the values whose hull contains it, sorted by end descending.
//! Values entirely before the midpoint go to the left subtree, values
//! entirely after it to the right. A query at `ln` walks one root-to-leaf
//! path and, at each node, scans the sorted list until the first value
//! ending before `ln`.
//!
//! Entries are whole values (head interval plus siblings). The per-sibling
//! check happens when an entry is reported, so a value that lives in a
//! register for part of its life is visited only while it is there.

use crate::intervals::{IntervalIndex, LifeInterval, LifeIntervals};
use crate::{InstId, LifeNumber};
use alloc::vec::Vec;
use allocator_api2::vec::Vec as BumpVec;
use bumpalo::Bump;

define_index!(NodeIndex);

#[derive(Clone, Copy, Debug)]
struct TreeEntry {
    begin: LifeNumber,
    end: LifeNumber,
    head: IntervalIndex,
    inst: InstId,
}

#[derive(Clone, Debug)]
pub struct LifeIntervalsTreeNode {
    /// Smallest begin in this subtree.
    min_value: LifeNumber,
    /// Largest end in this subtree.
    max_value: LifeNumber,
    midpoint: LifeNumber,
    /// `entries[entries_start..entries_end]`, sorted by end descending.
    entries_start: u32,
    entries_end: u32,
    left: Option<NodeIndex>,
    right: Option<NodeIndex>,
}

impl LifeIntervalsTreeNode {
    pub fn min_value(&self) -> LifeNumber {
        self.min_value
    }

    pub fn max_value(&self) -> LifeNumber {
        self.max_value
    }

    pub fn midpoint(&self) -> LifeNumber {
        self.midpoint
    }
}

#[derive(Clone, Debug)]
pub struct IntervalTree {
    nodes: Vec<LifeIntervalsTreeNode>,
    entries: Vec<TreeEntry>,
    root: NodeIndex,
}

impl IntervalTree {
    /// Builds the tree. Values with no register on any of their siblings
    /// are left out; returns `None` when nothing remains.
    pub fn build(intervals: &LifeIntervals) -> Option<IntervalTree> {
        let bump = Bump::new();
        let mut items = BumpVec::new_in(&bump);
        for head in intervals.heads() {
            let first = &intervals[head];
            if first.ranges().is_empty() {
                continue;
            }
            let mut has_reg = false;
            let mut end = first.end();
            for (_, sibling) in intervals.siblings(head) {
                has_reg |= sibling.has_reg();
                end = core::cmp::max(end, sibling.end());
            }
            if !has_reg {
                continue;
            }
            items.push(TreeEntry {
                begin: first.begin(),
                end,
                head,
                inst: first.inst(),
            });
        }
        if items.is_empty() {
            return None;
        }

        let mut tree = IntervalTree {
            nodes: Vec::new(),
            entries: Vec::with_capacity(items.len()),
            root: NodeIndex::invalid(),
        };
        tree.root = tree.build_node(&bump, &items);
        if trace_enabled!() {
            trace!(
                "interval tree: {} values in {} nodes, depth {}",
                tree.entries.len(),
                tree.nodes.len(),
                tree.depth()
            );
        }
        Some(tree)
    }

    fn build_node(&mut self, bump: &Bump, items: &[TreeEntry]) -> NodeIndex {
        debug_assert!(!items.is_empty());

        let mut endpoints = BumpVec::with_capacity_in(items.len() * 2, bump);
        let mut min_value = LifeNumber::MAX;
        let mut max_value = 0;
        for item in items {
            endpoints.push(item.begin);
            endpoints.push(item.end);
            min_value = core::cmp::min(min_value, item.begin);
            max_value = core::cmp::max(max_value, item.end);
        }
        endpoints.sort_unstable();
        // An endpoint of some item, so that item stays here and every
        // recursion works on strictly fewer items.
        let midpoint = endpoints[endpoints.len() / 2];

        let mut left = BumpVec::new_in(bump);
        let mut right = BumpVec::new_in(bump);
        let entries_start = self.entries.len();
        for &item in items {
            if item.end < midpoint {
                left.push(item);
            } else if item.begin > midpoint {
                right.push(item);
            } else {
                self.entries.push(item);
            }
        }
        self.entries[entries_start..].sort_unstable_by(|a, b| b.end.cmp(&a.end));

        let idx = NodeIndex::new(self.nodes.len());
        self.nodes.push(LifeIntervalsTreeNode {
            min_value,
            max_value,
            midpoint,
            entries_start: entries_start as u32,
            entries_end: self.entries.len() as u32,
            left: None,
            right: None,
        });
        if !left.is_empty() {
            let child = self.build_node(bump, &left);
            self.nodes[idx.index()].left = Some(child);
        }
        if !right.is_empty() {
            let child = self.build_node(bump, &right);
            self.nodes[idx.index()].right = Some(child);
        }
        idx
    }

    /// Calls `visitor` on every register-carrying interval that holds its
    /// value at `ln`, except those of `skip_inst`.
    pub fn visit_intervals<const LIVE_INPUTS: bool, F>(
        &self,
        intervals: &LifeIntervals,
        ln: LifeNumber,
        skip_inst: Option<InstId>,
        mut visitor: F,
    ) where
        F: FnMut(&LifeInterval),
    {
        let mut next = Some(self.root);
        while let Some(idx) = next {
            let node = &self.nodes[idx.index()];
            if ln < node.min_value || ln > node.max_value {
                return;
            }
            let entries = &self.entries[node.entries_start as usize..node.entries_end as usize];
            for entry in entries {
                if entry.end < ln {
                    break;
                }
                if Some(entry.inst) == skip_inst {
                    continue;
                }
                for (_, sibling) in intervals.siblings(entry.head) {
                    if sibling.has_reg() && sibling.split_cover::<LIVE_INPUTS>(ln) {
                        visitor(sibling);
                    }
                }
            }
            next = if ln < node.midpoint {
                node.left
            } else if ln > node.midpoint {
                node.right
            } else {
                None
            };
        }
    }

    /// Number of values in the tree.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root(&self) -> &LifeIntervalsTreeNode {
        &self.nodes[self.root.index()]
    }

    pub fn depth(&self) -> usize {
        fn depth_of(tree: &IntervalTree, idx: Option<NodeIndex>) -> usize {
            match idx {
                None => 0,
                Some(idx) => {
                    let node = &tree.nodes[idx.index()];
                    1 + core::cmp::max(depth_of(tree, node.left), depth_of(tree, node.right))
                }
            }
        }
        depth_of(self, Some(self.root))
    }

    /// Checks the node invariants: entries contain the midpoint and are
    /// end-sorted, left entries end before it, right entries start after
    /// it, and the bounds enclose the subtree.
    pub fn validate(&self) -> bool {
        self.validate_node(self.root, LifeNumber::MIN, LifeNumber::MAX)
    }

    fn validate_node(&self, idx: NodeIndex, lo: LifeNumber, hi: LifeNumber) -> bool {
        let node = &self.nodes[idx.index()];
        let entries = &self.entries[node.entries_start as usize..node.entries_end as usize];
        if entries.is_empty() {
            return false;
        }
        let ok_here = entries.iter().all(|e| {
            e.begin <= node.midpoint
                && node.midpoint <= e.end
                && e.begin >= node.min_value
                && e.end <= node.max_value
                && e.begin >= lo
                && e.end <= hi
        }) && entries.windows(2).all(|w| w[0].end >= w[1].end);
        ok_here
            && node.left.map_or(true, |l| {
                self.nodes[l.index()].max_value < node.midpoint
                    && self.validate_node(l, lo, node.midpoint)
            })
            && node.right.map_or(true, |r| {
                self.nodes[r.index()].min_value > node.midpoint
                    && self.validate_node(r, node.midpoint, hi)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Location, PReg, RegMask, ValueType};
    use alloc::vec::Vec;

    fn reg_intervals(ranges: &[(u32, u32)]) -> LifeIntervals {
        let mut intervals = LifeIntervals::new();
        for (i, &(begin, end)) in ranges.iter().enumerate() {
            let idx = intervals.add_interval(InstId::new(i), ValueType::Int64);
            intervals.add_range(idx, begin, end);
            intervals.set_location(idx, Location::Reg(PReg::int(i)));
        }
        intervals
    }

    fn live_mask(tree: &IntervalTree, intervals: &LifeIntervals, ln: LifeNumber) -> u32 {
        let mut mask = RegMask::empty();
        tree.visit_intervals::<true, _>(intervals, ln, None, |interval| {
            let reg = interval.reg().unwrap().hw_enc();
            assert!(!mask.contains(reg), "r{} visited twice", reg);
            mask.insert(reg);
        });
        mask.bits()
    }

    #[test]
    fn empty_input_builds_nothing() {
        assert!(IntervalTree::build(&LifeIntervals::new()).is_none());

        let mut intervals = LifeIntervals::new();
        let idx = intervals.add_interval(InstId::new(0), ValueType::Int32);
        intervals.add_range(idx, 0, 10);
        intervals.set_location(idx, Location::Stack(0));
        assert!(IntervalTree::build(&intervals).is_none());
    }

    #[test]
    fn live_registers_at_points() {
        let intervals = reg_intervals(&[(0, 10), (0, 2), (2, 3), (5, 6), (6, 8), (8, 10)]);
        let tree = IntervalTree::build(&intervals).unwrap();
        assert!(tree.validate());
        assert_eq!(tree.len(), 6);

        assert_eq!(live_mask(&tree, &intervals, 5), 0b1001);
        assert_eq!(live_mask(&tree, &intervals, 8), 0b110001);
        assert_eq!(live_mask(&tree, &intervals, 11), 0);
    }

    #[test]
    fn live_outputs_exclude_ending_values() {
        let intervals = reg_intervals(&[(0, 10), (0, 2), (2, 3), (5, 6), (6, 8), (8, 10)]);
        let tree = IntervalTree::build(&intervals).unwrap();
        let mut mask = RegMask::empty();
        tree.visit_intervals::<false, _>(&intervals, 8, None, |interval| {
            mask.insert(interval.reg().unwrap().hw_enc());
        });
        assert_eq!(mask.bits(), 0b100001);
    }

    #[test]
    fn skipped_instruction_is_not_visited() {
        let intervals = reg_intervals(&[(0, 10), (0, 2), (2, 3), (5, 6), (6, 8), (8, 10)]);
        let tree = IntervalTree::build(&intervals).unwrap();
        let mut mask = RegMask::empty();
        tree.visit_intervals::<true, _>(&intervals, 5, Some(InstId::new(3)), |interval| {
            mask.insert(interval.reg().unwrap().hw_enc());
        });
        assert_eq!(mask.bits(), 0b0001);
    }

    #[test]
    fn split_value_follows_its_location() {
        let mut intervals = LifeIntervals::new();
        let head = intervals.add_interval(InstId::new(0), ValueType::Int64);
        intervals.add_range(head, 0, 30);
        intervals.set_location(head, Location::Reg(PReg::int(0)));
        let on_stack = intervals.split_at(head, 9);
        intervals.set_location(on_stack, Location::Stack(0));
        let back_in_reg = intervals.split_at(on_stack, 19);
        intervals.set_location(back_in_reg, Location::Reg(PReg::int(1)));

        let tree = IntervalTree::build(&intervals).unwrap();
        assert_eq!(live_mask(&tree, &intervals, 7), 0b01);
        assert_eq!(live_mask(&tree, &intervals, 11), 0);
        assert_eq!(live_mask(&tree, &intervals, 19), 0b10);
        assert_eq!(live_mask(&tree, &intervals, 30), 0b10);
    }

    fn arbitrary_intervals(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<LifeIntervals> {
        let mut intervals = LifeIntervals::new();
        let count = u.int_in_range(0..=48)?;
        for i in 0..count {
            let ty = ValueType::Int64;
            let head = intervals.add_interval(InstId::new(i), ty);
            let begin: u32 = u.int_in_range(0..=120)?;
            let len: u32 = u.int_in_range(1..=40)?;
            intervals.add_range(head, begin, begin + len);
            if u.ratio(1, 3)? {
                let gap: u32 = u.int_in_range(1..=6)?;
                let len2: u32 = u.int_in_range(1..=10)?;
                let start = begin + len + gap;
                intervals.add_range(head, start, start + len2);
            }
            let mut cur = head;
            let splits: u32 = u.int_in_range(0..=3)?;
            for split in 0..=splits {
                let location = if u.ratio(2, 3)? {
                    Location::Reg(PReg::int(u.int_in_range(0..=31)?))
                } else {
                    Location::Stack(u.int_in_range(0..=7)?)
                };
                intervals.set_location(cur, location);
                if split == splits {
                    break;
                }
                let (b, e) = (intervals[cur].begin(), intervals[cur].end());
                if e - b < 2 {
                    break;
                }
                let at = u.int_in_range(b + 1..=e - 1)?;
                cur = intervals.split_at(cur, at);
            }
        }
        Ok(intervals)
    }

    fn brute_force<const LIVE_INPUTS: bool>(
        intervals: &LifeIntervals,
        ln: LifeNumber,
        skip: Option<InstId>,
    ) -> Vec<IntervalIndex> {
        let mut out = Vec::new();
        for (idx, interval) in intervals.iter() {
            if Some(interval.inst()) != skip
                && interval.has_reg()
                && interval.split_cover::<LIVE_INPUTS>(ln)
            {
                out.push(idx);
            }
        }
        out
    }

    fn visited<const LIVE_INPUTS: bool>(
        tree: &IntervalTree,
        intervals: &LifeIntervals,
        ln: LifeNumber,
        skip: Option<InstId>,
    ) -> Vec<IntervalIndex> {
        let mut out = Vec::new();
        tree.visit_intervals::<LIVE_INPUTS, _>(intervals, ln, skip, |interval| {
            let idx = intervals
                .siblings(intervals.head_of(interval.inst()).unwrap())
                .find(|(_, s)| core::ptr::eq(*s, interval))
                .map(|(i, _)| i)
                .unwrap();
            out.push(idx);
        });
        let len = out.len();
        out.sort_unstable();
        out.dedup();
        assert_eq!(len, out.len(), "interval visited twice at {}", ln);
        out
    }

    #[test]
    fn matches_linear_scan() {
        arbtest::arbtest(|u| {
            let intervals = arbitrary_intervals(u)?;
            assert!(intervals.validate());
            let tree = match IntervalTree::build(&intervals) {
                Some(tree) => tree,
                None => {
                    assert!(intervals.iter().all(|(_, i)| !i.has_reg()));
                    return Ok(());
                }
            };
            assert!(tree.validate());
            let skip = if intervals.is_empty() || u.arbitrary()? {
                None
            } else {
                Some(InstId::new(u.int_in_range(0..=intervals.heads().count() - 1)?))
            };
            for ln in 0..200 {
                assert_eq!(
                    visited::<true>(&tree, &intervals, ln, skip),
                    brute_force::<true>(&intervals, ln, skip)
                );
                assert_eq!(
                    visited::<false>(&tree, &intervals, ln, skip),
                    brute_force::<false>(&intervals, ln, skip)
                );
            }
            Ok(())
        })
        .budget_ms(1_000);
    }
}
