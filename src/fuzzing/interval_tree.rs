/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the interval tree against a linear scan of the intervals.

use crate::interval_tree::IntervalTree;
use crate::{InstId, IntervalIndex, LifeIntervals, LifeNumber, Location, PReg, ValueType};
use alloc::vec::Vec;
use arbitrary::{Arbitrary, Result, Unstructured};

/// Highest life number an arbitrary interval reaches.
pub const MAX_LIFE_NUMBER: LifeNumber = 200;

/// Up to `max_values` values, each with one or two ranges and split into
/// up to four siblings living in registers or spill slots.
pub fn arbitrary_intervals(u: &mut Unstructured<'_>, max_values: usize) -> Result<LifeIntervals> {
    let mut intervals = LifeIntervals::new();
    let count = u.int_in_range(0..=max_values)?;
    for i in 0..count {
        let ty = *u.choose(&[
            ValueType::Int32,
            ValueType::Int64,
            ValueType::Reference,
            ValueType::Float64,
        ])?;
        let inst = InstId::new(i);
        let head = intervals.add_interval(inst, ty);
        let begin: u32 = u.int_in_range(0..=120)?;
        let len: u32 = u.int_in_range(1..=40)?;
        intervals.add_range(head, begin, begin + len);
        intervals.set_life_number(inst, begin);
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
                let hw = u.int_in_range(0..=PReg::MAX)?;
                if ty.is_float() {
                    Location::Reg(PReg::float(hw))
                } else {
                    Location::Reg(PReg::int(hw))
                }
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

#[derive(Clone, Debug)]
pub struct TestCase {
    intervals: LifeIntervals,
    skip: Option<InstId>,
}

impl TestCase {
    pub fn intervals(&self) -> &LifeIntervals {
        &self.intervals
    }
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        let intervals = arbitrary_intervals(u, 64)?;
        let heads = intervals.heads().count();
        let skip = if heads == 0 || bool::arbitrary(u)? {
            None
        } else {
            Some(InstId::new(u.int_in_range(0..=heads - 1)?))
        };
        Ok(TestCase { intervals, skip })
    }
}

fn linear_scan<const LIVE_INPUTS: bool>(
    intervals: &LifeIntervals,
    ln: LifeNumber,
    skip: Option<InstId>,
) -> Vec<IntervalIndex> {
    intervals
        .iter()
        .filter(|(_, interval)| {
            Some(interval.inst()) != skip
                && interval.has_reg()
                && interval.split_cover::<LIVE_INPUTS>(ln)
        })
        .map(|(idx, _)| idx)
        .collect()
}

fn visited<const LIVE_INPUTS: bool>(
    tree: &IntervalTree,
    intervals: &LifeIntervals,
    ln: LifeNumber,
    skip: Option<InstId>,
) -> Vec<IntervalIndex> {
    let mut out = Vec::new();
    tree.visit_intervals::<LIVE_INPUTS, _>(intervals, ln, skip, |interval| {
        let head = intervals
            .head_of(interval.inst())
            .expect("visited interval has no head");
        let idx = intervals
            .siblings(head)
            .find(|(_, s)| core::ptr::eq(*s, interval))
            .map(|(i, _)| i)
            .expect("visited interval is not in its sibling chain");
        out.push(idx);
    });
    let len = out.len();
    out.sort_unstable();
    out.dedup();
    assert_eq!(len, out.len(), "interval visited twice at {}", ln);
    out
}

pub fn check(t: TestCase) {
    let intervals = &t.intervals;
    assert!(intervals.validate());
    let tree = match IntervalTree::build(intervals) {
        Some(tree) => tree,
        None => {
            assert!(intervals.iter().all(|(_, i)| !i.has_reg()));
            return;
        }
    };
    log::trace!("tree of {} nodes, depth {}", tree.len(), tree.depth());
    assert!(tree.validate());

    for ln in 0..=MAX_LIFE_NUMBER {
        assert_eq!(
            visited::<true>(&tree, intervals, ln, t.skip),
            linear_scan::<true>(intervals, ln, t.skip),
            "live inputs at {}",
            ln
        );
        assert_eq!(
            visited::<false>(&tree, intervals, ln, t.skip),
            linear_scan::<false>(intervals, ln, t.skip),
            "at {}",
            ln
        );
    }
}

#[test]
fn smoke() {
    arbtest::arbtest(|u| {
        let test_case = TestCase::arbitrary(u)?;
        check(test_case);
        Ok(())
    })
    .budget_ms(1_000);
}
