/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies that a sequence of moves has the same effect as the
//! spill-fill group it was resolved from.
//!
//! The group is read with parallel semantics: every source is read
//! before any destination is written. The sequence is simulated one move
//! at a time on symbolic values, where each location starts out holding
//! "the value that was in this location". Afterwards each destination of
//! the group must hold what its source held, and every other location
//! must be unchanged unless the caller declares it clobberable (the
//! scratch, a borrowed victim's save slot).
//!
//! On 32-bit targets a 64-bit value is two words: a register pair, or
//! the two halves of a spill slot. Each word is tracked on its own, so a
//! sequence that moves only half of a pair is caught.

use crate::moves::{is_paired_reg, SpillFillData};
use crate::{Arch, FxHashMap, Location, PReg, ValueType};
use core::fmt;
use smallvec::{smallvec, SmallVec};

/// One machine word of a location.
type Word = (Location, u8);

/// Symbolic content of a word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerValue {
    /// Whatever `location`'s word `part` held before the sequence ran.
    Initial(Location, u8),
    /// Word `part` of an immediate.
    Imm(i64, u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
    /// A destination of the group ends up with the wrong value.
    WrongValue {
        location: Location,
        expected: CheckerValue,
        found: CheckerValue,
    },
    /// A location outside the group was overwritten.
    Clobbered { location: Location },
    /// The sequence reads a scratch placeholder that was never filled in.
    UnresolvedScratch,
}

impl fmt::Display for CheckerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CheckerError {}

fn words(arch: Arch, loc: Location, ty: ValueType) -> SmallVec<[Word; 2]> {
    let parts = if arch == Arch::Aarch32 && ty.is_64bit(arch) {
        2
    } else {
        1
    };
    match loc {
        Location::Reg(reg) if is_paired_reg(arch, loc, ty) => {
            let high = PReg::new(reg.hw_enc() + 1, reg.class());
            smallvec![(loc, 0), (Location::Reg(high), 0)]
        }
        _ => (0..parts).map(|part| (loc, part)).collect(),
    }
}

fn read(state: &FxHashMap<Word, CheckerValue>, word: Word) -> CheckerValue {
    match word.0 {
        Location::Imm(v) => CheckerValue::Imm(v, word.1),
        _ => state
            .get(&word)
            .copied()
            .unwrap_or(CheckerValue::Initial(word.0, word.1)),
    }
}

/// Checks `sequence` against the parallel `group`. Locations for which
/// `clobberable` returns true may be overwritten freely.
pub fn check_parallel_moves<I, C>(
    arch: Arch,
    group: &[SpillFillData],
    sequence: I,
    clobberable: C,
) -> Result<(), CheckerError>
where
    I: IntoIterator,
    I::Item: core::borrow::Borrow<SpillFillData>,
    C: Fn(Location) -> bool,
{
    use core::borrow::Borrow;

    let empty = FxHashMap::default();
    let mut expected: FxHashMap<Word, CheckerValue> = FxHashMap::default();
    for m in group {
        let srcs = words(arch, m.src, m.ty);
        let dsts = words(arch, m.dst, m.ty);
        for (&src, &dst) in srcs.iter().zip(dsts.iter()) {
            expected.insert(dst, read(&empty, src));
        }
    }

    let mut state: FxHashMap<Word, CheckerValue> = FxHashMap::default();
    for m in sequence {
        let m = *m.borrow();
        if m.src.is_none() || m.dst.is_none() {
            return Err(CheckerError::UnresolvedScratch);
        }
        let srcs = words(arch, m.src, m.ty);
        let dsts = words(arch, m.dst, m.ty);
        let values: SmallVec<[CheckerValue; 2]> = srcs.iter().map(|&w| read(&state, w)).collect();
        for (&dst, value) in dsts.iter().zip(values) {
            state.insert(dst, value);
        }
        trace!("checker: {:?}", m);
    }

    for (&word, &want) in &expected {
        let found = read(&state, word);
        if found != want {
            return Err(CheckerError::WrongValue {
                location: word.0,
                expected: want,
                found,
            });
        }
    }
    for (&word, &value) in &state {
        if expected.contains_key(&word) || clobberable(word.0) {
            continue;
        }
        if value != CheckerValue::Initial(word.0, word.1) {
            return Err(CheckerError::Clobbered { location: word.0 });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: usize) -> Location {
        Location::Reg(PReg::int(i))
    }

    fn mv(src: Location, dst: Location) -> SpillFillData {
        SpillFillData::new(src, dst, ValueType::Int32)
    }

    #[test]
    fn naive_swap_is_rejected() {
        let group = [mv(r(0), r(1)), mv(r(1), r(0))];
        let err = check_parallel_moves(Arch::Aarch64, &group, &group, |_| false).unwrap_err();
        assert!(matches!(err, CheckerError::WrongValue { .. }));
    }

    #[test]
    fn clobbering_an_outside_register_is_rejected() {
        let group = [mv(r(0), r(1))];
        let seq = [mv(r(0), r(2)), mv(r(2), r(1))];
        assert_eq!(
            check_parallel_moves(Arch::Aarch64, &group, &seq, |_| false),
            Err(CheckerError::Clobbered { location: r(2) })
        );
        assert!(check_parallel_moves(Arch::Aarch64, &group, &seq, |l| l == r(2)).is_ok());
    }

    #[test]
    fn half_a_pair_is_not_enough() {
        let group = [SpillFillData::new(r(0), r(2), ValueType::Int64)];
        let seq = [mv(r(0), r(2))];
        let err = check_parallel_moves(Arch::Aarch32, &group, &seq, |_| false).unwrap_err();
        assert_eq!(
            err,
            CheckerError::WrongValue {
                location: r(3),
                expected: CheckerValue::Initial(r(1), 0),
                found: CheckerValue::Initial(r(3), 0),
            }
        );
    }

    #[test]
    fn placeholder_must_be_filled() {
        let group = [mv(r(0), r(1))];
        let seq = [mv(r(0), Location::None)];
        assert_eq!(
            check_parallel_moves(Arch::Amd64, &group, &seq, |_| true),
            Err(CheckerError::UnresolvedScratch)
        );
    }
}
