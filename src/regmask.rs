/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fixed-width register bitmasks.

use core::fmt;
use core::iter::FromIterator;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// A set of up to 32 registers of one class, one bit per hardware
/// encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct RegMask(u32);

/// Mask over the floating-point/vector register file. Same
/// representation as [`RegMask`]; the alias only documents intent.
pub type VRegMask = RegMask;

impl RegMask {
    pub const BITS: usize = 32;

    #[inline(always)]
    pub const fn new(bits: u32) -> Self {
        RegMask(bits)
    }

    #[inline(always)]
    pub const fn empty() -> Self {
        RegMask(0)
    }

    #[inline(always)]
    pub const fn all() -> Self {
        RegMask(u32::MAX)
    }

    /// Mask with bits `first..=last` set.
    #[inline(always)]
    pub const fn range(first: usize, last: usize) -> Self {
        let hi = if last >= 31 {
            u32::MAX
        } else {
            (1u32 << (last + 1)) - 1
        };
        let lo = (1u32 << first) - 1;
        RegMask(hi & !lo)
    }

    #[inline(always)]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn contains(self, reg: usize) -> bool {
        debug_assert!(reg < Self::BITS);
        self.0 & (1 << reg) != 0
    }

    #[inline(always)]
    pub fn insert(&mut self, reg: usize) {
        debug_assert!(reg < Self::BITS);
        self.0 |= 1 << reg;
    }

    #[inline(always)]
    pub fn remove(&mut self, reg: usize) {
        debug_assert!(reg < Self::BITS);
        self.0 &= !(1 << reg);
    }

    #[inline(always)]
    pub fn with(mut self, reg: usize) -> Self {
        self.insert(reg);
        self
    }

    #[inline(always)]
    pub fn without(mut self, reg: usize) -> Self {
        self.remove(reg);
        self
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn min_register(self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn max_register(self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(31 - self.0.leading_zeros() as usize)
        }
    }

    /// Number of set bits strictly above `reg`. Saved registers are laid
    /// out starting from the most significant one, so this is the rank of
    /// `reg`'s save slot.
    #[inline]
    pub fn distance_from_head(self, reg: usize) -> usize {
        debug_assert!(reg < Self::BITS);
        if reg == 31 {
            0
        } else {
            (self.0 >> (reg + 1)).count_ones() as usize
        }
    }

    /// Number of set bits strictly below `reg`.
    #[inline]
    pub fn distance_from_tail(self, reg: usize) -> usize {
        debug_assert!(reg < Self::BITS);
        (self.0 & ((1u32 << reg) - 1)).count_ones() as usize
    }

    /// True when the set bits form a single run.
    pub fn is_contiguous(self) -> bool {
        if self.is_empty() {
            return true;
        }
        let shifted = self.0 >> self.0.trailing_zeros();
        shifted & shifted.wrapping_add(1) == 0
    }

    pub fn iter(self) -> RegMaskIter {
        RegMaskIter(self.0)
    }
}

impl FromIterator<usize> for RegMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut mask = RegMask::empty();
        for reg in iter {
            mask.insert(reg);
        }
        mask
    }
}

impl BitOr for RegMask {
    type Output = RegMask;
    #[inline(always)]
    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for RegMask {
    #[inline(always)]
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RegMask {
    type Output = RegMask;
    #[inline(always)]
    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for RegMask {
    #[inline(always)]
    fn bitand_assign(&mut self, rhs: RegMask) {
        self.0 &= rhs.0;
    }
}

impl Not for RegMask {
    type Output = RegMask;
    #[inline(always)]
    fn not(self) -> RegMask {
        RegMask(!self.0)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask({:#x})", self.0)
    }
}

impl fmt::Display for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, reg) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", reg)?;
        }
        f.write_str("}")
    }
}

/// Ascending iterator over the registers of a [`RegMask`].
#[derive(Clone, Debug)]
pub struct RegMaskIter(u32);

impl Iterator for RegMaskIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let reg = self.0.trailing_zeros();
        self.0 &= !(1 << reg);
        Some(reg as usize)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for RegMaskIter {}
