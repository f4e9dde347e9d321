/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Stack frame layout shared by the code generator and the stack walker.
//!
//! Stacks grow down and are addressed in words ([`SlotAddr`]). A compiled
//! frame, relative to its frame pointer `fp`:
//!
//! ```text
//!   fp + 2 + i   incoming stack parameter i
//!   fp + 1       return address
//!   fp           caller's fp
//!   fp - 1       method word
//!   fp - 2       frame flags
//!   ...          callee-saved int registers, then fp registers
//!   ...          caller-saved int registers, then fp registers
//!   ...          spill slots
//!   sp + i       outgoing stack parameter i
//! ```
//!
//! Space is reserved for every callee- and caller-saved register of the
//! target, so the areas are at fixed offsets; only the order within the
//! callee area depends on which registers the method saved.
//!
//! Boundary frames mark transitions between compiled code, the
//! interpreter and the runtime. They have the same return address and
//! previous-frame words, a tag instead of a method word, and all callee
//! registers of the target saved below the tag. Interpreted frames hold
//! their values and per-value tags inline.

use crate::target::ArchInfo;
use crate::{MethodId, PReg, RegClass, RegMask};

/// Address of a stack word.
pub type SlotAddr = u64;

/// Method words below this are boundary tags.
pub const FIRST_METHOD_WORD: u64 = 0x10;

pub const RETURN_ADDR_OFFSET: u64 = 1;
pub const METHOD_WORD_OFFSET: u64 = 1;
pub const FLAGS_OFFSET: u64 = 2;
/// Words between fp and the first callee save slot.
pub const HEADER_SLOTS: u64 = 2;

pub const FRAME_FLAG_NATIVE: u64 = 1 << 0;
pub const FRAME_FLAG_SHOULD_DEOPT: u64 = 1 << 1;
pub const FRAME_FLAG_HAS_FLOAT: u64 = 1 << 2;

/// Kinds of boundary frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum BoundaryKind {
    /// Interpreter calling compiled code. The previous-frame word points
    /// at the interpreted frame.
    InterpreterToCompiled = 1,
    /// Compiled code calling into the interpreter.
    CompiledToInterpreter = 2,
    /// Compiled code calling a runtime entrypoint.
    Bypass = 3,
}

/// Decoded method word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameMarker {
    Method(MethodId),
    Boundary(BoundaryKind),
    Invalid(u64),
}

impl FrameMarker {
    pub fn decode(word: u64) -> Self {
        match word {
            1 => FrameMarker::Boundary(BoundaryKind::InterpreterToCompiled),
            2 => FrameMarker::Boundary(BoundaryKind::CompiledToInterpreter),
            3 => FrameMarker::Boundary(BoundaryKind::Bypass),
            w if w >= FIRST_METHOD_WORD && w - FIRST_METHOD_WORD <= u32::MAX as u64 => {
                FrameMarker::Method(MethodId::new((w - FIRST_METHOD_WORD) as usize))
            }
            w => FrameMarker::Invalid(w),
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            FrameMarker::Method(id) => FIRST_METHOD_WORD + id.raw_u32() as u64,
            FrameMarker::Boundary(kind) => kind as u64,
            FrameMarker::Invalid(w) => w,
        }
    }
}

#[inline]
pub fn method_word(id: MethodId) -> u64 {
    FrameMarker::Method(id).encode()
}

/// Word layout of a compiled frame on one target.
#[derive(Clone, Copy, Debug)]
pub struct CFrameLayout {
    info: &'static ArchInfo,
    spill_slots: u32,
    outgoing_slots: u32,
}

impl CFrameLayout {
    pub fn new(info: &'static ArchInfo, spill_slots: u32, outgoing_slots: u32) -> Self {
        CFrameLayout {
            info,
            spill_slots,
            outgoing_slots,
        }
    }

    pub fn info(&self) -> &'static ArchInfo {
        self.info
    }

    pub fn spill_slots(&self) -> u32 {
        self.spill_slots
    }

    pub fn callee_slots_count(&self) -> u32 {
        (self.info.callee_int.count() + self.info.callee_fp.count()) as u32
    }

    pub fn caller_slots_count(&self) -> u32 {
        (self.info.caller_int.count() + self.info.caller_fp.count()) as u32
    }

    /// Words below fp, kept even so that sp stays 16-byte aligned on the
    /// 64-bit targets.
    pub fn frame_slots(&self) -> u32 {
        let slots = HEADER_SLOTS as u32
            + self.callee_slots_count()
            + self.caller_slots_count()
            + self.spill_slots
            + self.outgoing_slots;
        (slots + 1) & !1
    }

    /// Base the callee save slots hang from.
    #[inline]
    pub fn callee_slots_base(fp: SlotAddr) -> SlotAddr {
        fp - HEADER_SLOTS
    }

    /// Save slot of callee register `reg` in an area based at
    /// `callee_slots`, holding the registers of `saved` (int and fp)
    /// ordered from the most significant one.
    pub fn callee_slot_at(
        info: &ArchInfo,
        callee_slots: SlotAddr,
        saved: (RegMask, RegMask),
        reg: PReg,
    ) -> SlotAddr {
        let rank = match reg.class() {
            RegClass::Int => {
                debug_assert!(saved.0.contains(reg.hw_enc()));
                saved.0.distance_from_head(reg.hw_enc()) as u64
            }
            RegClass::Float => {
                debug_assert!(saved.1.contains(reg.hw_enc()));
                info.callee_int.count() as u64 + saved.1.distance_from_head(reg.hw_enc()) as u64
            }
        };
        callee_slots - rank - 1
    }

    pub fn callee_slot(&self, fp: SlotAddr, saved: (RegMask, RegMask), reg: PReg) -> SlotAddr {
        Self::callee_slot_at(self.info, Self::callee_slots_base(fp), saved, reg)
    }

    /// Slot right below the saved callee registers of `class`. Holds the
    /// register that pads an odd count to a pair.
    pub fn callee_padding_slot(
        &self,
        fp: SlotAddr,
        saved: (RegMask, RegMask),
        class: RegClass,
    ) -> SlotAddr {
        let rank = match class {
            RegClass::Int => saved.0.count() as u64,
            RegClass::Float => self.info.callee_int.count() as u64 + saved.1.count() as u64,
        };
        debug_assert!(rank < self.callee_slots_count() as u64);
        Self::callee_slots_base(fp) - rank - 1
    }

    fn caller_area(&self, fp: SlotAddr) -> SlotAddr {
        Self::callee_slots_base(fp) - self.callee_slots_count() as u64
    }

    /// Slot a caller-saved register is kept in across a call. Every
    /// caller register has its own slot.
    pub fn caller_slot(&self, fp: SlotAddr, reg: PReg) -> SlotAddr {
        let info = self.info;
        let rank = match reg.class() {
            RegClass::Int => {
                debug_assert!(info.caller_int.contains(reg.hw_enc()));
                info.caller_int.distance_from_head(reg.hw_enc()) as u64
            }
            RegClass::Float => {
                debug_assert!(info.caller_fp.contains(reg.hw_enc()));
                info.caller_int.count() as u64
                    + info.caller_fp.distance_from_head(reg.hw_enc()) as u64
            }
        };
        self.caller_area(fp) - rank - 1
    }

    pub fn spill_slot(&self, fp: SlotAddr, slot: u32) -> SlotAddr {
        debug_assert!(slot < self.spill_slots);
        self.caller_area(fp) - self.caller_slots_count() as u64 - slot as u64 - 1
    }

    /// Incoming stack parameter `index`, in the caller's outgoing area.
    #[inline]
    pub fn stack_param_slot(fp: SlotAddr, index: u32) -> SlotAddr {
        fp + HEADER_SLOTS + index as u64
    }

    pub fn outgoing_param_slot(&self, fp: SlotAddr, index: u32) -> SlotAddr {
        debug_assert!(index < self.outgoing_slots);
        fp - self.frame_slots() as u64 + index as u64
    }

    /// Offset from fp, for encoders addressing memory relative to it.
    #[inline]
    pub fn fp_offset(fp: SlotAddr, addr: SlotAddr) -> i32 {
        (addr as i64 - fp as i64) as i32
    }
}

/// Layout of a boundary frame based at `bp`.
pub mod boundary {
    use super::{CFrameLayout, SlotAddr};
    use crate::target::ArchInfo;
    use crate::PReg;

    pub const TAG_OFFSET: u64 = 1;

    /// All callee registers of the target are saved, full-mask ranks.
    pub fn callee_slot(info: &ArchInfo, bp: SlotAddr, reg: PReg) -> SlotAddr {
        CFrameLayout::callee_slot_at(
            info,
            CFrameLayout::callee_slots_base(bp),
            (info.callee_int, info.callee_fp),
            reg,
        )
    }

    /// Words below `bp`.
    pub fn frame_slots(info: &ArchInfo) -> u32 {
        let slots = 2 + info.callee_int.count() as u32 + info.callee_fp.count() as u32;
        (slots + 1) & !1
    }
}

/// Layout of an interpreted frame at `addr`:
///
/// ```text
///   addr + 3 + n + i   tag of value i (1 = object)
///   addr + 3 + i       value i
///   addr + 2           number of values n
///   addr + 1           bytecode pc
///   addr               previous frame
///   addr - 1           method word
/// ```
pub mod iframe {
    use super::SlotAddr;

    pub const PREV_OFFSET: u64 = 0;
    pub const BYTECODE_PC_OFFSET: u64 = 1;
    pub const NUM_VREGS_OFFSET: u64 = 2;
    pub const VREGS_OFFSET: u64 = 3;

    pub const TAG_PRIMITIVE: u64 = 0;
    pub const TAG_OBJECT: u64 = 1;

    #[inline]
    pub fn vreg_slot(addr: SlotAddr, index: u64) -> SlotAddr {
        addr + VREGS_OFFSET + index
    }

    #[inline]
    pub fn tag_slot(addr: SlotAddr, num_vregs: u64, index: u64) -> SlotAddr {
        addr + VREGS_OFFSET + num_vregs + index
    }

    /// Words an interpreted frame with `num_vregs` values occupies,
    /// including the method word.
    pub fn size(num_vregs: u64) -> u64 {
        1 + VREGS_OFFSET + 2 * num_vregs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{aarch32::AARCH32_INFO, aarch64::AARCH64_INFO, amd64::AMD64_INFO};
    use crate::FxHashSet;

    #[test]
    fn method_words() {
        let id = MethodId::new(42);
        assert_eq!(FrameMarker::decode(method_word(id)), FrameMarker::Method(id));
        assert_eq!(
            FrameMarker::decode(3),
            FrameMarker::Boundary(BoundaryKind::Bypass)
        );
        assert_eq!(FrameMarker::decode(0), FrameMarker::Invalid(0));
        assert_eq!(FrameMarker::decode(7), FrameMarker::Invalid(7));
    }

    #[test]
    fn callee_slots_follow_the_saved_mask() {
        let layout = CFrameLayout::new(&AARCH64_INFO, 0, 0);
        let fp = 1000;
        let saved = (
            RegMask::new((1 << 19) | (1 << 22) | (1 << 27)),
            RegMask::new(1 << 9),
        );
        assert_eq!(layout.callee_slot(fp, saved, PReg::int(27)), fp - 3);
        assert_eq!(layout.callee_slot(fp, saved, PReg::int(22)), fp - 4);
        assert_eq!(layout.callee_slot(fp, saved, PReg::int(19)), fp - 5);
        // Float slots come after room for all ten int callee registers.
        assert_eq!(layout.callee_slot(fp, saved, PReg::float(9)), fp - 3 - 10);
        assert_eq!(layout.callee_padding_slot(fp, saved, RegClass::Int), fp - 6);
        assert_eq!(layout.callee_padding_slot(fp, saved, RegClass::Float), fp - 4 - 10);
    }

    #[test]
    fn areas_do_not_overlap() {
        for info in [&AMD64_INFO, &AARCH64_INFO, &AARCH32_INFO] {
            let layout = CFrameLayout::new(info, 5, 3);
            let fp: SlotAddr = 10_000;
            let mut seen = FxHashSet::default();
            let mut claim = |addr: SlotAddr| {
                assert!(addr < fp - 2 && addr >= fp - layout.frame_slots() as u64);
                assert!(seen.insert(addr), "{} claimed twice on {}", addr, info.arch);
            };
            let all = (info.callee_int, info.callee_fp);
            for r in info.callee_int.iter() {
                claim(layout.callee_slot(fp, all, PReg::int(r)));
            }
            for r in info.callee_fp.iter() {
                claim(layout.callee_slot(fp, all, PReg::float(r)));
            }
            for r in info.caller_int.iter() {
                claim(layout.caller_slot(fp, PReg::int(r)));
            }
            for r in info.caller_fp.iter() {
                claim(layout.caller_slot(fp, PReg::float(r)));
            }
            for s in 0..5 {
                claim(layout.spill_slot(fp, s));
            }
            for p in 0..3 {
                claim(layout.outgoing_param_slot(fp, p));
            }
            assert_eq!(layout.frame_slots() % 2, 0);
        }
    }

    #[test]
    fn outgoing_params_become_incoming_params() {
        let layout = CFrameLayout::new(&AMD64_INFO, 1, 2);
        let fp = 500;
        let sp = fp - layout.frame_slots() as u64;
        // The call pushes the return address and the callee pushes fp.
        let callee_fp = sp - 2;
        assert_eq!(
            CFrameLayout::stack_param_slot(callee_fp, 1),
            layout.outgoing_param_slot(fp, 1)
        );
    }
}
