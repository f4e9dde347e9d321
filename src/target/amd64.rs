/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! amd64 (System V).
//!
//! The native callee-saved set {rbx, rbp, r12-r15} is not contiguous. To
//! address callee save slots by rank the registers are renumbered: rbx,
//! rsp and rbp (3, 4, 5) trade places with r11, r10 and r9 (11, 10, 9).
//! In the renumbered space callee-saved registers are 11..=15 and the
//! caller-saved ones 0..=8.

use super::{ArchInfo, RegistersDescription, SavedRegisters};
use crate::{Arch, CompilerOptions, RegMask};

/// Registers that trade places with `RENAMING_CONST - reg`.
pub const RENAMING_MASK_3_5_OR_9_11: u32 = 0xE38;
pub const RENAMING_CONST: usize = 14;

/// Maps a native register number to the renumbered one and back.
pub const fn convert_reg_number(reg: usize) -> usize {
    if reg < 32 && RENAMING_MASK_3_5_OR_9_11 & (1 << reg) != 0 {
        RENAMING_CONST - reg
    } else {
        reg
    }
}

const RBX: usize = convert_reg_number(3);
const RSP: usize = convert_reg_number(4);
const RBP: usize = convert_reg_number(5);
const RSI: usize = 6;
const RDI: usize = 7;
const R8: usize = 8;
const R9: usize = convert_reg_number(9);
const R10: usize = convert_reg_number(10);
const R11: usize = convert_reg_number(11);
const R15: usize = 15;

pub static AMD64_INFO: ArchInfo = ArchInfo {
    arch: Arch::Amd64,
    word_size: 8,
    callee_int: RegMask::range(RBX, R15),
    caller_int: RegMask::range(0, R8),
    callee_fp: RegMask::empty(),
    caller_fp: RegMask::range(0, 15),
    thread_reg: R15,
    frame_reg: RBP,
    sp_reg: Some(RSP),
    lr_reg: None,
    return_reg: 0,
    return_fp_reg: 0,
    temp_regs: &[R11, R10],
    temp_fp_reg: 15,
    param_regs: &[RDI, RSI, 2, 1, R8, R9],
};

#[derive(Clone, Debug)]
pub struct Amd64Registers {
    saved: SavedRegisters,
}

impl Amd64Registers {
    pub fn new(options: &CompilerOptions) -> Self {
        Amd64Registers {
            saved: SavedRegisters::new(&AMD64_INFO, options),
        }
    }
}

impl RegistersDescription for Amd64Registers {
    fn saved(&self) -> &SavedRegisters {
        &self.saved
    }

    fn saved_mut(&mut self) -> &mut SavedRegisters {
        &mut self.saved
    }
}
