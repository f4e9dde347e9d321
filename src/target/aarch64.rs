/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! AArch64 (AAPCS64).
//!
//! Callee-saved registers are stored with paired stores, so an odd
//! number of them gets padded with one more register of the same class.

use super::{ArchInfo, RegistersDescription, SavedRegisters};
use crate::{Arch, CompilerOptions, PReg, RegClass, RegMask};

pub static AARCH64_INFO: ArchInfo = ArchInfo {
    arch: Arch::Aarch64,
    word_size: 8,
    callee_int: RegMask::range(19, 28),
    caller_int: RegMask::range(0, 18),
    callee_fp: RegMask::range(8, 15),
    caller_fp: RegMask::new(0xFFFF_00FF),
    thread_reg: 28,
    frame_reg: 29,
    sp_reg: None,
    lr_reg: Some(30),
    return_reg: 0,
    return_fp_reg: 0,
    temp_regs: &[16, 17],
    temp_fp_reg: 31,
    param_regs: &[0, 1, 2, 3, 4, 5, 6, 7],
};

#[derive(Clone, Debug)]
pub struct Aarch64Registers {
    saved: SavedRegisters,
}

impl Aarch64Registers {
    pub fn new(options: &CompilerOptions) -> Self {
        Aarch64Registers {
            saved: SavedRegisters::new(&AARCH64_INFO, options),
        }
    }
}

impl RegistersDescription for Aarch64Registers {
    fn saved(&self) -> &SavedRegisters {
        &self.saved
    }

    fn saved_mut(&mut self) -> &mut SavedRegisters {
        &mut self.saved
    }

    fn alignment_reg(&self, class: RegClass) -> Option<PReg> {
        let saved = self.callee_regs(class);
        if saved.count() % 2 == 0 {
            return None;
        }
        // Lowest callee register of the class not already saved.
        let free = self.info().callee(class) & !saved;
        free.min_register().map(|r| PReg::new(r, class))
    }
}
