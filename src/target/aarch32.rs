/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! AArch32 (AAPCS, VFP single-precision numbering).
//!
//! 64-bit values take an even/odd register pair: `rN:rN+1` for integers,
//! `sN:sN+1` (that is, `dN/2`) for doubles.

use super::{ArchInfo, RegistersDescription, SavedRegisters};
use crate::{Arch, CompilerOptions, RegMask, ValueType};

pub static AARCH32_INFO: ArchInfo = ArchInfo {
    arch: Arch::Aarch32,
    word_size: 4,
    callee_int: RegMask::range(4, 10),
    caller_int: RegMask::range(0, 3),
    callee_fp: RegMask::range(16, 31),
    caller_fp: RegMask::range(0, 15),
    thread_reg: 10,
    frame_reg: 11,
    sp_reg: Some(13),
    lr_reg: Some(14),
    return_reg: 0,
    return_fp_reg: 0,
    temp_regs: &[12],
    temp_fp_reg: 14,
    param_regs: &[0, 1, 2, 3],
};

#[derive(Clone, Debug)]
pub struct Aarch32Registers {
    saved: SavedRegisters,
}

impl Aarch32Registers {
    pub fn new(options: &CompilerOptions) -> Self {
        Aarch32Registers {
            saved: SavedRegisters::new(&AARCH32_INFO, options),
        }
    }
}

impl RegistersDescription for Aarch32Registers {
    fn saved(&self) -> &SavedRegisters {
        &self.saved
    }

    fn saved_mut(&mut self) -> &mut SavedRegisters {
        &mut self.saved
    }

    fn is_paired_reg(&self, ty: ValueType) -> bool {
        ty.is_64bit(Arch::Aarch32)
    }
}
