/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Per-target register conventions and the callee/caller-saved masks
//! derived from what a method actually uses.
//!
//! The masks computed here are baked into the frame header by the code
//! generator and read back by the stack walker, so both sides go through
//! [`ArchInfo`] and [`CFrameLayout`](crate::frame::CFrameLayout) rather
//! than through their own copies of the tables.

use crate::{Arch, CompilerOptions, PReg, RegClass, RegMask, ValueType, VRegMask};
use alloc::boxed::Box;

pub mod aarch32;
pub mod aarch64;
pub mod amd64;

/// Fixed register conventions of one target. Register numbers are the
/// ones used everywhere else in the crate, which for amd64 means the
/// renumbered ones.
#[derive(Clone, Debug)]
pub struct ArchInfo {
    pub arch: Arch,
    /// Size of a stack slot, in bytes.
    pub word_size: u32,
    pub callee_int: RegMask,
    pub caller_int: RegMask,
    pub callee_fp: VRegMask,
    pub caller_fp: VRegMask,
    /// Holds the runtime thread pointer.
    pub thread_reg: usize,
    pub frame_reg: usize,
    pub sp_reg: Option<usize>,
    pub lr_reg: Option<usize>,
    pub return_reg: usize,
    pub return_fp_reg: usize,
    /// Registers the encoder reserves for itself. Never allocated.
    pub temp_regs: &'static [usize],
    pub temp_fp_reg: usize,
    /// Integer argument registers, in argument order.
    pub param_regs: &'static [usize],
}

impl ArchInfo {
    pub fn callee(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.callee_int,
            RegClass::Float => self.callee_fp,
        }
    }

    pub fn caller(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.caller_int,
            RegClass::Float => self.caller_fp,
        }
    }

    pub fn temp_mask(&self) -> (RegMask, VRegMask) {
        let mut fp = RegMask::empty().with(self.temp_fp_reg);
        if self.arch == Arch::Aarch32 {
            // Doubles live in s-register pairs.
            fp.insert(self.temp_fp_reg + 1);
        }
        (self.temp_regs.iter().copied().collect(), fp)
    }

    /// Mask of the first `count` argument registers.
    pub fn param_mask(&self, count: usize) -> RegMask {
        self.param_regs.iter().take(count).copied().collect()
    }

    pub fn thread(&self) -> PReg {
        PReg::int(self.thread_reg)
    }

    pub fn return_reg(&self, ty: ValueType) -> PReg {
        if ty.is_float() {
            PReg::float(self.return_fp_reg)
        } else {
            PReg::int(self.return_reg)
        }
    }
}

/// Register tables of a target.
pub fn arch_info(arch: Arch) -> &'static ArchInfo {
    match arch {
        Arch::Amd64 => &amd64::AMD64_INFO,
        Arch::Aarch64 => &aarch64::AARCH64_INFO,
        Arch::Aarch32 => &aarch32::AARCH32_INFO,
    }
}

/// Masks shared by every target's description.
#[derive(Clone, Debug)]
pub struct SavedRegisters {
    info: &'static ArchInfo,
    default_callee: RegMask,
    default_callee_fp: VRegMask,
    callee: RegMask,
    callee_fp: VRegMask,
    caller: RegMask,
    caller_fp: VRegMask,
    used: RegMask,
    used_fp: VRegMask,
}

impl SavedRegisters {
    pub fn new(info: &'static ArchInfo, options: &CompilerOptions) -> Self {
        let mut default_callee = info.callee_int.without(info.return_reg);
        if !options.allocate_thread_reg {
            default_callee.remove(info.thread_reg);
        }
        let default_callee_fp = info.callee_fp.without(info.return_fp_reg);
        // Until told otherwise, assume everything is used.
        SavedRegisters {
            info,
            default_callee,
            default_callee_fp,
            callee: default_callee,
            callee_fp: default_callee_fp,
            caller: info.caller_int,
            caller_fp: info.caller_fp,
            used: RegMask::all(),
            used_fp: RegMask::all(),
        }
    }
}

/// Callee/caller-saved bookkeeping for one method on one target.
pub trait RegistersDescription {
    fn saved(&self) -> &SavedRegisters;
    fn saved_mut(&mut self) -> &mut SavedRegisters;

    fn info(&self) -> &'static ArchInfo {
        self.saved().info
    }

    fn arch(&self) -> Arch {
        self.info().arch
    }

    /// Whether a value of type `ty` occupies two consecutive registers.
    fn is_paired_reg(&self, _ty: ValueType) -> bool {
        false
    }

    /// An extra register to save alongside the callee registers of
    /// `class` so that they can be pushed in pairs.
    fn alignment_reg(&self, _class: RegClass) -> Option<PReg> {
        None
    }

    /// Recomputes the masks from the registers the allocator handed out.
    fn set_used_regs(&mut self, regs: &[(PReg, ValueType)]) {
        let mut used = RegMask::empty();
        let mut used_fp = VRegMask::empty();
        for &(reg, ty) in regs {
            let mask = match reg.class() {
                RegClass::Int => &mut used,
                RegClass::Float => &mut used_fp,
            };
            mask.insert(reg.hw_enc());
            if self.is_paired_reg(ty) {
                mask.insert(reg.hw_enc() + 1);
            }
        }
        let saved = self.saved_mut();
        saved.used = used;
        saved.used_fp = used_fp;
        saved.callee = saved.default_callee & used;
        saved.callee_fp = saved.default_callee_fp & used_fp;
        saved.caller = saved.info.caller_int & used;
        saved.caller_fp = saved.info.caller_fp & used_fp;
        trace!(
            "{}: used {} / {}, callee {} / {}, caller {} / {}",
            saved.info.arch,
            used,
            used_fp,
            saved.callee,
            saved.callee_fp,
            saved.caller,
            saved.caller_fp
        );
    }

    fn used_regs(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.saved().used,
            RegClass::Float => self.saved().used_fp,
        }
    }

    /// Callee-saved registers this method must preserve.
    fn callee_regs(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.saved().callee,
            RegClass::Float => self.saved().callee_fp,
        }
    }

    /// Caller-saved registers this method may hold values in across a
    /// call.
    fn caller_regs(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.saved().caller,
            RegClass::Float => self.saved().caller_fp,
        }
    }

    /// Callee-saved set before intersecting with the used registers.
    fn default_callee_regs(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.saved().default_callee,
            RegClass::Float => self.saved().default_callee_fp,
        }
    }

    fn is_callee_register(&self, reg: PReg) -> bool {
        self.info().callee(reg.class()).contains(reg.hw_enc())
    }

    fn is_caller_register(&self, reg: PReg) -> bool {
        self.info().caller(reg.class()).contains(reg.hw_enc())
    }
}

/// Description for `arch`.
pub fn registers_description(
    arch: Arch,
    options: &CompilerOptions,
) -> Box<dyn RegistersDescription> {
    match arch {
        Arch::Amd64 => Box::new(amd64::Amd64Registers::new(options)),
        Arch::Aarch64 => Box::new(aarch64::Aarch64Registers::new(options)),
        Arch::Aarch32 => Box::new(aarch32::Aarch32Registers::new(options)),
    }
}
