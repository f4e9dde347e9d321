/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Live registers around an instruction, as the code generator sees
//! them.

use crate::interval_tree::IntervalTree;
use crate::intervals::LifeIntervals;
use crate::moves::is_paired_reg;
use crate::target::ArchInfo;
use crate::{Arch, CompilerOptions, InstId, Location, RegClass, RegMask, VRegMask};
use core::cell::OnceCell;

/// Runtime calls pass at most this many arguments in registers.
pub const MAX_RUNTIME_PARAMS: usize = 6;

/// Answers "which registers hold live values at this instruction" for
/// one method. The interval tree is built on the first query and kept
/// until [`LiveRegisters::invalidate`].
pub struct LiveRegisters<'a> {
    intervals: &'a LifeIntervals,
    info: &'static ArchInfo,
    options: &'a CompilerOptions,
    tree: OnceCell<Option<IntervalTree>>,
}

impl<'a> LiveRegisters<'a> {
    pub fn new(
        intervals: &'a LifeIntervals,
        info: &'static ArchInfo,
        options: &'a CompilerOptions,
    ) -> Self {
        LiveRegisters {
            intervals,
            info,
            options,
            tree: OnceCell::new(),
        }
    }

    /// The tree, building it if needed. `None` when no value has a
    /// register.
    pub fn tree(&self) -> Option<&IntervalTree> {
        self.tree
            .get_or_init(|| IntervalTree::build(self.intervals))
            .as_ref()
    }

    /// Drops the tree; the next query rebuilds it.
    pub fn invalidate(&mut self) {
        self.tree = OnceCell::new();
    }

    /// Registers live at `inst`, not counting `inst`'s own value, plus
    /// `live_tmps`, the encoder temporaries currently in use.
    ///
    /// With `LIVE_INPUTS` a value whose last use is `inst` counts as
    /// live. Without `inst`, or with
    /// [`CompilerOptions::save_only_live_registers`] off, everything is
    /// live.
    pub fn get_live_registers<const LIVE_INPUTS: bool>(
        &self,
        inst: Option<InstId>,
        live_tmps: (RegMask, VRegMask),
    ) -> (RegMask, VRegMask) {
        let inst = match inst {
            Some(inst) if self.options.save_only_live_registers => inst,
            _ => return (RegMask::all(), VRegMask::all()),
        };
        let ln = match self.intervals.life_number(inst) {
            Some(ln) => ln,
            None => {
                log::warn!("no life number for {:?}, assuming every register live", inst);
                return (RegMask::all(), VRegMask::all());
            }
        };

        let mut live = RegMask::empty();
        let mut live_fp = VRegMask::empty();
        if let Some(tree) = self.tree() {
            let arch = self.info.arch;
            tree.visit_intervals::<LIVE_INPUTS, _>(self.intervals, ln, Some(inst), |interval| {
                if let Some(reg) = interval.reg() {
                    let mask = match reg.class() {
                        RegClass::Int => &mut live,
                        RegClass::Float => &mut live_fp,
                    };
                    mask.insert(reg.hw_enc());
                    if is_paired_reg(arch, Location::Reg(reg), interval.ty()) {
                        mask.insert(reg.hw_enc() + 1);
                    }
                }
            });
        }
        trace!(
            "live at {:?} (ln {}, inputs {}): {} / {}",
            inst,
            ln,
            LIVE_INPUTS,
            live,
            live_fp
        );
        (live | live_tmps.0, live_fp | live_tmps.1)
    }
}

/// Keeps only the registers that carry the first `num_params` runtime
/// call arguments.
pub fn fill_only_parameters(mask: RegMask, num_params: usize, info: &ArchInfo) -> RegMask {
    assert!(num_params <= MAX_RUNTIME_PARAMS);
    let mut num_params = num_params;
    if info.arch == Arch::Aarch64 {
        // Parameter registers are saved in pairs.
        num_params += num_params & 1;
    }
    mask & info.param_mask(num_params)
}
