/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the spill-fill resolver together with the scratch resolver.

use crate::checker::check_parallel_moves;
use crate::codegen::{Encoder, RecordingEncoder};
use crate::moves::{is_paired_reg, MoveAndScratchResolver};
use crate::target::{arch_info, ArchInfo};
use crate::{Arch, Location, PReg, RegClass, RegMask, SpillFillData, SpillFillResolver, ValueType};
use alloc::vec::Vec;
use arbitrary::{Arbitrary, Result, Unstructured};
use smallvec::{smallvec, SmallVec};

/// Spill slots at or above this one belong to the scratch resolver.
const SCRATCH_SLOTS: u32 = 32;

#[derive(Clone, Debug)]
pub struct TestCase {
    arch: Arch,
    group: Vec<SpillFillData>,
    /// Temporaries already taken when the group is resolved.
    busy_temps: usize,
}

/// Registers of `class` the allocator may place values in. The return
/// register is included, since it doubles as the victim.
fn movable(info: &ArchInfo, class: RegClass) -> RegMask {
    let (temp_int, temp_fp) = info.temp_mask();
    match class {
        RegClass::Int => {
            let mut regs = (info.callee_int | info.caller_int) & !temp_int;
            let reserved = [Some(info.thread_reg), Some(info.frame_reg), info.sp_reg, info.lr_reg];
            for &reg in reserved.iter().flatten() {
                regs.remove(reg);
            }
            regs
        }
        RegClass::Float => (info.callee_fp | info.caller_fp) & !temp_fp,
    }
}

/// Every word a location covers when holding a `ty`.
fn words(arch: Arch, loc: Location, ty: ValueType) -> SmallVec<[Location; 2]> {
    match loc.reg() {
        Some(reg) if is_paired_reg(arch, loc, ty) => smallvec![
            loc,
            Location::Reg(PReg::new(reg.hw_enc() + 1, reg.class()))
        ],
        _ => smallvec![loc],
    }
}

/// Whether two locations share some words without being the same.
fn conflicts(arch: Arch, a: (Location, ValueType), b: (Location, ValueType)) -> bool {
    let a = words(arch, a.0, a.1);
    let b = words(arch, b.0, b.1);
    a != b && a.iter().any(|w| b.contains(w))
}

fn arbitrary_location(u: &mut Unstructured, arch: Arch, class: RegClass, paired: bool) -> Result<Location> {
    let regs = movable(arch_info(arch), class);
    let candidates: SmallVec<[usize; 32]> = regs
        .iter()
        .filter(|&r| !paired || (r % 2 == 0 && regs.contains(r + 1)))
        .collect();
    if candidates.is_empty() || u.ratio(1, 3)? {
        return Ok(Location::Stack(u.int_in_range(0..=9)?));
    }
    Ok(Location::Reg(PReg::new(*u.choose(&candidates)?, class)))
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        let arch = *u.choose(&[Arch::Amd64, Arch::Aarch64, Arch::Aarch32])?;
        let mut group: Vec<SpillFillData> = Vec::new();
        let mut written: Vec<Location> = Vec::new();
        while group.len() < 24 && bool::arbitrary(u)? {
            let ty = *u.choose(&[
                ValueType::Int32,
                ValueType::Int64,
                ValueType::Reference,
                ValueType::Float32,
                ValueType::Float64,
            ])?;
            let paired = arch == Arch::Aarch32 && ty.is_64bit(arch);
            let class = ty.reg_class();
            let dst = arbitrary_location(u, arch, class, paired)?;
            let dst_words = words(arch, dst, ty);
            // Every word is written at most once in a group.
            if dst_words.iter().any(|w| written.contains(w)) {
                continue;
            }
            let src = if !ty.is_float() && u.ratio(1, 8)? {
                Location::Imm(u.int_in_range(-5..=5)?)
            } else {
                arbitrary_location(u, arch, class, paired)?
            };
            // Moves touching half of a pair another move uses as a whole
            // are not something the allocator produces.
            let overlaps = group.iter().any(|m| {
                conflicts(arch, (src, ty), (m.src, m.ty))
                    || conflicts(arch, (src, ty), (m.dst, m.ty))
                    || conflicts(arch, (dst, ty), (m.src, m.ty))
            });
            if overlaps {
                continue;
            }
            written.extend(dst_words);
            group.push(SpillFillData::new(src, dst, ty));
        }
        let busy_temps = u.int_in_range(0..=arch_info(arch).temp_regs.len())?;
        Ok(TestCase {
            arch,
            group,
            busy_temps,
        })
    }
}

pub fn check(t: TestCase) {
    let arch = t.arch;
    let resolved = match SpillFillResolver::new(arch).resolve(&t.group) {
        Ok(resolved) => resolved,
        Err(e) => panic!("resolving {:?}: {:?}", t.group, e),
    };
    let cycles = resolved.cycles;
    let sequence = resolved.into_sequence();
    log::trace!("raw resolved moves: {:?}", sequence.moves());
    assert_eq!(
        sequence.moves().iter().filter(|m| m.dst.is_none()).count(),
        cycles
    );

    // Temporaries come from an encoder, refused for pairs the way the
    // code generator refuses them.
    let info = arch_info(arch);
    let mut enc = RecordingEncoder::new(arch);
    for _ in 0..t.busy_temps {
        enc.acquire_scratch(RegClass::Int);
    }
    let before = enc.live_tmp_reg_mask();
    let mut next_slot = SCRATCH_SLOTS;
    let moves = {
        let tmps = &mut enc;
        MoveAndScratchResolver::new(
            arch,
            |ty: ValueType| {
                if !ty.is_float() && arch == Arch::Aarch32 && ty.is_64bit(arch) {
                    return None;
                }
                tmps.acquire_scratch(ty.reg_class()).map(Location::Reg)
            },
            || {
                next_slot += 1;
                Location::Stack(next_slot - 1)
            },
            PReg::int(info.return_reg),
        )
        .compute(sequence)
    };
    log::trace!("resolved moves: {:?}", moves);

    for m in &moves {
        assert!(!(m.src.is_memory() && m.dst.is_memory()), "{:?}", m);
        assert!(!m.dst.is_none() && !m.src.is_none());
        if let Some(reg) = m.dst.reg() {
            assert_eq!(reg.class(), m.ty.reg_class(), "{:?}", m);
        }
    }

    // Only what the resolver was handed may change besides the group's
    // destinations: fresh temporaries, with the second half of a double
    // temporary, and scratch slots.
    let after = enc.live_tmp_reg_mask();
    let handed_int = after.0 & !before.0;
    let handed_fp = after.1 & !before.1;
    let clobberable = |loc: Location| match loc {
        Location::Stack(slot) => slot >= SCRATCH_SLOTS,
        Location::Reg(reg) if reg.is_float() => {
            let hw = reg.hw_enc();
            handed_fp.contains(hw)
                || (arch == Arch::Aarch32 && hw % 2 == 1 && handed_fp.contains(hw - 1))
        }
        Location::Reg(reg) => handed_int.contains(reg.hw_enc()),
        _ => false,
    };
    if let Err(e) = check_parallel_moves(arch, &t.group, &moves, clobberable) {
        panic!("{:?} resolved to {:?}: {:?}", t.group, moves, e);
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
