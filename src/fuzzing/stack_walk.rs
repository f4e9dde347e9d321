/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fuzz the code generator and the stack walker together: values are
//! placed in arbitrary registers and spill slots, shuffled around between
//! runtime calls and safepoints, and every time the thread parks the
//! walker must find each of them with its current value.

use crate::codegen::builder::MethodBuilder;
use crate::sim::{Machine, Parked, Runtime, SimError};
use crate::target::{arch_info, ArchInfo};
use crate::{Arch, CompilerOptions, InstId, Location, MethodId, PReg, RegMask, ValueType};
use alloc::vec::Vec;
use arbitrary::{Arbitrary, Result, Unstructured};
use smallvec::SmallVec;

/// Added to every object each time the thread parks.
const DELTA: u64 = 0x10000;

const SPILL_SLOTS: u32 = 12;

const MAX_VALUES: usize = 8;

const ENTRYPOINT: u32 = 1;

#[derive(Clone, Debug)]
enum Op {
    CallRuntime { saves_only_params: bool },
    Safepoint,
    /// New location of every value.
    Shuffle(Vec<Location>),
}

#[derive(Clone, Debug)]
pub struct TestCase {
    arch: Arch,
    options: CompilerOptions,
    values: Vec<(ValueType, u64)>,
    initial: Vec<Location>,
    ops: Vec<Op>,
}

/// Integer registers a value may be given: everything the encoder,
/// the runtime and the frame leave alone.
fn allocatable(info: &ArchInfo) -> RegMask {
    let mut regs = (info.callee_int | info.caller_int) & !info.temp_mask().0;
    let reserved = [
        Some(info.thread_reg),
        Some(info.frame_reg),
        info.sp_reg,
        info.lr_reg,
        Some(info.return_reg),
    ];
    for &reg in reserved.iter().flatten() {
        regs.remove(reg);
    }
    regs
}

/// Distinct locations for values of `types`.
fn arbitrary_locations(
    u: &mut Unstructured,
    arch: Arch,
    types: &[ValueType],
) -> Result<Vec<Location>> {
    let regs = allocatable(arch_info(arch));
    let mut taken_regs = RegMask::empty();
    let mut taken_slots: SmallVec<[u32; 8]> = SmallVec::new();
    let mut locations = Vec::with_capacity(types.len());
    for &ty in types {
        let paired = arch == Arch::Aarch32 && ty.is_64bit(arch);
        let mut candidates: SmallVec<[Location; 32]> = regs
            .iter()
            .filter(|&r| !taken_regs.contains(r))
            .filter(|&r| !paired || (r % 2 == 0 && regs.contains(r + 1) && !taken_regs.contains(r + 1)))
            .map(|r| Location::Reg(PReg::int(r)))
            .collect();
        candidates.extend(
            (0..SPILL_SLOTS)
                .filter(|s| !taken_slots.contains(s))
                .map(Location::Stack),
        );
        let loc = *u.choose(&candidates)?;
        match loc {
            Location::Reg(reg) => {
                taken_regs.insert(reg.hw_enc());
                if paired {
                    taken_regs.insert(reg.hw_enc() + 1);
                }
            }
            Location::Stack(slot) => taken_slots.push(slot),
            _ => unreachable!(),
        }
        locations.push(loc);
    }
    Ok(locations)
}

impl Arbitrary<'_> for TestCase {
    fn arbitrary(u: &mut Unstructured) -> Result<Self> {
        let arch = *u.choose(&[Arch::Amd64, Arch::Aarch64, Arch::Aarch32])?;
        let options = CompilerOptions {
            save_only_live_registers: bool::arbitrary(u)?,
            compact_prologue: bool::arbitrary(u)?,
            ..CompilerOptions::default()
        };

        let count = u.int_in_range(1..=MAX_VALUES)?;
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let ty = *u.choose(&[ValueType::Reference, ValueType::Int64, ValueType::Int32])?;
            let value = match ty {
                ValueType::Reference => 0x100 * (i as u64 + 1),
                ValueType::Int32 => u64::from(u32::arbitrary(u)? & 0x7fff_ffff),
                _ => u64::arbitrary(u)?,
            };
            values.push((ty, value));
        }
        let types: Vec<ValueType> = values.iter().map(|&(ty, _)| ty).collect();
        let initial = arbitrary_locations(u, arch, &types)?;

        let mut ops = Vec::new();
        while ops.len() < 12 && bool::arbitrary(u)? {
            let op = match u.int_in_range(0..=2)? {
                0 => Op::CallRuntime {
                    saves_only_params: bool::arbitrary(u)?,
                },
                1 => Op::Safepoint,
                _ => Op::Shuffle(arbitrary_locations(u, arch, &types)?),
            };
            ops.push(op);
        }
        Ok(TestCase {
            arch,
            options,
            values,
            initial,
            ops,
        })
    }
}

/// Checks the walker's view of the parked thread against the values the
/// method was given, then moves every object.
struct Checker {
    expected: Vec<(ValueType, u64)>,
    parks: usize,
}

impl Checker {
    fn park(&mut self, parked: &mut Parked<'_>) {
        let mut walker = parked.walker();
        assert!(walker.verify(), "inconsistent stack at park {}", self.parks);

        let want: Vec<(u32, u64, bool)> = self
            .expected
            .iter()
            .enumerate()
            .map(|(i, &(ty, value))| (i as u32, value, ty.is_reference()))
            .collect();
        walker.reset();
        let mut seen = Vec::new();
        walker.iterate_vregs(|v| seen.push((v.index, v.value, v.object)));
        assert_eq!(seen, want, "values at park {}", self.parks);

        let mut roots = Vec::new();
        walker.visit_gc_roots(|root| roots.push(root.object));
        roots.sort_unstable();
        let mut objects: Vec<u64> = want.iter().filter(|v| v.2).map(|v| v.1).collect();
        objects.sort_unstable();
        assert_eq!(roots, objects, "roots at park {}", self.parks);

        walker.update_objects(|o| o + DELTA);
        for (ty, value) in self.expected.iter_mut() {
            if ty.is_reference() {
                *value += DELTA;
            }
        }
        walker.reset();
        let mut moved = Vec::new();
        walker.iterate_vregs(|v| moved.push(v.value));
        let expected: Vec<u64> = self.expected.iter().map(|&(_, value)| value).collect();
        assert_eq!(moved, expected, "forwarded values at park {}", self.parks);
        self.parks += 1;
    }
}

impl Runtime for Checker {
    fn call(&mut self, entrypoint: u32, args: &[u64], mut parked: Parked<'_>) -> core::result::Result<u64, SimError> {
        assert_eq!(entrypoint, ENTRYPOINT);
        assert!(args.is_empty());
        self.park(&mut parked);
        Ok(0)
    }

    fn safepoint(&mut self, mut parked: Parked<'_>) -> core::result::Result<(), SimError> {
        self.park(&mut parked);
        Ok(())
    }
}

pub fn check(t: TestCase) {
    let mut b = MethodBuilder::new(MethodId::new(0), t.arch);
    let ids: Vec<InstId> = t
        .values
        .iter()
        .zip(&t.initial)
        .map(|(&(ty, value), &loc)| b.constant(value as i64, ty, loc))
        .collect();
    let live: Vec<Option<InstId>> = ids.iter().copied().map(Some).collect();
    let mut parks = 0;
    let mut current = t.initial.clone();
    for op in &t.ops {
        match op {
            Op::CallRuntime { saves_only_params } => {
                b.call_runtime(ENTRYPOINT, &[], &live, *saves_only_params, None);
                parks += 1;
            }
            Op::Safepoint => {
                b.safepoint(&live);
                parks += 1;
            }
            Op::Shuffle(to) => {
                let moves: Vec<(InstId, Location)> = ids
                    .iter()
                    .zip(current.iter().zip(to))
                    .filter(|(_, (from, to))| from != to)
                    .map(|(&id, (_, &to))| (id, to))
                    .collect();
                if !moves.is_empty() {
                    b.shuffle(&moves);
                }
                current = to.clone();
            }
        }
    }
    b.safepoint(&live);
    parks += 1;
    b.ret(None);
    let (method, intervals) = b.finish();

    let checker = Checker {
        expected: t.values.clone(),
        parks: 0,
    };
    let mut machine = Machine::new(t.arch, 0x1000, checker);
    if let Err(e) = machine.compile(&method, &intervals, &t.options) {
        panic!("compiling {:?}: {:?}", method, e);
    }
    if let Err(e) = machine.run(method.id, &[], ValueType::Int64) {
        panic!("running {:?}: {:?}", method, e);
    }
    assert_eq!(machine.runtime().parks, parks);
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
