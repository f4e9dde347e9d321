/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::*;
use crate::code_info::CodeInfo;
use crate::target::{aarch32::AARCH32_INFO, aarch64::AARCH64_INFO, amd64::AMD64_INFO};

fn r(i: usize) -> Location {
    Location::Reg(PReg::int(i))
}

fn compile_with(
    b: MethodBuilder,
    options: &CompilerOptions,
) -> Result<(CompiledMethod, RecordedCode), CodegenError> {
    let arch = b.arch();
    let (method, intervals) = b.finish();
    let mut enc = RecordingEncoder::new(arch);
    let compiled = CodeGenerator::new(&method, &intervals, arch, options)?.generate(&mut enc)?;
    Ok((compiled, enc.finish()?))
}

fn compile(b: MethodBuilder) -> (CompiledMethod, RecordedCode) {
    compile_with(b, &CompilerOptions::default()).unwrap()
}

fn stores(code: &RecordedCode) -> Vec<(PReg, i32)> {
    code.insts
        .iter()
        .filter_map(|inst| match *inst {
            EncodedInst::Store { src, mem, .. } => Some((src, mem.fp_offset)),
            _ => None,
        })
        .collect()
}

fn loads(code: &RecordedCode) -> Vec<(PReg, i32)> {
    code.insts
        .iter()
        .filter_map(|inst| match *inst {
            EncodedInst::Load { dst, mem, .. } => Some((dst, mem.fp_offset)),
            _ => None,
        })
        .collect()
}

#[test]
fn argument_locations() {
    use ValueType::*;
    let locs = parameter_locations(&AMD64_INFO, &[Int64, Float64, Reference, Int32]);
    assert_eq!(
        locs.as_slice(),
        [r(7), Location::StackParameter(0), r(6), r(2)]
    );
    let many = [Int64; 10];
    let locs = parameter_locations(&AARCH64_INFO, &many);
    assert_eq!(locs[7], r(7));
    assert_eq!(locs[8], Location::StackParameter(0));
    assert_eq!(locs[9], Location::StackParameter(1));
    // Wide values go on the stack on 32-bit targets.
    let locs = parameter_locations(&AARCH32_INFO, &[Int64, Int32, Reference]);
    assert_eq!(locs.as_slice(), [Location::StackParameter(0), r(0), r(1)]);
}

#[test]
fn prologue_saves_used_callee_registers() {
    let mut b = MethodBuilder::new(MethodId::new(3), Arch::Aarch64);
    let a = b.constant(1, ValueType::Int64, r(19));
    b.constant(2, ValueType::Int64, r(20));
    b.constant(3, ValueType::Int64, r(21));
    b.ret(Some(a));
    let (compiled, code) = compile(b);

    assert_eq!(compiled.saved_callees.0.bits(), 0b111 << 19);
    assert_eq!(compiled.frame_slots, 68);
    assert_eq!(
        code.insts[0],
        EncodedInst::PushFrame {
            method_word: 0x13,
            flags: 0,
            frame_slots: 68
        }
    );
    // Ranked from the most significant saved register, x22 pads the
    // odd count.
    let mut saves = stores(&code);
    saves.sort();
    assert_eq!(
        saves,
        [
            (PReg::int(19), -5),
            (PReg::int(20), -4),
            (PReg::int(21), -3),
            (PReg::int(22), -6)
        ]
    );
    let mut restores = loads(&code);
    restores.sort();
    assert_eq!(restores, saves);
    assert!(code.insts.contains(&EncodedInst::Mov {
        dst: PReg::int(0),
        src: PReg::int(19),
        ty: ValueType::Int64
    }));
    assert_eq!(&code.insts[code.insts.len() - 2..], [EncodedInst::PopFrame, EncodedInst::Return]);

    let info = CodeInfo::decode(&compiled.code_info).unwrap();
    assert_eq!(info.header().frame_slots, 68);
    assert_eq!(info.header().code_size, code.size());
    assert_eq!(info.saved_callees(), compiled.saved_callees);
}

#[test]
fn full_prologue_when_not_compact() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
    let a = b.constant(1, ValueType::Int64, r(12));
    b.ret(Some(a));
    let options = CompilerOptions {
        compact_prologue: false,
        ..CompilerOptions::default()
    };
    let (compiled, _) = compile_with(b, &options).unwrap();
    // r15 holds the thread.
    assert_eq!(compiled.saved_callees.0.bits(), 0b1111 << 11);

    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
    b.native();
    b.ret(None);
    let (compiled, code) = compile(b);
    assert_eq!(compiled.saved_callees.0, AMD64_INFO.callee_int);
    assert!(matches!(
        code.insts[0],
        EncodedInst::PushFrame { flags: 1, .. }
    ));
}

#[test]
fn calls_save_live_caller_registers() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
    let x = b.constant(5, ValueType::Int64, r(5));
    let y = b.constant(6, ValueType::Reference, r(12));
    b.constant(7, ValueType::Int64, r(1));
    b.call_runtime(9, &[], &[Some(x), Some(y)], false, Some((ValueType::Int64, r(2))));
    b.ret(Some(x));
    let (compiled, code) = compile(b);

    let call = code
        .insts
        .iter()
        .position(|i| matches!(i, EncodedInst::Call(_)))
        .unwrap();
    // r1 died before the call and r12 is preserved by the callee.
    assert_eq!(
        code.insts[call - 1],
        EncodedInst::Store {
            src: PReg::int(5),
            mem: MemRef::fp(-11),
            ty: ValueType::Int64
        }
    );
    assert_eq!(
        code.insts[call + 1],
        EncodedInst::Mov {
            dst: PReg::int(2),
            src: PReg::int(0),
            ty: ValueType::Int64
        }
    );
    assert_eq!(
        code.insts[call + 2],
        EncodedInst::Load {
            dst: PReg::int(5),
            mem: MemRef::fp(-11),
            ty: ValueType::Int64
        }
    );

    let info = CodeInfo::decode(&compiled.code_info).unwrap();
    let map = info
        .find_stack_map((call as u32 + 1) * INST_SIZE)
        .copied()
        .unwrap();
    assert_eq!(map.bytecode_pc, 3);
    let vregs = info.vregs(&map);
    assert_eq!(vregs.len(), 2);
    assert_eq!((vregs[0].kind, vregs[0].value, vregs[0].object), (LocationKind::Register, 5, false));
    assert_eq!((vregs[1].kind, vregs[1].value), (LocationKind::Register, 12));
    assert!(vregs[1].is_live_object());
}

#[test]
fn result_register_is_not_restored() {
    // The argument dies at the call and the result takes its register.
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
    let x = b.constant(5, ValueType::Int64, r(3));
    let res = b.call_runtime(1, &[x], &[], false, Some((ValueType::Int64, r(3))));
    b.ret(Some(res));
    let (_, code) = compile(b);
    assert!(stores(&code).iter().any(|&(reg, _)| reg == PReg::int(3)));
    assert!(loads(&code).iter().all(|&(reg, _)| reg != PReg::int(3)));
}

#[test]
fn bridge_saves_the_other_caller_registers() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
    let arg = b.constant(1, ValueType::Int64, r(0));
    let p = b.constant(2, ValueType::Int64, r(1));
    let q = b.constant(3, ValueType::Int64, r(9));
    b.call_runtime(4, &[arg], &[Some(p), Some(q)], true, None);
    b.safepoint(&[Some(p), Some(q)]);
    b.ret(None);
    let (_, code) = compile(b);

    let call = code
        .insts
        .iter()
        .position(|i| matches!(i, EncodedInst::Call(_)))
        .unwrap();
    assert_eq!(
        code.insts[call],
        EncodedInst::Call(CallTarget::Runtime {
            entrypoint: 4,
            num_params: 1,
            bridge_saves_callers: true
        })
    );
    let saved: Vec<PReg> = code.insts[..call]
        .iter()
        .filter_map(|i| match *i {
            EncodedInst::Store { src, .. } if !AARCH64_INFO.callee_int.contains(src.hw_enc()) => {
                Some(src)
            }
            _ => None,
        })
        .collect();
    // Parameter registers rounded up to a pair; x9 is left to the bridge.
    assert_eq!(saved, [PReg::int(0), PReg::int(1)]);
}

#[test]
fn stack_arguments_go_to_the_outgoing_area() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
    let args: Vec<InstId> = (0..8)
        .map(|i| b.constant(i, ValueType::Int64, Location::Stack(i as u32)))
        .collect();
    b.call(MethodId::new(1), &args, &[], None);
    b.ret(None);
    let (compiled, code) = compile(b);
    let layout = CFrameLayout::new(&AMD64_INFO, 8 + SCRATCH_SLOTS, 2);
    assert_eq!(compiled.frame_slots, layout.frame_slots());
    let fp = 10_000;
    let out0 = CFrameLayout::fp_offset(fp, layout.outgoing_param_slot(fp, 0));
    let out1 = CFrameLayout::fp_offset(fp, layout.outgoing_param_slot(fp, 1));
    let stored: Vec<i32> = stores(&code).iter().map(|s| s.1).collect();
    assert!(stored.contains(&out0) && stored.contains(&out1));
    // The six register arguments are loaded from their spill slots.
    let loaded: Vec<PReg> = loads(&code).iter().map(|l| l.0).collect();
    for &reg in AMD64_INFO.param_regs {
        assert!(loaded.contains(&PReg::int(reg)), "{}", reg);
    }
}

#[test]
fn spill_fill_swap_goes_through_a_temporary() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
    let x = b.constant(1, ValueType::Int64, r(1));
    let y = b.constant(2, ValueType::Int64, r(2));
    b.shuffle(&[(x, r(2)), (y, r(1))]);
    b.safepoint(&[Some(x), Some(y)]);
    b.ret(None);
    let (_, code) = compile(b);
    let movs: Vec<(PReg, PReg)> = code
        .insts
        .iter()
        .filter_map(|i| match *i {
            EncodedInst::Mov { dst, src, .. } => Some((dst, src)),
            _ => None,
        })
        .collect();
    assert_eq!(movs.len(), 3);
    assert!(movs.iter().any(|&(dst, _)| dst == PReg::int(3)));
}

#[test]
fn aarch32_cycles_of_different_widths_use_their_own_scratch() {
    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch32);
    let a = b.constant(1, ValueType::Int32, r(4));
    let c = b.constant(2, ValueType::Int32, r(5));
    let w1 = b.constant(3, ValueType::Int64, r(6));
    let w2 = b.constant(4, ValueType::Int64, r(8));
    b.shuffle(&[(a, r(5)), (c, r(4)), (w1, r(8)), (w2, r(6))]);
    b.safepoint(&[Some(a), Some(c), Some(w1), Some(w2)]);
    b.ret(None);
    let (_, code) = compile(b);

    let sp = PReg::int(AARCH32_INFO.sp_reg.unwrap());
    let temp = PReg::int(AARCH32_INFO.temp_regs[0]);
    for inst in &code.insts {
        let (dst, ty) = match *inst {
            EncodedInst::Mov { dst, ty, .. }
            | EncodedInst::MovImm { dst, ty, .. }
            | EncodedInst::Load { dst, ty, .. } => (dst, ty),
            _ => continue,
        };
        assert_ne!(dst, sp, "{}", inst);
        assert!(!(dst == temp && ty.is_64bit(Arch::Aarch32)), "{}", inst);
    }
    // The word cycle goes through the temporary, the pair cycle through
    // a spill slot.
    assert!(code
        .insts
        .iter()
        .any(|i| matches!(*i, EncodedInst::Mov { dst, ty: ValueType::Int32, .. } if dst == temp)));
    assert!(code.insts.iter().any(|i| matches!(
        *i,
        EncodedInst::Store { src, ty: ValueType::Int64, .. } if src == PReg::int(6) || src == PReg::int(8)
    )));
}

#[test]
fn failures_are_reported() {
    let build = || {
        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch32);
        let args: Vec<InstId> = (0..5)
            .map(|i| b.constant(i, ValueType::Int32, Location::Stack(i as u32)))
            .collect();
        b.call_runtime(0, &args, &[], false, None);
        b.ret(None);
        b
    };
    assert_eq!(
        compile_with(build(), &CompilerOptions::default()),
        Err(CodegenError::TooManyParameters(5))
    );

    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
    let c = b.constant(1, ValueType::Int64, r(1));
    b.shuffle(&[(c, Location::Stack(300))]);
    b.ret(Some(c));
    assert_eq!(
        compile_with(b, &CompilerOptions::default()).map(|_| ()),
        Err(CodegenError::SpillSlotOutOfRange(300))
    );

    let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
    let a = b.constant(1, ValueType::Int64, r(19));
    b.ret(Some(a));
    let (method, intervals) = b.finish();
    let options = CompilerOptions::default();
    let mut enc = RecordingEncoder::with_limit(Arch::Aarch64, 3);
    let result = CodeGenerator::new(&method, &intervals, Arch::Aarch64, &options)
        .unwrap()
        .generate(&mut enc);
    assert_eq!(result, Err(CodegenError::EncoderFailed));
}
