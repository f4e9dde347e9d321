/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A machine executing [`RecordedCode`], for testing the code generator
//! and the stack walker against each other.
//!
//! Stack words are 64 bits on every target. Registers are 32 bits on
//! aarch32, where 64-bit values live in register pairs and are stored to
//! a single stack word. Code of method `id` is placed at `(id + 1) << 20`.
//!
//! Runtime calls go through a bridge frame that saves every callee
//! register and, when asked to, the caller registers the code left to
//! it. The thread is then parked at the bridge and handed to the
//! [`Runtime`], which may walk the stack and update what it finds there.
//! Safepoint polls park the thread the same way, saving every caller
//! register.

use crate::code_info::{CodeInfo, CodeInfoError};
use crate::codegen::encoder::{CallTarget, EncodedInst, MemRef, RecordedCode, RecordingEncoder, INST_SIZE};
use crate::codegen::{parameter_locations, CodeGenerator, CompiledMethod, Method};
use crate::frame::{boundary, BoundaryKind, CFrameLayout, SlotAddr, FLAGS_OFFSET, METHOD_WORD_OFFSET};
use crate::live_registers::fill_only_parameters;
use crate::moves::is_paired_reg;
use crate::stack_walker::{CodeRegistry, SimulatedStack, StackMemory, StackWalker, ThreadState};
use crate::target::{arch_info, ArchInfo};
use crate::{
    Arch, CodegenError, CompilerOptions, FxHashMap, LifeIntervals, Location, MethodId, PReg,
    RegClass, RegMask, VRegMask, ValueType,
};
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

/// Return address of the outermost frame. Returning to it ends a run.
pub const HOST_RETURN: u64 = 0;

pub const DEFAULT_FUEL: u64 = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimError {
    Codegen(CodegenError),
    CodeInfo(CodeInfoError),
    UnknownMethod(MethodId),
    ArgumentCount { expected: usize, actual: usize },
    /// No installed instruction at this address.
    BadPc(u64),
    BadAddress(u64),
    /// A register pair running past the last register.
    BadRegister(PReg),
    StackOverflow,
    OutOfFuel,
    /// The runtime failed the call to this entrypoint.
    Runtime(u32),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SimError {}

impl From<CodegenError> for SimError {
    fn from(e: CodegenError) -> Self {
        SimError::Codegen(e)
    }
}

impl From<CodeInfoError> for SimError {
    fn from(e: CodeInfoError) -> Self {
        SimError::CodeInfo(e)
    }
}

/// A thread stopped in a runtime bridge.
pub struct Parked<'a> {
    pub stack: &'a mut SimulatedStack,
    pub registry: &'a CodeRegistry,
    pub arch: Arch,
    pub thread: ThreadState,
}

impl<'a> Parked<'a> {
    pub fn walker(&mut self) -> StackWalker<'_, &mut SimulatedStack> {
        StackWalker::new(&mut *self.stack, self.registry, self.arch, self.thread)
    }
}

/// What runtime entrypoints and safepoints do.
pub trait Runtime {
    /// Runs `entrypoint`. The result goes to the return register.
    fn call(&mut self, entrypoint: u32, args: &[u64], parked: Parked<'_>) -> Result<u64, SimError>;

    fn safepoint(&mut self, _parked: Parked<'_>) -> Result<(), SimError> {
        Ok(())
    }
}

/// Every entrypoint returns 0.
impl Runtime for () {
    fn call(&mut self, _entrypoint: u32, _args: &[u64], _parked: Parked<'_>) -> Result<u64, SimError> {
        Ok(0)
    }
}

struct Installed {
    params: Vec<ValueType>,
    code: RecordedCode,
}

pub struct Machine<R: Runtime> {
    info: &'static ArchInfo,
    stack: SimulatedStack,
    registry: CodeRegistry,
    code: FxHashMap<MethodId, Installed>,
    int_regs: [u64; 32],
    fp_regs: [u64; 32],
    sp: SlotAddr,
    fp: SlotAddr,
    pc: u64,
    fuel: u64,
    runtime: R,
}

impl<R: Runtime> Machine<R> {
    pub fn new(arch: Arch, stack_words: usize, runtime: R) -> Self {
        let stack = SimulatedStack::new(0x1000, stack_words);
        Machine {
            info: arch_info(arch),
            sp: stack.top(),
            stack,
            registry: CodeRegistry::new(),
            code: FxHashMap::default(),
            int_regs: [0; 32],
            fp_regs: [0; 32],
            fp: 0,
            pc: HOST_RETURN,
            fuel: DEFAULT_FUEL,
            runtime,
        }
    }

    /// Limits every run to `fuel` instructions.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn arch(&self) -> Arch {
        self.info.arch
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn stack(&self) -> &SimulatedStack {
        &self.stack
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    pub fn code(&self, method: MethodId) -> Option<&RecordedCode> {
        self.code.get(&method).map(|installed| &installed.code)
    }

    pub fn code_base(method: MethodId) -> u64 {
        (method.raw_u32() as u64 + 1) << 20
    }

    /// Makes `code` callable as `method.id`.
    pub fn install(
        &mut self,
        method: &Method,
        compiled: &CompiledMethod,
        code: RecordedCode,
    ) -> Result<(), SimError> {
        let info = CodeInfo::decode(&compiled.code_info)?;
        debug_assert_eq!(info.header().code_size, code.size());
        self.registry.insert(method.id, Self::code_base(method.id), info);
        self.code.insert(
            method.id,
            Installed {
                params: method.params.clone(),
                code,
            },
        );
        Ok(())
    }

    /// Generates code for `method` and installs it.
    pub fn compile(
        &mut self,
        method: &Method,
        intervals: &LifeIntervals,
        options: &CompilerOptions,
    ) -> Result<CompiledMethod, SimError> {
        let mut enc = RecordingEncoder::new(self.info.arch);
        let compiled = CodeGenerator::new(method, intervals, self.info.arch, options)?.generate(&mut enc)?;
        let code = enc.finish()?;
        if options.dump_disassembly {
            for (i, inst) in code.insts.iter().enumerate() {
                log::info!("{:?} {:4}: {}", method.id, i as u32 * INST_SIZE, inst);
            }
        }
        self.install(method, &compiled, code)?;
        Ok(compiled)
    }

    pub fn reg(&self, reg: PReg) -> u64 {
        self.bank(reg.class())[reg.hw_enc()]
    }

    pub fn set_reg(&mut self, reg: PReg, value: u64) {
        let value = self.narrow(value);
        self.bank_mut(reg.class())[reg.hw_enc()] = value;
    }

    /// Calls `method` from the host and returns its result, read as `ty`.
    pub fn run(&mut self, method: MethodId, args: &[u64], ty: ValueType) -> Result<u64, SimError> {
        let params = match self.code.get(&method) {
            Some(installed) => installed.params.clone(),
            None => return Err(SimError::UnknownMethod(method)),
        };
        if params.len() != args.len() {
            return Err(SimError::ArgumentCount {
                expected: params.len(),
                actual: args.len(),
            });
        }
        let locations = parameter_locations(self.info, &params);
        let on_stack = locations
            .iter()
            .filter(|loc| matches!(loc, Location::StackParameter(_)))
            .count() as u64;

        self.sp = self.stack.top() - ((on_stack + 1) & !1);
        let entry_sp = self.sp;
        for ((&loc, &arg), &param) in locations.iter().zip(args).zip(&params) {
            match loc {
                Location::Reg(reg) => self.write_reg(reg, param, arg)?,
                Location::StackParameter(i) => self.store(entry_sp + i as u64, arg)?,
                _ => unreachable!(),
            }
        }
        self.fp = 0;
        self.push(HOST_RETURN)?;
        self.pc = Self::code_base(method);
        trace!("sim: run {:?} with {:?}", method, args);

        let mut fuel = self.fuel;
        while self.step()? {
            fuel = fuel.checked_sub(1).ok_or(SimError::OutOfFuel)?;
        }
        debug_assert_eq!(self.sp, entry_sp);
        self.read_reg(self.info.return_reg(ty), ty)
    }

    fn bank(&self, class: RegClass) -> &[u64; 32] {
        match class {
            RegClass::Int => &self.int_regs,
            RegClass::Float => &self.fp_regs,
        }
    }

    fn bank_mut(&mut self, class: RegClass) -> &mut [u64; 32] {
        match class {
            RegClass::Int => &mut self.int_regs,
            RegClass::Float => &mut self.fp_regs,
        }
    }

    fn narrow(&self, value: u64) -> u64 {
        if self.info.arch.is_64bit() {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    fn read_reg(&self, reg: PReg, ty: ValueType) -> Result<u64, SimError> {
        let bank = self.bank(reg.class());
        let r = reg.hw_enc();
        if is_paired_reg(self.info.arch, Location::Reg(reg), ty) {
            let hi = bank.get(r + 1).ok_or(SimError::BadRegister(reg))?;
            Ok((bank[r] & 0xffff_ffff) | (hi << 32))
        } else {
            Ok(bank[r])
        }
    }

    fn write_reg(&mut self, reg: PReg, ty: ValueType, value: u64) -> Result<(), SimError> {
        let r = reg.hw_enc();
        if is_paired_reg(self.info.arch, Location::Reg(reg), ty) {
            let bank = self.bank_mut(reg.class());
            if r + 1 >= bank.len() {
                return Err(SimError::BadRegister(reg));
            }
            bank[r] = value & 0xffff_ffff;
            bank[r + 1] = value >> 32;
        } else {
            let value = self.narrow(value);
            self.bank_mut(reg.class())[r] = value;
        }
        Ok(())
    }

    fn load(&self, addr: SlotAddr) -> Result<u64, SimError> {
        if !self.stack.contains(addr) {
            return Err(SimError::BadAddress(addr));
        }
        Ok(self.stack.read(addr))
    }

    fn store(&mut self, addr: SlotAddr, value: u64) -> Result<(), SimError> {
        if !self.stack.contains(addr) {
            return Err(SimError::BadAddress(addr));
        }
        self.stack.write(addr, value);
        Ok(())
    }

    fn fp_addr(&self, mem: MemRef) -> SlotAddr {
        (self.fp as i64 + mem.fp_offset as i64) as u64
    }

    fn set_sp(&mut self, sp: SlotAddr) -> Result<(), SimError> {
        if sp < self.stack.base() {
            return Err(SimError::StackOverflow);
        }
        self.sp = sp;
        Ok(())
    }

    fn push(&mut self, value: u64) -> Result<(), SimError> {
        let sp = self.sp.checked_sub(1).ok_or(SimError::StackOverflow)?;
        self.set_sp(sp)?;
        self.store(sp, value)
    }

    fn pop(&mut self) -> Result<u64, SimError> {
        let value = self.load(self.sp)?;
        self.sp += 1;
        Ok(value)
    }

    fn fetch(&self, pc: u64) -> Result<(u64, EncodedInst), SimError> {
        let compiled = self.registry.find(pc).ok_or(SimError::BadPc(pc))?;
        let installed = self
            .code
            .get(&compiled.method)
            .ok_or(SimError::BadPc(pc))?;
        let inst = installed
            .code
            .inst_at((pc - compiled.code_base) as u32)
            .ok_or(SimError::BadPc(pc))?;
        Ok((compiled.code_base, *inst))
    }

    /// Executes one instruction. False once the outermost frame returned.
    fn step(&mut self) -> Result<bool, SimError> {
        let (code_base, inst) = self.fetch(self.pc)?;
        let next = self.pc + INST_SIZE as u64;
        trace!("sim: {:#x}: {}", self.pc, inst);
        self.pc = next;
        match inst {
            EncodedInst::Mov { dst, src, ty } => {
                let value = self.read_reg(src, ty)?;
                self.write_reg(dst, ty, value)?;
            }
            EncodedInst::MovImm { dst, imm, ty } => self.write_reg(dst, ty, imm as u64)?,
            EncodedInst::Load { dst, mem, ty } => {
                let value = self.load(self.fp_addr(mem))?;
                self.write_reg(dst, ty, value)?;
            }
            EncodedInst::Store { src, mem, ty } => {
                let value = self.read_reg(src, ty)?;
                self.store(self.fp_addr(mem), value)?;
            }
            EncodedInst::StoreImm { imm, mem, .. } => self.store(self.fp_addr(mem), imm as u64)?,
            EncodedInst::Call(CallTarget::Method(callee)) => {
                if !self.code.contains_key(&callee) {
                    return Err(SimError::UnknownMethod(callee));
                }
                self.push(next)?;
                self.pc = Self::code_base(callee);
            }
            EncodedInst::Call(CallTarget::Runtime {
                entrypoint,
                num_params,
                bridge_saves_callers,
            }) => self.call_runtime(next, entrypoint, num_params as usize, bridge_saves_callers)?,
            EncodedInst::Return => {
                let ret = self.pop()?;
                if ret == HOST_RETURN {
                    return Ok(false);
                }
                self.pc = ret;
            }
            EncodedInst::PushFrame {
                method_word,
                flags,
                frame_slots,
            } => {
                self.push(self.fp)?;
                self.fp = self.sp;
                self.store(self.fp - METHOD_WORD_OFFSET, method_word)?;
                self.store(self.fp - FLAGS_OFFSET, flags)?;
                let sp = self.fp.checked_sub(frame_slots as u64).ok_or(SimError::StackOverflow)?;
                self.set_sp(sp)?;
            }
            EncodedInst::PopFrame => {
                self.sp = self.fp;
                self.fp = self.pop()?;
            }
            EncodedInst::Jump(label) => {
                let method = MethodId::new(((code_base >> 20) - 1) as usize);
                let target = self
                    .code
                    .get(&method)
                    .and_then(|installed| installed.code.labels.get(label.0 as usize))
                    .ok_or(SimError::BadPc(code_base))?;
                self.pc = code_base + (*target * INST_SIZE) as u64;
            }
            EncodedInst::SafepointPoll => {
                let saves = (self.info.caller_int, self.info.caller_fp);
                let bp = self.enter_bridge(next, saves)?;
                let parked = Parked {
                    stack: &mut self.stack,
                    registry: &self.registry,
                    arch: self.info.arch,
                    thread: ThreadState {
                        current_frame: bp,
                        is_compiled: true,
                    },
                };
                self.runtime.safepoint(parked)?;
                self.leave_bridge(bp, saves)?;
            }
        }
        Ok(true)
    }

    /// Caller registers a bridge saves: those not passing arguments,
    /// except the return register.
    fn bridge_saves(&self, num_params: usize) -> (RegMask, VRegMask) {
        let info = self.info;
        let params = fill_only_parameters(info.caller_int, num_params, info);
        (
            info.caller_int & !params & !RegMask::empty().with(info.return_reg),
            info.caller_fp,
        )
    }

    fn call_runtime(
        &mut self,
        return_pc: u64,
        entrypoint: u32,
        num_params: usize,
        bridge_saves_callers: bool,
    ) -> Result<(), SimError> {
        let saves = if bridge_saves_callers {
            self.bridge_saves(num_params)
        } else {
            (RegMask::empty(), VRegMask::empty())
        };
        let args: SmallVec<[u64; 8]> = self.info.param_regs[..num_params]
            .iter()
            .map(|&r| self.int_regs[r])
            .collect();
        let bp = self.enter_bridge(return_pc, saves)?;
        trace!("sim: runtime {} with {:?}, parked at {:#x}", entrypoint, args, bp);
        let parked = Parked {
            stack: &mut self.stack,
            registry: &self.registry,
            arch: self.info.arch,
            thread: ThreadState {
                current_frame: bp,
                is_compiled: true,
            },
        };
        let result = self.runtime.call(entrypoint, &args, parked)?;
        self.leave_bridge(bp, saves)?;
        self.set_reg(PReg::int(self.info.return_reg), result);
        Ok(())
    }

    fn callee_regs(&self) -> impl Iterator<Item = PReg> {
        let info = self.info;
        info.callee_int
            .iter()
            .map(PReg::int)
            .chain(info.callee_fp.iter().map(PReg::float))
    }

    fn caller_regs(saves: (RegMask, VRegMask)) -> impl Iterator<Item = PReg> {
        saves
            .0
            .iter()
            .map(PReg::int)
            .chain(saves.1.iter().map(PReg::float))
    }

    /// Saves `saves` into the current frame, pushes a bypass frame and
    /// returns its base.
    fn enter_bridge(&mut self, return_pc: u64, saves: (RegMask, VRegMask)) -> Result<SlotAddr, SimError> {
        let info = self.info;
        let layout = CFrameLayout::new(info, 0, 0);
        for reg in Self::caller_regs(saves) {
            self.store(layout.caller_slot(self.fp, reg), self.reg(reg))?;
        }
        self.push(return_pc)?;
        self.push(self.fp)?;
        let bp = self.sp;
        self.store(bp - boundary::TAG_OFFSET, BoundaryKind::Bypass as u64)?;
        for reg in self.callee_regs() {
            self.store(boundary::callee_slot(info, bp, reg), self.reg(reg))?;
        }
        self.set_sp(bp - boundary::frame_slots(info) as u64)?;
        Ok(bp)
    }

    /// Reloads what [`Self::enter_bridge`] saved, as the runtime left it.
    fn leave_bridge(&mut self, bp: SlotAddr, saves: (RegMask, VRegMask)) -> Result<(), SimError> {
        let info = self.info;
        for reg in self.callee_regs() {
            let value = self.load(boundary::callee_slot(info, bp, reg))?;
            self.set_reg(reg, value);
        }
        let layout = CFrameLayout::new(info, 0, 0);
        for reg in Self::caller_regs(saves) {
            let value = self.load(layout.caller_slot(self.fp, reg))?;
            self.set_reg(reg, value);
        }
        self.sp = bp + 2;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::builder::MethodBuilder;
    use crate::stack_walker::{FrameKind, GcRootKind};
    use alloc::vec;

    fn r(i: usize) -> Location {
        Location::Reg(PReg::int(i))
    }

    /// Records what every runtime call sees and moves objects below
    /// `0x10000` up by that much.
    #[derive(Default)]
    struct MovingRuntime {
        calls: Vec<(u32, Vec<u64>)>,
        roots: Vec<Vec<u64>>,
        frames: Vec<Vec<(FrameKind, MethodId)>>,
        vregs: Vec<Vec<(u32, u64)>>,
    }

    impl MovingRuntime {
        fn collect(&mut self, parked: &mut Parked<'_>) {
            let mut w = parked.walker();
            assert!(w.verify());
            let mut roots = Vec::new();
            w.visit_gc_roots(|root| {
                assert_eq!(root.kind, GcRootKind::CompiledFrame);
                roots.push(root.object)
            });
            let mut again = Vec::new();
            w.visit_gc_roots(|root| again.push(root.object));
            assert_eq!(roots, again);
            self.roots.push(roots);

            w.reset();
            let mut frames = Vec::new();
            let mut vregs = Vec::new();
            while let Some(frame) = w.frame() {
                frames.push((frame.kind, frame.method));
                if frames.len() == 1 {
                    w.iterate_vregs(|v| vregs.push((v.index, v.value)));
                }
                w.next_frame();
            }
            self.frames.push(frames);
            self.vregs.push(vregs);

            w.update_objects(|o| if o < 0x10000 { o + 0x10000 } else { o });
        }
    }

    impl Runtime for MovingRuntime {
        fn call(&mut self, entrypoint: u32, args: &[u64], mut parked: Parked<'_>) -> Result<u64, SimError> {
            self.calls.push((entrypoint, args.to_vec()));
            self.collect(&mut parked);
            match entrypoint {
                1 => Ok(args[0] + 1),
                2 => Ok(args[0] * args[1]),
                _ => Ok(0),
            }
        }

        fn safepoint(&mut self, mut parked: Parked<'_>) -> Result<(), SimError> {
            self.collect(&mut parked);
            Ok(())
        }
    }

    fn machine(arch: Arch) -> Machine<MovingRuntime> {
        Machine::new(arch, 0x1000, MovingRuntime::default())
    }

    fn install(m: &mut Machine<MovingRuntime>, b: MethodBuilder) {
        let (method, intervals) = b.finish();
        m.compile(&method, &intervals, &CompilerOptions::default()).unwrap();
    }

    #[test]
    fn runtime_calls_round_trip() {
        let mut m = machine(Arch::Amd64);
        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
        let p = b.param(ValueType::Int64);
        let x = b.constant(0x1000, ValueType::Reference, r(12));
        let y = b.constant(5, ValueType::Int64, r(5));
        let res = b.call_runtime(1, &[p], &[Some(x), Some(y)], false, Some((ValueType::Int64, r(1))));
        b.call_runtime(2, &[y, res], &[Some(x)], true, Some((ValueType::Int64, r(2))));
        b.safepoint(&[Some(x)]);
        b.ret(Some(x));
        install(&mut m, b);

        m.set_reg(PReg::int(13), 0xdead);
        let result = m.run(MethodId::new(0), &[41], ValueType::Reference).unwrap();
        assert_eq!(result, 0x11000);
        // Callee registers survive the call.
        assert_eq!(m.reg(PReg::int(13)), 0xdead);

        let rt = m.runtime();
        assert_eq!(rt.calls, [(1, vec![41]), (2, vec![5, 42])]);
        assert_eq!(rt.roots, [vec![0x1000], vec![0x11000], vec![0x11000]]);
        assert_eq!(rt.vregs[0], [(0, 0x1000), (1, 5)]);
        assert_eq!(rt.frames[0], [(FrameKind::Compiled, MethodId::new(0))]);
    }

    #[test]
    fn callee_saves_are_chained_across_frames() {
        let mut m = machine(Arch::Aarch64);

        let mut b = MethodBuilder::new(MethodId::new(1), Arch::Aarch64);
        let p = b.param(ValueType::Reference);
        b.shuffle(&[(p, r(19))]);
        b.call_runtime(7, &[], &[Some(p)], false, None);
        b.ret(Some(p));
        install(&mut m, b);

        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
        let a = b.constant(0x1000, ValueType::Reference, r(19));
        let arg = b.constant(0x3000, ValueType::Reference, r(20));
        let c = b.constant(0x5000, ValueType::Reference, Location::Stack(0));
        let res = b.call(
            MethodId::new(1),
            &[arg],
            &[Some(a), Some(c)],
            Some((ValueType::Reference, r(21))),
        );
        b.safepoint(&[Some(a), Some(c), Some(res)]);
        b.ret(Some(res));
        install(&mut m, b);

        let result = m.run(MethodId::new(0), &[], ValueType::Reference).unwrap();
        assert_eq!(result, 0x13000);

        let rt = m.runtime();
        assert_eq!(
            rt.frames[0],
            [
                (FrameKind::Compiled, MethodId::new(1)),
                (FrameKind::Compiled, MethodId::new(0))
            ]
        );
        assert_eq!(rt.roots[0], [0x3000, 0x1000, 0x5000]);
        assert_eq!(rt.roots[1], [0x11000, 0x15000, 0x13000]);
    }

    #[test]
    fn wide_values_on_aarch32() {
        let mut m = machine(Arch::Aarch32);
        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch32);
        let w = b.constant(0x7_0000_0001, ValueType::Int64, r(4));
        let o = b.constant(0x400, ValueType::Reference, Location::Stack(1));
        b.call_runtime(3, &[], &[Some(w), Some(o)], false, None);
        b.safepoint(&[Some(w), Some(o)]);
        b.ret(Some(w));
        install(&mut m, b);

        let result = m.run(MethodId::new(0), &[], ValueType::Int64).unwrap();
        assert_eq!(result, 0x7_0000_0001);
        let rt = m.runtime();
        assert_eq!(rt.vregs[0], [(0, 0x7_0000_0001), (1, 0x400)]);
        assert_eq!(rt.roots, [vec![0x400], vec![0x10400]]);
    }

    #[test]
    fn stack_arguments_reach_the_callee() {
        let mut m = machine(Arch::Amd64);
        let mut b = MethodBuilder::new(MethodId::new(1), Arch::Amd64);
        let params: Vec<_> = (0..8).map(|_| b.param(ValueType::Int64)).collect();
        let res = b.call_runtime(2, &[params[6], params[7]], &[], false, Some((ValueType::Int64, r(0))));
        b.ret(Some(res));
        install(&mut m, b);

        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Amd64);
        let args: Vec<_> = (0..8)
            .map(|i| b.constant(i + 3, ValueType::Int64, Location::Stack(i as u32)))
            .collect();
        let res = b.call(MethodId::new(1), &args, &[], Some((ValueType::Int64, r(1))));
        b.ret(Some(res));
        install(&mut m, b);

        assert_eq!(m.run(MethodId::new(0), &[], ValueType::Int64), Ok(9 * 10));
        // Called from the host with stack arguments.
        let args: Vec<u64> = (0..8).collect();
        assert_eq!(m.run(MethodId::new(1), &args, ValueType::Int64), Ok(6 * 7));
    }

    #[test]
    fn aarch32_word_and_pair_swaps() {
        let mut m = machine(Arch::Aarch32);
        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch32);
        let a = b.constant(1, ValueType::Int32, r(4));
        let c = b.constant(2, ValueType::Int32, r(5));
        let w1 = b.constant(0x1_0000_0003, ValueType::Int64, r(6));
        let w2 = b.constant(0x2_0000_0004, ValueType::Int64, r(8));
        b.shuffle(&[(a, r(5)), (c, r(4)), (w1, r(8)), (w2, r(6))]);
        b.safepoint(&[Some(a), Some(c), Some(w1), Some(w2)]);
        b.ret(None);
        install(&mut m, b);

        m.run(MethodId::new(0), &[], ValueType::Int32).unwrap();
        assert_eq!(
            m.runtime().vregs[0],
            [(0, 1), (1, 2), (2, 0x1_0000_0003), (3, 0x2_0000_0004)]
        );
    }

    #[test]
    fn errors() {
        let mut m = machine(Arch::Aarch64);
        assert_eq!(
            m.run(MethodId::new(3), &[], ValueType::Int64),
            Err(SimError::UnknownMethod(MethodId::new(3)))
        );

        let mut b = MethodBuilder::new(MethodId::new(0), Arch::Aarch64);
        b.param(ValueType::Int64);
        b.label(0);
        b.jump(0);
        b.ret(None);
        install(&mut m, b);
        assert_eq!(
            m.run(MethodId::new(0), &[], ValueType::Int64),
            Err(SimError::ArgumentCount {
                expected: 1,
                actual: 0
            })
        );
        let mut m = m.with_fuel(100);
        assert_eq!(
            m.run(MethodId::new(0), &[1], ValueType::Int64),
            Err(SimError::OutOfFuel)
        );
    }
}
