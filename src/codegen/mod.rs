/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Code generation over allocated intervals.
//!
//! The generator walks a [`Method`]'s instructions once, dispatching on
//! the [`Opcode`], and emits through an [`Encoder`]. Besides the code it
//! produces the method's code info: frame shape, the callee registers
//! the prologue saved and a stack map for every call and safepoint.

use crate::code_info::{CodeInfoBuilder, CodeInfoHeader, VRegInfo};
use crate::frame::{
    method_word, CFrameLayout, SlotAddr, FRAME_FLAG_HAS_FLOAT, FRAME_FLAG_NATIVE,
};
use crate::live_registers::{fill_only_parameters, LiveRegisters, MAX_RUNTIME_PARAMS};
use crate::moves::{is_paired_reg, MoveAndScratchResolver, SpillFillData, SpillFillResolver};
use crate::target::{arch_info, registers_description, ArchInfo, RegistersDescription};
use crate::{
    Arch, CodegenError, CompilerOptions, FxHashMap, InstId, LifeIntervals, LifeNumber, Location,
    LocationKind, MethodId, PReg, RegClass, RegMask, VRegMask, ValueType,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryFrom;
use smallvec::SmallVec;

pub mod builder;
pub mod encoder;

pub use self::builder::MethodBuilder;
pub use self::encoder::{
    CallTarget, EncodedInst, Encoder, Label, MemRef, RecordedCode, RecordingEncoder, INST_SIZE,
};

/// Spill slots reserved past the allocator's for scratch values and
/// saved victim registers.
pub const SCRATCH_SLOTS: u32 = 5;

/// Frame pointer value used to turn slot addresses into fp offsets.
const FP_ORIGIN: SlotAddr = 1 << 32;

/// Interpreter-visible state at a call or safepoint: for each virtual
/// register, the value it holds, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct SaveState {
    pub bytecode_pc: u32,
    pub vregs: Vec<Option<InstId>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Opcode {
    /// Defines the value of incoming parameter `n`.
    Parameter(u32),
    Constant(i64),
    /// Moves with parallel semantics.
    SpillFill(Vec<SpillFillData>),
    Call {
        callee: MethodId,
        args: Vec<InstId>,
        save_state: SaveState,
    },
    /// Call into the runtime through a bridge frame. With
    /// `saves_only_params` the code saves just the live argument
    /// registers and the bridge saves the remaining caller registers.
    CallRuntime {
        entrypoint: u32,
        args: Vec<InstId>,
        save_state: SaveState,
        saves_only_params: bool,
    },
    SafePoint(SaveState),
    Label(u32),
    Jump(u32),
    Return(Option<InstId>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Inst {
    /// Also the id of the value the instruction defines, if any.
    pub id: InstId,
    pub opcode: Opcode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Method {
    pub id: MethodId,
    pub params: Vec<ValueType>,
    pub insts: Vec<Inst>,
    /// Native methods save every callee register and carry no
    /// interpreter state.
    pub is_native: bool,
}

/// Where the arguments of a compiled-to-compiled call are passed: word
/// sized integers and references in the argument registers while they
/// last, everything else in stack parameter slots, in order.
pub fn parameter_locations(info: &ArchInfo, params: &[ValueType]) -> SmallVec<[Location; 8]> {
    let mut regs = info.param_regs.iter();
    let mut next_slot = 0;
    params
        .iter()
        .map(|&ty| {
            let in_reg = !ty.is_float() && !(info.arch == Arch::Aarch32 && ty.is_64bit(info.arch));
            let reg = if in_reg { regs.next() } else { None };
            match reg {
                Some(&reg) => Location::Reg(PReg::int(reg)),
                None => {
                    next_slot += 1;
                    Location::StackParameter(next_slot - 1)
                }
            }
        })
        .collect()
}

/// Result of compiling one method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledMethod {
    pub id: MethodId,
    pub code_size: u32,
    pub frame_slots: u32,
    /// Callee registers the prologue saves, recorded in the code info.
    pub saved_callees: (RegMask, VRegMask),
    pub num_stack_maps: usize,
    /// Encoded [`CodeInfo`](crate::code_info::CodeInfo).
    pub code_info: Vec<u8>,
}

pub struct CodeGenerator<'a> {
    method: &'a Method,
    intervals: &'a LifeIntervals,
    options: &'a CompilerOptions,
    info: &'static ArchInfo,
    regs: Box<dyn RegistersDescription>,
    live: LiveRegisters<'a>,
    resolver: SpillFillResolver,
    layout: CFrameLayout,
    saved: (RegMask, VRegMask),
    /// Registers stored only to keep callee saves paired.
    padding: SmallVec<[PReg; 2]>,
    first_scratch_slot: u32,
    labels: FxHashMap<u32, Label>,
    code_info: CodeInfoBuilder,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(
        method: &'a Method,
        intervals: &'a LifeIntervals,
        arch: Arch,
        options: &'a CompilerOptions,
    ) -> Result<Self, CodegenError> {
        let info = arch_info(arch);
        let mut regs = registers_description(arch, options);
        regs.set_used_regs(&intervals.used_registers());

        let mut padding = SmallVec::new();
        let saved = if method.is_native {
            (info.callee_int, info.callee_fp)
        } else if options.compact_prologue {
            padding.extend(
                [RegClass::Int, RegClass::Float]
                    .iter()
                    .filter_map(|&class| regs.alignment_reg(class)),
            );
            (regs.callee_regs(RegClass::Int), regs.callee_regs(RegClass::Float))
        } else {
            (
                regs.default_callee_regs(RegClass::Int),
                regs.default_callee_regs(RegClass::Float),
            )
        };

        let mut outgoing = 0;
        for inst in &method.insts {
            if let Opcode::Call { args, .. } = &inst.opcode {
                let types = args
                    .iter()
                    .map(|&arg| value_type(intervals, arg))
                    .collect::<Result<SmallVec<[ValueType; 8]>, _>>()?;
                let on_stack = parameter_locations(info, &types)
                    .iter()
                    .filter(|loc| matches!(loc, Location::StackParameter(_)))
                    .count() as u32;
                outgoing = outgoing.max(on_stack);
            }
        }

        let first_scratch_slot = intervals.max_stack_slot().map_or(0, |slot| slot + 1);
        let layout = CFrameLayout::new(info, first_scratch_slot + SCRATCH_SLOTS, outgoing);

        Ok(CodeGenerator {
            method,
            intervals,
            options,
            info,
            regs,
            live: LiveRegisters::new(intervals, info, options),
            resolver: SpillFillResolver::new(arch),
            layout,
            saved,
            padding,
            first_scratch_slot,
            labels: FxHashMap::default(),
            code_info: CodeInfoBuilder::new(),
        })
    }

    pub fn layout(&self) -> &CFrameLayout {
        &self.layout
    }

    /// Callee registers the prologue saves.
    pub fn saved_callees(&self) -> (RegMask, VRegMask) {
        self.saved
    }

    pub fn generate<E: Encoder>(mut self, enc: &mut E) -> Result<CompiledMethod, CodegenError> {
        debug_assert_eq!(enc.arch(), self.info.arch);
        if self.options.verbose_log {
            log::debug!(
                "codegen {:?} on {}: frame {} slots ({} spill), saving {} / {}, padding {:?}",
                self.method.id,
                self.info.arch,
                self.layout.frame_slots(),
                self.layout.spill_slots(),
                self.saved.0,
                self.saved.1,
                self.padding
            );
        }

        self.emit_prologue(enc);
        self.emit_parameter_moves(enc)?;
        check(enc)?;

        let method = self.method;
        for inst in &method.insts {
            let offset = enc.current_offset();
            self.visit(enc, inst)?;
            check(enc)?;
            if self.options.dump_disassembly {
                log::info!(
                    "{:?} {:>5}..{:<5} {:?}: {:?}",
                    method.id,
                    offset,
                    enc.current_offset(),
                    inst.id,
                    inst.opcode
                );
            }
        }

        let header = CodeInfoHeader {
            code_size: enc.current_offset(),
            frame_slots: self.layout.frame_slots(),
            callee_int_mask: self.saved.0,
            callee_fp_mask: self.saved.1,
            spill_slots: self.layout.spill_slots(),
        };
        if self.options.verbose_log {
            log::debug!(
                "codegen {:?}: {} bytes, {} stack maps",
                method.id,
                header.code_size,
                self.code_info.num_stack_maps()
            );
        }
        Ok(CompiledMethod {
            id: method.id,
            code_size: header.code_size,
            frame_slots: header.frame_slots,
            saved_callees: self.saved,
            num_stack_maps: self.code_info.num_stack_maps(),
            code_info: self.code_info.encode(&header),
        })
    }

    fn visit<E: Encoder>(&mut self, enc: &mut E, inst: &Inst) -> Result<(), CodegenError> {
        match &inst.opcode {
            // Moved into place right after the prologue.
            Opcode::Parameter(_) => Ok(()),
            Opcode::Constant(imm) => {
                let ln = self.life_number(inst.id)?;
                let (dst, ty) = self.value_at(inst.id, ln)?;
                if dst.is_none() {
                    return Ok(());
                }
                self.emit_move(enc, inst.id, &SpillFillData::new(Location::Imm(*imm), dst, ty))
            }
            Opcode::SpillFill(group) => self.emit_moves(enc, inst.id, group),
            Opcode::Call {
                callee,
                args,
                save_state,
            } => self.emit_call(enc, inst.id, CallTarget::Method(*callee), args, save_state),
            Opcode::CallRuntime {
                entrypoint,
                args,
                save_state,
                saves_only_params,
            } => {
                if args.len() > MAX_RUNTIME_PARAMS || args.len() > self.info.param_regs.len() {
                    return Err(CodegenError::TooManyParameters(args.len()));
                }
                let target = CallTarget::Runtime {
                    entrypoint: *entrypoint,
                    num_params: args.len() as u32,
                    bridge_saves_callers: *saves_only_params,
                };
                self.emit_call(enc, inst.id, target, args, save_state)
            }
            Opcode::SafePoint(save_state) => {
                let ln = self.life_number(inst.id)?;
                enc.encode_safepoint_poll();
                check(enc)?;
                self.record_stack_map(enc.current_offset(), ln, save_state)
            }
            Opcode::Label(id) => {
                let label = self.label(enc, *id);
                enc.bind_label(label);
                Ok(())
            }
            Opcode::Jump(id) => {
                let label = self.label(enc, *id);
                enc.encode_jump(label);
                Ok(())
            }
            Opcode::Return(value) => self.emit_return(enc, inst.id, *value),
        }
    }

    fn label<E: Encoder>(&mut self, enc: &mut E, id: u32) -> Label {
        *self.labels.entry(id).or_insert_with(|| enc.create_label())
    }

    fn life_number(&self, inst: InstId) -> Result<LifeNumber, CodegenError> {
        self.intervals
            .life_number(inst)
            .ok_or(CodegenError::MissingInterval(inst))
    }

    /// Location and type of `value` at `ln`.
    fn value_at(&self, value: InstId, ln: LifeNumber) -> Result<(Location, ValueType), CodegenError> {
        let ty = value_type(self.intervals, value)?;
        let loc = self
            .intervals
            .location_at(value, ln)
            .unwrap_or(Location::None);
        Ok((loc, ty))
    }

    fn word_type(&self, class: RegClass) -> ValueType {
        match (class, self.info.arch.is_64bit()) {
            (RegClass::Int, true) => ValueType::Int64,
            (RegClass::Int, false) => ValueType::Int32,
            (RegClass::Float, true) => ValueType::Float64,
            (RegClass::Float, false) => ValueType::Float32,
        }
    }

    fn slot_ref(&self, addr: SlotAddr) -> MemRef {
        MemRef::fp(CFrameLayout::fp_offset(FP_ORIGIN, addr))
    }

    fn mem_ref(&self, loc: Location) -> Option<MemRef> {
        match loc {
            Location::Stack(slot) => Some(self.slot_ref(self.layout.spill_slot(FP_ORIGIN, slot))),
            Location::StackParameter(index) => {
                Some(self.slot_ref(CFrameLayout::stack_param_slot(FP_ORIGIN, index)))
            }
            _ => None,
        }
    }

    /// Callee saves of the prologue, padding included.
    fn callee_saves(&self) -> SmallVec<[(PReg, MemRef); 32]> {
        let mut saves = SmallVec::new();
        for reg in self.saved.0.iter().map(PReg::int) {
            let slot = self.layout.callee_slot(FP_ORIGIN, self.saved, reg);
            saves.push((reg, self.slot_ref(slot)));
        }
        for reg in self.saved.1.iter().map(PReg::float) {
            let slot = self.layout.callee_slot(FP_ORIGIN, self.saved, reg);
            saves.push((reg, self.slot_ref(slot)));
        }
        for &reg in &self.padding {
            let slot = self
                .layout
                .callee_padding_slot(FP_ORIGIN, self.saved, reg.class());
            saves.push((reg, self.slot_ref(slot)));
        }
        saves
    }

    fn emit_prologue<E: Encoder>(&mut self, enc: &mut E) {
        let mut flags = 0;
        if self.method.is_native {
            flags |= FRAME_FLAG_NATIVE;
        }
        if !self.regs.used_regs(RegClass::Float).is_empty() {
            flags |= FRAME_FLAG_HAS_FLOAT;
        }
        enc.encode_push_frame(method_word(self.method.id), flags, self.layout.frame_slots());
        for (reg, slot) in self.callee_saves() {
            enc.encode_store(reg, slot, self.word_type(reg.class()));
        }
    }

    fn emit_epilogue<E: Encoder>(&mut self, enc: &mut E) {
        for (reg, slot) in self.callee_saves() {
            enc.encode_load(reg, slot, self.word_type(reg.class()));
        }
        enc.encode_pop_frame();
        enc.encode_return();
    }

    fn emit_parameter_moves<E: Encoder>(&mut self, enc: &mut E) -> Result<(), CodegenError> {
        let method = self.method;
        let incoming = parameter_locations(self.info, &method.params);
        let mut group: SmallVec<[SpillFillData; 8]> = SmallVec::new();
        let mut first = None;
        for inst in &method.insts {
            let index = match inst.opcode {
                Opcode::Parameter(index) => index as usize,
                _ => continue,
            };
            let src = *incoming
                .get(index)
                .ok_or(CodegenError::InvalidMove(inst.id))?;
            let ln = self.life_number(inst.id)?;
            let (dst, ty) = self.value_at(inst.id, ln)?;
            if !dst.is_none() && dst != src {
                group.push(SpillFillData::new(src, dst, ty));
            }
            first.get_or_insert(inst.id);
        }
        match first {
            Some(id) => self.emit_moves(enc, id, &group),
            None => Ok(()),
        }
    }

    /// Emits one move. Memory to memory is not encodable.
    fn emit_move<E: Encoder>(
        &self,
        enc: &mut E,
        inst: InstId,
        m: &SpillFillData,
    ) -> Result<(), CodegenError> {
        match (m.src, m.dst) {
            (Location::Reg(src), Location::Reg(dst)) => enc.encode_mov(dst, src, m.ty),
            (Location::Imm(imm), Location::Reg(dst)) => enc.encode_mov_imm(dst, imm, m.ty),
            (Location::Reg(src), dst) if dst.is_memory() => {
                enc.encode_store(src, self.mem_ref(dst).ok_or(CodegenError::InvalidMove(inst))?, m.ty)
            }
            (Location::Imm(imm), dst) if dst.is_memory() => {
                enc.encode_store_imm(imm, self.mem_ref(dst).ok_or(CodegenError::InvalidMove(inst))?, m.ty)
            }
            (src, Location::Reg(dst)) if src.is_memory() => {
                enc.encode_load(dst, self.mem_ref(src).ok_or(CodegenError::InvalidMove(inst))?, m.ty)
            }
            _ => return Err(CodegenError::InvalidMove(inst)),
        }
        Ok(())
    }

    /// Resolves a parallel group and emits it.
    fn emit_moves<E: Encoder>(
        &mut self,
        enc: &mut E,
        inst: InstId,
        group: &[SpillFillData],
    ) -> Result<(), CodegenError> {
        for m in group {
            if m.src.is_none() || m.dst.is_none() || m.dst.is_imm() {
                return Err(CodegenError::InvalidMove(inst));
            }
        }
        let resolved = self.resolver.resolve(group)?;
        if resolved.is_empty() {
            return Ok(());
        }

        let arch = self.info.arch;
        let before = enc.live_tmp_reg_mask();
        let mut next_slot = self.first_scratch_slot;
        let moves = {
            let tmps = &mut *enc;
            MoveAndScratchResolver::new(
                arch,
                |ty: ValueType| {
                    // There is no temporary register pair.
                    if !ty.is_float() && arch == Arch::Aarch32 && ty.is_64bit(arch) {
                        return None;
                    }
                    tmps.acquire_scratch(ty.reg_class()).map(Location::Reg)
                },
                || {
                    next_slot += 1;
                    Location::Stack(next_slot - 1)
                },
                PReg::int(self.info.return_reg),
            )
            .compute(resolved.into_sequence())
        };
        debug_assert!(next_slot <= self.first_scratch_slot + SCRATCH_SLOTS);
        trace!("spill-fill at {:?}: {:?} -> {:?}", inst, group, moves);

        let result = moves.iter().try_for_each(|m| self.emit_move(enc, inst, m));
        let after = enc.live_tmp_reg_mask();
        for reg in (after.0 & !before.0).iter() {
            enc.release_scratch(PReg::int(reg));
        }
        for reg in (after.1 & !before.1).iter() {
            enc.release_scratch(PReg::float(reg));
        }
        result
    }

    /// Copies a value between two stack words, through a temporary or,
    /// when none fits, through the return register saved around it.
    fn emit_mem_to_mem<E: Encoder>(&self, enc: &mut E, src: MemRef, dst: MemRef, ty: ValueType) {
        let arch = self.info.arch;
        let wide_int = !ty.is_float() && arch == Arch::Aarch32 && ty.is_64bit(arch);
        let tmp = if wide_int {
            None
        } else {
            enc.acquire_scratch(ty.reg_class())
        };
        match tmp {
            Some(tmp) => {
                enc.encode_load(tmp, src, ty);
                enc.encode_store(tmp, dst, ty);
                enc.release_scratch(tmp);
            }
            None => {
                let victim = PReg::int(self.info.return_reg);
                let save = self.slot_ref(self.layout.spill_slot(FP_ORIGIN, self.first_scratch_slot));
                enc.encode_store(victim, save, ty);
                enc.encode_load(victim, src, ty);
                enc.encode_store(victim, dst, ty);
                enc.encode_load(victim, save, ty);
            }
        }
    }

    fn emit_call<E: Encoder>(
        &mut self,
        enc: &mut E,
        id: InstId,
        target: CallTarget,
        args: &[InstId],
        save_state: &SaveState,
    ) -> Result<(), CodegenError> {
        let ln = self.life_number(id)?;
        let info = self.info;

        let (live, live_fp) = self
            .live
            .get_live_registers::<true>(Some(id), enc.live_tmp_reg_mask());
        let mut save = live & info.caller_int;
        let mut save_fp = live_fp & info.caller_fp;
        if let CallTarget::Runtime {
            num_params,
            bridge_saves_callers: true,
            ..
        } = target
        {
            // The bridge leaves the return register alone.
            let ret_live = save.contains(info.return_reg);
            save = fill_only_parameters(save, num_params as usize, info);
            if ret_live {
                save.insert(info.return_reg);
            }
            save_fp = VRegMask::empty();
        }
        for reg in save.iter().map(PReg::int).chain(save_fp.iter().map(PReg::float)) {
            let slot = self.slot_ref(self.layout.caller_slot(FP_ORIGIN, reg));
            enc.encode_store(reg, slot, self.word_type(reg.class()));
        }

        let mut sources: SmallVec<[(Location, ValueType); 8]> = SmallVec::new();
        for &arg in args {
            let (src, ty) = self.value_at(arg, ln)?;
            if src.is_none() {
                return Err(CodegenError::InvalidMove(arg));
            }
            sources.push((src, ty));
        }
        let dsts = match target {
            CallTarget::Method(_) => {
                let types: SmallVec<[ValueType; 8]> = sources.iter().map(|s| s.1).collect();
                parameter_locations(info, &types)
            }
            CallTarget::Runtime { .. } => {
                for (&arg, &(_, ty)) in args.iter().zip(&sources) {
                    if ty.is_float() || (info.arch == Arch::Aarch32 && ty.is_64bit(info.arch)) {
                        return Err(CodegenError::InvalidMove(arg));
                    }
                }
                info.param_regs[..args.len()]
                    .iter()
                    .map(|&r| Location::Reg(PReg::int(r)))
                    .collect()
            }
        };

        let mut group: SmallVec<[SpillFillData; 8]> = SmallVec::new();
        for (&(src, ty), &dst) in sources.iter().zip(&dsts) {
            match dst {
                Location::StackParameter(index) => {
                    let out = self.slot_ref(self.layout.outgoing_param_slot(FP_ORIGIN, index));
                    match src {
                        Location::Reg(reg) => enc.encode_store(reg, out, ty),
                        Location::Imm(imm) => enc.encode_store_imm(imm, out, ty),
                        _ => {
                            let from = self.mem_ref(src).ok_or(CodegenError::InvalidMove(id))?;
                            self.emit_mem_to_mem(enc, from, out, ty);
                        }
                    }
                }
                _ => group.push(SpillFillData::new(src, dst, ty)),
            }
        }
        self.emit_moves(enc, id, &group)?;

        enc.encode_call(target);
        check(enc)?;
        self.record_stack_map(enc.current_offset(), ln, save_state)?;

        // Registers now holding the result are not restored.
        let mut result_regs = (RegMask::empty(), VRegMask::empty());
        if self.intervals.head_of(id).is_some() {
            let (dst, ty) = self.value_at(id, ln)?;
            if let Location::Reg(reg) = dst {
                let mask = match reg.class() {
                    RegClass::Int => &mut result_regs.0,
                    RegClass::Float => &mut result_regs.1,
                };
                mask.insert(reg.hw_enc());
                if is_paired_reg(info.arch, dst, ty) {
                    mask.insert(reg.hw_enc() + 1);
                }
            }
            if !dst.is_none() {
                let ret = Location::Reg(info.return_reg(ty));
                if ret != dst {
                    self.emit_move(enc, id, &SpillFillData::new(ret, dst, ty))?;
                }
            }
        }

        let restore = (save & !result_regs.0).iter().map(PReg::int);
        let restore_fp = (save_fp & !result_regs.1).iter().map(PReg::float);
        for reg in restore.chain(restore_fp) {
            let slot = self.slot_ref(self.layout.caller_slot(FP_ORIGIN, reg));
            enc.encode_load(reg, slot, self.word_type(reg.class()));
        }
        Ok(())
    }

    fn emit_return<E: Encoder>(
        &mut self,
        enc: &mut E,
        id: InstId,
        value: Option<InstId>,
    ) -> Result<(), CodegenError> {
        if let Some(value) = value {
            let ln = self.life_number(id)?;
            let (src, ty) = self.value_at(value, ln)?;
            if src.is_none() {
                return Err(CodegenError::InvalidMove(value));
            }
            let ret = Location::Reg(self.info.return_reg(ty));
            if src != ret {
                self.emit_moves(enc, id, &[SpillFillData::new(src, ret, ty)])?;
            }
        }
        self.emit_epilogue(enc);
        Ok(())
    }

    fn record_stack_map(
        &mut self,
        native_pc: u32,
        ln: LifeNumber,
        save_state: &SaveState,
    ) -> Result<(), CodegenError> {
        self.code_info
            .begin_stack_map(native_pc, save_state.bytecode_pc);
        for vreg in &save_state.vregs {
            let info = match *vreg {
                Some(value) => self.vreg_info(value, ln)?,
                None => VRegInfo::dead(),
            };
            self.code_info.add_vreg(info);
        }
        if self.options.verbose_log {
            log::debug!(
                "stack map at {} (bytecode {}): {} vregs",
                native_pc,
                save_state.bytecode_pc,
                save_state.vregs.len()
            );
        }
        Ok(())
    }

    fn vreg_info(&self, value: InstId, ln: LifeNumber) -> Result<VRegInfo, CodegenError> {
        let (loc, ty) = self.value_at(value, ln)?;
        let (kind, value) = match loc {
            Location::None => return Ok(VRegInfo::dead()),
            Location::Reg(reg) if reg.is_float() => (LocationKind::FpRegister, reg.hw_enc() as u32),
            Location::Reg(reg) => (LocationKind::Register, reg.hw_enc() as u32),
            Location::Stack(slot) => (LocationKind::StackSlot, slot),
            Location::StackParameter(index) => (LocationKind::StackParameter, index),
            Location::Imm(imm) => {
                let imm = i32::try_from(imm).map_err(|_| CodegenError::InvalidMove(value))?;
                (LocationKind::Constant, imm as u32)
            }
        };
        Ok(VRegInfo {
            kind,
            ty,
            live: true,
            object: ty.is_reference(),
            value,
        })
    }
}

fn value_type(intervals: &LifeIntervals, value: InstId) -> Result<ValueType, CodegenError> {
    let head = intervals
        .head_of(value)
        .ok_or(CodegenError::MissingInterval(value))?;
    Ok(intervals[head].ty())
}

fn check<E: Encoder>(enc: &E) -> Result<(), CodegenError> {
    if enc.get_result() {
        Ok(())
    } else {
        Err(CodegenError::EncoderFailed)
    }
}

#[cfg(test)]
mod tests;
