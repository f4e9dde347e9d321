/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Walking a parked thread's stack.
//!
//! The walker starts at the youngest frame and moves to older ones with
//! [`StackWalker::next_frame`]. Compiled frames are described by the
//! stack map at their return address and by the callee registers their
//! prologue saved; interpreted frames carry tagged values inline.
//! Boundary frames between the two are crossed transparently.
//!
//! A value a compiled frame keeps in a callee-saved register lives
//! wherever the first younger frame that saved that register put it, or
//! in the runtime bridge's save area when none did. The walker tracks
//! this in a callee buffer that is rebuilt at every compiled frame from
//! the younger frame's buffer.

use crate::code_info::{StackMap, VRegInfo};
use crate::frame::{
    boundary, iframe, method_word, BoundaryKind, CFrameLayout, FrameMarker, SlotAddr,
    FLAGS_OFFSET, FRAME_FLAG_NATIVE, FRAME_FLAG_SHOULD_DEOPT, METHOD_WORD_OFFSET,
    RETURN_ADDR_OFFSET,
};
use crate::moves::is_paired_reg;
use crate::target::{arch_info, ArchInfo};
use crate::{Arch, FxHashSet, Location, LocationKind, MethodId, PReg, RegClass, RegMask, ValueType};
use alloc::vec::Vec;
use core::fmt;
use smallvec::SmallVec;

pub mod memory;

pub use self::memory::{CodeRegistry, CompiledCode, SimulatedStack, StackMemory, ThreadState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Compiled native code. No interpreter state.
    CompiledNative,
    /// Compiled managed code, described by a stack map.
    Compiled,
    Interpreted,
}

#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    pub kind: FrameKind,
    /// Frame pointer of a compiled frame, address of an interpreted one.
    pub addr: SlotAddr,
    pub method: MethodId,
    /// Offset of the frame's return address into its code.
    pub native_pc: u32,
    pub bytecode_pc: u32,
    code: Option<&'a CompiledCode>,
    stack_map: Option<StackMap>,
}

impl<'a> Frame<'a> {
    pub fn is_compiled(&self) -> bool {
        self.kind != FrameKind::Interpreted
    }

    pub fn code(&self) -> Option<&'a CompiledCode> {
        self.code
    }

    pub fn stack_map(&self) -> Option<&StackMap> {
        self.stack_map.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcRootKind {
    CompiledFrame,
    InterpretedFrame,
}

/// A reference found on the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRoot {
    pub kind: GcRootKind,
    /// The object holding the reference. Stack roots have none.
    pub from_object: Option<u64>,
    pub object: u64,
}

/// A live virtual register of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VRegValue {
    pub index: u32,
    pub value: u64,
    pub ty: ValueType,
    pub object: bool,
}

/// Interpreter state rebuilt from a compiled frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeoptFrame {
    pub method: MethodId,
    pub bytecode_pc: u32,
    /// Value and object flag of every virtual register; dead ones are 0.
    pub vregs: Vec<(u64, bool)>,
}

impl DeoptFrame {
    /// Lays the frame out as an interpreted frame at `addr`, linked to
    /// `prev`.
    pub fn write_to<M: StackMemory + ?Sized>(&self, memory: &mut M, addr: SlotAddr, prev: SlotAddr) {
        let n = self.vregs.len() as u64;
        memory.write(addr - METHOD_WORD_OFFSET, method_word(self.method));
        memory.write(addr + iframe::PREV_OFFSET, prev);
        memory.write(addr + iframe::BYTECODE_PC_OFFSET, self.bytecode_pc as u64);
        memory.write(addr + iframe::NUM_VREGS_OFFSET, n);
        for (i, &(value, object)) in self.vregs.iter().enumerate() {
            let tag = if object {
                iframe::TAG_OBJECT
            } else {
                iframe::TAG_PRIMITIVE
            };
            memory.write(iframe::vreg_slot(addr, i as u64), value);
            memory.write(iframe::tag_slot(addr, n, i as u64), tag);
        }
    }
}

/// Where a value is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Home {
    Word(SlotAddr),
    /// A register pair saved one register per word.
    Pair(SlotAddr, SlotAddr),
    Constant(u64),
}

/// Save slot of every callee register of the target, int registers
/// first, each class in ascending order. 0 when unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct CalleeBuffer {
    slots: SmallVec<[SlotAddr; 32]>,
}

fn callee_index(info: &ArchInfo, reg: PReg) -> Option<usize> {
    let mask = info.callee(reg.class());
    if !mask.contains(reg.hw_enc()) {
        return None;
    }
    let below = RegMask::new(mask.bits() & ((1u32 << reg.hw_enc()) - 1)).count();
    Some(match reg.class() {
        RegClass::Int => below,
        RegClass::Float => info.callee_int.count() + below,
    })
}

fn callee_regs(info: &ArchInfo) -> impl Iterator<Item = PReg> + '_ {
    info.callee_int
        .iter()
        .map(PReg::int)
        .chain(info.callee_fp.iter().map(PReg::float))
}

impl CalleeBuffer {
    fn unknown(info: &ArchInfo) -> Self {
        let len = info.callee_int.count() + info.callee_fp.count();
        CalleeBuffer {
            slots: core::iter::repeat(0).take(len).collect(),
        }
    }

    /// Every callee register saved by a bridge frame at `bp`.
    fn boundary(info: &ArchInfo, bp: SlotAddr) -> Self {
        let mut buffer = Self::unknown(info);
        for reg in callee_regs(info) {
            if let Some(i) = callee_index(info, reg) {
                buffer.slots[i] = boundary::callee_slot(info, bp, reg);
            }
        }
        buffer
    }

    /// Buffer of the caller of a frame that saved `saved` below
    /// `callee_slots`, given the frame's own buffer `prev`.
    fn init_callee_buffer(
        info: &ArchInfo,
        callee_slots: SlotAddr,
        saved: (RegMask, RegMask),
        prev: &CalleeBuffer,
    ) -> Self {
        let mut buffer = prev.clone();
        for reg in callee_regs(info) {
            let saved_here = match reg.class() {
                RegClass::Int => saved.0.contains(reg.hw_enc()),
                RegClass::Float => saved.1.contains(reg.hw_enc()),
            };
            if saved_here {
                if let Some(i) = callee_index(info, reg) {
                    buffer.slots[i] = CFrameLayout::callee_slot_at(info, callee_slots, saved, reg);
                }
            }
        }
        buffer
    }

    fn get(&self, info: &ArchInfo, reg: PReg) -> SlotAddr {
        callee_index(info, reg).map_or(0, |i| self.slots[i])
    }
}

pub struct StackWalker<'a, M: StackMemory> {
    memory: M,
    registry: &'a CodeRegistry,
    info: &'static ArchInfo,
    thread: ThreadState,
    frame: Option<Frame<'a>>,
    /// Where the current frame's callee registers are.
    callee: CalleeBuffer,
}

impl<'a, M: StackMemory> StackWalker<'a, M> {
    /// A walker positioned at the youngest frame of `thread`.
    pub fn new(memory: M, registry: &'a CodeRegistry, arch: Arch, thread: ThreadState) -> Self {
        let info = arch_info(arch);
        let mut walker = StackWalker {
            memory,
            registry,
            info,
            thread,
            frame: None,
            callee: CalleeBuffer::unknown(info),
        };
        walker.reset();
        walker
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn into_memory(self) -> M {
        self.memory
    }

    /// Goes back to the youngest frame.
    pub fn reset(&mut self) {
        let top = self.thread.current_frame;
        if self.thread.is_compiled {
            let marker = FrameMarker::decode(self.memory.read(top - boundary::TAG_OFFSET));
            assert_eq!(
                marker,
                FrameMarker::Boundary(BoundaryKind::Bypass),
                "compiled thread parked outside of a runtime call"
            );
            self.callee = CalleeBuffer::boundary(self.info, top);
            let fp = self.memory.read(top);
            let pc = self.memory.read(top + RETURN_ADDR_OFFSET);
            self.frame = Some(self.compiled_frame(fp, pc));
        } else {
            self.callee = CalleeBuffer::unknown(self.info);
            self.frame = Some(self.interpreted_frame(top));
        }
    }

    pub fn frame(&self) -> Option<&Frame<'a>> {
        self.frame.as_ref()
    }

    pub fn has_frame(&self) -> bool {
        self.frame.is_some()
    }

    fn method_at(&self, addr: SlotAddr) -> MethodId {
        match FrameMarker::decode(self.memory.read(addr - METHOD_WORD_OFFSET)) {
            FrameMarker::Method(id) => id,
            other => panic!("frame at {:#x} has marker {:?}", addr, other),
        }
    }

    fn compiled_frame(&self, fp: SlotAddr, return_pc: u64) -> Frame<'a> {
        let method = self.method_at(fp);
        let code = match self.registry.get(method) {
            Some(code) => code,
            None => panic!("no code installed for {:?}", method),
        };
        assert!(
            code.contains(return_pc),
            "return address {:#x} outside of {:?}",
            return_pc,
            method
        );
        let native_pc = (return_pc - code.code_base) as u32;
        let flags = self.memory.read(fp - FLAGS_OFFSET);
        if flags & FRAME_FLAG_NATIVE != 0 {
            return Frame {
                kind: FrameKind::CompiledNative,
                addr: fp,
                method,
                native_pc,
                bytecode_pc: 0,
                code: Some(code),
                stack_map: None,
            };
        }
        let stack_map = match code.info.find_stack_map(native_pc) {
            Some(map) => *map,
            None => panic!("no stack map for {:?} at native pc {:#x}", method, native_pc),
        };
        Frame {
            kind: FrameKind::Compiled,
            addr: fp,
            method,
            native_pc,
            bytecode_pc: stack_map.bytecode_pc,
            code: Some(code),
            stack_map: Some(stack_map),
        }
    }

    fn interpreted_frame(&self, addr: SlotAddr) -> Frame<'a> {
        Frame {
            kind: FrameKind::Interpreted,
            addr,
            method: self.method_at(addr),
            native_pc: 0,
            bytecode_pc: self.memory.read(addr + iframe::BYTECODE_PC_OFFSET) as u32,
            code: None,
            stack_map: None,
        }
    }

    /// Moves to the caller of the current frame.
    pub fn next_frame(&mut self) {
        let frame = match self.frame {
            Some(frame) => frame,
            None => return,
        };
        self.frame = if frame.is_compiled() {
            self.next_from_compiled(&frame)
        } else {
            self.next_from_interpreted(&frame)
        };
        if let Some(next) = &self.frame {
            trace!(
                "walk: {:?} {:?} at {:#x} -> {:?} {:?} at {:#x}",
                frame.kind,
                frame.method,
                frame.addr,
                next.kind,
                next.method,
                next.addr
            );
        }
    }

    fn next_from_compiled(&mut self, frame: &Frame<'a>) -> Option<Frame<'a>> {
        let fp = frame.addr;
        let prev = self.memory.read(fp);
        if prev == 0 {
            return None;
        }
        match FrameMarker::decode(self.memory.read(prev - METHOD_WORD_OFFSET)) {
            FrameMarker::Method(_) => {
                let saved = self.saved_callees(frame);
                self.callee = CalleeBuffer::init_callee_buffer(
                    self.info,
                    CFrameLayout::callee_slots_base(fp),
                    saved,
                    &self.callee,
                );
                Some(self.compiled_frame(prev, self.memory.read(fp + RETURN_ADDR_OFFSET)))
            }
            FrameMarker::Boundary(BoundaryKind::InterpreterToCompiled) => {
                let caller = self.memory.read(prev);
                if caller == 0 {
                    None
                } else {
                    Some(self.interpreted_frame(caller))
                }
            }
            other => panic!("compiled frame at {:#x} called from {:?}", fp, other),
        }
    }

    fn next_from_interpreted(&mut self, frame: &Frame<'a>) -> Option<Frame<'a>> {
        let prev = self.memory.read(frame.addr + iframe::PREV_OFFSET);
        if prev == 0 {
            return None;
        }
        match FrameMarker::decode(self.memory.read(prev - METHOD_WORD_OFFSET)) {
            FrameMarker::Method(_) => Some(self.interpreted_frame(prev)),
            FrameMarker::Boundary(BoundaryKind::CompiledToInterpreter) => {
                self.callee = CalleeBuffer::boundary(self.info, prev);
                let fp = self.memory.read(prev);
                Some(self.compiled_frame(fp, self.memory.read(prev + RETURN_ADDR_OFFSET)))
            }
            other => panic!(
                "interpreted frame at {:#x} called from {:?}",
                frame.addr, other
            ),
        }
    }

    fn saved_callees(&self, frame: &Frame<'a>) -> (RegMask, RegMask) {
        frame
            .code
            .map_or((RegMask::empty(), RegMask::empty()), |code| code.info.saved_callees())
    }

    fn layout(&self, frame: &Frame<'a>) -> CFrameLayout {
        let spill_slots = frame.code.map_or(0, |code| code.info.header().spill_slots);
        CFrameLayout::new(self.info, spill_slots, 0)
    }

    fn reg_home(&self, frame: &Frame<'a>, reg: PReg) -> SlotAddr {
        if self.info.callee(reg.class()).contains(reg.hw_enc()) {
            let slot = self.callee.get(self.info, reg);
            assert!(slot != 0, "no save slot for {} in {:?}", reg, frame.method);
            slot
        } else {
            self.layout(frame).caller_slot(frame.addr, reg)
        }
    }

    fn home(&self, frame: &Frame<'a>, vreg: &VRegInfo) -> Option<Home> {
        if !vreg.live {
            return None;
        }
        let fp = frame.addr;
        Some(match vreg.kind {
            LocationKind::None => return None,
            LocationKind::Register | LocationKind::FpRegister => {
                let class = if vreg.kind == LocationKind::FpRegister {
                    RegClass::Float
                } else {
                    RegClass::Int
                };
                let reg = PReg::new(vreg.value as usize, class);
                if is_paired_reg(self.info.arch, Location::Reg(reg), vreg.ty) {
                    let hi = PReg::new(reg.hw_enc() + 1, class);
                    Home::Pair(self.reg_home(frame, reg), self.reg_home(frame, hi))
                } else {
                    Home::Word(self.reg_home(frame, reg))
                }
            }
            LocationKind::StackSlot => Home::Word(self.layout(frame).spill_slot(fp, vreg.value)),
            LocationKind::StackParameter => Home::Word(CFrameLayout::stack_param_slot(fp, vreg.value)),
            LocationKind::Constant => Home::Constant(vreg.value as i32 as i64 as u64),
        })
    }

    fn read_home(&self, home: Home) -> u64 {
        match home {
            Home::Word(addr) => self.memory.read(addr),
            Home::Pair(lo, hi) => {
                (self.memory.read(lo) & 0xffff_ffff) | (self.memory.read(hi) << 32)
            }
            Home::Constant(value) => value,
        }
    }

    fn write_home(&mut self, home: Home, value: u64) {
        match home {
            Home::Word(addr) => self.memory.write(addr, value),
            Home::Pair(lo, hi) => {
                self.memory.write(lo, value & 0xffff_ffff);
                self.memory.write(hi, value >> 32);
            }
            Home::Constant(_) => {}
        }
    }

    fn stack_map_vregs(&self, frame: &Frame<'a>) -> &'a [VRegInfo] {
        match (frame.code, &frame.stack_map) {
            (Some(code), Some(map)) => code.info.vregs(map),
            _ => &[],
        }
    }

    fn for_each_vreg<F: FnMut(VRegValue, Option<Home>, SlotAddr)>(&self, frame: &Frame<'a>, mut f: F) {
        match frame.kind {
            FrameKind::CompiledNative => {}
            FrameKind::Compiled => {
                for (i, vreg) in self.stack_map_vregs(frame).iter().enumerate() {
                    if let Some(home) = self.home(frame, vreg) {
                        let value = VRegValue {
                            index: i as u32,
                            value: self.read_home(home),
                            ty: vreg.ty,
                            object: vreg.object,
                        };
                        f(value, Some(home), 0);
                    }
                }
            }
            FrameKind::Interpreted => {
                let addr = frame.addr;
                let n = self.memory.read(addr + iframe::NUM_VREGS_OFFSET);
                for i in 0..n {
                    let object = self.memory.read(iframe::tag_slot(addr, n, i)) == iframe::TAG_OBJECT;
                    let slot = iframe::vreg_slot(addr, i);
                    let value = VRegValue {
                        index: i as u32,
                        value: self.memory.read(slot),
                        ty: if object {
                            ValueType::Reference
                        } else {
                            ValueType::Any
                        },
                        object,
                    };
                    f(value, None, slot);
                }
            }
        }
    }

    /// Live virtual registers of the current frame.
    pub fn iterate_vregs<F: FnMut(VRegValue)>(&self, mut f: F) {
        if let Some(frame) = &self.frame {
            self.for_each_vreg(frame, |value, _, _| f(value));
        }
    }

    pub fn get_vreg_value(&self, index: u32) -> Option<u64> {
        let mut found = None;
        self.iterate_vregs(|v| {
            if v.index == index {
                found = Some(v.value);
            }
        });
        found
    }

    /// Live references of the current frame.
    pub fn iterate_objects<F: FnMut(u64)>(&self, mut f: F) {
        self.iterate_vregs(|v| {
            if v.object {
                f(v.value)
            }
        });
    }

    /// Reports every reference on the stack, youngest frame first.
    pub fn visit_gc_roots<F: FnMut(GcRoot)>(&mut self, mut visitor: F) {
        self.reset();
        while let Some(frame) = self.frame {
            let kind = if frame.is_compiled() {
                GcRootKind::CompiledFrame
            } else {
                GcRootKind::InterpretedFrame
            };
            self.iterate_objects(|object| {
                visitor(GcRoot {
                    kind,
                    from_object: None,
                    object,
                })
            });
            self.next_frame();
        }
    }

    /// Replaces every reference on the stack by `forward(reference)`.
    /// Each stack word is updated once, however many virtual registers
    /// share it.
    pub fn update_objects<F: FnMut(u64) -> u64>(&mut self, mut forward: F) {
        self.reset();
        let mut updated: FxHashSet<SlotAddr> = FxHashSet::default();
        while let Some(frame) = self.frame {
            let mut homes: SmallVec<[(Home, u64); 8]> = SmallVec::new();
            self.for_each_vreg(&frame, |value, home, slot| {
                if !value.object {
                    return;
                }
                let home = home.unwrap_or(Home::Word(slot));
                let first = match home {
                    Home::Word(addr) | Home::Pair(addr, _) => updated.insert(addr),
                    Home::Constant(_) => false,
                };
                if first {
                    homes.push((home, value.value));
                }
            });
            for (home, old) in homes {
                let new = forward(old);
                if new != old {
                    trace!("walk: {:?} {:#x} -> {:#x}", home, old, new);
                    self.write_home(home, new);
                }
            }
            self.next_frame();
        }
    }

    /// Values the callee registers must get back when the current
    /// compiled frame is replaced by an interpreted one.
    pub fn callee_regs_for_deoptimize(&self) -> SmallVec<[(PReg, u64); 32]> {
        let frame = match &self.frame {
            Some(frame) if frame.is_compiled() => frame,
            _ => return SmallVec::new(),
        };
        let buffer = CalleeBuffer::init_callee_buffer(
            self.info,
            CFrameLayout::callee_slots_base(frame.addr),
            self.saved_callees(frame),
            &self.callee,
        );
        callee_regs(self.info)
            .filter_map(|reg| match buffer.get(self.info, reg) {
                0 => None,
                addr => Some((reg, self.memory.read(addr))),
            })
            .collect()
    }

    /// Interpreter state of the current compiled frame.
    pub fn convert_to_iframe(&self) -> Option<DeoptFrame> {
        let frame = self.frame.as_ref().filter(|f| f.kind == FrameKind::Compiled)?;
        let vregs = self
            .stack_map_vregs(frame)
            .iter()
            .map(|vreg| match self.home(frame, vreg) {
                Some(home) => (self.read_home(home), vreg.object),
                None => (0, false),
            })
            .collect();
        Some(DeoptFrame {
            method: frame.method,
            bytecode_pc: frame.bytecode_pc,
            vregs,
        })
    }

    /// Flags the current compiled frame for deoptimization on return.
    pub fn mark_for_deoptimization(&mut self) {
        if let Some(frame) = self.frame.filter(|f| f.is_compiled()) {
            let flags = frame.addr - FLAGS_OFFSET;
            let value = self.memory.read(flags);
            self.memory.write(flags, value | FRAME_FLAG_SHOULD_DEOPT);
        }
    }

    pub fn should_deoptimize(&self) -> bool {
        match &self.frame {
            Some(frame) if frame.is_compiled() => {
                self.memory.read(frame.addr - FLAGS_OFFSET) & FRAME_FLAG_SHOULD_DEOPT != 0
            }
            _ => false,
        }
    }

    /// Checks the whole stack for consistency: frames strictly older as
    /// the walk goes on and every live value in its own frame or a
    /// callee's.
    pub fn verify(&mut self) -> bool {
        self.reset();
        let top = self.thread.current_frame;
        let lowest = if self.thread.is_compiled {
            top - boundary::frame_slots(self.info) as u64
        } else {
            top
        };
        let mut last = 0;
        while let Some(frame) = self.frame {
            if frame.addr <= last {
                log::error!("frame at {:#x} is not older than {:#x}", frame.addr, last);
                return false;
            }
            last = frame.addr;
            if frame.kind == FrameKind::Compiled {
                let spill_slots = self.layout(&frame).spill_slots();
                for vreg in self.stack_map_vregs(&frame).iter().filter(|v| v.live) {
                    if vreg.kind == LocationKind::StackSlot && vreg.value >= spill_slots {
                        log::error!(
                            "{:?} at {:#x}: spill slot {} of {}",
                            frame.method,
                            frame.native_pc,
                            vreg.value,
                            spill_slots
                        );
                        return false;
                    }
                    if let Some(Home::Word(addr)) | Some(Home::Pair(addr, _)) = self.home(&frame, vreg) {
                        if addr < lowest {
                            log::error!(
                                "{:?} at {:#x}: value at {:#x} is above the stack top",
                                frame.method,
                                frame.native_pc,
                                addr
                            );
                            return false;
                        }
                    }
                }
            }
            self.next_frame();
        }
        true
    }

    /// Writes every frame and its live values, youngest first.
    pub fn dump<W: fmt::Write>(&mut self, out: &mut W) -> fmt::Result {
        self.reset();
        while let Some(frame) = self.frame {
            writeln!(
                out,
                "{:?} {:?} at {:#x}: native pc {:#x}, bytecode pc {}",
                frame.kind, frame.method, frame.addr, frame.native_pc, frame.bytecode_pc
            )?;
            let mut result = Ok(());
            self.iterate_vregs(|v| {
                if result.is_ok() {
                    result = writeln!(
                        out,
                        "  v{}: {:#x} ({}{})",
                        v.index,
                        v.value,
                        v.ty,
                        if v.object { ", object" } else { "" }
                    );
                }
            });
            result?;
            self.next_frame();
        }
        Ok(())
    }
}
