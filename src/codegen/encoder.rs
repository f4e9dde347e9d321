/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The encoder interface the code generator emits through, and a
//! recording implementation of it.

use crate::target::{arch_info, ArchInfo};
use crate::{Arch, CodegenError, MethodId, PReg, RegClass, RegMask, VRegMask, ValueType};
use alloc::vec::Vec;
use core::fmt;

/// Size of every recorded instruction, in bytes.
pub const INST_SIZE: u32 = 4;

/// A stack word addressed relative to the frame pointer, in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct MemRef {
    pub fp_offset: i32,
}

impl MemRef {
    #[inline]
    pub fn fp(fp_offset: i32) -> Self {
        MemRef { fp_offset }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fp_offset < 0 {
            write!(f, "[fp - {}]", -(self.fp_offset as i64))
        } else {
            write!(f, "[fp + {}]", self.fp_offset)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum CallTarget {
    Method(MethodId),
    /// A runtime entrypoint, entered through a bridge frame. When
    /// `bridge_saves_callers` is set the bridge stores the caller-saved
    /// registers that do not carry arguments into the caller's frame.
    Runtime {
        entrypoint: u32,
        num_params: u32,
        bridge_saves_callers: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Label(pub u32);

/// One recorded instruction. A 64-bit value in a register on a 32-bit
/// target means the register pair starting there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum EncodedInst {
    Mov { dst: PReg, src: PReg, ty: ValueType },
    MovImm { dst: PReg, imm: i64, ty: ValueType },
    Load { dst: PReg, mem: MemRef, ty: ValueType },
    Store { src: PReg, mem: MemRef, ty: ValueType },
    StoreImm { imm: i64, mem: MemRef, ty: ValueType },
    Call(CallTarget),
    Return,
    /// Pushes fp, points fp at it, writes the method word and flags
    /// below it and reserves `frame_slots` words.
    PushFrame { method_word: u64, flags: u64, frame_slots: u32 },
    /// Releases the frame and restores the caller's fp.
    PopFrame,
    Jump(Label),
    SafepointPoll,
}

impl fmt::Display for EncodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EncodedInst::Mov { dst, src, ty } => write!(f, "mov.{} {}, {}", ty, dst, src),
            EncodedInst::MovImm { dst, imm, ty } => write!(f, "mov.{} {}, #{}", ty, dst, imm),
            EncodedInst::Load { dst, mem, ty } => write!(f, "ld.{} {}, {}", ty, dst, mem),
            EncodedInst::Store { src, mem, ty } => write!(f, "st.{} {}, {}", ty, src, mem),
            EncodedInst::StoreImm { imm, mem, ty } => write!(f, "st.{} #{}, {}", ty, imm, mem),
            EncodedInst::Call(target) => write!(f, "call {:?}", target),
            EncodedInst::Return => f.write_str("ret"),
            EncodedInst::PushFrame {
                method_word,
                flags,
                frame_slots,
            } => write!(f, "push_frame {:#x}, {:#x}, {}", method_word, flags, frame_slots),
            EncodedInst::PopFrame => f.write_str("pop_frame"),
            EncodedInst::Jump(label) => write!(f, "b L{}", label.0),
            EncodedInst::SafepointPoll => f.write_str("safepoint"),
        }
    }
}

/// What the code generator needs from an instruction encoder.
///
/// Encoders report running out of resources through
/// [`Encoder::get_result`] instead of failing individual calls.
pub trait Encoder {
    fn arch(&self) -> Arch;

    /// Offset of the next instruction, in bytes.
    fn current_offset(&self) -> u32;

    fn encode_mov(&mut self, dst: PReg, src: PReg, ty: ValueType);
    fn encode_mov_imm(&mut self, dst: PReg, imm: i64, ty: ValueType);
    fn encode_load(&mut self, dst: PReg, mem: MemRef, ty: ValueType);
    fn encode_store(&mut self, src: PReg, mem: MemRef, ty: ValueType);
    fn encode_store_imm(&mut self, imm: i64, mem: MemRef, ty: ValueType);
    fn encode_call(&mut self, target: CallTarget);
    fn encode_return(&mut self);
    fn encode_push_frame(&mut self, method_word: u64, flags: u64, frame_slots: u32);
    fn encode_pop_frame(&mut self);
    fn encode_safepoint_poll(&mut self);

    fn create_label(&mut self) -> Label;
    fn bind_label(&mut self, label: Label);
    fn encode_jump(&mut self, label: Label);

    /// Hands out one of the encoder's temporaries, if any is free.
    fn acquire_scratch(&mut self, class: RegClass) -> Option<PReg>;
    fn release_scratch(&mut self, reg: PReg);
    /// Temporaries currently handed out.
    fn live_tmp_reg_mask(&self) -> (RegMask, VRegMask);

    /// False once the encoder failed.
    fn get_result(&self) -> bool;
}

/// Code produced by a [`RecordingEncoder`].
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct RecordedCode {
    pub insts: Vec<EncodedInst>,
    /// Instruction index each label is bound to.
    pub labels: Vec<u32>,
}

impl RecordedCode {
    pub fn size(&self) -> u32 {
        self.insts.len() as u32 * INST_SIZE
    }

    /// Instruction at byte offset `offset`.
    pub fn inst_at(&self, offset: u32) -> Option<&EncodedInst> {
        if offset % INST_SIZE != 0 {
            return None;
        }
        self.insts.get((offset / INST_SIZE) as usize)
    }
}

/// Records instructions instead of encoding them.
pub struct RecordingEncoder {
    info: &'static ArchInfo,
    insts: Vec<EncodedInst>,
    labels: Vec<Option<u32>>,
    acquired: (RegMask, VRegMask),
    max_insts: Option<usize>,
    failed: bool,
}

impl RecordingEncoder {
    pub fn new(arch: Arch) -> Self {
        RecordingEncoder {
            info: arch_info(arch),
            insts: Vec::new(),
            labels: Vec::new(),
            acquired: (RegMask::empty(), VRegMask::empty()),
            max_insts: None,
            failed: false,
        }
    }

    /// An encoder whose code buffer holds at most `max_insts`
    /// instructions.
    pub fn with_limit(arch: Arch, max_insts: usize) -> Self {
        RecordingEncoder {
            max_insts: Some(max_insts),
            ..Self::new(arch)
        }
    }

    fn push(&mut self, inst: EncodedInst) {
        if self.max_insts.map_or(false, |max| self.insts.len() >= max) {
            if !self.failed {
                log::debug!("recording encoder: out of space at {}", inst);
            }
            self.failed = true;
            return;
        }
        self.insts.push(inst);
    }

    pub fn insts(&self) -> &[EncodedInst] {
        &self.insts
    }

    pub fn finish(self) -> Result<RecordedCode, CodegenError> {
        if self.failed {
            return Err(CodegenError::EncoderFailed);
        }
        let labels = self
            .labels
            .into_iter()
            .collect::<Option<Vec<u32>>>()
            .ok_or(CodegenError::EncoderFailed)?;
        Ok(RecordedCode {
            insts: self.insts,
            labels,
        })
    }
}

impl Encoder for RecordingEncoder {
    fn arch(&self) -> Arch {
        self.info.arch
    }

    fn current_offset(&self) -> u32 {
        self.insts.len() as u32 * INST_SIZE
    }

    fn encode_mov(&mut self, dst: PReg, src: PReg, ty: ValueType) {
        if dst != src {
            self.push(EncodedInst::Mov { dst, src, ty });
        }
    }

    fn encode_mov_imm(&mut self, dst: PReg, imm: i64, ty: ValueType) {
        self.push(EncodedInst::MovImm { dst, imm, ty });
    }

    fn encode_load(&mut self, dst: PReg, mem: MemRef, ty: ValueType) {
        self.push(EncodedInst::Load { dst, mem, ty });
    }

    fn encode_store(&mut self, src: PReg, mem: MemRef, ty: ValueType) {
        self.push(EncodedInst::Store { src, mem, ty });
    }

    fn encode_store_imm(&mut self, imm: i64, mem: MemRef, ty: ValueType) {
        self.push(EncodedInst::StoreImm { imm, mem, ty });
    }

    fn encode_call(&mut self, target: CallTarget) {
        self.push(EncodedInst::Call(target));
    }

    fn encode_return(&mut self) {
        self.push(EncodedInst::Return);
    }

    fn encode_push_frame(&mut self, method_word: u64, flags: u64, frame_slots: u32) {
        self.push(EncodedInst::PushFrame {
            method_word,
            flags,
            frame_slots,
        });
    }

    fn encode_pop_frame(&mut self) {
        self.push(EncodedInst::PopFrame);
    }

    fn encode_safepoint_poll(&mut self) {
        self.push(EncodedInst::SafepointPoll);
    }

    fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind_label(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label L{} bound twice", label.0);
        *slot = Some(self.insts.len() as u32);
    }

    fn encode_jump(&mut self, label: Label) {
        self.push(EncodedInst::Jump(label));
    }

    fn acquire_scratch(&mut self, class: RegClass) -> Option<PReg> {
        match class {
            RegClass::Int => {
                let reg = self
                    .info
                    .temp_regs
                    .iter()
                    .copied()
                    .find(|&r| !self.acquired.0.contains(r))?;
                self.acquired.0.insert(reg);
                Some(PReg::int(reg))
            }
            RegClass::Float => {
                let reg = self.info.temp_fp_reg;
                if self.acquired.1.contains(reg) {
                    return None;
                }
                self.acquired.1.insert(reg);
                Some(PReg::float(reg))
            }
        }
    }

    fn release_scratch(&mut self, reg: PReg) {
        match reg.class() {
            RegClass::Int => self.acquired.0.remove(reg.hw_enc()),
            RegClass::Float => self.acquired.1.remove(reg.hw_enc()),
        }
    }

    fn live_tmp_reg_mask(&self) -> (RegMask, VRegMask) {
        self.acquired
    }

    fn get_result(&self) -> bool {
        !self.failed
    }
}
