/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Register liveness, spill-fill resolution and frame reconstruction for
//! a JIT backend.
//!
//! The crate consumes the output of a register allocator (a set of
//! [`intervals::LifeIntervals`] with assigned locations) and provides:
//!
//! - an [`interval_tree::IntervalTree`] answering "what is live in a
//!   register at life number `ln`";
//! - [`live_registers::LiveRegisters`], the code generator's view of that
//!   query;
//! - a [`moves::SpillFillResolver`] turning parallel moves into a safe
//!   sequential order;
//! - per-architecture [`target::RegistersDescription`]s computing the
//!   callee/caller-saved masks;
//! - a [`codegen::CodeGenerator`] that emits frames, runtime calls and
//!   stack maps through an abstract [`codegen::Encoder`];
//! - a [`stack_walker::StackWalker`] that replays the same frame layout
//!   to find GC roots and deoptimization state in a parked thread's stack.

#![allow(dead_code)]
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

use core::fmt;

#[macro_use]
mod index;
pub use index::{InstId, MethodId};

mod regmask;
pub use regmask::{RegMask, RegMaskIter, VRegMask};

pub mod checker;
pub mod code_info;
pub mod codegen;
pub mod frame;
pub mod interval_tree;
pub mod intervals;
pub mod live_registers;
pub mod moves;
pub mod sim;
pub mod stack_walker;
pub mod target;

#[cfg(feature = "enable-serde")]
pub mod serialize;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

/// Abstract program-point counter. Even numbers are instruction
/// boundaries, odd numbers are use points.
pub type LifeNumber = u32;

/// Register classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum RegClass {
    Int = 0,
    Float = 1,
}

/// A physical register. Contains a physical register number and a class.
///
/// The `hw_enc` field is in a separate index space per class: Int
/// register 0 is different than Float register 0. It must fit in 5
/// bits, which is also the width of [`RegMask`].
///
/// For targets that renumber their registers (amd64), `hw_enc` is the
/// renumbered id, never the raw ISA encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct PReg {
    hw_enc: u8,
    class: RegClass,
}

impl PReg {
    pub const MAX_BITS: usize = 5;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;
    pub const MAX_INDEX: usize = 1 << (Self::MAX_BITS + 1); // including RegClass bit

    #[inline(always)]
    pub const fn new(hw_enc: usize, class: RegClass) -> Self {
        assert!(hw_enc <= PReg::MAX);
        PReg {
            hw_enc: hw_enc as u8,
            class,
        }
    }

    #[inline(always)]
    pub const fn int(hw_enc: usize) -> Self {
        PReg::new(hw_enc, RegClass::Int)
    }

    #[inline(always)]
    pub const fn float(hw_enc: usize) -> Self {
        PReg::new(hw_enc, RegClass::Float)
    }

    #[inline(always)]
    pub fn hw_enc(self) -> usize {
        self.hw_enc as usize
    }

    #[inline(always)]
    pub fn class(self) -> RegClass {
        self.class
    }

    #[inline(always)]
    pub fn is_float(self) -> bool {
        self.class == RegClass::Float
    }

    /// Index into the space of all physical registers: 0..31 are the
    /// integer registers, 32..63 the float registers.
    #[inline(always)]
    pub fn index(self) -> usize {
        ((self.class as u8 as usize) << 5) | (self.hw_enc as usize)
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        let class = match (index >> 5) & 1 {
            0 => RegClass::Int,
            _ => RegClass::Float,
        };
        PReg::new(index & Self::MAX, class)
    }
}

impl fmt::Debug for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PReg(hw = {}, class = {:?}, index = {})",
            self.hw_enc(),
            self.class(),
            self.index()
        )
    }
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            RegClass::Int => write!(f, "r{}", self.hw_enc()),
            RegClass::Float => write!(f, "v{}", self.hw_enc()),
        }
    }
}

/// Type of a value held in a location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum ValueType {
    Int32 = 0,
    Int64 = 1,
    Float32 = 2,
    Float64 = 3,
    /// A managed object reference. The GC must see every live one.
    Reference = 4,
    /// Dynamically typed value; never treated as a reference.
    Any = 5,
}

impl ValueType {
    #[inline(always)]
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float32 | ValueType::Float64)
    }

    #[inline(always)]
    pub fn is_reference(self) -> bool {
        self == ValueType::Reference
    }

    /// Whether the value needs 64 bits. References are pointer sized, so
    /// this depends on the target.
    #[inline(always)]
    pub fn is_64bit(self, arch: Arch) -> bool {
        match self {
            ValueType::Int64 | ValueType::Float64 | ValueType::Any => true,
            ValueType::Reference => arch.is_64bit(),
            ValueType::Int32 | ValueType::Float32 => false,
        }
    }

    #[inline(always)]
    pub fn reg_class(self) -> RegClass {
        if self.is_float() {
            RegClass::Float
        } else {
            RegClass::Int
        }
    }

    pub fn from_u8(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => ValueType::Int32,
            1 => ValueType::Int64,
            2 => ValueType::Float32,
            3 => ValueType::Float64,
            4 => ValueType::Reference,
            5 => ValueType::Any,
            _ => return None,
        })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueType::Int32 => "i32",
            ValueType::Int64 => "i64",
            ValueType::Float32 => "f32",
            ValueType::Float64 => "f64",
            ValueType::Reference => "ref",
            ValueType::Any => "any",
        })
    }
}

/// Where a value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Location {
    /// Not assigned (yet), or dead.
    None,
    /// A general purpose or fp register.
    Reg(PReg),
    /// A spill slot in the method's own frame.
    Stack(u32),
    /// An incoming argument slot in the caller's frame.
    StackParameter(u32),
    /// A constant. Only valid as a move source.
    Imm(i64),
}

impl Location {
    #[inline(always)]
    pub fn reg(self) -> Option<PReg> {
        match self {
            Location::Reg(r) => Some(r),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_reg(self) -> bool {
        matches!(self, Location::Reg(_))
    }

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self == Location::None
    }

    #[inline(always)]
    pub fn is_imm(self) -> bool {
        matches!(self, Location::Imm(_))
    }

    /// Spill slots and stack parameters.
    #[inline(always)]
    pub fn is_memory(self) -> bool {
        matches!(self, Location::Stack(_) | Location::StackParameter(_))
    }

    pub fn kind(self) -> LocationKind {
        match self {
            Location::None => LocationKind::None,
            Location::Reg(r) if r.is_float() => LocationKind::FpRegister,
            Location::Reg(_) => LocationKind::Register,
            Location::Stack(_) => LocationKind::StackSlot,
            Location::StackParameter(_) => LocationKind::StackParameter,
            Location::Imm(_) => LocationKind::Constant,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::None => f.write_str("none"),
            Location::Reg(r) => write!(f, "{}", r),
            Location::Stack(slot) => write!(f, "s{}", slot),
            Location::StackParameter(slot) => write!(f, "p{}", slot),
            Location::Imm(imm) => write!(f, "#{}", imm),
        }
    }
}

/// Location kinds as recorded in stack maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum LocationKind {
    None = 0,
    Register = 1,
    FpRegister = 2,
    StackSlot = 3,
    StackParameter = 4,
    Constant = 5,
}

impl LocationKind {
    pub fn from_u8(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => LocationKind::None,
            1 => LocationKind::Register,
            2 => LocationKind::FpRegister,
            3 => LocationKind::StackSlot,
            4 => LocationKind::StackParameter,
            5 => LocationKind::Constant,
            _ => return None,
        })
    }
}

/// Supported targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Arch {
    Amd64,
    Aarch64,
    Aarch32,
}

impl Arch {
    #[inline(always)]
    pub fn is_64bit(self) -> bool {
        !matches!(self, Arch::Aarch32)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Amd64 => "amd64",
            Arch::Aarch64 => "aarch64",
            Arch::Aarch32 => "aarch32",
        })
    }
}

/// Options for code generation, threaded explicitly through the
/// compilation context.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct CompilerOptions {
    /// Only preserve registers that are live across a call. When off,
    /// every register is treated as live.
    pub save_only_live_registers: bool,
    /// Save only the callee registers the method uses.
    pub compact_prologue: bool,
    /// Whether the allocator may hand out the thread register. When it
    /// can't, the register is left out of callee-saved accounting.
    pub allocate_thread_reg: bool,
    /// Log every emitted operation.
    pub dump_disassembly: bool,
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            save_only_live_registers: true,
            compact_prologue: true,
            allocate_thread_reg: false,
            dump_disassembly: false,
            verbose_log: false,
        }
    }
}

/// A code generation failure. These are reported to the caller, which
/// is expected to fall back to the interpreter for the method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// The encoder ran out of resources and flagged its result as failed.
    EncoderFailed,
    /// A spill slot beyond what the move table can index.
    SpillSlotOutOfRange(u32),
    /// A stack parameter beyond what the move table can index.
    ParameterSlotOutOfRange(u32),
    /// Runtime calls pass at most this many arguments in registers.
    TooManyParameters(usize),
    /// A move with no source or destination.
    InvalidMove(InstId),
    /// An instruction whose value has no interval.
    MissingInterval(InstId),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CodegenError {}

pub use codegen::{CodeGenerator, CompiledMethod, Encoder};
pub use interval_tree::IntervalTree;
pub use intervals::{IntervalIndex, LifeInterval, LifeIntervals, LiveRange};
pub use live_registers::LiveRegisters;
pub use moves::{SpillFillData, SpillFillResolver};
pub use stack_walker::{GcRoot, GcRootKind, StackWalker};
pub use target::RegistersDescription;
