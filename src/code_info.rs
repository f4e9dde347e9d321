/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Metadata the code generator attaches to a compiled method: frame
//! shape, saved callee registers and stack maps.
//!
//! The blob is little-endian:
//!
//! ```text
//! header, 8 x u32:
//!   magic, code_size, frame_slots, callee_int_mask, callee_fp_mask,
//!   spill_slots, num_stack_maps, num_vregs
//! stack maps, 4 x u32 each, sorted by native pc:
//!   native_pc, bytecode_pc, first_vreg, vreg_count
//! vregs, 8 bytes each:
//!   u8 kind, u8 type, u8 flags (bit 0 live, bit 1 object), u8 0, u32 value
//! ```

use crate::{LocationKind, RegMask, ValueType};
use alloc::vec::Vec;
use core::fmt;

pub const CODE_INFO_MAGIC: u32 = 0x4943_524C;
pub const HEADER_SIZE: usize = 32;
pub const STACK_MAP_SIZE: usize = 16;
pub const VREG_SIZE: usize = 8;

const VREG_FLAG_LIVE: u8 = 1 << 0;
const VREG_FLAG_OBJECT: u8 = 1 << 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeInfoError {
    BadMagic(u32),
    Truncated { expected: usize, actual: usize },
    /// Stack maps out of order, or vreg ranges outside the vreg table.
    Inconsistent,
    UnknownLocationKind(u8),
    UnknownType(u8),
}

impl fmt::Display for CodeInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CodeInfoError {}

/// Where one virtual register lives at a stack map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct VRegInfo {
    pub kind: LocationKind,
    pub ty: ValueType,
    pub live: bool,
    pub object: bool,
    /// Register number, slot index, or the constant itself.
    pub value: u32,
}

impl VRegInfo {
    pub fn dead() -> Self {
        VRegInfo {
            kind: LocationKind::None,
            ty: ValueType::Any,
            live: false,
            object: false,
            value: 0,
        }
    }

    pub fn is_live_object(&self) -> bool {
        self.live && self.object
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct StackMap {
    /// Offset from the start of the method's code.
    pub native_pc: u32,
    pub bytecode_pc: u32,
    pub first_vreg: u32,
    pub vreg_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeInfoHeader {
    pub code_size: u32,
    pub frame_slots: u32,
    pub callee_int_mask: RegMask,
    pub callee_fp_mask: RegMask,
    pub spill_slots: u32,
}

/// Decoded code info.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeInfo {
    header: CodeInfoHeader,
    stack_maps: Vec<StackMap>,
    vregs: Vec<VRegInfo>,
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

impl CodeInfo {
    pub fn decode(data: &[u8]) -> Result<CodeInfo, CodeInfoError> {
        if data.len() < HEADER_SIZE {
            return Err(CodeInfoError::Truncated {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let magic = read_u32(data, 0);
        if magic != CODE_INFO_MAGIC {
            return Err(CodeInfoError::BadMagic(magic));
        }
        let header = CodeInfoHeader {
            code_size: read_u32(data, 4),
            frame_slots: read_u32(data, 8),
            callee_int_mask: RegMask::new(read_u32(data, 12)),
            callee_fp_mask: RegMask::new(read_u32(data, 16)),
            spill_slots: read_u32(data, 20),
        };
        let num_stack_maps = read_u32(data, 24) as usize;
        let num_vregs = read_u32(data, 28) as usize;
        let expected = num_stack_maps
            .checked_mul(STACK_MAP_SIZE)
            .and_then(|s| num_vregs.checked_mul(VREG_SIZE).and_then(|v| s.checked_add(v)))
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(CodeInfoError::Inconsistent)?;
        if data.len() != expected {
            return Err(CodeInfoError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let mut stack_maps = Vec::with_capacity(num_stack_maps);
        for i in 0..num_stack_maps {
            let at = HEADER_SIZE + i * STACK_MAP_SIZE;
            let map = StackMap {
                native_pc: read_u32(data, at),
                bytecode_pc: read_u32(data, at + 4),
                first_vreg: read_u32(data, at + 8),
                vreg_count: read_u32(data, at + 12),
            };
            let end = map.first_vreg as u64 + map.vreg_count as u64;
            if end > num_vregs as u64 {
                return Err(CodeInfoError::Inconsistent);
            }
            if stack_maps.last().map_or(false, |prev: &StackMap| prev.native_pc >= map.native_pc) {
                return Err(CodeInfoError::Inconsistent);
            }
            stack_maps.push(map);
        }

        let vregs_start = HEADER_SIZE + num_stack_maps * STACK_MAP_SIZE;
        let mut vregs = Vec::with_capacity(num_vregs);
        for i in 0..num_vregs {
            let at = vregs_start + i * VREG_SIZE;
            let kind = LocationKind::from_u8(data[at])
                .ok_or(CodeInfoError::UnknownLocationKind(data[at]))?;
            let ty = ValueType::from_u8(data[at + 1])
                .ok_or(CodeInfoError::UnknownType(data[at + 1]))?;
            let flags = data[at + 2];
            vregs.push(VRegInfo {
                kind,
                ty,
                live: flags & VREG_FLAG_LIVE != 0,
                object: flags & VREG_FLAG_OBJECT != 0,
                value: read_u32(data, at + 4),
            });
        }

        Ok(CodeInfo {
            header,
            stack_maps,
            vregs,
        })
    }

    pub fn header(&self) -> &CodeInfoHeader {
        &self.header
    }

    pub fn saved_callees(&self) -> (RegMask, RegMask) {
        (self.header.callee_int_mask, self.header.callee_fp_mask)
    }

    pub fn stack_maps(&self) -> &[StackMap] {
        &self.stack_maps
    }

    /// Stack map recorded at code offset `native_pc`.
    pub fn find_stack_map(&self, native_pc: u32) -> Option<&StackMap> {
        self.stack_maps
            .binary_search_by_key(&native_pc, |m| m.native_pc)
            .ok()
            .map(|i| &self.stack_maps[i])
    }

    pub fn vregs(&self, map: &StackMap) -> &[VRegInfo] {
        let start = map.first_vreg as usize;
        &self.vregs[start..start + map.vreg_count as usize]
    }
}

/// Accumulates stack maps while a method is being generated.
#[derive(Clone, Debug, Default)]
pub struct CodeInfoBuilder {
    stack_maps: Vec<StackMap>,
    vregs: Vec<VRegInfo>,
}

impl CodeInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a stack map. Maps must come in increasing pc order.
    pub fn begin_stack_map(&mut self, native_pc: u32, bytecode_pc: u32) {
        if let Some(prev) = self.stack_maps.last() {
            assert!(
                prev.native_pc < native_pc,
                "stack map at {} after one at {}",
                native_pc,
                prev.native_pc
            );
        }
        self.stack_maps.push(StackMap {
            native_pc,
            bytecode_pc,
            first_vreg: self.vregs.len() as u32,
            vreg_count: 0,
        });
    }

    /// Appends a vreg to the current stack map.
    pub fn add_vreg(&mut self, vreg: VRegInfo) {
        let map = self
            .stack_maps
            .last_mut()
            .expect("add_vreg outside of a stack map");
        map.vreg_count += 1;
        self.vregs.push(vreg);
    }

    pub fn num_stack_maps(&self) -> usize {
        self.stack_maps.len()
    }

    pub fn encode(&self, header: &CodeInfoHeader) -> Vec<u8> {
        let size = HEADER_SIZE + self.stack_maps.len() * STACK_MAP_SIZE + self.vregs.len() * VREG_SIZE;
        let mut out = Vec::with_capacity(size);
        for word in [
            CODE_INFO_MAGIC,
            header.code_size,
            header.frame_slots,
            header.callee_int_mask.bits(),
            header.callee_fp_mask.bits(),
            header.spill_slots,
            self.stack_maps.len() as u32,
            self.vregs.len() as u32,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for map in &self.stack_maps {
            for word in [map.native_pc, map.bytecode_pc, map.first_vreg, map.vreg_count] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        for vreg in &self.vregs {
            let mut flags = 0;
            if vreg.live {
                flags |= VREG_FLAG_LIVE;
            }
            if vreg.object {
                flags |= VREG_FLAG_OBJECT;
            }
            out.extend_from_slice(&[vreg.kind as u8, vreg.ty as u8, flags, 0]);
            out.extend_from_slice(&vreg.value.to_le_bytes());
        }
        debug_assert_eq!(out.len(), size);
        out
    }
}
