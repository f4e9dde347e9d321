/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! What the walker reads: the parked thread's stack and the metadata of
//! the code its frames belong to.

use crate::code_info::CodeInfo;
use crate::frame::SlotAddr;
use crate::{FxHashMap, MethodId};
use alloc::vec;
use alloc::vec::Vec;

/// Word-addressed access to a stack.
pub trait StackMemory {
    fn read(&self, addr: SlotAddr) -> u64;
    fn write(&mut self, addr: SlotAddr, value: u64);
}

impl<T: StackMemory + ?Sized> StackMemory for &mut T {
    #[inline]
    fn read(&self, addr: SlotAddr) -> u64 {
        (**self).read(addr)
    }

    #[inline]
    fn write(&mut self, addr: SlotAddr, value: u64) {
        (**self).write(addr, value)
    }
}

/// A stack of `len` words starting at address `base`. Out-of-range
/// accesses panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatedStack {
    base: SlotAddr,
    words: Vec<u64>,
}

impl SimulatedStack {
    pub fn new(base: SlotAddr, len: usize) -> Self {
        assert!(base > 0, "address 0 ends frame chains");
        SimulatedStack {
            base,
            words: vec![0; len],
        }
    }

    pub fn base(&self) -> SlotAddr {
        self.base
    }

    /// One past the highest address.
    pub fn top(&self) -> SlotAddr {
        self.base + self.words.len() as u64
    }

    pub fn contains(&self, addr: SlotAddr) -> bool {
        addr >= self.base && addr < self.top()
    }

    fn index(&self, addr: SlotAddr) -> usize {
        match addr.checked_sub(self.base) {
            Some(i) if (i as usize) < self.words.len() => i as usize,
            _ => panic!(
                "stack access at {:#x} outside [{:#x}, {:#x})",
                addr,
                self.base,
                self.top()
            ),
        }
    }
}

impl StackMemory for SimulatedStack {
    fn read(&self, addr: SlotAddr) -> u64 {
        self.words[self.index(addr)]
    }

    fn write(&mut self, addr: SlotAddr, value: u64) {
        let i = self.index(addr);
        self.words[i] = value;
    }
}

/// Installed code of one method.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledCode {
    pub method: MethodId,
    /// Address of the first instruction. Return addresses into the
    /// method are this plus an offset.
    pub code_base: u64,
    pub info: CodeInfo,
}

impl CompiledCode {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.code_base && pc - self.code_base < self.info.header().code_size as u64
    }
}

/// Published code of every compiled method, by method id.
#[derive(Clone, Debug, Default)]
pub struct CodeRegistry {
    methods: FxHashMap<MethodId, CompiledCode>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: MethodId, code_base: u64, info: CodeInfo) {
        let prev = self.methods.insert(
            method,
            CompiledCode {
                method,
                code_base,
                info,
            },
        );
        debug_assert!(prev.is_none(), "{:?} installed twice", method);
    }

    pub fn get(&self, method: MethodId) -> Option<&CompiledCode> {
        self.methods.get(&method)
    }

    /// The method whose code contains `pc`.
    pub fn find(&self, pc: u64) -> Option<&CompiledCode> {
        self.methods.values().find(|code| code.contains(pc))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Where a parked thread stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadState {
    /// Youngest frame: a runtime bridge when `is_compiled`, else an
    /// interpreted frame.
    pub current_frame: SlotAddr,
    pub is_compiled: bool,
}
