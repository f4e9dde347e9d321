/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill-fill resolution: turning a group of moves with parallel
//! semantics into a sequence that can be executed one move at a time.

use crate::{Arch, CodegenError, Location, PReg, RegClass, ValueType};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use smallvec::{smallvec, SmallVec};

/// One move of a spill-fill group.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct SpillFillData {
    pub src: Location,
    pub dst: Location,
    pub ty: ValueType,
}

impl SpillFillData {
    #[inline(always)]
    pub fn new(src: Location, dst: Location, ty: ValueType) -> Self {
        SpillFillData { src, dst, ty }
    }
}

impl fmt::Debug for SpillFillData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.src, self.dst, self.ty)
    }
}

/// A list of moves to be performed in sequence.
pub type MoveVec = SmallVec<[SpillFillData; 16]>;

// Dense numbering of every location a move can write: integer registers
// first, then fp registers, spill slots and outgoing parameter slots.
pub const VREGS_TABLE_OFFSET: usize = PReg::MAX + 1;
pub const SLOTS_TABLE_OFFSET: usize = VREGS_TABLE_OFFSET + PReg::MAX + 1;
pub const MAX_SPILL_SLOTS: usize = 256;
pub const PARAMETER_SLOTS_OFFSET: usize = SLOTS_TABLE_OFFSET + MAX_SPILL_SLOTS;
pub const MAX_PARAMETER_SLOTS: usize = 64;
pub const LOCATIONS_COUNT: usize = PARAMETER_SLOTS_OFFSET + MAX_PARAMETER_SLOTS;

/// Table index of a location. Immediates and `None` have none.
pub fn location_index(loc: Location) -> Result<Option<usize>, CodegenError> {
    Ok(match loc {
        Location::Reg(reg) => Some(match reg.class() {
            RegClass::Int => reg.hw_enc(),
            RegClass::Float => VREGS_TABLE_OFFSET + reg.hw_enc(),
        }),
        Location::Stack(slot) => {
            if slot as usize >= MAX_SPILL_SLOTS {
                return Err(CodegenError::SpillSlotOutOfRange(slot));
            }
            Some(SLOTS_TABLE_OFFSET + slot as usize)
        }
        Location::StackParameter(slot) => {
            if slot as usize >= MAX_PARAMETER_SLOTS {
                return Err(CodegenError::ParameterSlotOutOfRange(slot));
            }
            Some(PARAMETER_SLOTS_OFFSET + slot as usize)
        }
        Location::Imm(_) | Location::None => None,
    })
}

/// A 64-bit value in a register of a 32-bit target occupies an
/// even/odd register pair.
#[inline]
pub fn is_paired_reg(arch: Arch, loc: Location, ty: ValueType) -> bool {
    arch == Arch::Aarch32 && loc.is_reg() && ty.is_64bit(arch)
}

/// The table indices a location covers for a value of type `ty`.
pub(crate) fn location_units(
    arch: Arch,
    loc: Location,
    ty: ValueType,
) -> Result<SmallVec<[usize; 2]>, CodegenError> {
    let mut units = SmallVec::new();
    if let Some(idx) = location_index(loc)? {
        units.push(idx);
        if is_paired_reg(arch, loc, ty) {
            debug_assert!(idx % 2 == 0, "register pair must start at an even register");
            units.push(idx + 1);
        }
    }
    Ok(units)
}

/// A sequence of moves where an unchosen scratch location may occur,
/// represented by `Location::None`.
#[derive(Clone, Debug)]
pub enum MoveVecWithScratch {
    /// No scratch was actually used.
    NoScratch(MoveVec),
    /// A scratch space was used.
    Scratch(MoveVec),
}

impl MoveVecWithScratch {
    /// Fills in the scratch location, which must not occur anywhere in
    /// the original group, and returns the final list of moves. Every
    /// cycle goes through `scratch`, so it must fit all of them; see
    /// [`MoveAndScratchResolver`] for a scratch per kind of value.
    pub fn with_scratch(self, scratch: Location) -> MoveVec {
        match self {
            MoveVecWithScratch::NoScratch(moves) => moves,
            MoveVecWithScratch::Scratch(mut moves) => {
                for m in &mut moves {
                    debug_assert!(m.src != scratch && m.dst != scratch);
                    debug_assert!(!(m.src.is_none() && m.dst.is_none()));
                    if m.src.is_none() {
                        m.src = scratch;
                    }
                    if m.dst.is_none() {
                        m.dst = scratch;
                    }
                }
                moves
            }
        }
    }

    pub fn without_scratch(self) -> Option<MoveVec> {
        match self {
            MoveVecWithScratch::NoScratch(moves) => Some(moves),
            MoveVecWithScratch::Scratch(..) => None,
        }
    }

    pub fn needs_scratch(&self) -> bool {
        matches!(self, MoveVecWithScratch::Scratch(..))
    }

    pub fn moves(&self) -> &MoveVec {
        match self {
            MoveVecWithScratch::NoScratch(moves) | MoveVecWithScratch::Scratch(moves) => moves,
        }
    }

    /// Do any moves go from memory to memory?
    pub fn stack_to_stack(&self) -> bool {
        self.moves()
            .iter()
            .any(|m| m.src.is_memory() && m.dst.is_memory())
    }
}

/// Output of [`SpillFillResolver::resolve`], bucketed.
#[derive(Clone, Debug, Default)]
pub struct ResolvedMoves {
    /// Moves nobody else depends on in either direction. Safe to run
    /// first, or anywhere.
    pub pre_moves: MoveVec,
    /// Dependency chains and broken cycles, in execution order. May
    /// contain scratch placeholders.
    pub moves: MoveVec,
    /// Immediate loads. Nothing can clobber their source, so they run
    /// last.
    pub post_moves: MoveVec,
    /// Number of cycles broken through the scratch.
    pub cycles: usize,
}

impl ResolvedMoves {
    pub fn needs_scratch(&self) -> bool {
        self.cycles > 0
    }

    pub fn len(&self) -> usize {
        self.pre_moves.len() + self.moves.len() + self.post_moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All three buckets in execution order.
    pub fn into_sequence(self) -> MoveVecWithScratch {
        let mut all = self.pre_moves;
        all.extend(self.moves);
        all.extend(self.post_moves);
        if self.cycles > 0 {
            MoveVecWithScratch::Scratch(all)
        } else {
            MoveVecWithScratch::NoScratch(all)
        }
    }
}

const NO_MOVE: u32 = u32::MAX;

#[derive(Clone, Debug)]
struct PendingMove {
    data: SpillFillData,
    dst_units: SmallVec<[usize; 2]>,
    src_units: SmallVec<[usize; 2]>,
    /// Moves reading this one's destination that are not emitted yet.
    readers: u32,
    reader_list: SmallVec<[u32; 2]>,
    emitted: bool,
    /// Source replaced by the scratch.
    redirected: bool,
}

/// Resolves spill-fill groups. Holds dense tables indexed by location
/// so that resolving a group allocates nothing beyond the group itself;
/// keep one per compilation and reuse it.
pub struct SpillFillResolver {
    arch: Arch,
    /// Move writing each location in the current group.
    writer: Vec<u32>,
    /// Chain marker per location, compared against `epoch`.
    chain_marker: Vec<u32>,
    epoch: u32,
    touched: SmallVec<[usize; 32]>,
    pending: SmallVec<[PendingMove; 16]>,
}

impl SpillFillResolver {
    pub fn new(arch: Arch) -> Self {
        SpillFillResolver {
            arch,
            writer: vec![NO_MOVE; LOCATIONS_COUNT],
            chain_marker: vec![0; LOCATIONS_COUNT],
            epoch: 0,
            touched: SmallVec::new(),
            pending: SmallVec::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Orders a group of moves with parallel semantics.
    ///
    /// Destinations must be unique within the group; that is checked
    /// with a debug assertion only. Moves whose source equals their
    /// destination are dropped.
    pub fn resolve(&mut self, group: &[SpillFillData]) -> Result<ResolvedMoves, CodegenError> {
        let mut result = ResolvedMoves::default();
        if let Err(e) = self.collect(group, &mut result) {
            self.reset();
            return Err(e);
        }
        self.count_readers();
        self.reorder(&mut result);
        self.reset();
        trace!(
            "spill-fill: {:?} -> pre {:?} moves {:?} post {:?}",
            group,
            result.pre_moves,
            result.moves,
            result.post_moves
        );
        Ok(result)
    }

    fn collect(&mut self, group: &[SpillFillData], result: &mut ResolvedMoves) -> Result<(), CodegenError> {
        for &data in group {
            if data.src == data.dst {
                continue;
            }
            if data.src.is_none() || data.dst.is_none() || data.dst.is_imm() {
                return Err(CodegenError::InvalidMove(crate::InstId::invalid()));
            }
            let dst_units = location_units(self.arch, data.dst, data.ty)?;
            let src_units = location_units(self.arch, data.src, data.ty)?;
            let idx = self.pending.len() as u32;
            for &unit in &dst_units {
                debug_assert_eq!(
                    self.writer[unit], NO_MOVE,
                    "{} written twice in one spill-fill group",
                    data.dst
                );
                self.writer[unit] = idx;
                self.touched.push(unit);
            }
            if data.src.is_imm() {
                result.post_moves.push(data);
                // Keep the destination registered so readers see it,
                // but never schedule the move itself.
                self.pending.push(PendingMove {
                    data,
                    dst_units,
                    src_units,
                    readers: 0,
                    reader_list: SmallVec::new(),
                    emitted: true,
                    redirected: false,
                });
                continue;
            }
            self.pending.push(PendingMove {
                data,
                dst_units,
                src_units,
                readers: 0,
                reader_list: SmallVec::new(),
                emitted: false,
                redirected: false,
            });
        }
        Ok(())
    }

    fn count_readers(&mut self) {
        for i in 0..self.pending.len() {
            if self.pending[i].data.src.is_imm() {
                continue;
            }
            let mut last_writer = NO_MOVE;
            for u in 0..self.pending[i].src_units.len() {
                let w = self.writer[self.pending[i].src_units[u]];
                if w == NO_MOVE || w == i as u32 || w == last_writer {
                    continue;
                }
                last_writer = w;
                let writer = &mut self.pending[w as usize];
                if writer.data.src.is_imm() {
                    // Immediates run last, after every reader.
                    continue;
                }
                writer.readers += 1;
                writer.reader_list.push(i as u32);
            }
        }
    }

    fn reads_written(&self, m: &PendingMove, me: u32) -> bool {
        m.src_units.iter().any(|&u| {
            let w = self.writer[u];
            w != NO_MOVE && w != me && !self.pending[w as usize].data.src.is_imm()
        })
    }

    fn reorder(&mut self, result: &mut ResolvedMoves) {
        // Independent moves first.
        let mut ready: SmallVec<[u32; 16]> = SmallVec::new();
        for i in 0..self.pending.len() {
            let m = &self.pending[i];
            if m.emitted {
                continue;
            }
            if m.readers == 0 && !self.reads_written(m, i as u32) {
                result.pre_moves.push(m.data);
                self.pending[i].emitted = true;
            }
        }

        // Chains: a move can run once every reader of its destination
        // has run.
        for i in (0..self.pending.len()).rev() {
            let m = &self.pending[i];
            if !m.emitted && m.readers == 0 {
                ready.push(i as u32);
            }
        }
        loop {
            while let Some(i) = ready.pop() {
                self.emit(i, &mut ready, result);
            }
            match self.pending.iter().position(|m| !m.emitted) {
                None => break,
                Some(start) => {
                    let (cycle_move, reader) = self.find_cycle(start as u32);
                    self.break_cycle(cycle_move, reader, &mut ready, result);
                }
            }
        }
    }

    fn emit(&mut self, i: u32, ready: &mut SmallVec<[u32; 16]>, result: &mut ResolvedMoves) {
        let m = &mut self.pending[i as usize];
        debug_assert!(!m.emitted && m.readers == 0);
        m.emitted = true;
        let mut data = m.data;
        if m.redirected {
            data.src = Location::None;
            result.moves.push(data);
            return;
        }
        result.moves.push(data);
        let mut last_writer = NO_MOVE;
        for u in 0..self.pending[i as usize].src_units.len() {
            let w = self.writer[self.pending[i as usize].src_units[u]];
            if w == NO_MOVE || w == i || w == last_writer {
                continue;
            }
            last_writer = w;
            let writer = &mut self.pending[w as usize];
            if writer.emitted {
                continue;
            }
            writer.readers -= 1;
            if writer.readers == 0 {
                ready.push(w);
            }
        }
    }

    /// The first reader of `i`'s destination still waiting to run.
    fn next_reader(&self, i: u32) -> u32 {
        let m = &self.pending[i as usize];
        m.reader_list
            .iter()
            .copied()
            .find(|&r| {
                let r = &self.pending[r as usize];
                !r.emitted && !r.redirected
            })
            .expect("blocked move without a waiting reader")
    }

    /// Follows readers from `start` until a destination repeats. Every
    /// remaining move has a waiting reader, so this always ends on a
    /// cycle. Returns a move on the cycle and the reader the walk took
    /// from it.
    fn find_cycle(&mut self, start: u32) -> (u32, u32) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            for m in self.chain_marker.iter_mut() {
                *m = 0;
            }
            self.epoch = 1;
        }
        let mut cur = start;
        loop {
            let dst = self.pending[cur as usize].dst_units[0];
            if self.chain_marker[dst] == self.epoch {
                return (cur, self.next_reader(cur));
            }
            self.chain_marker[dst] = self.epoch;
            cur = self.next_reader(cur);
        }
    }

    /// Saves `cycle_move`'s destination into the scratch and points
    /// `reader` at the scratch, which unblocks `cycle_move`.
    fn break_cycle(
        &mut self,
        cycle_move: u32,
        reader: u32,
        ready: &mut SmallVec<[u32; 16]>,
        result: &mut ResolvedMoves,
    ) {
        debug_assert!(
            self.pending.iter().all(|m| !m.redirected || m.emitted),
            "scratch still holds a value from the previous cycle"
        );
        let saved = self.pending[cycle_move as usize].data;
        let reader_data = self.pending[reader as usize].data;
        trace!(
            "spill-fill: cycle through {}, saving it for {:?}",
            saved.dst,
            reader_data
        );
        result.moves.push(SpillFillData::new(
            reader_data.src,
            Location::None,
            reader_data.ty,
        ));
        result.cycles += 1;
        self.pending[reader as usize].redirected = true;

        // The reader no longer blocks any writer of its old source.
        let mut last_writer = NO_MOVE;
        for u in 0..self.pending[reader as usize].src_units.len() {
            let w = self.writer[self.pending[reader as usize].src_units[u]];
            if w == NO_MOVE || w == reader || w == last_writer {
                continue;
            }
            last_writer = w;
            let writer = &mut self.pending[w as usize];
            if writer.emitted {
                continue;
            }
            writer.readers -= 1;
            if writer.readers == 0 {
                ready.push(w);
            }
        }
        debug_assert!(ready.contains(&cycle_move));
    }

    fn reset(&mut self) {
        for &unit in &self.touched {
            self.writer[unit] = NO_MOVE;
        }
        self.touched.clear();
        self.pending.clear();
    }
}

/// Final stage of move resolution: choosing the scratch, and making
/// sure no move goes from memory to memory, which no encoder supports.
///
/// Each cycle's scratch comes from `find_free_reg`, asked with the type
/// the cycle moves, if it has one left, otherwise from a spill slot.
/// Memory-to-memory moves then go through another free register of a
/// suitable kind; if there is none, `victim` is borrowed and saved to a
/// spill slot around each such move. On 32-bit
/// targets a 64-bit value borrows the `victim` pair, so `victim` must be
/// even.
pub struct MoveAndScratchResolver<GetReg, GetStackSlot>
where
    GetReg: FnMut(ValueType) -> Option<Location>,
    GetStackSlot: FnMut() -> Location,
{
    /// Temporary per kind of value moved: the register and, if it is the
    /// victim, where it is saved.
    stack_stack_scratch: SmallVec<[(TmpKind, Location, Option<Location>); 2]>,
    /// Scratch per kind of value a cycle moves.
    cycle_scratch: SmallVec<[(TmpKind, Location); 2]>,
    arch: Arch,
    find_free_reg: GetReg,
    get_stackslot: GetStackSlot,
    victim: PReg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TmpKind {
    class: RegClass,
    paired: bool,
}

impl<GetReg, GetStackSlot> MoveAndScratchResolver<GetReg, GetStackSlot>
where
    GetReg: FnMut(ValueType) -> Option<Location>,
    GetStackSlot: FnMut() -> Location,
{
    pub fn new(arch: Arch, find_free_reg: GetReg, get_stackslot: GetStackSlot, victim: PReg) -> Self {
        Self {
            stack_stack_scratch: SmallVec::new(),
            cycle_scratch: SmallVec::new(),
            arch,
            find_free_reg,
            get_stackslot,
            victim,
        }
    }

    fn word(&self) -> ValueType {
        if self.arch.is_64bit() {
            ValueType::Int64
        } else {
            ValueType::Int32
        }
    }

    fn kind(&self, ty: ValueType) -> TmpKind {
        TmpKind {
            class: ty.reg_class(),
            paired: self.arch == Arch::Aarch32 && ty.is_64bit(self.arch),
        }
    }

    fn tmp_for(&mut self, ty: ValueType) -> (Location, Option<Location>) {
        let kind = self.kind(ty);
        if let Some(&(_, reg, save)) = self.stack_stack_scratch.iter().find(|e| e.0 == kind) {
            return (reg, save);
        }
        let (reg, save) = match (self.find_free_reg)(ty) {
            Some(reg) => (reg, None),
            None => (Location::Reg(self.victim), Some((self.get_stackslot)())),
        };
        trace!(
            "scratch resolver: memory to memory for {:?} through {} (save {:?})",
            kind,
            reg,
            save
        );
        self.stack_stack_scratch.push((kind, reg, save));
        (reg, save)
    }

    /// Scratch for a cycle moving a `ty`. Cycles run one after another,
    /// so a kind's scratch is reused by later cycles of the same kind.
    fn scratch_for(&mut self, ty: ValueType) -> Location {
        let kind = self.kind(ty);
        if let Some(&(_, loc)) = self.cycle_scratch.iter().find(|e| e.0 == kind) {
            return loc;
        }
        let loc = (self.find_free_reg)(ty).unwrap_or_else(|| (self.get_stackslot)());
        trace!("scratch resolver: scratch {} for {:?}", loc, kind);
        self.cycle_scratch.push((kind, loc));
        loc
    }

    pub fn compute(mut self, moves: MoveVecWithScratch) -> MoveVec {
        if !moves.needs_scratch() && !moves.stack_to_stack() {
            return moves.without_scratch().unwrap_or_default();
        }

        let mut result = smallvec![];
        let mut scratch = Location::None;
        for mut m in moves.moves().iter().copied() {
            debug_assert!(!(m.src.is_none() && m.dst.is_none()));
            if m.dst.is_none() {
                scratch = self.scratch_for(m.ty);
                m.dst = scratch;
            } else if m.src.is_none() {
                debug_assert!(!scratch.is_none(), "scratch read before a cycle saved it");
                m.src = scratch;
            }
            if !(m.src.is_memory() && m.dst.is_memory()) {
                result.push(m);
                continue;
            }
            let (tmp, save) = self.tmp_for(m.ty);
            match save {
                None => {
                    result.push(SpillFillData::new(m.src, tmp, m.ty));
                    result.push(SpillFillData::new(tmp, m.dst, m.ty));
                }
                Some(save) => {
                    let saved_ty = if is_paired_reg(self.arch, tmp, m.ty) {
                        m.ty
                    } else {
                        self.word()
                    };
                    result.push(SpillFillData::new(tmp, save, saved_ty));
                    result.push(SpillFillData::new(m.src, tmp, m.ty));
                    result.push(SpillFillData::new(tmp, m.dst, m.ty));
                    result.push(SpillFillData::new(save, tmp, saved_ty));
                }
            }
        }
        trace!("scratch resolver: got {:?}", result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::check_parallel_moves;
    use alloc::vec::Vec;

    fn r(i: usize) -> Location {
        Location::Reg(PReg::int(i))
    }

    fn f(i: usize) -> Location {
        Location::Reg(PReg::float(i))
    }

    fn s(i: u32) -> Location {
        Location::Stack(i)
    }

    fn mv(src: Location, dst: Location) -> SpillFillData {
        SpillFillData::new(src, dst, ValueType::Int64)
    }

    fn resolve(arch: Arch, group: &[SpillFillData]) -> ResolvedMoves {
        SpillFillResolver::new(arch).resolve(group).unwrap()
    }

    fn sequence(resolved: ResolvedMoves, scratch: Location) -> Vec<SpillFillData> {
        resolved.into_sequence().with_scratch(scratch).into_iter().collect()
    }

    #[test]
    fn independent_moves_are_pre_moves() {
        let group = [mv(r(0), r(1)), mv(s(0), r(2)), mv(f(0), f(1))];
        let resolved = resolve(Arch::Aarch64, &group);
        assert_eq!(resolved.pre_moves.as_slice(), &group);
        assert!(resolved.moves.is_empty());
        assert!(!resolved.needs_scratch());
    }

    #[test]
    fn chain_runs_reader_first() {
        // r1 := r0, r2 := r1: r2 must read r1 before it is overwritten.
        let group = [mv(r(0), r(1)), mv(r(1), r(2))];
        let resolved = resolve(Arch::Aarch64, &group);
        assert!(resolved.pre_moves.is_empty());
        assert_eq!(resolved.moves.as_slice(), &[mv(r(1), r(2)), mv(r(0), r(1))]);
        check_parallel_moves(Arch::Aarch64, &group, &sequence(resolved, r(16)), |_| false)
            .unwrap();
    }

    #[test]
    fn swap_uses_one_scratch() {
        let group = [mv(r(0), r(1)), mv(r(1), r(0))];
        let resolved = resolve(Arch::Aarch64, &group);
        assert_eq!(resolved.cycles, 1);
        let seq = sequence(resolved, r(16));
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.iter().filter(|m| m.dst == r(16)).count(), 1);
        check_parallel_moves(Arch::Aarch64, &group, &seq, |l| l == r(16)).unwrap();
    }

    #[test]
    fn rotation_with_tail() {
        // r0 -> r1 -> r2 -> r0, with r2 also copied to a stack slot and an
        // immediate into r3, which r1's old value does not depend on.
        let group = [
            mv(r(0), r(1)),
            mv(r(1), r(2)),
            mv(r(2), r(0)),
            mv(r(2), s(4)),
            mv(Location::Imm(7), r(3)),
            mv(r(3), r(4)),
        ];
        let resolved = resolve(Arch::Amd64, &group);
        assert_eq!(resolved.cycles, 1);
        assert_eq!(resolved.post_moves.as_slice(), &[mv(Location::Imm(7), r(3))]);
        let seq = sequence(resolved, r(5));
        check_parallel_moves(Arch::Amd64, &group, &seq, |l| l == r(5)).unwrap();
    }

    #[test]
    fn two_cycles_reuse_the_scratch() {
        let group = [
            mv(r(0), r(1)),
            mv(r(1), r(0)),
            mv(s(0), s(1)),
            mv(s(1), s(2)),
            mv(s(2), s(0)),
        ];
        let resolved = resolve(Arch::Aarch64, &group);
        assert_eq!(resolved.cycles, 2);
        let seq = sequence(resolved, r(16));
        check_parallel_moves(Arch::Aarch64, &group, &seq, |l| l == r(16)).unwrap();
    }

    #[test]
    fn each_cycle_gets_a_scratch_of_its_own_kind() {
        // An int swap, a float swap and a swap of 64-bit pairs: the first
        // cycle's kind must not decide the scratch of the others.
        let int = |src, dst| SpillFillData::new(src, dst, ValueType::Int32);
        let float = |src, dst| SpillFillData::new(src, dst, ValueType::Float64);
        let wide = |src, dst| SpillFillData::new(src, dst, ValueType::Int64);
        let group = [
            int(r(4), r(5)),
            int(r(5), r(4)),
            float(f(0), f(2)),
            float(f(2), f(0)),
            wide(r(6), r(8)),
            wide(r(8), r(6)),
        ];
        let resolved = resolve(Arch::Aarch32, &group);
        assert_eq!(resolved.cycles, 3);
        let mut asked = Vec::new();
        let moves = MoveAndScratchResolver::new(
            Arch::Aarch32,
            |ty: ValueType| {
                asked.push(ty);
                match ty {
                    ValueType::Int32 => Some(r(12)),
                    ValueType::Float64 => Some(f(14)),
                    _ => None,
                }
            },
            || s(30),
            PReg::int(0),
        )
        .compute(resolved.into_sequence());
        assert_eq!(asked.len(), 3);

        let saves: Vec<SpillFillData> = moves
            .iter()
            .copied()
            .filter(|m| m.dst == r(12) || m.dst == f(14) || m.dst == s(30))
            .collect();
        assert_eq!(saves.len(), 3);
        for m in &saves {
            match m.ty {
                ValueType::Int32 => assert_eq!(m.dst, r(12)),
                ValueType::Float64 => assert_eq!(m.dst, f(14)),
                _ => assert_eq!(m.dst, s(30)),
            }
        }
        // The integer temp never holds a pair, so r13 is left alone.
        assert!(moves
            .iter()
            .all(|m| !(m.dst == r(12) && m.ty.is_64bit(Arch::Aarch32))));
        let clobberable = |l: Location| l == r(12) || l == f(14) || l == f(15) || l == s(30);
        check_parallel_moves(Arch::Aarch32, &group, &moves, clobberable).unwrap();
    }

    #[test]
    fn register_pairs_move_as_a_unit() {
        let pair = |i| SpillFillData::new(r(0), r(i), ValueType::Int64);
        // r0:r1 -> r2:r3 while the low half r2 (32-bit) -> r4.
        let group = [pair(2), SpillFillData::new(r(2), r(4), ValueType::Int32)];
        let resolved = resolve(Arch::Aarch32, &group);
        assert_eq!(resolved.cycles, 0);
        let seq = sequence(resolved, r(12));
        assert_eq!(seq[0].dst, r(4));
        check_parallel_moves(Arch::Aarch32, &group, &seq, |_| false).unwrap();

        // r0:r1 -> r2:r3 while r2 -> r1 closes a cycle through the pair.
        let group = [pair(2), SpillFillData::new(r(2), r(1), ValueType::Int32)];
        let resolved = resolve(Arch::Aarch32, &group);
        assert_eq!(resolved.cycles, 1);
        let seq = sequence(resolved, r(12));
        check_parallel_moves(Arch::Aarch32, &group, &seq, |l| l == r(12)).unwrap();

        // Swapping two pairs needs the scratch once.
        let group = [
            SpillFillData::new(r(0), r(2), ValueType::Int64),
            SpillFillData::new(r(2), r(0), ValueType::Int64),
        ];
        let resolved = resolve(Arch::Aarch32, &group);
        assert_eq!(resolved.cycles, 1);
        let seq = sequence(resolved, s(9));
        check_parallel_moves(Arch::Aarch32, &group, &seq, |l| l == s(9)).unwrap();
    }

    #[test]
    fn out_of_range_slot_is_reported() {
        let mut resolver = SpillFillResolver::new(Arch::Aarch64);
        assert_eq!(
            resolver
                .resolve(&[mv(r(0), s(MAX_SPILL_SLOTS as u32))])
                .unwrap_err(),
            CodegenError::SpillSlotOutOfRange(MAX_SPILL_SLOTS as u32)
        );
        // The failed group left nothing behind.
        let resolved = resolver.resolve(&[mv(r(0), r(1))]).unwrap();
        assert_eq!(resolved.pre_moves.len(), 1);
    }

    #[test]
    fn stack_to_stack_goes_through_a_register() {
        let group = [mv(s(0), s(1)), mv(s(1), s(0))];
        let resolved = resolve(Arch::Aarch64, &group).into_sequence();
        let mut free = vec![r(16), r(17)];
        let moves = MoveAndScratchResolver::new(
            Arch::Aarch64,
            |_| free.pop(),
            || unreachable!("free registers available"),
            PReg::int(0),
        )
        .compute(resolved);
        assert!(moves.iter().all(|m| !(m.src.is_memory() && m.dst.is_memory())));
        check_parallel_moves(Arch::Aarch64, &group, &moves, |l| l == r(16) || l == r(17)).unwrap();
    }

    #[test]
    fn victim_is_saved_and_restored() {
        let word = |src, dst| SpillFillData::new(src, dst, ValueType::Int32);
        let group = [word(s(0), s(1)), word(r(3), r(4))];
        let resolved = resolve(Arch::Aarch32, &group).into_sequence();
        let mut next_slot = 20;
        let moves = MoveAndScratchResolver::new(
            Arch::Aarch32,
            |_| None,
            || {
                next_slot += 1;
                s(next_slot)
            },
            PReg::int(3),
        )
        .compute(resolved);
        assert_eq!(moves.len(), 5);
        check_parallel_moves(Arch::Aarch32, &group, &moves, |l| l == s(21)).unwrap();
    }

    #[test]
    fn wide_values_borrow_a_victim_pair() {
        let group = [SpillFillData::new(s(0), s(1), ValueType::Int64)];
        let resolved = resolve(Arch::Aarch32, &group).into_sequence();
        let moves = MoveAndScratchResolver::new(Arch::Aarch32, |_| None, || s(7), PReg::int(4))
            .compute(resolved);
        assert_eq!(moves[0], SpillFillData::new(r(4), s(7), ValueType::Int64));
        check_parallel_moves(Arch::Aarch32, &group, &moves, |l| l == s(7)).unwrap();
    }

    #[test]
    fn random_groups_keep_parallel_semantics() {
        arbtest::arbtest(|u| {
            let arch = *u.choose(&[Arch::Amd64, Arch::Aarch64, Arch::Aarch32])?;
            let locations: Vec<Location> = (0..8)
                .map(r)
                .chain((0..4).map(f))
                .chain((0..6).map(s))
                .collect();
            let mut dsts: Vec<Location> = locations.clone();
            let mut group = Vec::new();
            let n = u.int_in_range(0..=dsts.len())?;
            for _ in 0..n {
                let d = u.int_in_range(0..=dsts.len() - 1)?;
                let dst = dsts.swap_remove(d);
                let src = if u.ratio(1, 8)? {
                    Location::Imm(u.int_in_range(-5..=5)?)
                } else {
                    *u.choose(&locations)?
                };
                // Keep each move within one class, as the allocator does.
                let src = match (src, dst) {
                    (Location::Reg(a), Location::Reg(b)) if a.class() != b.class() => dst,
                    _ => src,
                };
                let ty = if dst.reg().map_or(false, |r| r.is_float()) {
                    ValueType::Float32
                } else {
                    ValueType::Int32
                };
                group.push(SpillFillData::new(src, dst, ty));
            }
            let resolved = SpillFillResolver::new(arch).resolve(&group).unwrap();
            let cycles = resolved.cycles;
            let seq = resolved.into_sequence();
            let scratch_uses = seq.moves().iter().filter(|m| m.dst.is_none()).count();
            assert_eq!(scratch_uses, cycles);
            let mut free = vec![f(15), r(15)];
            let mut next_slot = 20;
            let moves = MoveAndScratchResolver::new(
                arch,
                |ty: ValueType| {
                    let at = free.iter().position(|l| l.reg().map(|r| r.class()) == Some(ty.reg_class()))?;
                    Some(free.remove(at))
                },
                || {
                    next_slot += 1;
                    s(next_slot)
                },
                PReg::int(14),
            )
            .compute(seq);
            for m in &moves {
                if let Some(reg) = m.src.reg().or_else(|| m.dst.reg()) {
                    assert_eq!(reg.class(), m.ty.reg_class(), "{:?}", m);
                }
            }
            let clobberable = |l: Location| match l {
                Location::Stack(slot) => slot > 20,
                _ => l == r(15) || l == f(15),
            };
            check_parallel_moves(arch, &group, &moves, clobberable).unwrap();
            Ok(())
        })
        .budget_ms(1_000);
    }
}
