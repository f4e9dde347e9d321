/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Builds a [`Method`] together with its allocated intervals.
//!
//! Instruction `i` gets life number `2 * i`. A value lives from its
//! definition to its last use, in the location given when it was defined
//! until a [`MethodBuilder::shuffle`] moves it, which splits its interval
//! there. Keeping two values live in one location at once is up to the
//! caller to avoid.

use super::{parameter_locations, Inst, Method, Opcode, SaveState};
use crate::moves::SpillFillData;
use crate::target::arch_info;
use crate::{Arch, FxHashMap, InstId, LifeIntervals, LifeNumber, Location, MethodId, ValueType};
use alloc::vec::Vec;
use smallvec::SmallVec;

#[derive(Clone, Debug)]
struct Value {
    ty: ValueType,
    def: LifeNumber,
    last_use: LifeNumber,
    initial: Location,
    current: Location,
    moves: SmallVec<[(LifeNumber, Location); 2]>,
}

#[derive(Clone, Debug)]
pub struct MethodBuilder {
    arch: Arch,
    id: MethodId,
    is_native: bool,
    params: Vec<ValueType>,
    insts: Vec<Inst>,
    values: FxHashMap<InstId, Value>,
    order: Vec<InstId>,
}

impl MethodBuilder {
    pub fn new(id: MethodId, arch: Arch) -> Self {
        MethodBuilder {
            arch,
            id,
            is_native: false,
            params: Vec::new(),
            insts: Vec::new(),
            values: FxHashMap::default(),
            order: Vec::new(),
        }
    }

    pub fn native(&mut self) -> &mut Self {
        self.is_native = true;
        self
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    fn push(&mut self, opcode: Opcode) -> (InstId, LifeNumber) {
        let id = InstId::new(self.insts.len());
        self.insts.push(Inst { id, opcode });
        (id, 2 * id.raw_u32())
    }

    fn define(&mut self, id: InstId, ln: LifeNumber, ty: ValueType, loc: Location) {
        self.values.insert(
            id,
            Value {
                ty,
                def: ln,
                last_use: ln,
                initial: loc,
                current: loc,
                moves: SmallVec::new(),
            },
        );
        self.order.push(id);
    }

    fn value_mut(&mut self, value: InstId) -> &mut Value {
        match self.values.get_mut(&value) {
            Some(v) => v,
            None => panic!("{:?} is not a value", value),
        }
    }

    fn use_value(&mut self, value: InstId, ln: LifeNumber) {
        let v = self.value_mut(value);
        v.last_use = v.last_use.max(ln);
    }

    fn save_state(&mut self, live: &[Option<InstId>], ln: LifeNumber) -> SaveState {
        for &value in live.iter().flatten() {
            self.use_value(value, ln);
        }
        SaveState {
            bytecode_pc: ln / 2,
            vregs: live.to_vec(),
        }
    }

    /// Where `value` is right now.
    pub fn location(&self, value: InstId) -> Option<Location> {
        self.values.get(&value).map(|v| v.current)
    }

    pub fn ty(&self, value: InstId) -> Option<ValueType> {
        self.values.get(&value).map(|v| v.ty)
    }

    /// The next parameter, kept where the caller passes it.
    pub fn param(&mut self, ty: ValueType) -> InstId {
        let mut params = self.params.clone();
        params.push(ty);
        let incoming = parameter_locations(arch_info(self.arch), &params)[params.len() - 1];
        self.param_in(ty, incoming)
    }

    /// The next parameter, moved to `loc` on entry.
    pub fn param_in(&mut self, ty: ValueType, loc: Location) -> InstId {
        assert_eq!(
            self.insts.len(),
            self.params.len(),
            "parameters must come first"
        );
        let index = self.params.len() as u32;
        self.params.push(ty);
        let (id, ln) = self.push(Opcode::Parameter(index));
        self.define(id, ln, ty, loc);
        id
    }

    pub fn constant(&mut self, imm: i64, ty: ValueType, loc: Location) -> InstId {
        let (id, ln) = self.push(Opcode::Constant(imm));
        self.define(id, ln, ty, loc);
        id
    }

    /// Moves values to new locations, all at once.
    pub fn shuffle(&mut self, moves: &[(InstId, Location)]) {
        let ln = 2 * self.insts.len() as u32;
        let mut group = Vec::with_capacity(moves.len());
        for &(value, to) in moves {
            assert!(!to.is_imm() && !to.is_none(), "cannot move {:?} to {}", value, to);
            self.use_value(value, ln);
            let v = self.value_mut(value);
            group.push(SpillFillData::new(v.current, to, v.ty));
            v.current = to;
            v.moves.push((ln, to));
        }
        self.push(Opcode::SpillFill(group));
    }

    pub fn call(
        &mut self,
        callee: MethodId,
        args: &[InstId],
        live: &[Option<InstId>],
        result: Option<(ValueType, Location)>,
    ) -> InstId {
        let ln = 2 * self.insts.len() as u32;
        for &arg in args {
            self.use_value(arg, ln);
        }
        let save_state = self.save_state(live, ln);
        let (id, ln) = self.push(Opcode::Call {
            callee,
            args: args.to_vec(),
            save_state,
        });
        if let Some((ty, loc)) = result {
            self.define(id, ln, ty, loc);
        }
        id
    }

    pub fn call_runtime(
        &mut self,
        entrypoint: u32,
        args: &[InstId],
        live: &[Option<InstId>],
        saves_only_params: bool,
        result: Option<(ValueType, Location)>,
    ) -> InstId {
        let ln = 2 * self.insts.len() as u32;
        for &arg in args {
            self.use_value(arg, ln);
        }
        let save_state = self.save_state(live, ln);
        let (id, ln) = self.push(Opcode::CallRuntime {
            entrypoint,
            args: args.to_vec(),
            save_state,
            saves_only_params,
        });
        if let Some((ty, loc)) = result {
            self.define(id, ln, ty, loc);
        }
        id
    }

    pub fn safepoint(&mut self, live: &[Option<InstId>]) -> InstId {
        let ln = 2 * self.insts.len() as u32;
        let save_state = self.save_state(live, ln);
        self.push(Opcode::SafePoint(save_state)).0
    }

    pub fn label(&mut self, label: u32) {
        self.push(Opcode::Label(label));
    }

    pub fn jump(&mut self, label: u32) {
        self.push(Opcode::Jump(label));
    }

    pub fn ret(&mut self, value: Option<InstId>) {
        let ln = 2 * self.insts.len() as u32;
        if let Some(value) = value {
            self.use_value(value, ln);
        }
        self.push(Opcode::Return(value));
    }

    pub fn finish(self) -> (Method, LifeIntervals) {
        let mut intervals = LifeIntervals::new();
        for inst in &self.insts {
            intervals.set_life_number(inst.id, 2 * inst.id.raw_u32());
        }
        for id in &self.order {
            let v = &self.values[id];
            let end = v.last_use.max(v.def + 1);
            let mut idx = intervals.add_interval(*id, v.ty);
            intervals.add_range(idx, v.def, end);
            intervals.set_location(idx, v.initial);
            for &(ln, loc) in &v.moves {
                if v.def < ln && ln < end {
                    idx = intervals.split_at(idx, ln);
                    intervals.set_location(idx, loc);
                }
            }
        }
        debug_assert!(intervals.validate());
        let method = Method {
            id: self.id,
            params: self.params,
            insts: self.insts,
            is_native: self.is_native,
        };
        (method, intervals)
    }
}
