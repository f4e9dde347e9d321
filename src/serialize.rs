/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use core::fmt;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::codegen::{Method, Opcode};
use crate::{Arch, CompilerOptions, InstId, LifeIntervals, LifeNumber, LiveRange, Location, ValueType};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SiblingData {
    ranges: Vec<LiveRange>,
    location: Location,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IntervalData {
    inst: InstId,
    ty: ValueType,
    siblings: Vec<SiblingData>,
}

/// A method together with its allocated intervals and the options to
/// compile it with, in a form that can be serialized and deserialized.
///
/// The serialized form of this structure is not stable: it is intended to be
/// deserialized with the exact same version of liveregs as the one that it
/// was created with.
#[derive(Clone, Serialize, Deserialize)]
pub struct SerializableMethod {
    arch: Arch,
    options: CompilerOptions,
    method: Method,
    intervals: Vec<IntervalData>,
    life_numbers: Vec<(InstId, LifeNumber)>,
}

impl SerializableMethod {
    pub fn new(
        arch: Arch,
        method: &Method,
        intervals: &LifeIntervals,
        options: CompilerOptions,
    ) -> Self {
        Self {
            arch,
            options,
            method: method.clone(),
            intervals: intervals
                .heads()
                .map(|head| {
                    let interval = &intervals[head];
                    IntervalData {
                        inst: interval.inst(),
                        ty: interval.ty(),
                        siblings: intervals
                            .siblings(head)
                            .map(|(_, sibling)| SiblingData {
                                ranges: sibling.ranges().to_vec(),
                                location: sibling.location(),
                            })
                            .collect(),
                    }
                })
                .collect(),
            life_numbers: intervals.inst_life_numbers().to_vec(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Rebuilds the intervals. Every sibling is recreated by splitting
    /// at its first range.
    pub fn intervals(&self) -> LifeIntervals {
        let mut intervals = LifeIntervals::new();
        for &(inst, ln) in &self.life_numbers {
            intervals.set_life_number(inst, ln);
        }
        for data in &self.intervals {
            let mut idx = intervals.add_interval(data.inst, data.ty);
            for range in data.siblings.iter().flat_map(|s| s.ranges.iter()) {
                intervals.add_range(idx, range.begin, range.end);
            }
            for (i, sibling) in data.siblings.iter().enumerate() {
                if i > 0 {
                    if let Some(first) = sibling.ranges.first() {
                        idx = intervals.split_at(idx, first.begin);
                    }
                }
                intervals.set_location(idx, sibling.location);
            }
        }
        intervals
    }
}

impl fmt::Debug for SerializableMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{\n")?;
        write!(f, "  arch: {}\n", self.arch)?;
        write!(f, "  options: {:?}\n", self.options)?;
        write!(
            f,
            "  method{}{}: params {:?}\n",
            self.method.id.index(),
            if self.method.is_native { " (native)" } else { "" },
            self.method.params
        )?;
        for inst in &self.method.insts {
            let ln = self
                .life_numbers
                .iter()
                .find(|&&(i, _)| i == inst.id)
                .map(|&(_, ln)| ln);
            match ln {
                Some(ln) => write!(f, "    @{:<4}", ln)?,
                None => write!(f, "    @?   ")?,
            }
            match &inst.opcode {
                Opcode::SpillFill(moves) => {
                    write!(f, "inst{}: spill_fill", inst.id.index())?;
                    for m in moves.iter() {
                        write!(f, " {} -> {} ({})", m.src, m.dst, m.ty)?;
                    }
                    write!(f, "\n")?;
                }
                opcode => write!(f, "inst{}: {:?}\n", inst.id.index(), opcode)?,
            }
        }
        for data in &self.intervals {
            write!(f, "  v{} ({}):", data.inst.index(), data.ty)?;
            for sibling in &data.siblings {
                write!(f, " {:?} in {}", sibling.ranges, sibling.location)?;
            }
            write!(f, "\n")?;
        }
        write!(f, "}}\n")?;
        Ok(())
    }
}
