//! Taint analysis.
//!
//! Two fix-points over the values of a function:
//!
//! - the *speculative* model tracks, for every value that may hold
//!   speculatively loaded data, the set of loads it originates from;
//! - the *non-speculative* model computes the values that are public
//!   architecturally: revealed by the program whether or not it
//!   speculates.
//!
//! Both re-evaluate every value on each iteration and stop when the whole
//! map is unchanged. The relations only grow and the value set is finite,
//! so both terminate. Neither modifies the function.

use crate::alias::{store_operands, AliasQuery};
use crate::def_use::DefUseGraph;
use crate::intrinsics::{Intrinsic, Intrinsics};
use crate::policy::{IntrinsicPolicy, IntrinsicTaint, ValuePolicy};
use crate::result::{BladeError, BladeResult};
use cranelift_codegen::ir::{Function, Inst, Value};
use std::collections::BTreeSet;

mod nonspeculative;
mod speculative;

pub use self::nonspeculative::PublicValues;
pub use self::speculative::SpeculativeTaint;

/// Which fix-point to compute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThreatModel {
    /// Loads may execute with mispredicted addresses.
    Speculative,
    /// Only architectural execution.
    NonSpeculative,
}

/// The result of `compute_taint`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaintMap {
    /// Origins of speculatively tainted values.
    Speculative(SpeculativeTaint),
    /// The architecturally public values.
    NonSpeculative(PublicValues),
}

impl TaintMap {
    /// The model this map was computed under.
    pub fn model(&self) -> ThreatModel {
        match self {
            Self::Speculative(_) => ThreatModel::Speculative,
            Self::NonSpeculative(_) => ThreatModel::NonSpeculative,
        }
    }

    /// The speculative taint, if that is what this map holds.
    pub fn speculative(&self) -> Option<&SpeculativeTaint> {
        match self {
            Self::Speculative(taint) => Some(taint),
            Self::NonSpeculative(_) => None,
        }
    }

    /// The public values, if that is what this map holds.
    pub fn public(&self) -> Option<&PublicValues> {
        match self {
            Self::NonSpeculative(public) => Some(public),
            Self::Speculative(_) => None,
        }
    }
}

/// Compute the taint of every value of `func` under `model`.
///
/// `def_use` must have been built without call edges: call results never
/// depend on call arguments here.
/// `intrinsics` names the imports of `func` that are intrinsics.
pub fn compute_taint(
    func: &Function,
    intrinsics: &Intrinsics,
    def_use: &DefUseGraph,
    alias: &dyn AliasQuery,
    model: ThreatModel,
) -> BladeResult<TaintMap> {
    let cx = Context {
        func,
        intrinsics,
        def_use,
        alias,
    };
    Ok(match model {
        ThreatModel::Speculative => TaintMap::Speculative(SpeculativeTaint::compute(&cx)?),
        ThreatModel::NonSpeculative => TaintMap::NonSpeculative(PublicValues::compute(&cx)?),
    })
}

/// What both fix-points read.
struct Context<'a> {
    func: &'a Function,
    intrinsics: &'a Intrinsics,
    def_use: &'a DefUseGraph,
    alias: &'a dyn AliasQuery,
}

/// The propagation rule of one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    /// By opcode.
    Value(ValuePolicy),
    /// A call to an intrinsic the fix-points can express.
    Intrinsic(IntrinsicTaint),
}

impl<'a> Context<'a> {
    /// The rule for `inst`. Read-modify-write atomics and intrinsics such
    /// as `setjmp` have none.
    fn rule(&self, inst: Inst) -> BladeResult<Rule> {
        let func = self.func;
        let opcode = func.dfg.insts[inst].opcode();
        match ValuePolicy::for_opcode(opcode) {
            ValuePolicy::Unsupported => Err(unhandled(func, inst, format!("opcode {}", opcode))),
            ValuePolicy::Call => match self.intrinsics.called_by(func, inst) {
                Some(intrinsic) => match IntrinsicPolicy::for_intrinsic(intrinsic).taint {
                    IntrinsicTaint::Invalid => Err(unhandled(func, inst, intrinsic_what(intrinsic))),
                    taint => Ok(Rule::Intrinsic(taint)),
                },
                None => Ok(Rule::Value(ValuePolicy::Call)),
            },
            policy => Ok(Rule::Value(policy)),
        }
    }

    /// The value a write instruction stores, for stores and `memset`.
    fn stored_value(&self, inst: Inst) -> Option<Value> {
        if let Some((data, _)) = store_operands(self.func, inst) {
            return Some(data);
        }
        match self.intrinsics.called_by(self.func, inst) {
            Some(Intrinsic::Memset) => self.func.dfg.inst_args(inst).get(1).copied(),
            _ => None,
        }
    }
}

fn intrinsic_what(intrinsic: Intrinsic) -> String {
    format!("intrinsic {}", intrinsic)
}

fn unhandled(func: &Function, inst: Inst, what: String) -> BladeError {
    BladeError::UnhandledInstruction {
        func: func.name.to_string(),
        inst,
        what,
    }
}

/// All instructions in layout order.
fn layout_insts(func: &Function) -> Vec<Inst> {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block))
        .collect()
}

/// All block parameters in layout order.
fn layout_params(func: &Function) -> Vec<Value> {
    func.layout
        .blocks()
        .flat_map(|block| func.dfg.block_params(block).iter().copied())
        .collect()
}

/// Does every value of a non-empty `values` belong to `set`?
fn all_in(set: &BTreeSet<Value>, mut values: impl Iterator<Item = Value>) -> bool {
    match values.next() {
        None => false,
        Some(first) => set.contains(&first) && values.all(|v| set.contains(&v)),
    }
}
