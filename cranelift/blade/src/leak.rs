//! Transmitters: which operands of an instruction are observable.
//!
//! A *true* transmission is observable whatever the data: the address of a
//! memory access, the condition of a branch, the target of an indirect
//! call. A *pseudo* transmission only becomes observable later, e.g. a
//! stored value that may be read back through an out-of-bounds access, or
//! an argument handed to code we cannot see.

use crate::alias::{load_address, store_operands};
use crate::def_use::{DefUseGraph, ValueUse};
use crate::inst_predicates::{first_result, has_fence_before};
use crate::intrinsics::{Intrinsic, Intrinsics};
use crate::policy::{IntrinsicLeak, IntrinsicPolicy};
use crate::result::{BladeError, BladeResult};
use crate::taint::PublicValues;
use cranelift_codegen::ir::{Function, Inst, InstructionData, Opcode, Value};
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// How an operand is transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransmitKind {
    /// Always observable.
    True,
    /// Observable only under additional conditions.
    Pseudo,
}

/// Transmitted operands of one instruction, in operand order.
pub type Transmitters = SmallVec<[(Value, TransmitKind); 4]>;

/// The transmitted operands of `inst` according to the policy table.
///
/// Benign intrinsics transmit nothing. Unknown intrinsics are an error.
pub fn transmitter_operands(
    func: &Function,
    intrinsics: &Intrinsics,
    inst: Inst,
) -> BladeResult<Transmitters> {
    use TransmitKind::*;
    let mut out = Transmitters::new();
    if let Some(addr) = load_address(func, inst) {
        out.push((addr, True));
        return Ok(out);
    }
    if let Some((data, addr)) = store_operands(func, inst) {
        out.push((data, Pseudo));
        out.extend(addr.map(|addr| (addr, True)));
        return Ok(out);
    }
    let data = &func.dfg.insts[inst];
    let args = func.dfg.inst_args(inst);
    match *data {
        InstructionData::Brif { arg, .. } | InstructionData::BranchTable { arg, .. } => {
            out.push((arg, True))
        }
        InstructionData::CondTrap { arg, .. } => out.push((arg, True)),
        InstructionData::CallIndirect { .. } => {
            if let Some((&callee, rest)) = args.split_first() {
                out.push((callee, True));
                out.extend(rest.iter().map(|&v| (v, Pseudo)));
            }
        }
        InstructionData::Call { .. } => match intrinsics.called_by(func, inst) {
            Some(intrinsic) => match IntrinsicPolicy::for_intrinsic(intrinsic).leak {
                IntrinsicLeak::AllArgs => out.extend(args.iter().map(|&v| (v, True))),
                IntrinsicLeak::Fill => {
                    for (i, &v) in args.iter().enumerate() {
                        out.push((v, if i == 1 { Pseudo } else { True }));
                    }
                }
                IntrinsicLeak::Address => out.extend(args.first().map(|&v| (v, True))),
                IntrinsicLeak::Nothing | IntrinsicLeak::Benign => {}
                IntrinsicLeak::Unknown => {
                    return Err(BladeError::UnhandledIntrinsic {
                        func: func.name.to_string(),
                        inst,
                        intrinsic,
                    })
                }
            },
            None => out.extend(args.iter().map(|&v| (v, Pseudo))),
        },
        _ if data.opcode() == Opcode::Return => out.extend(args.iter().map(|&v| (v, Pseudo))),
        _ => {}
    }
    Ok(out)
}

/// Classifies transmitters for one function, warning once per benign
/// intrinsic kind it sees.
#[derive(Debug, Default)]
pub struct LeakClassifier {
    warned: BTreeSet<Intrinsic>,
}

impl LeakClassifier {
    /// A classifier that has not warned yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The transmitted operands of `inst`.
    pub fn transmitter_operands(
        &mut self,
        func: &Function,
        intrinsics: &Intrinsics,
        inst: Inst,
    ) -> BladeResult<Transmitters> {
        if let Some(intrinsic) = intrinsics.called_by(func, inst) {
            if IntrinsicPolicy::for_intrinsic(intrinsic).leak == IntrinsicLeak::Benign
                && self.warned.insert(intrinsic)
            {
                log::warn!(
                    "{}: treating intrinsic {} as non-transmitting",
                    func.name,
                    intrinsic
                );
            }
        }
        transmitter_operands(func, intrinsics, inst)
    }
}

fn is_true_transmission(func: &Function, intrinsics: &Intrinsics, inst: Inst, value: Value) -> bool {
    match transmitter_operands(func, intrinsics, inst) {
        Ok(ops) => ops.contains(&(value, TransmitKind::True)),
        Err(_) => true,
    }
}

/// Can `value` reach a true-transmitter operand through def-use chains
/// that do not pass through an instruction preceded by a fence?
pub fn may_leak(
    func: &Function,
    intrinsics: &Intrinsics,
    def_use: &DefUseGraph,
    value: Value,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![value];
    seen.insert(value);
    while let Some(v) = stack.pop() {
        for val_use in def_use.uses_of_val(v) {
            match *val_use {
                ValueUse::Inst(inst) => {
                    if has_fence_before(func, inst) {
                        continue;
                    }
                    if is_true_transmission(func, intrinsics, inst, v) {
                        return true;
                    }
                    if let Some(result) = first_result(func, inst) {
                        if def_use.dependencies_of_val(result).any(|dep| dep == v)
                            && seen.insert(result)
                        {
                            stack.push(result);
                        }
                    }
                }
                ValueUse::Value(param) => {
                    if seen.insert(param) {
                        stack.push(param);
                    }
                }
            }
        }
    }
    false
}

/// Is `value` transmitted, or derived from transmitted data, without
/// speculation? A speculative transmission of such a value reveals
/// nothing new.
pub fn nonspeculative_leak(public: &PublicValues, value: Value) -> bool {
    public.is_public(value)
}
