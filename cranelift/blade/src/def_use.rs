//! Value-level def-use graph.

use cranelift_codegen::flowgraph::ControlFlowGraph;
use cranelift_codegen::ir::{Function, Inst, Value};
use cranelift_entity::SecondaryMap;

/// Maps each value to the places that use it, and each value to the values
/// it is computed from.
pub struct DefUseGraph {
    /// Maps a value to its uses
    map: SecondaryMap<Value, Vec<ValueUse>>,
    /// Inverse map: map a value to the values it uses
    inverse_map: SecondaryMap<Value, Vec<Value>>,
}

/// Describes a way in which a given `Value` is used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueUse {
    /// This `Inst` uses the `Value` as an operand
    Inst(Inst),
    /// The `Value` is passed along a branch to this block parameter
    Value(Value),
}

impl DefUseGraph {
    /// Create a `DefUseGraph` for the given `Function`.
    ///
    /// `call_edges`: if `true`, then for call instructions, the result of
    /// the instruction (i.e., the return value) is considered to depend on
    /// each of the call arguments. If `false`, the result of a call depends
    /// on nothing. The call itself is still recorded as a use of its
    /// arguments either way.
    pub fn for_function(func: &Function, cfg: &ControlFlowGraph, call_edges: bool) -> Self {
        let mut map: SecondaryMap<Value, Vec<ValueUse>> =
            SecondaryMap::with_capacity(func.dfg.num_values());
        let mut inverse_map: SecondaryMap<Value, Vec<Value>> =
            SecondaryMap::with_capacity(func.dfg.num_values());

        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                let opaque = !call_edges && func.dfg.insts[inst].opcode().is_call();
                let results = func.dfg.inst_results(inst);
                for &arg in func.dfg.inst_args(inst) {
                    if !map[arg].contains(&ValueUse::Inst(inst)) {
                        map[arg].push(ValueUse::Inst(inst));
                    }
                    if opaque {
                        continue;
                    }
                    for &result in results {
                        inverse_map[result].push(arg);
                    }
                }
            }
            // Each block parameter is a use of the corresponding argument of
            // every branch which can feed this block.
            for pred in cfg.pred_iter(block) {
                let params = func.dfg.block_params(block);
                let dests = func.dfg.insts[pred.inst].branch_destination(&func.dfg.jump_tables);
                for dest in dests {
                    if dest.block(&func.dfg.value_lists) != block {
                        continue;
                    }
                    let args = dest.args_slice(&func.dfg.value_lists);
                    debug_assert_eq!(args.len(), params.len());
                    for (&param, &arg) in params.iter().zip(args) {
                        map[arg].push(ValueUse::Value(param));
                        inverse_map[param].push(arg);
                    }
                }
            }
        }

        Self { map, inverse_map }
    }

    /// Iterate over all the uses of the given `Value`
    pub fn uses_of_val(&self, val: Value) -> impl Iterator<Item = &ValueUse> {
        self.map[val].iter()
    }

    /// Iterate over all the values which the given `Value` is computed from
    pub fn dependencies_of_val(&self, val: Value) -> impl Iterator<Item = Value> + '_ {
        self.inverse_map[val].iter().copied()
    }

    /// Iterate over the values which directly depend on `val`: results of
    /// instructions using it and block parameters it flows into. With
    /// `call_edges` off, results of calls are skipped.
    pub fn dependents_of_val<'s>(
        &'s self,
        func: &'s Function,
        val: Value,
    ) -> impl Iterator<Item = Value> + 's {
        self.uses_of_val(val).flat_map(move |val_use| match *val_use {
            ValueUse::Inst(inst) => func
                .dfg
                .inst_results(inst)
                .first()
                .copied()
                .filter(|&result| self.inverse_map[result].contains(&val)),
            ValueUse::Value(param) => Some(param),
        })
    }
}
