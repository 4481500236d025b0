//! Instruction and block predicates used when placing fences.

use cranelift_codegen::ir::{Block, Function, Inst, Opcode, Value};

/// Is `inst` a speculation barrier?
pub fn is_fence(func: &Function, inst: Inst) -> bool {
    func.dfg.insts[inst].opcode() == Opcode::Fence
}

/// Is the instruction immediately before `inst` a fence?
pub fn has_fence_before(func: &Function, inst: Inst) -> bool {
    func.layout
        .prev_inst(inst)
        .map_or(false, |prev| is_fence(func, prev))
}

/// Does `block` start with a fence?
pub fn starts_with_fence(func: &Function, block: Block) -> bool {
    func.layout
        .first_inst(block)
        .map_or(false, |first| is_fence(func, first))
}

/// The terminator of `block`, if the block ends with one.
pub fn terminator(func: &Function, block: Block) -> Option<Inst> {
    func.layout
        .last_inst(block)
        .filter(|&inst| func.dfg.insts[inst].opcode().is_terminator())
}

/// The first result of `inst`, if it has any.
pub fn first_result(func: &Function, inst: Inst) -> Option<Value> {
    func.dfg.inst_results(inst).first().copied()
}
