//! Turning cut edges into fences.

use crate::graph::DependenceGraph;
use crate::inst_predicates::{has_fence_before, is_fence, starts_with_fence, terminator};
use crate::mincut::CutEdge;
use crate::settings::BladeType;
use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::flowgraph::ControlFlowGraph;
use cranelift_codegen::ir::{Block, BlockCall, Function, Inst, InstBuilder, Type, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a fence was inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertionPoint {
    /// Immediately before an existing instruction.
    Before(Inst),
    /// First in `block`, created by splitting the control flow edge
    /// `from -> to`.
    EdgeBlock {
        /// The new block.
        block: Block,
        /// The block the edge leaves.
        from: Block,
        /// The block the edge enters.
        to: Block,
    },
}

/// A fence inserted into the function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mitigation {
    /// The fence instruction.
    pub fence: Inst,
    /// Where it was put.
    pub point: InsertionPoint,
}

impl fmt::Display for Mitigation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.point {
            InsertionPoint::Before(inst) => write!(f, "{} before {}", self.fence, inst),
            InsertionPoint::EdgeBlock { block, from, to } => {
                write!(f, "{} in {} on {} -> {}", self.fence, block, from, to)
            }
        }
    }
}

/// Inserts fences into a function, at most one per insertion point.
pub struct MitigationPlacer<'a> {
    func: &'a mut Function,
    cfg: ControlFlowGraph,
    blade_type: BladeType,
    /// Block edges split so far, and the block now carrying each.
    split: BTreeMap<(Block, Block), Block>,
    placed: Vec<Mitigation>,
}

impl<'a> MitigationPlacer<'a> {
    /// A placer for `func`. Only `lfence_per_block` changes where fences
    /// go; every other type fences exactly at the cut.
    pub fn new(func: &'a mut Function, blade_type: BladeType) -> Self {
        let cfg = ControlFlowGraph::with_function(func);
        Self {
            func,
            cfg,
            blade_type,
            split: BTreeMap::new(),
            placed: Vec::new(),
        }
    }

    /// Cut every edge of `cut`, which are control edges of `graph`.
    ///
    /// `graph` must have been built from the function before any fence
    /// was placed; instructions keep their identity across placement.
    pub fn place(&mut self, graph: &DependenceGraph, cut: &[CutEdge]) {
        for edge in cut {
            let (src, dst) = match (graph.node_inst(edge.src), graph.node_inst(edge.dst)) {
                (Some(src), Some(dst)) => (src, dst),
                _ => {
                    log::warn!("{}: cut edge {} does not join two instructions", self.func.name, edge);
                    continue;
                }
            };
            self.cut_between(src, dst);
        }
    }

    /// Stop speculation along the control flow from `src` to `dst`.
    pub fn cut_between(&mut self, src: Inst, dst: Inst) {
        if self.blade_type == BladeType::LfencePerBlock {
            let top = first_inst_of_linear_block(self.func, dst);
            self.fence_before(top);
            return;
        }
        let (src_block, dst_block) = match (
            self.func.layout.inst_block(src),
            self.func.layout.inst_block(dst),
        ) {
            (Some(s), Some(d)) => (s, d),
            _ => return,
        };
        // A branch to the top of a block, possibly its own.
        let block_edge = terminator(self.func, src_block) == Some(src)
            && self.func.layout.first_inst(dst_block) == Some(dst);
        let sole_path = self.cfg.succ_iter(src_block).count() == 1
            && self.predecessor_blocks(dst_block) == 1;
        if !block_edge || sole_path {
            self.fence_before(dst);
        } else {
            self.fence_on_edge(src_block, dst_block);
        }
    }

    /// Insert a fence right after `inst`, which must not end its block.
    pub fn fence_after(&mut self, inst: Inst) {
        if let Some(next) = self.func.layout.next_inst(inst) {
            self.fence_before(next);
        }
    }

    /// Insert a fence before `inst` unless one is already there.
    pub fn fence_before(&mut self, inst: Inst) {
        if is_fence(self.func, inst) || has_fence_before(self.func, inst) {
            return;
        }
        let fence = FuncCursor::new(self.func).at_inst(inst).ins().fence();
        crate::trace!("inserting fence before {}", inst);
        self.placed.push(Mitigation {
            fence,
            point: InsertionPoint::Before(inst),
        });
    }

    /// Split `from -> to` and put a fence first in the new block. Each
    /// block edge is split once.
    fn fence_on_edge(&mut self, from: Block, to: Block) {
        if self.split.contains_key(&(from, to)) || self.already_split(from, to) {
            return;
        }
        if !self.cfg.succ_iter(from).any(|succ| succ == to) {
            log::warn!("{}: no control flow edge {} -> {}", self.func.name, from, to);
            return;
        }
        let block = match split_edge(self.func, from, to) {
            Some(block) => block,
            None => return,
        };
        self.cfg.compute(self.func);
        self.split.insert((from, to), block);
        let fence = FuncCursor::new(self.func).at_first_inst(block).ins().fence();
        crate::trace!("split {} -> {} with {}, fenced by {}", from, to, block, fence);
        self.placed.push(Mitigation {
            fence,
            point: InsertionPoint::EdgeBlock { block, from, to },
        });
    }

    /// Was `from -> to` split and fenced by an earlier placement?
    fn already_split(&self, from: Block, to: Block) -> bool {
        self.cfg.succ_iter(from).any(|mid| {
            mid != to
                && starts_with_fence(self.func, mid)
                && self.cfg.succ_iter(mid).eq([to])
                && self.predecessor_blocks(mid) == 1
        })
    }

    /// Number of distinct blocks branching to `block`.
    fn predecessor_blocks(&self, block: Block) -> usize {
        self.cfg
            .pred_iter(block)
            .map(|pred| pred.block)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Number of control flow edges split so far.
    pub fn edges_split(&self) -> usize {
        self.split.len()
    }

    /// The fences inserted so far, in insertion order.
    pub fn mitigations(&self) -> &[Mitigation] {
        &self.placed
    }

    /// Finish, returning the inserted fences.
    pub fn finish(self) -> Vec<Mitigation> {
        self.placed
    }
}

/// Place fences on every edge of `cut`.
pub fn place_mitigations(
    func: &mut Function,
    graph: &DependenceGraph,
    cut: &[CutEdge],
    blade_type: BladeType,
) -> Vec<Mitigation> {
    let mut placer = MitigationPlacer::new(func, blade_type);
    placer.place(graph, cut);
    placer.finish()
}

/// Split the control flow edge `from -> to`.
///
/// A new block holding a single `jump` to `to` is placed after `from`, and
/// every destination of `from`'s terminator naming `to` is retargeted to
/// it. When all those destinations pass the same arguments, the jump
/// carries them directly; otherwise the new block takes parameters
/// mirroring `to`'s and forwards them.
///
/// Returns `None`, leaving `func` untouched, if `from` does not branch to
/// `to`.
pub fn split_edge(func: &mut Function, from: Block, to: Block) -> Option<Block> {
    let branch = terminator(func, from)?;
    let arg_sets: Vec<Vec<Value>> = func.dfg.insts[branch]
        .branch_destination(&func.dfg.jump_tables)
        .iter()
        .filter(|dest| dest.block(&func.dfg.value_lists) == to)
        .map(|dest| dest.args_slice(&func.dfg.value_lists).to_vec())
        .collect();
    let first = arg_sets.first()?.clone();

    let new_block = func.dfg.make_block();
    let uniform = arg_sets.iter().all(|args| *args == first);
    let forwarded: Vec<Value> = if uniform {
        first
    } else {
        let types: Vec<Type> = func
            .dfg
            .block_params(to)
            .iter()
            .map(|&param| func.dfg.value_type(param))
            .collect();
        types
            .into_iter()
            .map(|ty| func.dfg.append_block_param(new_block, ty))
            .collect()
    };

    let dfg = &mut func.dfg;
    for dest in dfg.insts[branch].branch_destination_mut(&mut dfg.jump_tables) {
        if dest.block(&dfg.value_lists) != to {
            continue;
        }
        let args = if uniform {
            Vec::new()
        } else {
            dest.args_slice(&dfg.value_lists).to_vec()
        };
        *dest = BlockCall::new(new_block, &args, &mut dfg.value_lists);
    }

    func.layout.insert_block_after(new_block, from);
    FuncCursor::new(func)
        .at_bottom(new_block)
        .ins()
        .jump(to, &forwarded);
    Some(new_block)
}

/// Get the first instruction of the linear block containing `inst`.
///
/// Linear blocks are finer than the function's blocks: every branch and
/// every call ends one.
pub fn first_inst_of_linear_block(func: &Function, inst: Inst) -> Inst {
    let mut cur = inst;
    while let Some(prev) = func.layout.prev_inst(cur) {
        let opcode = func.dfg.insts[prev].opcode();
        if opcode.is_call() || opcode.is_branch() {
            break;
        }
        cur = prev;
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::weights::UniformWeights;
    use cranelift_codegen::ir::{
        types, AbiParam, ExtFuncData, ExternalName, MemFlags, Opcode, Signature,
    };
    use cranelift_codegen::isa::CallConv;

    /// `block0` branches to `block1` and `block2`; `block1` jumps to
    /// `block2`, which loads and returns.
    fn two_preds() -> (Function, [Block; 3], Inst, Inst) {
        let mut func = Function::new();
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        let block2 = func.dfg.make_block();
        let c = func.dfg.append_block_param(block0, types::I32);
        let p = func.dfg.append_block_param(block0, types::I64);
        let (brif, load);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            brif = pos.ins().brif(c, block2, &[], block1, &[]);
            pos.insert_block(block1);
            pos.ins().jump(block2, &[]);
            pos.insert_block(block2);
            let v = pos.ins().load(types::I64, MemFlags::new(), p, 0);
            load = pos.func.dfg.value_def(v).unwrap_inst();
            pos.ins().return_(&[v]);
        }
        (func, [block0, block1, block2], brif, load)
    }

    fn cut_edge(graph: &DependenceGraph, src: Inst, dst: Inst) -> CutEdge {
        let edge = CutEdge::new(graph.inst_node(src).unwrap(), graph.inst_node(dst).unwrap());
        assert!(graph.weight(edge.src, edge.dst) > 0);
        edge
    }

    fn dests(func: &Function, inst: Inst) -> Vec<(Block, Vec<Value>)> {
        func.dfg.insts[inst]
            .branch_destination(&func.dfg.jump_tables)
            .iter()
            .map(|dest| {
                (
                    dest.block(&func.dfg.value_lists),
                    dest.args_slice(&func.dfg.value_lists).to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn split_edge_with_shared_args() {
        let mut func = Function::new();
        let b0 = func.dfg.make_block();
        let b1 = func.dfg.make_block();
        let b2 = func.dfg.make_block();
        let x = func.dfg.append_block_param(b0, types::I64);
        let p = func.dfg.append_block_param(b2, types::I64);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(b0);
            pos.ins().brif(x, b1, &[], b2, &[x]);
            pos.insert_block(b1);
            pos.ins().jump(b2, &[x]);
            pos.insert_block(b2);
            pos.ins().return_(&[p]);
        }

        let new_block = split_edge(&mut func, b0, b2).unwrap();
        assert_eq!(
            func.layout.blocks().collect::<Vec<_>>(),
            [b0, new_block, b1, b2]
        );
        let brif = terminator(&func, b0).unwrap();
        assert_eq!(dests(&func, brif), [(b1, vec![]), (new_block, vec![])]);
        let jump = terminator(&func, new_block).unwrap();
        assert_eq!(dests(&func, jump), [(b2, vec![x])]);
        assert!(func.dfg.block_params(new_block).is_empty());
        // no edge b1 -> b0
        assert_eq!(split_edge(&mut func, b1, b0), None);
        assert_eq!(func.layout.blocks().count(), 4);
    }

    #[test]
    fn split_edge_with_diverging_args() {
        let mut func = Function::new();
        let b0 = func.dfg.make_block();
        let b1 = func.dfg.make_block();
        let x = func.dfg.append_block_param(b0, types::I64);
        let y = func.dfg.append_block_param(b0, types::I64);
        let p = func.dfg.append_block_param(b1, types::I64);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(b0);
            pos.ins().brif(x, b1, &[x], b1, &[y]);
            pos.insert_block(b1);
            pos.ins().return_(&[p]);
        }

        let new_block = split_edge(&mut func, b0, b1).unwrap();
        let params = func.dfg.block_params(new_block).to_vec();
        assert_eq!(params.len(), 1);
        assert_eq!(func.dfg.value_type(params[0]), types::I64);
        let brif = terminator(&func, b0).unwrap();
        assert_eq!(
            dests(&func, brif),
            [(new_block, vec![x]), (new_block, vec![y])]
        );
        let jump = terminator(&func, new_block).unwrap();
        assert_eq!(dests(&func, jump), [(b1, params)]);
    }

    #[test]
    fn edge_into_join_is_split() {
        let (mut func, [block0, _, block2], brif, load) = two_preds();
        let cfg = ControlFlowGraph::with_function(&func);
        let graph = DependenceGraph::for_function(&func, &cfg, &UniformWeights(1));
        let cut = [cut_edge(&graph, brif, load)];

        let placed = place_mitigations(&mut func, &graph, &cut, BladeType::Lfence);
        assert_eq!(placed.len(), 1);
        let block = match placed[0].point {
            InsertionPoint::EdgeBlock { block, from, to } => {
                assert_eq!((from, to), (block0, block2));
                block
            }
            other => panic!("expected an edge block, got {:?}", other),
        };
        assert_eq!(func.layout.first_inst(block), Some(placed[0].fence));
        assert!(is_fence(&func, placed[0].fence));
        let cfg = ControlFlowGraph::with_function(&func);
        let preds: Vec<Block> = cfg.pred_iter(block).map(|p| p.block).collect();
        assert_eq!(preds, [block0]);
        assert_eq!(cfg.succ_iter(block).collect::<Vec<_>>(), [block2]);
        // the load itself is untouched, its other path has no fence
        assert!(!has_fence_before(&func, load));
        let jump = func.layout.last_inst(block).unwrap();
        assert_eq!(func.dfg.insts[jump].opcode(), Opcode::Jump);

        // placing the same cut again changes nothing
        let again = place_mitigations(&mut func, &graph, &cut, BladeType::Lfence);
        assert!(again.is_empty());
        assert_eq!(func.layout.blocks().count(), 4);
        let mut placer = MitigationPlacer::new(&mut func, BladeType::Lfence);
        placer.cut_between(brif, load);
        assert_eq!(placer.edges_split(), 0);
        assert!(placer.mitigations().is_empty());
    }

    #[test]
    fn straight_line_fences_before_destination() {
        let (mut func, [_, block1, block2], _, load) = two_preds();
        let jump = func.layout.first_inst(block1).unwrap();
        let ret = func.layout.last_inst(block2).unwrap();
        let mut placer = MitigationPlacer::new(&mut func, BladeType::Lfence);
        placer.cut_between(load, ret);
        placer.cut_between(load, ret);
        assert_eq!(placer.mitigations().len(), 1);
        assert_eq!(placer.mitigations()[0].point, InsertionPoint::Before(ret));
        // jump -> load crosses into a block with two predecessors
        placer.cut_between(jump, load);
        assert_eq!(placer.edges_split(), 1);
        let placed = placer.finish();
        assert_eq!(placed.len(), 2);
        assert!(has_fence_before(&func, ret));
    }

    #[test]
    fn linear_blocks() {
        let mut func = Function::new();
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(types::I64));
        let signature = func.import_signature(sig);
        let callee = func.import_function(ExtFuncData {
            name: ExternalName::testcase("callee"),
            signature,
            colocated: false,
        });
        let block0 = func.dfg.make_block();
        let p = func.dfg.append_block_param(block0, types::I64);
        let (first, call, add, load);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            let v = pos.ins().load(types::I64, MemFlags::new(), p, 0);
            first = pos.func.dfg.value_def(v).unwrap_inst();
            call = pos.ins().call(callee, &[v]);
            let a = pos.ins().iadd(v, v);
            add = pos.func.dfg.value_def(a).unwrap_inst();
            let w = pos.ins().load(types::I64, MemFlags::new(), a, 0);
            load = pos.func.dfg.value_def(w).unwrap_inst();
            pos.ins().return_(&[w]);
        }
        assert_eq!(first_inst_of_linear_block(&func, load), add);
        assert_eq!(first_inst_of_linear_block(&func, call), first);

        let mut placer = MitigationPlacer::new(&mut func, BladeType::LfencePerBlock);
        placer.cut_between(add, load);
        placer.cut_between(call, add);
        assert_eq!(placer.mitigations().len(), 1);
        assert_eq!(placer.mitigations()[0].point, InsertionPoint::Before(add));

        placer.fence_after(first);
        let placed = placer.finish();
        assert_eq!(placed.len(), 2);
        assert!(has_fence_before(&func, call));
    }
}
