//! Node weights: the estimated cost of putting a fence in front of a program
//! point.

use cranelift_codegen::dominator_tree::DominatorTree;
use cranelift_codegen::flowgraph::ControlFlowGraph;
use cranelift_codegen::ir::{Block, Function};
use cranelift_codegen::loop_analysis::LoopAnalysis;
use cranelift_entity::SecondaryMap;

/// Estimates the cost of executing a fence placed at the top of a block.
pub trait NodeWeights {
    /// Weight of a fence placed in `block`. Never 0.
    fn block_weight(&self, block: Block) -> u64;
}

/// Weights every block the same.
#[derive(Clone, Copy, Debug)]
pub struct UniformWeights(pub u64);

impl NodeWeights for UniformWeights {
    fn block_weight(&self, _block: Block) -> u64 {
        self.0.max(1)
    }
}

/// Execution frequency estimate from the loop nest and the dominator tree.
///
/// `w = max(1, base * (loop_depth + 1) / (dom_depth + 1))`: a fence inside
/// a loop runs more often, a fence deep in the dominator tree runs on fewer
/// paths.
pub struct FrequencyWeights {
    weights: SecondaryMap<Block, u64>,
}

impl FrequencyWeights {
    /// Compute the weights of every block of `func`.
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, base: u64) -> Self {
        let domtree = DominatorTree::with_function(func, cfg);
        let mut loops = LoopAnalysis::new();
        loops.compute(func, cfg, &domtree);
        let reachable: Vec<Block> = func
            .layout
            .blocks()
            .filter(|&block| domtree.is_reachable(block))
            .collect();
        let mut weights = SecondaryMap::with_default(1);
        for &block in &reachable {
            let loop_factor = loop_depth(&loops, block) + 1;
            let dominators = reachable
                .iter()
                .filter(|&&other| other != block && domtree.dominates(other, block, &func.layout))
                .count();
            let dom_factor = u64::try_from(dominators).unwrap_or(u64::MAX).saturating_add(1);
            weights[block] = (base.saturating_mul(loop_factor) / dom_factor).max(1);
        }
        Self { weights }
    }
}

/// Number of loops containing `block`.
fn loop_depth(loops: &LoopAnalysis, block: Block) -> u64 {
    let mut depth = 0;
    let mut lp = loops.innermost_loop(block);
    while let Some(l) = lp {
        depth += 1;
        lp = loops.loop_parent(l);
    }
    depth
}

impl NodeWeights for FrequencyWeights {
    fn block_weight(&self, block: Block) -> u64 {
        self.weights[block]
    }
}
