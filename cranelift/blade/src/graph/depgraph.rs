//! The program dependence graph of a function.

use super::{Graph, GraphMut, Node, WeightedGraph};
use crate::inst_predicates::first_result;
use crate::weights::NodeWeights;
use cranelift_codegen::flowgraph::ControlFlowGraph;
use cranelift_codegen::ir::{Function, Inst, Value};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};

/// What a dependence graph node stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProgramPoint {
    /// An instruction.
    Inst(Inst),
    /// A block parameter.
    Param(Value),
}

/// Program points of a function connected by two edge sets.
///
/// Control edges follow program order: from each instruction to the next in
/// its block, and from a block's branch to the first instruction of every
/// successor. A control edge weighs what a fence at its destination costs.
/// Data edges go from the program point defining a value to every
/// instruction using it, and from branch arguments to the block parameters
/// they feed; they all weigh 1.
///
/// The `Graph` implementation exposes the control edges, which is where
/// fences can be placed.
pub struct DependenceGraph {
    points: PrimaryMap<Node, ProgramPoint>,
    inst_nodes: SecondaryMap<Inst, PackedOption<Node>>,
    value_nodes: SecondaryMap<Value, PackedOption<Node>>,
    control: WeightedGraph,
    data: WeightedGraph,
}

impl DependenceGraph {
    /// Build the dependence graph of `func`.
    pub fn for_function(func: &Function, cfg: &ControlFlowGraph, weights: &dyn NodeWeights) -> Self {
        let mut points: PrimaryMap<Node, ProgramPoint> = PrimaryMap::new();
        let mut inst_nodes = SecondaryMap::new();
        let mut value_nodes: SecondaryMap<Value, PackedOption<Node>> = SecondaryMap::new();
        for block in func.layout.blocks() {
            for &param in func.dfg.block_params(block) {
                let node = points.push(ProgramPoint::Param(param));
                value_nodes[param] = node.into();
            }
            for inst in func.layout.block_insts(block) {
                let node = points.push(ProgramPoint::Inst(inst));
                inst_nodes[inst] = node.into();
                if let Some(result) = first_result(func, inst) {
                    value_nodes[result] = node.into();
                }
            }
        }

        let mut control = WeightedGraph::with_nodes(points.len());
        let mut data = WeightedGraph::with_nodes(points.len());
        let node_of = |inst: Inst, inst_nodes: &SecondaryMap<Inst, PackedOption<Node>>| {
            inst_nodes[inst].expect("instruction in the layout has a node")
        };

        for block in func.layout.blocks() {
            let weight = weights.block_weight(block);
            let insts: Vec<Inst> = func.layout.block_insts(block).collect();
            for pair in insts.windows(2) {
                control.put_weight(
                    node_of(pair[0], &inst_nodes),
                    node_of(pair[1], &inst_nodes),
                    weight,
                );
            }
            if let Some(&last) = insts.last() {
                for succ in cfg.succ_iter(block) {
                    if let Some(first) = func.layout.first_inst(succ) {
                        control.put_weight(
                            node_of(last, &inst_nodes),
                            node_of(first, &inst_nodes),
                            weights.block_weight(succ),
                        );
                    }
                }
            }

            for &inst in &insts {
                let user = node_of(inst, &inst_nodes);
                for &arg in func.dfg.inst_args(inst) {
                    if let Some(def) = value_nodes[arg].expand() {
                        data.put_weight(def, user, 1);
                    }
                }
                let dests = func.dfg.insts[inst].branch_destination(&func.dfg.jump_tables);
                for dest in dests {
                    let params = func.dfg.block_params(dest.block(&func.dfg.value_lists));
                    let args = dest.args_slice(&func.dfg.value_lists);
                    for (&param, &arg) in params.iter().zip(args) {
                        if let Some(def) = value_nodes[arg].expand() {
                            data.put_weight(def, user, 1);
                            if let Some(param_node) = value_nodes[param].expand() {
                                data.put_weight(def, param_node, 1);
                            }
                        }
                    }
                }
            }
        }

        Self {
            points,
            inst_nodes,
            value_nodes,
            control,
            data,
        }
    }

    /// The program point of `node`.
    pub fn point(&self, node: Node) -> ProgramPoint {
        self.points[node]
    }

    /// The node of `inst`, if it is in the layout.
    pub fn inst_node(&self, inst: Inst) -> Option<Node> {
        self.inst_nodes[inst].expand()
    }

    /// The node defining `value`: its instruction or its block parameter.
    pub fn value_node(&self, value: Value) -> Option<Node> {
        self.value_nodes[value].expand()
    }

    /// The instruction of `node`, if it is one.
    pub fn node_inst(&self, node: Node) -> Option<Inst> {
        match self.points[node] {
            ProgramPoint::Inst(inst) => Some(inst),
            ProgramPoint::Param(_) => None,
        }
    }

    /// Iterate over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.points.keys()
    }

    /// The control edges.
    pub fn control(&self) -> &WeightedGraph {
        &self.control
    }

    /// The def-use edges.
    pub fn data(&self) -> &WeightedGraph {
        &self.data
    }
}

impl Graph for DependenceGraph {
    fn node_count(&self) -> usize {
        self.points.len()
    }

    fn weight(&self, src: Node, dst: Node) -> u64 {
        self.control.weight(src, dst)
    }

    fn successors(&self, node: Node) -> Vec<(Node, u64)> {
        self.control.successors(node)
    }

    fn predecessors(&self, node: Node) -> Vec<(Node, u64)> {
        self.control.predecessors(node)
    }
}
