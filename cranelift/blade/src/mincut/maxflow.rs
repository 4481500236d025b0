//! Maximum flow and minimum cuts, computed by `rs_graph`.

use super::{CancelFlag, CutEdge, WaypointGroup};
use crate::graph::{DuplicatedGraph, Graph, Node, INFINITE_WEIGHT};
use crate::result::{BladeError, BladeResult};
use cranelift_entity::EntityRef;
use rs_graph::linkedlistgraph::{Edge, LinkedListGraph, Node as FlowNode};
use rs_graph::maxflow::edmondskarp::EdmondsKarp;
use rs_graph::maxflow::MaxFlow;
use rs_graph::Buildable;
use rs_graph::Builder;
use std::collections::{BTreeSet, HashMap};

/// A minimum cut between two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinCut {
    /// Total weight of the cut, which is the value of the maximum flow.
    pub value: u64,
    /// Edges from the source side to the sink side, by ascending
    /// `(src, dst)`.
    pub edges: Vec<(Node, Node)>,
}

/// A copy of a `Graph` in `rs_graph`'s representation.
struct FlowGraph {
    graph: LinkedListGraph<usize>,
    /// The flow node of each of our nodes, by index.
    nodes: Vec<FlowNode<usize>>,
    /// Our node of each flow node.
    back: HashMap<FlowNode<usize>, Node>,
    /// Capacity of each flow edge.
    capacity: HashMap<Edge<usize>, usize>,
    /// The edges of the input, with their weights.
    edges: Vec<(Node, Node, u64)>,
}

impl FlowGraph {
    /// Materialize `graph`. Infinite edges get a capacity larger than the
    /// total of all finite ones, so that no finite cut ever prefers them.
    fn build<G: Graph + ?Sized>(graph: &G) -> Self {
        let edges = graph.edges();
        let finite_total = edges
            .iter()
            .filter(|&&(_, _, w)| w < INFINITE_WEIGHT)
            .fold(0u64, |acc, &(_, _, w)| acc.saturating_add(w));
        let infinite = usize::try_from(finite_total.saturating_add(1)).unwrap_or(usize::MAX / 2);

        let mut builder = <LinkedListGraph<usize> as Buildable>::Builder::new();
        let nodes: Vec<FlowNode<usize>> =
            (0..graph.node_count()).map(|_| builder.add_node()).collect();
        let back = nodes
            .iter()
            .enumerate()
            .map(|(i, &node)| (node, Node::new(i)))
            .collect();
        let mut capacity = HashMap::with_capacity(edges.len());
        for &(src, dst, weight) in &edges {
            let edge = builder.add_edge(nodes[src.index()], nodes[dst.index()]);
            let cap = if weight >= INFINITE_WEIGHT {
                infinite
            } else {
                usize::try_from(weight).unwrap_or(infinite)
            };
            capacity.insert(edge, cap);
        }

        Self {
            graph: builder.to_graph(),
            nodes,
            back,
            capacity,
            edges,
        }
    }
}

/// A minimum cut separating `sink` from `source` in `graph`.
///
/// The source side of the cut is the set of nodes still reachable from
/// `source` once a maximum flow saturates the graph, so among all minimum
/// cuts this is the one closest to the source. `graph` itself is never
/// modified. Fails with `UnboundedFlow` when every separating cut needs an
/// infinite edge.
pub fn min_cut<G: Graph + ?Sized>(
    graph: &G,
    source: Node,
    sink: Node,
    cancel: &CancelFlag,
) -> BladeResult<MinCut> {
    cancel.check()?;
    let flow_graph = FlowGraph::build(graph);
    let capacity = &flow_graph.capacity;

    let mut maxflow = EdmondsKarp::<LinkedListGraph<usize>, usize>::new(&flow_graph.graph);
    maxflow.solve(
        flow_graph.nodes[source.index()],
        flow_graph.nodes[sink.index()],
        |e| capacity[&e],
    );
    cancel.check()?;

    // `mincut` is the set of nodes reachable from the source in the
    // residual graph; the cut edges leave it.
    let source_side: BTreeSet<Node> = maxflow
        .mincut()
        .into_iter()
        .filter_map(|node| flow_graph.back.get(&node).copied())
        .collect();
    let mut value: u64 = 0;
    let mut edges = Vec::new();
    for &(src, dst, weight) in &flow_graph.edges {
        if source_side.contains(&src) && !source_side.contains(&dst) {
            if weight >= INFINITE_WEIGHT {
                return Err(BladeError::UnboundedFlow);
            }
            value = value.saturating_add(weight);
            edges.push((src, dst));
        }
    }
    crate::trace!(
        "max-flow {} -> {}: value {}, {} cut edges",
        source,
        sink,
        value,
        edges.len()
    );
    Ok(MinCut { value, edges })
}

/// A minimum cut of `graph` separating one group.
///
/// The stages are narrowed by reachability first; a group no walk
/// satisfies needs no cut. Otherwise the cut is computed on a layered copy
/// of `graph` with one copy per stage transition, and each layered cut edge
/// is projected back to its base edge.
pub fn min_cut_group<G: Graph>(
    graph: G,
    group: &WaypointGroup,
    cancel: &CancelFlag,
) -> BladeResult<Vec<CutEdge>> {
    let stages = match group.narrow(&graph) {
        Some(stages) => stages,
        None => return Ok(Vec::new()),
    };
    let layered = DuplicatedGraph::layered(graph, &stages);
    let flow = min_cut(&layered, layered.source(), layered.sink(), cancel)?;
    let mut cut = BTreeSet::new();
    for &(src, dst) in &flow.edges {
        if let (Some((cu, u)), Some((cv, v))) = (layered.project(src), layered.project(dst)) {
            if cu == cv {
                cut.insert(CutEdge::new(u, v));
            }
        }
    }
    crate::trace!(
        "group {} cut with flow {} over {} copies: {} edges",
        group,
        flow.value,
        layered.copies(),
        cut.len()
    );
    Ok(cut.into_iter().collect())
}
