//! Weighted directed graphs.
//!
//! All graphs share one interface: `weight(u, v)`, ordered successor and
//! predecessor lists, and `put_weight(u, v, w)` for the mutable ones. A
//! weight of 0 means the edge is absent, and writing an edge replaces its
//! weight. The implementations compose: a `ScopedGraph` overlays sparse
//! modifications on any graph without touching it, and a `DuplicatedGraph`
//! presents several layered copies of a graph.

use cranelift_entity::{entity_impl, EntityRef};
use std::collections::BTreeMap;

pub mod depgraph;
pub mod dot;
pub mod duplicated;
pub mod scoped;

pub use self::depgraph::{DependenceGraph, ProgramPoint};
pub use self::duplicated::DuplicatedGraph;
pub use self::scoped::ScopedGraph;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A node of a graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Node(u32);
entity_impl!(Node, "n");

/// Weight of edges that must never be cut.
pub const INFINITE_WEIGHT: u64 = u64::MAX / 4;

/// Read access to a weighted directed graph whose nodes are `0..node_count`.
pub trait Graph {
    /// Number of nodes.
    fn node_count(&self) -> usize;

    /// Weight of the edge `src -> dst`, 0 if absent.
    fn weight(&self, src: Node, dst: Node) -> u64;

    /// Outgoing edges of `node` with positive weight, by ascending target.
    fn successors(&self, node: Node) -> Vec<(Node, u64)>;

    /// Incoming edges of `node` with positive weight, by ascending source.
    fn predecessors(&self, node: Node) -> Vec<(Node, u64)>;

    /// All edges with positive weight, by ascending `(src, dst)`.
    fn edges(&self) -> Vec<(Node, Node, u64)> {
        let mut edges = Vec::new();
        for i in 0..self.node_count() {
            let src = Node::new(i);
            for (dst, w) in self.successors(src) {
                edges.push((src, dst, w));
            }
        }
        edges
    }
}

/// A graph whose edge weights can be written.
pub trait GraphMut: Graph {
    /// Set the weight of `src -> dst`. 0 removes the edge.
    fn put_weight(&mut self, src: Node, dst: Node, weight: u64);
}

impl<'a, G: Graph + ?Sized> Graph for &'a G {
    fn node_count(&self) -> usize {
        (**self).node_count()
    }

    fn weight(&self, src: Node, dst: Node) -> u64 {
        (**self).weight(src, dst)
    }

    fn successors(&self, node: Node) -> Vec<(Node, u64)> {
        (**self).successors(node)
    }

    fn predecessors(&self, node: Node) -> Vec<(Node, u64)> {
        (**self).predecessors(node)
    }
}

/// The plain adjacency-map graph.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WeightedGraph {
    succs: Vec<BTreeMap<Node, u64>>,
    preds: Vec<BTreeMap<Node, u64>>,
}

impl WeightedGraph {
    /// A graph with no nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph with `n` nodes and no edges.
    pub fn with_nodes(n: usize) -> Self {
        Self {
            succs: vec![BTreeMap::new(); n],
            preds: vec![BTreeMap::new(); n],
        }
    }

    /// Add a node and return it.
    pub fn add_node(&mut self) -> Node {
        self.succs.push(BTreeMap::new());
        self.preds.push(BTreeMap::new());
        Node::new(self.succs.len() - 1)
    }

    /// Copy every edge of `other` into a new `WeightedGraph`.
    pub fn from_graph(other: &dyn Graph) -> Self {
        let mut g = Self::with_nodes(other.node_count());
        for (src, dst, w) in other.edges() {
            g.put_weight(src, dst, w);
        }
        g
    }
}

impl Graph for WeightedGraph {
    fn node_count(&self) -> usize {
        self.succs.len()
    }

    fn weight(&self, src: Node, dst: Node) -> u64 {
        self.succs
            .get(src.index())
            .and_then(|s| s.get(&dst))
            .copied()
            .unwrap_or(0)
    }

    fn successors(&self, node: Node) -> Vec<(Node, u64)> {
        self.succs[node.index()].iter().map(|(&n, &w)| (n, w)).collect()
    }

    fn predecessors(&self, node: Node) -> Vec<(Node, u64)> {
        self.preds[node.index()].iter().map(|(&n, &w)| (n, w)).collect()
    }
}

impl GraphMut for WeightedGraph {
    fn put_weight(&mut self, src: Node, dst: Node, weight: u64) {
        if weight == 0 {
            self.succs[src.index()].remove(&dst);
            self.preds[dst.index()].remove(&src);
        } else {
            self.succs[src.index()].insert(dst, weight);
            self.preds[dst.index()].insert(src, weight);
        }
    }
}

/// Nodes reachable from `from` (inclusive) through positive-weight edges.
pub fn reachable_from<G: Graph + ?Sized>(graph: &G, from: impl IntoIterator<Item = Node>) -> Vec<bool> {
    let mut seen = vec![false; graph.node_count()];
    let mut stack: Vec<Node> = Vec::new();
    for n in from {
        if !seen[n.index()] {
            seen[n.index()] = true;
            stack.push(n);
        }
    }
    while let Some(n) = stack.pop() {
        for (succ, _) in graph.successors(n) {
            if !seen[succ.index()] {
                seen[succ.index()] = true;
                stack.push(succ);
            }
        }
    }
    seen
}

/// Nodes from which one of `to` (inclusive) is reachable.
pub fn reaching<G: Graph + ?Sized>(graph: &G, to: impl IntoIterator<Item = Node>) -> Vec<bool> {
    let mut seen = vec![false; graph.node_count()];
    let mut stack: Vec<Node> = Vec::new();
    for n in to {
        if !seen[n.index()] {
            seen[n.index()] = true;
            stack.push(n);
        }
    }
    while let Some(n) = stack.pop() {
        for (pred, _) in graph.predecessors(n) {
            if !seen[pred.index()] {
                seen[pred.index()] = true;
                stack.push(pred);
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: usize) -> Node {
        Node::new(i)
    }

    #[test]
    fn latest_write_wins() {
        let mut g = WeightedGraph::with_nodes(3);
        g.put_weight(n(0), n(1), 5);
        g.put_weight(n(0), n(1), 2);
        assert_eq!(g.weight(n(0), n(1)), 2);
        assert_eq!(g.predecessors(n(1)), [(n(0), 2)]);
        g.put_weight(n(0), n(1), 0);
        assert_eq!(g.weight(n(0), n(1)), 0);
        assert!(g.successors(n(0)).is_empty());
        assert!(g.predecessors(n(1)).is_empty());
    }

    #[test]
    fn ordered_adjacency_and_reachability() {
        let mut g = WeightedGraph::new();
        let a = g.add_node();
        let b = g.add_node();
        let c = g.add_node();
        let d = g.add_node();
        g.put_weight(a, c, 1);
        g.put_weight(a, b, 1);
        g.put_weight(b, d, 1);
        assert_eq!(g.successors(a), [(b, 1), (c, 1)]);
        assert_eq!(g.edges(), [(a, b, 1), (a, c, 1), (b, d, 1)]);
        assert_eq!(reachable_from(&g, [b]), [false, true, false, true]);
        assert_eq!(reaching(&g, [d]), [true, true, false, true]);
        assert_eq!(WeightedGraph::from_graph(&g), g);
    }
}
