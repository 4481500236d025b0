//! A layered view of a graph, used to cut walks through ordered waypoints.

use super::{Graph, Node, INFINITE_WEIGHT};
use cranelift_entity::EntityRef;
use std::collections::BTreeSet;

/// `copies` copies of a base graph with `n` nodes, plus a super source and
/// a super sink.
///
/// Node `c * n + v` is copy `c` of base node `v`; the super source is
/// `copies * n` and the super sink `copies * n + 1`. Copy `c` holds the
/// walks that have visited stages `0..=c` and look for stage `c + 1`.
/// Infinite edges lead from the super source into copy 0 at the nodes of
/// stage 0, from copy `c` to copy `c + 1` at the nodes of stage `c + 1`,
/// and from the last copy at the nodes of the last stage into the super
/// sink. A cut separating the super source from the super sink projects
/// back to a set of base edges that every satisfying walk crosses.
#[derive(Clone, Debug)]
pub struct DuplicatedGraph<G: Graph> {
    base: G,
    n: usize,
    copies: usize,
    entry: BTreeSet<Node>,
    links: Vec<BTreeSet<Node>>,
    exit: BTreeSet<Node>,
}

impl<G: Graph> DuplicatedGraph<G> {
    /// Layer `base` along `stages`, which must have at least two entries.
    pub fn layered(base: G, stages: &[BTreeSet<Node>]) -> Self {
        assert!(stages.len() >= 2, "a layered graph needs two stages");
        let n = base.node_count();
        let copies = stages.len() - 1;
        Self {
            base,
            n,
            copies,
            entry: stages[0].clone(),
            links: stages[1..copies].to_vec(),
            exit: stages[copies].clone(),
        }
    }

    /// Number of copies of the base graph.
    pub fn copies(&self) -> usize {
        self.copies
    }

    /// The super source.
    pub fn source(&self) -> Node {
        Node::new(self.copies * self.n)
    }

    /// The super sink.
    pub fn sink(&self) -> Node {
        Node::new(self.copies * self.n + 1)
    }

    /// Copy `copy` of base node `node`.
    pub fn node(&self, copy: usize, node: Node) -> Node {
        debug_assert!(copy < self.copies && node.index() < self.n);
        Node::new(copy * self.n + node.index())
    }

    /// The copy and base node of a layered node; `None` for the super
    /// source and sink.
    pub fn project(&self, node: Node) -> Option<(usize, Node)> {
        if node.index() >= self.copies * self.n {
            None
        } else {
            Some((node.index() / self.n, Node::new(node.index() % self.n)))
        }
    }

    fn is_link(&self, copy: usize, node: Node) -> bool {
        self.links.get(copy).map_or(false, |l| l.contains(&node))
    }
}

impl<G: Graph> Graph for DuplicatedGraph<G> {
    fn node_count(&self) -> usize {
        self.copies * self.n + 2
    }

    fn weight(&self, src: Node, dst: Node) -> u64 {
        match (self.project(src), self.project(dst)) {
            (None, Some((0, v))) if src == self.source() && self.entry.contains(&v) => {
                INFINITE_WEIGHT
            }
            (Some((c, u)), None)
                if dst == self.sink() && c + 1 == self.copies && self.exit.contains(&u) =>
            {
                INFINITE_WEIGHT
            }
            (Some((cu, u)), Some((cv, v))) => {
                if cu == cv {
                    self.base.weight(u, v)
                } else if cv == cu + 1 && u == v && self.is_link(cu, u) {
                    INFINITE_WEIGHT
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn successors(&self, node: Node) -> Vec<(Node, u64)> {
        match self.project(node) {
            None if node == self.source() => self
                .entry
                .iter()
                .map(|&v| (self.node(0, v), INFINITE_WEIGHT))
                .collect(),
            None => Vec::new(),
            Some((c, u)) => {
                let mut succs: Vec<(Node, u64)> = self
                    .base
                    .successors(u)
                    .into_iter()
                    .map(|(v, w)| (self.node(c, v), w))
                    .collect();
                if self.is_link(c, u) {
                    succs.push((self.node(c + 1, u), INFINITE_WEIGHT));
                }
                if c + 1 == self.copies && self.exit.contains(&u) {
                    succs.push((self.sink(), INFINITE_WEIGHT));
                }
                succs
            }
        }
    }

    fn predecessors(&self, node: Node) -> Vec<(Node, u64)> {
        match self.project(node) {
            None if node == self.sink() => self
                .exit
                .iter()
                .map(|&u| (self.node(self.copies - 1, u), INFINITE_WEIGHT))
                .collect(),
            None => Vec::new(),
            Some((c, v)) => {
                let mut preds: Vec<(Node, u64)> = Vec::new();
                if c > 0 && self.is_link(c - 1, v) {
                    preds.push((self.node(c - 1, v), INFINITE_WEIGHT));
                }
                preds.extend(
                    self.base
                        .predecessors(v)
                        .into_iter()
                        .map(|(u, w)| (self.node(c, u), w)),
                );
                if c == 0 && self.entry.contains(&v) {
                    preds.push((self.source(), INFINITE_WEIGHT));
                }
                preds
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{reachable_from, GraphMut, WeightedGraph};

    fn n(i: usize) -> Node {
        Node::new(i)
    }

    fn set(nodes: &[usize]) -> BTreeSet<Node> {
        nodes.iter().map(|&i| n(i)).collect()
    }

    #[test]
    fn two_stage_layout() {
        let mut base = WeightedGraph::with_nodes(3);
        base.put_weight(n(0), n(1), 3);
        base.put_weight(n(1), n(2), 4);
        let dup = DuplicatedGraph::layered(&base, &[set(&[0]), set(&[2])]);
        assert_eq!(dup.copies(), 1);
        assert_eq!(dup.node_count(), 5);
        assert_eq!(dup.source(), n(3));
        assert_eq!(dup.sink(), n(4));
        assert_eq!(dup.successors(n(3)), [(n(0), INFINITE_WEIGHT)]);
        assert_eq!(dup.successors(n(2)), [(n(4), INFINITE_WEIGHT)]);
        assert_eq!(dup.weight(n(1), n(2)), 4);
        assert_eq!(dup.predecessors(n(0)), [(n(3), INFINITE_WEIGHT)]);
        assert_eq!(dup.project(n(2)), Some((0, n(2))));
        assert_eq!(dup.project(n(4)), None);
    }

    #[test]
    fn waypoint_forces_order() {
        // 0 -> 1 -> 2 and 0 -> 2; the waypoint 1 must be visited.
        let mut base = WeightedGraph::with_nodes(3);
        base.put_weight(n(0), n(1), 1);
        base.put_weight(n(1), n(2), 1);
        base.put_weight(n(0), n(2), 1);
        let dup = DuplicatedGraph::layered(&base, &[set(&[0]), set(&[1]), set(&[2])]);
        assert_eq!(dup.copies(), 2);
        // copy 0 of node 1 jumps to copy 1 of node 1
        assert_eq!(dup.weight(n(1), n(4)), INFINITE_WEIGHT);
        assert_eq!(dup.predecessors(n(4)), [(n(1), INFINITE_WEIGHT), (n(3), 1)]);
        // only copy 1 of node 2 reaches the sink
        assert_eq!(dup.weight(n(2), dup.sink()), 0);
        assert_eq!(dup.weight(n(5), dup.sink()), INFINITE_WEIGHT);
        let seen = reachable_from(&dup, [dup.source()]);
        assert!(seen[dup.sink().index()]);
        assert!(!seen[3]); // copy 1 of node 0 is never entered
    }
}
