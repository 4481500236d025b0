//! A copy-on-write overlay over another graph.

use super::{Graph, GraphMut, Node};
use std::collections::{BTreeMap, BTreeSet};

/// Sparse modifications read through to a base graph.
///
/// Writes go to an override map; the base is never modified. Edges that are
/// absent in the base but written here are tracked in side tables so that
/// adjacency queries see them.
#[derive(Clone, Debug)]
pub struct ScopedGraph<G: Graph> {
    base: G,
    overrides: BTreeMap<(Node, Node), u64>,
    extra_succs: BTreeMap<Node, BTreeSet<Node>>,
    extra_preds: BTreeMap<Node, BTreeSet<Node>>,
}

impl<G: Graph> ScopedGraph<G> {
    /// An overlay with no modifications.
    pub fn new(base: G) -> Self {
        Self {
            base,
            overrides: BTreeMap::new(),
            extra_succs: BTreeMap::new(),
            extra_preds: BTreeMap::new(),
        }
    }

    /// Put back the base weight of `src -> dst`.
    pub fn restore(&mut self, src: Node, dst: Node) {
        self.overrides.remove(&(src, dst));
        if let Some(succs) = self.extra_succs.get_mut(&src) {
            succs.remove(&dst);
        }
        if let Some(preds) = self.extra_preds.get_mut(&dst) {
            preds.remove(&src);
        }
    }

    fn merged(
        &self,
        base: Vec<(Node, u64)>,
        extra: Option<&BTreeSet<Node>>,
        key: impl Fn(Node) -> (Node, Node),
    ) -> Vec<(Node, u64)> {
        let mut out: BTreeMap<Node, u64> = base.into_iter().collect();
        if let Some(extra) = extra {
            for &n in extra {
                out.insert(n, 0);
            }
        }
        out.into_iter()
            .filter_map(|(n, w)| {
                let w = self.overrides.get(&key(n)).copied().unwrap_or(w);
                if w > 0 {
                    Some((n, w))
                } else {
                    None
                }
            })
            .collect()
    }
}

impl<G: Graph> Graph for ScopedGraph<G> {
    fn node_count(&self) -> usize {
        self.base.node_count()
    }

    fn weight(&self, src: Node, dst: Node) -> u64 {
        match self.overrides.get(&(src, dst)) {
            Some(&w) => w,
            None => self.base.weight(src, dst),
        }
    }

    fn successors(&self, node: Node) -> Vec<(Node, u64)> {
        self.merged(
            self.base.successors(node),
            self.extra_succs.get(&node),
            |n| (node, n),
        )
    }

    fn predecessors(&self, node: Node) -> Vec<(Node, u64)> {
        self.merged(
            self.base.predecessors(node),
            self.extra_preds.get(&node),
            |n| (n, node),
        )
    }
}

impl<G: Graph> GraphMut for ScopedGraph<G> {
    fn put_weight(&mut self, src: Node, dst: Node, weight: u64) {
        if self.base.weight(src, dst) == 0 {
            if weight > 0 {
                self.extra_succs.entry(src).or_default().insert(dst);
                self.extra_preds.entry(dst).or_default().insert(src);
            } else {
                self.restore(src, dst);
                return;
            }
        }
        self.overrides.insert((src, dst), weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WeightedGraph;
    use cranelift_entity::EntityRef;

    #[test]
    fn overlay_leaves_base_unmodified() {
        let mut base = WeightedGraph::with_nodes(3);
        let (a, b, c) = (Node::new(0), Node::new(1), Node::new(2));
        base.put_weight(a, b, 4);
        base.put_weight(b, c, 2);
        let snapshot = base.clone();

        let mut scoped = ScopedGraph::new(&base);
        scoped.put_weight(a, b, 1);
        scoped.put_weight(b, c, 0);
        scoped.put_weight(c, a, 7);
        assert_eq!(scoped.weight(a, b), 1);
        assert!(scoped.successors(b).is_empty());
        assert_eq!(scoped.successors(c), [(a, 7)]);
        assert_eq!(scoped.predecessors(a), [(c, 7)]);
        assert_eq!(scoped.edges(), [(a, b, 1), (c, a, 7)]);

        scoped.restore(b, c);
        assert_eq!(scoped.weight(b, c), 2);
        scoped.put_weight(c, a, 0);
        assert!(scoped.successors(c).is_empty());
        drop(scoped);
        assert_eq!(base, snapshot);
    }
}
