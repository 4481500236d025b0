//! Minimum-weight edge cuts separating waypoint groups.
//!
//! A waypoint group is an ordered list of node sets `[W0, .., Wk]`. A walk
//! satisfies the group when it visits a node of each stage in order. A cut
//! is a set of edges such that, once they are removed, no walk satisfies
//! any of the groups. All groups are separated at once: the cut returned by
//! a strategy is valid for every group on the same graph.
//!
//! Two strategies share the `MincutStrategy` interface:
//!
//! - `Combinatorial` recomputes a max-flow cut per group until the cuts of
//!   all groups agree;
//! - `ConstraintStrategy` solves the label-set formulation of all groups
//!   exactly, seeded with the combinatorial cut.

use crate::graph::{reachable_from, Graph, GraphMut, Node, ScopedGraph};
use crate::result::{BladeError, BladeResult};
use crate::settings::{self, Flags};
use cranelift_entity::EntityRef;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

mod combinatorial;
mod constraint;
mod maxflow;
#[cfg(feature = "smt")]
mod smt;

pub use self::combinatorial::Combinatorial;
pub use self::constraint::{
    BranchAndBound, ConstraintBackend, ConstraintFormulation, ConstraintStrategy, Solution,
};
pub use self::maxflow::{min_cut, min_cut_group, MinCut};
#[cfg(feature = "smt")]
pub use self::smt::Z3Backend;

/// Ordered stages a walk must visit for the group to be satisfied.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct WaypointGroup {
    stages: Vec<BTreeSet<Node>>,
}

impl WaypointGroup {
    /// A group with the given stages.
    pub fn new(stages: Vec<BTreeSet<Node>>) -> Self {
        Self { stages }
    }

    /// The two-stage group from `sources` to `sinks`.
    pub fn pair(
        sources: impl IntoIterator<Item = Node>,
        sinks: impl IntoIterator<Item = Node>,
    ) -> Self {
        Self::new(vec![
            sources.into_iter().collect(),
            sinks.into_iter().collect(),
        ])
    }

    /// The stages, first to last.
    pub fn stages(&self) -> &[BTreeSet<Node>] {
        &self.stages
    }

    /// The first stage, if there is one.
    pub fn sources(&self) -> Option<&BTreeSet<Node>> {
        self.stages.first()
    }

    /// The last stage, if there is one.
    pub fn sinks(&self) -> Option<&BTreeSet<Node>> {
        self.stages.last()
    }

    /// Check the group against a graph with `node_count` nodes.
    pub fn validate(&self, node_count: usize) -> BladeResult<()> {
        if self.stages.len() < 2 {
            return Err(BladeError::InvalidWaypointGroup(format!(
                "{}: a group needs at least two stages",
                self
            )));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.is_empty() {
                return Err(BladeError::InvalidWaypointGroup(format!(
                    "{}: stage {} is empty",
                    self, i
                )));
            }
            if let Some(node) = stage.iter().find(|n| n.index() >= node_count) {
                return Err(BladeError::InvalidWaypointGroup(format!(
                    "{}: {} is not a node of the graph",
                    self, node
                )));
            }
        }
        for (i, pair) in self.stages.windows(2).enumerate() {
            if let Some(node) = pair[0].intersection(&pair[1]).next() {
                return Err(BladeError::InvalidWaypointGroup(format!(
                    "{}: {} is in stages {} and {}",
                    self,
                    node,
                    i,
                    i + 1
                )));
            }
        }
        Ok(())
    }

    /// Narrow the stages to the nodes a satisfying walk can actually use:
    /// `F0 = W0` and `F(i+1) = reach(Fi) ∩ W(i+1)`. `None` when some stage
    /// becomes empty, i.e. no walk satisfies the group. A group with fewer
    /// than two stages has nothing to separate and also narrows to `None`,
    /// as do nodes outside `graph`.
    pub fn narrow<G: Graph + ?Sized>(&self, graph: &G) -> Option<Vec<BTreeSet<Node>>> {
        let (first, rest) = self.stages.split_first()?;
        if rest.is_empty() {
            return None;
        }
        let in_graph = |n: &Node| n.index() < graph.node_count();
        let mut frontier: BTreeSet<Node> = first.iter().copied().filter(in_graph).collect();
        if frontier.is_empty() {
            return None;
        }
        let mut narrowed = vec![frontier.clone()];
        for next in rest {
            let reach = reachable_from(graph, frontier.iter().copied());
            frontier = next
                .iter()
                .copied()
                .filter(|n| reach.get(n.index()).copied().unwrap_or(false))
                .collect();
            if frontier.is_empty() {
                return None;
            }
            narrowed.push(frontier.clone());
        }
        Some(narrowed)
    }
}

impl fmt::Display for WaypointGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{{")?;
            for (j, node) in stage.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", node)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

/// An edge selected for mitigation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CutEdge {
    /// Source of the edge.
    pub src: Node,
    /// Destination of the edge.
    pub dst: Node,
}

impl CutEdge {
    /// The edge `src -> dst`.
    pub fn new(src: Node, dst: Node) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for CutEdge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A cooperative cancellation flag shared with the host.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Running strategies stop at their next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Has the flag been raised?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> BladeResult<()> {
        if self.is_cancelled() {
            Err(BladeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A way of computing a cut that separates every group.
pub trait MincutStrategy {
    /// Compute a cut of `graph` separating all of `groups`.
    fn run(&mut self, graph: &dyn Graph, groups: &[WaypointGroup]) -> BladeResult<Vec<CutEdge>>;
}

/// Validate, deduplicate and sort `groups`.
pub fn prepare_groups(graph: &dyn Graph, groups: &[WaypointGroup]) -> BladeResult<Vec<WaypointGroup>> {
    for group in groups {
        group.validate(graph.node_count())?;
    }
    let set: BTreeSet<WaypointGroup> = groups.iter().cloned().collect();
    Ok(set.into_iter().collect())
}

/// `graph` with the edges of `cut` removed.
fn without_cut<'a>(graph: &'a dyn Graph, cut: &[CutEdge]) -> ScopedGraph<&'a dyn Graph> {
    let mut scoped = ScopedGraph::new(graph);
    for edge in cut {
        scoped.put_weight(edge.src, edge.dst, 0);
    }
    scoped
}

/// Does no walk over the edges of `graph` outside `cut` satisfy `group`?
///
/// Malformed groups, which no walk can satisfy, are always separated.
pub fn is_separated(graph: &dyn Graph, cut: &[CutEdge], group: &WaypointGroup) -> bool {
    group.narrow(&without_cut(graph, cut)).is_none()
}

/// Is `cut` valid for every group?
pub fn verify_cut(graph: &dyn Graph, cut: &[CutEdge], groups: &[WaypointGroup]) -> bool {
    let remaining = without_cut(graph, cut);
    groups.iter().all(|group| group.narrow(&remaining).is_none())
}

/// Total weight of the edges of `cut`.
pub fn cut_weight(graph: &dyn Graph, cut: &[CutEdge]) -> u64 {
    cut.iter()
        .map(|e| graph.weight(e.src, e.dst))
        .fold(0, u64::saturating_add)
}

/// Compute a cut separating `groups` with the strategy selected in `flags`.
///
/// An empty group list is a no-op.
pub fn run_mincut(
    graph: &dyn Graph,
    groups: &[WaypointGroup],
    flags: &Flags,
    cancel: &CancelFlag,
) -> BladeResult<Vec<CutEdge>> {
    if groups.is_empty() {
        return Ok(Vec::new());
    }
    let combinatorial = Combinatorial::new(flags.max_mincut_passes() as usize, cancel.clone());
    let cut = match flags.mincut_strategy() {
        settings::MincutStrategy::Combinatorial => {
            let mut strategy = combinatorial;
            let cut = strategy.run(graph, groups)?;
            if !strategy.converged() {
                log::debug!(
                    "combinatorial cut repaired after {} passes",
                    strategy.passes()
                );
            }
            cut
        }
        settings::MincutStrategy::Constraint => {
            #[cfg(feature = "smt")]
            {
                let backend = Z3Backend::new(flags.smt_timeout_ms());
                ConstraintStrategy::new(backend, combinatorial, cancel.clone()).run(graph, groups)?
            }
            #[cfg(not(feature = "smt"))]
            {
                let backend = BranchAndBound::new(flags.constraint_search_budget());
                ConstraintStrategy::new(backend, combinatorial, cancel.clone()).run(graph, groups)?
            }
        }
    };
    log::debug!(
        "{} groups separated by {} edges of total weight {}",
        groups.len(),
        cut.len(),
        cut_weight(graph, &cut)
    );
    Ok(cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WeightedGraph;

    fn n(i: usize) -> Node {
        Node::new(i)
    }

    fn set(nodes: &[usize]) -> BTreeSet<Node> {
        nodes.iter().map(|&i| n(i)).collect()
    }

    /// `A -> B -> C -> D` with weights `[5, 1, 5]`.
    pub(super) fn chain() -> WeightedGraph {
        let mut g = WeightedGraph::with_nodes(4);
        g.put_weight(n(0), n(1), 5);
        g.put_weight(n(1), n(2), 1);
        g.put_weight(n(2), n(3), 5);
        g
    }

    /// `A -> B, A -> C, B -> D, C -> D`, all weights 1.
    pub(super) fn diamond() -> WeightedGraph {
        let mut g = WeightedGraph::with_nodes(4);
        g.put_weight(n(0), n(1), 1);
        g.put_weight(n(0), n(2), 1);
        g.put_weight(n(1), n(3), 1);
        g.put_weight(n(2), n(3), 1);
        g
    }

    fn flags(strategy: &str) -> Flags {
        use crate::settings::Configurable;
        let mut b = settings::builder();
        b.set("mincut_strategy", strategy).unwrap();
        Flags::new(b)
    }

    #[test]
    fn group_validation() {
        let g = chain();
        assert!(WaypointGroup::new(vec![set(&[0])]).validate(4).is_err());
        assert!(WaypointGroup::new(vec![set(&[0]), set(&[])]).validate(4).is_err());
        assert!(WaypointGroup::pair([n(0)], [n(9)]).validate(4).is_err());
        assert!(WaypointGroup::pair([n(0), n(1)], [n(1)]).validate(4).is_err());
        // disjointness is only required between consecutive stages
        let group = WaypointGroup::new(vec![set(&[0]), set(&[1]), set(&[0, 3])]);
        assert!(group.validate(4).is_ok());
        assert_eq!(group.to_string(), "{n0} -> {n1} -> {n0, n3}");
        assert!(matches!(
            prepare_groups(&g, &[WaypointGroup::pair([n(0)], [n(0)])]),
            Err(BladeError::InvalidWaypointGroup(_))
        ));
    }

    #[test]
    fn malformed_groups_are_separated() {
        let g = chain();
        let empty = WaypointGroup::new(vec![]);
        assert_eq!(empty.sources(), None);
        assert_eq!(empty.sinks(), None);
        assert_eq!(empty.narrow(&g), None);
        assert!(is_separated(&g, &[], &empty));
        assert!(verify_cut(&g, &[], &[empty.clone()]));
        assert!(min_cut_group(&g, &empty, &CancelFlag::new()).unwrap().is_empty());

        let single = WaypointGroup::new(vec![set(&[0])]);
        assert_eq!(single.sources(), single.sinks());
        assert_eq!(single.narrow(&g), None);
        let outside = WaypointGroup::pair([n(0)], [n(17)]);
        assert_eq!(outside.narrow(&g), None);
        assert!(matches!(
            prepare_groups(&g, &[empty]),
            Err(BladeError::InvalidWaypointGroup(_))
        ));
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let g = chain();
        for strategy in ["combinatorial", "constraint"] {
            let cut = run_mincut(&g, &[], &flags(strategy), &CancelFlag::new()).unwrap();
            assert!(cut.is_empty());
        }
    }

    #[test]
    fn scenario_chain() {
        let g = chain();
        let groups = [WaypointGroup::pair([n(0)], [n(3)])];
        for strategy in ["combinatorial", "constraint"] {
            let cut = run_mincut(&g, &groups, &flags(strategy), &CancelFlag::new()).unwrap();
            assert_eq!(cut, [CutEdge::new(n(1), n(2))]);
        }
    }

    #[test]
    fn scenario_diamond() {
        let g = diamond();
        let groups = [WaypointGroup::pair([n(0)], [n(3)])];
        for strategy in ["combinatorial", "constraint"] {
            let cut = run_mincut(&g, &groups, &flags(strategy), &CancelFlag::new()).unwrap();
            assert_eq!(cut.len(), 2);
            assert_eq!(cut_weight(&g, &cut), 2);
            assert!(verify_cut(&g, &cut, &groups));
        }
    }

    #[test]
    fn scenario_disjoint_groups() {
        // chain on 0..4 and a diamond on 4..8
        let mut g = WeightedGraph::with_nodes(8);
        for (src, dst, w) in chain().edges().into_iter().chain(
            diamond()
                .edges()
                .into_iter()
                .map(|(s, d, w)| (n(s.index() + 4), n(d.index() + 4), w)),
        ) {
            g.put_weight(src, dst, w);
        }
        let first = WaypointGroup::pair([n(0)], [n(3)]);
        let second = WaypointGroup::pair([n(4)], [n(7)]);
        for strategy in ["combinatorial", "constraint"] {
            let f = flags(strategy);
            let cancel = CancelFlag::new();
            let alone_1 = run_mincut(&g, &[first.clone()], &f, &cancel).unwrap();
            let alone_2 = run_mincut(&g, &[second.clone()], &f, &cancel).unwrap();
            let both = run_mincut(&g, &[second.clone(), first.clone()], &f, &cancel).unwrap();
            let mut union: Vec<CutEdge> = alone_1.iter().chain(&alone_2).copied().collect();
            union.sort();
            assert_eq!(both, union);
            assert_eq!(
                cut_weight(&g, &both),
                cut_weight(&g, &alone_1) + cut_weight(&g, &alone_2)
            );
        }
    }

    #[test]
    fn unreachable_groups_need_no_cut() {
        let g = chain();
        let groups = [WaypointGroup::pair([n(3)], [n(0)])];
        let cut = run_mincut(&g, &groups, &flags("combinatorial"), &CancelFlag::new()).unwrap();
        assert!(cut.is_empty());
        assert!(is_separated(&g, &cut, &groups[0]));
    }

    #[test]
    fn cancellation() {
        let g = diamond();
        let groups = [WaypointGroup::pair([n(0)], [n(3)])];
        let cancel = CancelFlag::new();
        cancel.clone().cancel();
        assert!(cancel.is_cancelled());
        for strategy in ["combinatorial", "constraint"] {
            assert!(matches!(
                run_mincut(&g, &groups, &flags(strategy), &cancel),
                Err(BladeError::Cancelled)
            ));
        }
    }
}
