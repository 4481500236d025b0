//! Exact cuts from the label-set formulation.
//!
//! Every (group, stage) pair gets a label. A node emits the label of
//! `(g, 0)` when it is in the first stage of `g`, and the label of `(g, i)`
//! when it is in stage `i` and already received `(g, i - 1)`. Labels flow
//! along uncut edges:
//!
//! ```text
//! set_in(v)  = ∪ set_out(u)                        over uncut edges u -> v
//! set_out(v) = set_in(v) ∪ {(g, 0) | v ∈ W0(g)}
//!                        ∪ {(g, i) | v ∈ Wi(g), (g, i - 1) ∈ set_in(v)}
//! ```
//!
//! A cut is valid when no node of the last stage `Wk(g)` receives
//! `(g, k - 1)`. The cheapest valid cut is the optimum.

use super::{prepare_groups, CancelFlag, Combinatorial, CutEdge, MincutStrategy, WaypointGroup};
use crate::graph::{reachable_from, reaching, Graph, Node, INFINITE_WEIGHT};
use crate::result::BladeResult;
use cranelift_entity::EntityRef;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// The label-set formulation of a cut problem.
#[derive(Clone, Debug)]
pub struct ConstraintFormulation {
    node_count: usize,
    groups: Vec<WaypointGroup>,
    /// First label of each group; group `g` owns labels
    /// `label_base[g]..label_base[g] + stages - 1`.
    label_base: Vec<usize>,
    num_labels: usize,
    /// Edges that lie on some walk from a first stage to a last stage.
    edges: Vec<(Node, Node, u64)>,
    /// Indices into `edges`, by source node.
    out_edges: BTreeMap<Node, Vec<usize>>,
}

impl ConstraintFormulation {
    /// Encode `groups`, which must be valid for `graph`.
    ///
    /// Groups agreeing on every stage but the last are collapsed into one
    /// group whose last stage is the union of theirs.
    pub fn encode(graph: &dyn Graph, groups: &[WaypointGroup]) -> Self {
        let mut collapsed: BTreeMap<Vec<BTreeSet<Node>>, BTreeSet<Node>> = BTreeMap::new();
        for group in groups {
            let (last, prefix) = match group.stages().split_last() {
                Some(split) => split,
                None => continue,
            };
            collapsed
                .entry(prefix.to_vec())
                .or_default()
                .extend(last.iter().copied());
        }
        let groups: Vec<WaypointGroup> = collapsed
            .into_iter()
            .map(|(mut stages, last)| {
                stages.push(last);
                WaypointGroup::new(stages)
            })
            .collect();

        let mut label_base = Vec::with_capacity(groups.len());
        let mut num_labels = 0;
        for group in &groups {
            label_base.push(num_labels);
            num_labels += group.stages().len() - 1;
        }

        let sources = groups.iter().filter_map(WaypointGroup::sources).flatten();
        let sinks = groups.iter().filter_map(WaypointGroup::sinks).flatten();
        let forward = reachable_from(graph, sources.copied());
        let backward = reaching(graph, sinks.copied());
        let mut edges = Vec::new();
        let mut out_edges: BTreeMap<Node, Vec<usize>> = BTreeMap::new();
        for (src, dst, weight) in graph.edges() {
            if forward[src.index()] && backward[dst.index()] {
                out_edges.entry(src).or_default().push(edges.len());
                edges.push((src, dst, weight));
            }
        }

        Self {
            node_count: graph.node_count(),
            groups,
            label_base,
            num_labels,
            edges,
            out_edges,
        }
    }

    /// Number of nodes of the encoded graph.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// The collapsed groups.
    pub fn groups(&self) -> &[WaypointGroup] {
        &self.groups
    }

    /// Number of labels.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// The label of stage `stage` of group `group`. Last stages have none.
    pub fn label(&self, group: usize, stage: usize) -> usize {
        debug_assert!(stage + 1 < self.groups[group].stages().len());
        self.label_base[group] + stage
    }

    /// The relevant edges: `(src, dst, weight)`.
    pub fn edges(&self) -> &[(Node, Node, u64)] {
        &self.edges
    }

    /// Indices of the relevant edges leaving `node`.
    pub fn out_edges(&self, node: Node) -> &[usize] {
        self.out_edges.get(&node).map_or(&[], |v| v.as_slice())
    }

    /// Index of the relevant edge `src -> dst`.
    pub fn edge_index(&self, src: Node, dst: Node) -> Option<usize> {
        self.out_edges(src)
            .iter()
            .copied()
            .find(|&e| self.edges[e].1 == dst)
    }

    /// Total weight of a set of edge indices.
    pub fn weight(&self, cut: &BTreeSet<usize>) -> u64 {
        cut.iter()
            .map(|&e| self.edges[e].2)
            .fold(0, u64::saturating_add)
    }

    /// The cut edges of a set of edge indices.
    pub fn cut_edges(&self, cut: &BTreeSet<usize>) -> Vec<CutEdge> {
        let mut out: Vec<CutEdge> = cut
            .iter()
            .map(|&e| CutEdge::new(self.edges[e].0, self.edges[e].1))
            .collect();
        out.sort();
        out
    }

    /// A walk over uncut edges satisfying some group, as edge indices in
    /// walk order; `None` when `cut` is valid.
    ///
    /// The walk is a shortest one for the first group that has one.
    pub fn witness(&self, cut: &BTreeSet<usize>) -> Option<Vec<usize>> {
        self.groups
            .iter()
            .find_map(|group| self.group_witness(group, cut))
    }

    fn group_witness(&self, group: &WaypointGroup, cut: &BTreeSet<usize>) -> Option<Vec<usize>> {
        let stages = group.stages();
        let last = stages.len() - 1;
        // State (v, i): the walk stands at v and has visited stages 0..=i.
        let mut parent: BTreeMap<(Node, usize), Option<((Node, usize), usize)>> = BTreeMap::new();
        let mut queue = VecDeque::new();
        for &v in &stages[0] {
            parent.insert((v, 0), None);
            queue.push_back((v, 0));
        }
        let mut found = None;
        'search: while let Some((u, i)) = queue.pop_front() {
            for &e in self.out_edges(u) {
                if cut.contains(&e) {
                    continue;
                }
                let v = self.edges[e].1;
                let stage = if stages[i + 1].contains(&v) { i + 1 } else { i };
                let state = (v, stage);
                if parent.contains_key(&state) {
                    continue;
                }
                parent.insert(state, Some(((u, i), e)));
                if stage == last {
                    found = Some(state);
                    break 'search;
                }
                queue.push_back(state);
            }
        }
        let mut state = found?;
        let mut walk = Vec::new();
        while let Some(Some((prev, edge))) = parent.get(&state).copied() {
            walk.push(edge);
            state = prev;
        }
        walk.reverse();
        Some(walk)
    }

    /// The fixed point of the label equations under `cut`: `set_in` of
    /// every node, indexed by node then label.
    pub fn evaluate(&self, cut: &BTreeSet<usize>) -> Vec<Vec<bool>> {
        let mut set_in = vec![vec![false; self.num_labels]; self.node_count];
        let mut set_out = vec![vec![false; self.num_labels]; self.node_count];
        let mut changed = true;
        while changed {
            changed = false;
            for v in 0..self.node_count {
                let node = Node::new(v);
                for (g, group) in self.groups.iter().enumerate() {
                    for (i, stage) in group.stages().iter().enumerate() {
                        if i + 1 == group.stages().len() || !stage.contains(&node) {
                            continue;
                        }
                        let emits = i == 0 || set_in[v][self.label(g, i - 1)];
                        let l = self.label(g, i);
                        if emits && !set_out[v][l] {
                            set_out[v][l] = true;
                            changed = true;
                        }
                    }
                }
                for l in 0..self.num_labels {
                    if set_in[v][l] && !set_out[v][l] {
                        set_out[v][l] = true;
                        changed = true;
                    }
                }
            }
            for (e, &(src, dst, _)) in self.edges.iter().enumerate() {
                if cut.contains(&e) {
                    continue;
                }
                for l in 0..self.num_labels {
                    if set_out[src.index()][l] && !set_in[dst.index()][l] {
                        set_in[dst.index()][l] = true;
                        changed = true;
                    }
                }
            }
        }
        set_in
    }

    /// Does `cut` satisfy every demand of the formulation?
    pub fn is_valid(&self, cut: &BTreeSet<usize>) -> bool {
        let set_in = self.evaluate(cut);
        self.groups.iter().enumerate().all(|(g, group)| {
            let k = group.stages().len() - 1;
            let l = self.label(g, k - 1);
            group.sinks().into_iter().flatten().all(|v| !set_in[v.index()][l])
        })
    }
}

/// A solution found by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution {
    /// Indices of the cut edges in the formulation.
    pub cut: BTreeSet<usize>,
    /// Is the cut known to be minimal?
    pub optimal: bool,
}

/// A solver for the label-set formulation.
pub trait ConstraintBackend {
    /// Find a minimum-weight valid cut. `incumbent` is a valid cut to
    /// improve on.
    fn solve(
        &mut self,
        formulation: &ConstraintFormulation,
        incumbent: &BTreeSet<usize>,
        cancel: &CancelFlag,
    ) -> BladeResult<Solution>;
}

/// Exact search over the edges of violating walks.
///
/// Every valid cut contains an edge of every satisfying walk, so branching
/// on the edges of one such walk enumerates all minimal cuts. The search
/// is bounded by the weight of the best cut so far and by a budget of
/// search nodes; an exhausted budget keeps the best cut found.
#[derive(Clone, Debug)]
pub struct BranchAndBound {
    budget: u64,
}

struct Search<'a> {
    formulation: &'a ConstraintFormulation,
    cancel: &'a CancelFlag,
    budget: u64,
    visited: u64,
    best: BTreeSet<usize>,
    best_weight: u64,
}

impl<'a> Search<'a> {
    fn visit(&mut self, cut: &mut BTreeSet<usize>, weight: u64) -> BladeResult<()> {
        self.cancel.check()?;
        if self.visited >= self.budget {
            return Ok(());
        }
        self.visited += 1;
        if weight >= self.best_weight {
            return Ok(());
        }
        let walk = match self.formulation.witness(cut) {
            None => {
                self.best = cut.clone();
                self.best_weight = weight;
                return Ok(());
            }
            Some(walk) => walk,
        };
        let mut branches: Vec<usize> = walk
            .into_iter()
            .filter(|&e| self.formulation.edges[e].2 < INFINITE_WEIGHT)
            .collect();
        branches.sort_by_key(|&e| (self.formulation.edges[e].2, e));
        branches.dedup();
        for e in branches {
            let w = self.formulation.edges[e].2;
            cut.insert(e);
            self.visit(cut, weight.saturating_add(w))?;
            cut.remove(&e);
        }
        Ok(())
    }
}

impl BranchAndBound {
    /// A search visiting at most `budget` nodes.
    pub fn new(budget: u64) -> Self {
        Self {
            budget: budget.max(1),
        }
    }
}

impl ConstraintBackend for BranchAndBound {
    fn solve(
        &mut self,
        formulation: &ConstraintFormulation,
        incumbent: &BTreeSet<usize>,
        cancel: &CancelFlag,
    ) -> BladeResult<Solution> {
        let mut search = Search {
            formulation,
            cancel,
            budget: self.budget,
            visited: 0,
            best: incumbent.clone(),
            best_weight: formulation.weight(incumbent),
        };
        search.visit(&mut BTreeSet::new(), 0)?;
        let optimal = search.visited < search.budget;
        crate::trace!(
            "branch and bound visited {} nodes, best weight {}",
            search.visited,
            search.best_weight
        );
        Ok(Solution {
            cut: search.best,
            optimal,
        })
    }
}

/// Solve all groups at once with a constraint backend, starting from the
/// combinatorial cut.
pub struct ConstraintStrategy<B: ConstraintBackend> {
    backend: B,
    combinatorial: Combinatorial,
    cancel: CancelFlag,
}

impl<B: ConstraintBackend> ConstraintStrategy<B> {
    /// A strategy using `backend`, seeded by `combinatorial`.
    pub fn new(backend: B, combinatorial: Combinatorial, cancel: CancelFlag) -> Self {
        Self {
            backend,
            combinatorial,
            cancel,
        }
    }
}

impl<B: ConstraintBackend> MincutStrategy for ConstraintStrategy<B> {
    fn run(&mut self, graph: &dyn Graph, groups: &[WaypointGroup]) -> BladeResult<Vec<CutEdge>> {
        let groups = prepare_groups(graph, groups)?;
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let seed = self.combinatorial.run(graph, &groups)?;
        let formulation = ConstraintFormulation::encode(graph, &groups);
        // Cut edges off every relevant walk do not matter.
        let incumbent: BTreeSet<usize> = seed
            .iter()
            .filter_map(|e| formulation.edge_index(e.src, e.dst))
            .collect();
        let solution = self.backend.solve(&formulation, &incumbent, &self.cancel)?;
        if !solution.optimal {
            log::warn!(
                "constraint min-cut search budget exhausted; keeping a cut of weight {}",
                formulation.weight(&solution.cut)
            );
        }
        debug_assert!(formulation.is_valid(&solution.cut));
        Ok(formulation.cut_edges(&solution.cut))
    }
}
