//! Iterated per-group max-flow cuts.

use super::maxflow::min_cut_group;
use super::{prepare_groups, CancelFlag, CutEdge, MincutStrategy, WaypointGroup};
use crate::graph::{Graph, GraphMut, ScopedGraph};
use crate::result::BladeResult;
use std::collections::{BTreeMap, BTreeSet};

/// Separate each group with its own minimum cut, on a graph where the cuts
/// of all other groups are already removed, until a full pass over the
/// groups changes nothing.
///
/// Each group's cut is locally minimal; the union is a fixed point, not
/// necessarily a global minimum.
#[derive(Clone, Debug)]
pub struct Combinatorial {
    max_passes: usize,
    cancel: CancelFlag,
    /// Passes made by the last run.
    passes: usize,
    /// Did the last run reach a fixed point?
    converged: bool,
}

/// The working state of one run.
struct CutState<'a> {
    graph: ScopedGraph<&'a dyn Graph>,
    /// How many groups currently claim each removed edge.
    owners: BTreeMap<CutEdge, usize>,
    /// The current cut of each group.
    assignment: Vec<BTreeSet<CutEdge>>,
}

impl<'a> CutState<'a> {
    fn release(&mut self, group: usize) {
        for edge in std::mem::take(&mut self.assignment[group]) {
            if let Some(count) = self.owners.get_mut(&edge) {
                *count -= 1;
                if *count == 0 {
                    self.owners.remove(&edge);
                    self.graph.restore(edge.src, edge.dst);
                }
            }
        }
    }

    fn claim(&mut self, group: usize, cut: BTreeSet<CutEdge>) {
        for &edge in &cut {
            let count = self.owners.entry(edge).or_insert(0);
            if *count == 0 {
                self.graph.put_weight(edge.src, edge.dst, 0);
            }
            *count += 1;
        }
        self.assignment[group].extend(cut);
    }
}

impl Combinatorial {
    /// A strategy giving up after `max_passes` passes over the groups.
    pub fn new(max_passes: usize, cancel: CancelFlag) -> Self {
        Self {
            max_passes: max_passes.max(1),
            cancel,
            passes: 0,
            converged: false,
        }
    }

    /// Number of passes over the groups made by the last run.
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Did the last run stop because a pass changed nothing? When it did
    /// not, the cut was completed by a repair round.
    pub fn converged(&self) -> bool {
        self.converged
    }
}

impl MincutStrategy for Combinatorial {
    fn run(&mut self, graph: &dyn Graph, groups: &[WaypointGroup]) -> BladeResult<Vec<CutEdge>> {
        let groups = prepare_groups(graph, groups)?;
        self.passes = 0;
        self.converged = true;
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = CutState {
            graph: ScopedGraph::new(graph),
            owners: BTreeMap::new(),
            assignment: vec![BTreeSet::new(); groups.len()],
        };
        let mut history = BTreeSet::new();
        history.insert(state.assignment.clone());

        let mut converged = false;
        let mut passes = 0;
        while passes < self.max_passes {
            passes += 1;
            let mut changed = false;
            for (i, group) in groups.iter().enumerate() {
                self.cancel.check()?;
                let previous = state.assignment[i].clone();
                state.release(i);
                let cut: BTreeSet<CutEdge> = min_cut_group(&state.graph, group, &self.cancel)?
                    .into_iter()
                    .collect();
                changed |= cut != previous;
                state.claim(i, cut);
            }
            if !changed {
                converged = true;
                break;
            }
            if !history.insert(state.assignment.clone()) {
                log::warn!(
                    "min-cut assignment repeats after {} passes over {} groups; stopping",
                    passes,
                    groups.len()
                );
                break;
            }
        }

        if !converged {
            if passes >= self.max_passes {
                log::warn!(
                    "min-cut did not converge within {} passes over {} groups",
                    self.max_passes,
                    groups.len()
                );
            }
            // Add-only repair: every group is separated on the final graph.
            for (i, group) in groups.iter().enumerate() {
                self.cancel.check()?;
                if group.narrow(&state.graph).is_some() {
                    let cut = min_cut_group(&state.graph, group, &self.cancel)?;
                    state.claim(i, cut.into_iter().collect());
                }
            }
        }

        crate::trace!(
            "combinatorial min-cut: {} groups, {} passes, converged: {}",
            groups.len(),
            passes,
            converged
        );
        self.passes = passes;
        self.converged = converged;
        Ok(state.owners.keys().copied().collect())
    }
}
