//! A pass over the IR which implements the Blade algorithm

use crate::alias::AliasQuery;
use crate::def_use::DefUseGraph;
use crate::graph::dot::DependenceGraphPrinter;
use crate::graph::{DependenceGraph, Graph, Node};
use crate::inst_predicates::first_result;
use crate::intrinsics::Intrinsics;
use crate::leak::{may_leak, nonspeculative_leak, LeakClassifier, TransmitKind};
use crate::mincut::{cut_weight, run_mincut, CancelFlag, WaypointGroup};
use crate::placement::MitigationPlacer;
use crate::result::BladeResult;
use crate::settings::{BladeType, Flags};
use crate::taint::{compute_taint, PublicValues, TaintMap, ThreatModel};
use crate::weights::FrequencyWeights;
use cranelift_codegen::flowgraph::ControlFlowGraph;
use cranelift_codegen::ir::{Function, Inst, Opcode};
use std::collections::BTreeSet;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Log the IR of each function before this pass
///
/// Even if this is set to `false` here, you can enable it by setting the
/// environment variable `PRINT_FUNCTION_BEFORE_BLADE`
const DEBUG_PRINT_FUNCTION_BEFORE: bool = false;

/// Log the IR of each function after this pass, fences included
///
/// Even if this is set to `false` here, you can enable it by setting the
/// environment variable `PRINT_FUNCTION_AFTER_BLADE`
const DEBUG_PRINT_FUNCTION_AFTER: bool = false;

/// Log the dependence graph in DOT form, with sources, sinks and the cut
/// highlighted
///
/// Even if this is set to `false` here, you can enable it by setting the
/// environment variable `PRINT_BLADE_DOT`
const DEBUG_PRINT_DOT: bool = false;

/// Should we dump various statistics about Blade's actions, in JSON form, to a
/// file blade_stats/<func_name>.json
///
/// Even if this is set to `false` here, you can enable it by setting the
/// environment variable `DUMP_BLADE_STATS`
const DUMP_BLADE_STATS: bool = false;

/// Run Blade on `func`, inserting fences as `flags` direct. `intrinsics`
/// names the imports of `func` that are compiler intrinsics.
pub fn do_blade(
    func: &mut Function,
    flags: &Flags,
    alias: &dyn AliasQuery,
    intrinsics: &Intrinsics,
) -> BladeResult<BladeStats> {
    BladePass::new(func, flags, alias, intrinsics).run()
}

/// Statistics about Blade's actions on one function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct BladeStats {
    /// Total number of static fences inserted by Blade
    pub static_fences_inserted: usize,
    /// How many control flow edges were split to hold a fence
    pub edges_split: usize,
    /// Number of distinct origin loads among the groups
    pub num_sources: usize,
    /// Number of distinct transmitting instructions among the groups
    pub num_sinks: usize,
    /// Number of waypoint groups handed to the min-cut
    pub num_groups: usize,
    /// Total weight of the cut edges
    pub cut_weight: u64,
}

impl BladeStats {
    /// The statistics as a JSON object.
    pub fn to_json(&self) -> json::JsonValue {
        json::object! {
            static_fences_inserted: self.static_fences_inserted,
            edges_split: self.edges_split,
            num_sources: self.num_sources,
            num_sinks: self.num_sinks,
            num_groups: self.num_groups,
            cut_weight: self.cut_weight,
        }
    }

    fn dump(&self, func_name: &str) -> BladeResult<()> {
        use std::io::Write;
        use std::path::Path;
        let dir = Path::new("blade_stats");
        std::fs::create_dir_all(dir)?;
        let filepath = dir.join(format!("{}.json", func_name));
        let mut f = std::fs::File::create(filepath)?;
        writeln!(f, "{:#}", self.to_json())?;
        Ok(())
    }
}

/// All of the data we need to perform the Blade pass
pub struct BladePass<'a> {
    /// The function which we're performing the Blade pass on
    func: &'a mut Function,
    /// The settings
    flags: &'a Flags,
    /// Answers alias queries for the taint analyses
    alias: &'a dyn AliasQuery,
    /// Which imported functions are intrinsics
    intrinsics: &'a Intrinsics,
    /// Lets the host abandon the min-cut
    cancel: CancelFlag,
}

/// Waypoint groups together with the instructions they were built from.
struct Groups {
    groups: Vec<WaypointGroup>,
    sources: BTreeSet<Inst>,
    sinks: BTreeSet<Inst>,
}

impl<'a> BladePass<'a> {
    /// A pass over `func`.
    pub fn new(
        func: &'a mut Function,
        flags: &'a Flags,
        alias: &'a dyn AliasQuery,
        intrinsics: &'a Intrinsics,
    ) -> Self {
        Self {
            func,
            flags,
            alias,
            intrinsics,
            cancel: CancelFlag::new(),
        }
    }

    /// Use `cancel` to stop the min-cut from outside.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the Blade pass, inserting fences as necessary, and return the
    /// `BladeStats` with statistics about Blade's actions
    pub fn run(self) -> BladeResult<BladeStats> {
        let blade_type = self.flags.blade_type();
        if blade_type == BladeType::None {
            return Ok(BladeStats::default());
        }

        if DEBUG_PRINT_FUNCTION_BEFORE || std::env::var("PRINT_FUNCTION_BEFORE_BLADE").is_ok() {
            log::info!("function before blade:\n{}", self.func.display());
        }

        let cfg = ControlFlowGraph::with_function(self.func);
        let def_use = DefUseGraph::for_function(self.func, &cfg, false);
        let taint = compute_taint(
            self.func,
            self.intrinsics,
            &def_use,
            self.alias,
            ThreatModel::Speculative,
        )?;
        let public = if self.flags.prune_public_transmissions() {
            compute_taint(
                self.func,
                self.intrinsics,
                &def_use,
                self.alias,
                ThreatModel::NonSpeculative,
            )?
            .public()
            .cloned()
        } else {
            None
        };

        let weights = FrequencyWeights::compute(self.func, &cfg, self.flags.base_edge_weight());
        let graph = DependenceGraph::for_function(self.func, &cfg, &weights);
        let collected = self.collect_groups(&graph, &def_use, &taint, public.as_ref())?;

        let mut stats = BladeStats {
            num_sources: collected.sources.len(),
            num_sinks: collected.sinks.len(),
            num_groups: collected.groups.len(),
            ..BladeStats::default()
        };

        let cut = match blade_type {
            BladeType::Lfence | BladeType::LfencePerBlock => {
                run_mincut(&graph, &collected.groups, self.flags, &self.cancel)?
            }
            BladeType::BaselineFence | BladeType::None => Vec::new(),
        };
        stats.cut_weight = cut_weight(&graph, &cut);

        if DEBUG_PRINT_DOT || std::env::var("PRINT_BLADE_DOT").is_ok() {
            let node_of = |inst: &Inst| graph.inst_node(*inst);
            log::info!(
                "{}",
                DependenceGraphPrinter::new(&*self.func, &graph)
                    .with_sources(collected.sources.iter().filter_map(node_of))
                    .with_sinks(collected.sinks.iter().filter_map(node_of))
                    .with_cut(cut.iter().map(|e| (e.src, e.dst)))
            );
        }

        let mut placer = MitigationPlacer::new(&mut *self.func, blade_type);
        if blade_type == BladeType::BaselineFence {
            for &source in &collected.sources {
                // a fence after every source
                placer.fence_after(source);
            }
        } else {
            placer.place(&graph, &cut);
        }
        stats.static_fences_inserted = placer.mitigations().len();
        stats.edges_split = placer.edges_split();
        drop(placer);

        log::debug!(
            "function {}: inserted {} (static) fences, {} sources, {} sinks, {} groups",
            self.func.name,
            stats.static_fences_inserted,
            stats.num_sources,
            stats.num_sinks,
            stats.num_groups
        );

        if DEBUG_PRINT_FUNCTION_AFTER || std::env::var("PRINT_FUNCTION_AFTER_BLADE").is_ok() {
            log::info!("function after blade:\n{}", self.func.display());
        }

        if DUMP_BLADE_STATS || std::env::var("DUMP_BLADE_STATS").is_ok() {
            stats.dump(&self.func.name.to_string())?;
        }

        Ok(stats)
    }

    /// One group per transmitted operand with speculative origins:
    /// `[origins, {transmitter}]`, or `[branches, origins, {transmitter}]`
    /// with branch waypoints.
    fn collect_groups(
        &self,
        graph: &DependenceGraph,
        def_use: &DefUseGraph,
        taint: &TaintMap,
        public: Option<&PublicValues>,
    ) -> BladeResult<Groups> {
        let func: &Function = &*self.func;
        let mut classifier = LeakClassifier::new();
        let branches: BTreeSet<Node> = if self.flags.branch_waypoints() {
            graph
                .nodes()
                .filter(|&n| {
                    graph
                        .node_inst(n)
                        .map_or(false, |inst| {
                            matches!(func.dfg.insts[inst].opcode(), Opcode::Brif | Opcode::BrTable)
                        })
                })
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut out = Groups {
            groups: Vec::new(),
            sources: BTreeSet::new(),
            sinks: BTreeSet::new(),
        };
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                let sink = match graph.inst_node(inst) {
                    Some(sink) => sink,
                    None => continue,
                };
                for (value, kind) in classifier.transmitter_operands(func, self.intrinsics, inst)? {
                    if kind == TransmitKind::Pseudo {
                        if !self.flags.pseudo_transmitters() {
                            continue;
                        }
                        // Every true transmitter operand is public by
                        // definition, so only pseudo ones can be pruned.
                        if public.map_or(false, |public| nonspeculative_leak(public, value)) {
                            continue;
                        }
                    }
                    let origins = match taint.speculative().and_then(|t| t.origins(value)) {
                        Some(origins) => origins,
                        None => continue,
                    };
                    let mut sources = BTreeSet::new();
                    for &origin in origins {
                        // Flows already stopped by a fence need no group. Only
                        // direct transmissions are visible to def-use chains.
                        if kind == TransmitKind::True {
                            if let Some(result) = first_result(func, origin) {
                                if !may_leak(func, self.intrinsics, def_use, result) {
                                    continue;
                                }
                            }
                        }
                        let node = match graph.inst_node(origin) {
                            Some(node) => node,
                            None => continue,
                        };
                        if node == sink {
                            // A load feeding its own address on the next
                            // iteration: the flow starts after it.
                            sources.extend(graph.successors(node).into_iter().map(|(n, _)| n));
                        } else {
                            sources.insert(node);
                        }
                        out.sources.insert(origin);
                    }
                    sources.remove(&sink);
                    if sources.is_empty() {
                        continue;
                    }
                    let mut stages = Vec::with_capacity(3);
                    if !branches.is_empty() {
                        let waypoints: BTreeSet<Node> =
                            branches.difference(&sources).copied().collect();
                        if !waypoints.is_empty() {
                            stages.push(waypoints);
                        }
                    }
                    stages.push(sources);
                    stages.push([sink].into_iter().collect());
                    out.groups.push(WaypointGroup::new(stages));
                    out.sinks.insert(inst);
                }
            }
        }
        crate::trace!(
            "{}: {} groups from {} sources to {} sinks",
            func.name,
            out.groups.len(),
            out.sources.len(),
            out.sinks.len()
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::BasicAliasAnalysis;
    use crate::inst_predicates::{has_fence_before, starts_with_fence};
    use crate::result::BladeError;
    use crate::settings::{self, Configurable};
    use cranelift_codegen::cursor::{Cursor, FuncCursor};
    use cranelift_codegen::ir::{types, InstBuilder, MemFlags};

    fn flags(options: &[(&str, &str)]) -> Flags {
        let mut b = settings::builder();
        for &(name, value) in options {
            b.set(name, value).unwrap();
        }
        Flags::new(b)
    }

    fn blade(func: &mut Function, flags: &Flags) -> BladeResult<BladeStats> {
        do_blade(func, flags, &BasicAliasAnalysis, &Intrinsics::new())
    }

    /// What the pointer chase stores to `p + 8` before returning.
    #[derive(Clone, Copy)]
    enum Stored {
        Nothing,
        Loaded,
        Doubled,
    }

    /// `q = load p; x = load (q + i); y = load (x + x)`, then storing `x`
    /// or `x + x` as `stored` says. Returns the function and the
    /// instructions loading `x` and computing `x + x`.
    fn chase(stored: Stored) -> (Function, Inst, Inst) {
        let mut func = Function::new();
        let block0 = func.dfg.make_block();
        let p = func.dfg.append_block_param(block0, types::I64);
        let i = func.dfg.append_block_param(block0, types::I64);
        let (x_load, double);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            let q = pos.ins().load(types::I64, MemFlags::new(), p, 0);
            let a = pos.ins().iadd(q, i);
            let x = pos.ins().load(types::I64, MemFlags::new(), a, 0);
            x_load = pos.func.dfg.value_def(x).unwrap_inst();
            let y = pos.ins().iadd(x, x);
            double = pos.func.dfg.value_def(y).unwrap_inst();
            pos.ins().load(types::I64, MemFlags::new(), y, 0);
            match stored {
                Stored::Nothing => {}
                Stored::Loaded => {
                    pos.ins().store(MemFlags::new(), x, p, 8);
                }
                Stored::Doubled => {
                    pos.ins().store(MemFlags::new(), y, p, 8);
                }
            }
            pos.ins().return_(&[]);
        }
        (func, x_load, double)
    }

    #[test]
    fn none_does_nothing() {
        let (mut func, _, _) = chase(Stored::Loaded);
        let before = func.display().to_string();
        let stats = blade(&mut func, &flags(&[("blade_type", "none")])).unwrap();
        assert_eq!(stats, BladeStats::default());
        assert_eq!(func.display().to_string(), before);
    }

    #[test]
    fn fences_the_pointer_chase() {
        for strategy in ["combinatorial", "constraint"] {
            let (mut func, x_load, double) = chase(Stored::Nothing);
            let f = flags(&[("mincut_strategy", strategy)]);
            let stats = blade(&mut func, &f).unwrap();
            assert_eq!(stats.num_groups, 1);
            assert_eq!(stats.num_sources, 1);
            assert_eq!(stats.num_sinks, 1);
            assert_eq!(stats.static_fences_inserted, 1);
            assert_eq!(stats.edges_split, 0);
            assert_eq!(stats.cut_weight, 1000);
            assert!(has_fence_before(&func, double));
            assert!(!has_fence_before(&func, x_load));

            // the flow is already stopped the second time round
            let again = blade(&mut func, &f).unwrap();
            assert_eq!(again.num_groups, 0);
            assert_eq!(again.static_fences_inserted, 0);
        }
    }

    #[test]
    fn pseudo_transmitters_add_groups() {
        let (mut func, _, double) = chase(Stored::Loaded);
        let stats = blade(&mut func, &Flags::default()).unwrap();
        assert_eq!(stats.num_groups, 2);
        assert_eq!(stats.num_sinks, 2);
        assert_eq!(stats.static_fences_inserted, 1);
        assert!(has_fence_before(&func, double));

        let (mut func, _, _) = chase(Stored::Loaded);
        let f = flags(&[("pseudo_transmitters", "false")]);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.num_groups, 1);
    }

    #[test]
    fn public_pruning_keeps_true_transmissions() {
        let (mut func, _, double) = chase(Stored::Nothing);
        let f = flags(&[
            ("prune_public_transmissions", "true"),
            ("pseudo_transmitters", "false"),
        ]);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.num_groups, 1);
        assert_eq!(stats.static_fences_inserted, 1);
        assert!(has_fence_before(&func, double));

        // `x + x` is a load address, so storing it reveals nothing new
        let (mut func, _, _) = chase(Stored::Doubled);
        let stats = blade(&mut func, &Flags::default()).unwrap();
        assert_eq!(stats.num_groups, 2);
        let (mut func, _, double) = chase(Stored::Doubled);
        let f = flags(&[("prune_public_transmissions", "true")]);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.num_groups, 1);
        assert_eq!(stats.static_fences_inserted, 1);
        assert!(has_fence_before(&func, double));

        // `x` itself is secret: its store stays a group
        let (mut func, _, _) = chase(Stored::Loaded);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.num_groups, 2);
    }

    #[test]
    fn baseline_fences_after_sources() {
        let (mut func, _, double) = chase(Stored::Nothing);
        let f = flags(&[("blade_type", "baseline_fence")]);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.static_fences_inserted, 1);
        assert_eq!(stats.cut_weight, 0);
        assert!(has_fence_before(&func, double));
    }

    #[test]
    fn loop_carried_chase_splits_the_back_edge() {
        let mut func = Function::new();
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        let p = func.dfg.append_block_param(block0, types::I64);
        let ptr = func.dfg.append_block_param(block1, types::I64);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            pos.ins().jump(block1, &[p]);
            pos.insert_block(block1);
            let next = pos.ins().load(types::I64, MemFlags::new(), ptr, 0);
            pos.ins().jump(block1, &[next]);
        }
        let stats = blade(&mut func, &Flags::default()).unwrap();
        assert_eq!(stats.num_groups, 1);
        assert_eq!(stats.static_fences_inserted, 1);
        assert_eq!(stats.edges_split, 1);
        assert_eq!(func.layout.blocks().count(), 3);
        // the entry path stays unfenced
        assert!(!starts_with_fence(&func, block1));
    }

    #[test]
    fn branch_waypoints_require_a_branch_first() {
        let build = || {
            let mut func = Function::new();
            let block0 = func.dfg.make_block();
            let block1 = func.dfg.make_block();
            let block2 = func.dfg.make_block();
            let p = func.dfg.append_block_param(block0, types::I64);
            let i = func.dfg.append_block_param(block0, types::I64);
            let c = func.dfg.append_block_param(block0, types::I32);
            {
                let mut pos = FuncCursor::new(&mut func);
                pos.insert_block(block0);
                let q = pos.ins().load(types::I64, MemFlags::new(), p, 0);
                let a = pos.ins().iadd(q, i);
                let x = pos.ins().load(types::I64, MemFlags::new(), a, 0);
                let y = pos.ins().iadd(x, x);
                pos.ins().brif(c, block1, &[], block2, &[]);
                pos.insert_block(block1);
                pos.ins().load(types::I64, MemFlags::new(), y, 0);
                pos.ins().return_(&[]);
                pos.insert_block(block2);
                pos.ins().return_(&[]);
            }
            func
        };

        let mut func = build();
        let stats = blade(&mut func, &Flags::default()).unwrap();
        assert_eq!(stats.num_groups, 1);
        assert_eq!(stats.static_fences_inserted, 1);

        // the origin is loaded before any branch, so no walk visits a
        // branch, the origin and the transmitter in order
        let mut func = build();
        let f = flags(&[("branch_waypoints", "true")]);
        let stats = blade(&mut func, &f).unwrap();
        assert_eq!(stats.num_groups, 1);
        assert_eq!(stats.static_fences_inserted, 0);
    }

    #[test]
    fn stats_json() {
        let stats = BladeStats {
            static_fences_inserted: 3,
            edges_split: 1,
            num_sources: 2,
            num_sinks: 4,
            num_groups: 5,
            cut_weight: 2000,
        };
        let json = stats.to_json();
        assert_eq!(json["static_fences_inserted"], 3);
        assert_eq!(json["cut_weight"], 2000);
        assert_eq!(json["num_groups"], 5);
        assert!(json.dump().starts_with('{'));
    }

    #[test]
    fn cancelled_pass_fails() {
        let (mut func, _, _) = chase(Stored::Nothing);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let flags = Flags::default();
        let intrinsics = Intrinsics::new();
        let result = BladePass::new(&mut func, &flags, &BasicAliasAnalysis, &intrinsics)
            .with_cancel(cancel)
            .run();
        assert!(matches!(result, Err(BladeError::Cancelled)));
    }
}
