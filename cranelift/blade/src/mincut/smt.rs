//! The label-set formulation solved by Z3's optimizer.

use super::constraint::{ConstraintBackend, ConstraintFormulation, Solution};
use super::CancelFlag;
use crate::graph::{Node, INFINITE_WEIGHT};
use crate::result::{BladeError, BladeResult};
use std::collections::{BTreeMap, BTreeSet};
use z3::{
    ast::{Ast, Bool, Int},
    Config, Context, Optimize, SatResult,
};

/// Solve the formulation with Z3, minimizing the total cut weight.
#[derive(Clone, Debug)]
pub struct Z3Backend {
    timeout_ms: u64,
}

impl Z3Backend {
    /// A backend giving up after `timeout_ms` milliseconds; 0 means no
    /// limit.
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }
}

/// Boolean membership variables, created on first use.
struct Labels<'ctx> {
    ctx: &'ctx Context,
    set_in: BTreeMap<(Node, usize), Bool<'ctx>>,
    set_out: BTreeMap<(Node, usize), Bool<'ctx>>,
}

impl<'ctx> Labels<'ctx> {
    fn set_in(&mut self, node: Node, label: usize) -> Bool<'ctx> {
        let ctx = self.ctx;
        self.set_in
            .entry((node, label))
            .or_insert_with(|| Bool::new_const(ctx, format!("in_{}_{}", node, label)))
            .clone()
    }

    fn set_out(&mut self, node: Node, label: usize) -> Bool<'ctx> {
        let ctx = self.ctx;
        self.set_out
            .entry((node, label))
            .or_insert_with(|| Bool::new_const(ctx, format!("out_{}_{}", node, label)))
            .clone()
    }
}

impl ConstraintBackend for Z3Backend {
    fn solve(
        &mut self,
        formulation: &ConstraintFormulation,
        incumbent: &BTreeSet<usize>,
        cancel: &CancelFlag,
    ) -> BladeResult<Solution> {
        cancel.check()?;
        let mut cfg = Config::new();
        if self.timeout_ms > 0 {
            cfg.set_timeout_msec(self.timeout_ms);
        }
        let ctx = Context::new(&cfg);
        let opt = Optimize::new(&ctx);
        let mut labels = Labels {
            ctx: &ctx,
            set_in: BTreeMap::new(),
            set_out: BTreeMap::new(),
        };

        let cut: Vec<Bool> = (0..formulation.edges().len())
            .map(|e| Bool::new_const(&ctx, format!("cut_{}", e)))
            .collect();

        for (e, &(src, dst, weight)) in formulation.edges().iter().enumerate() {
            if weight >= INFINITE_WEIGHT {
                opt.assert(&cut[e].not());
            }
            for l in 0..formulation.num_labels() {
                let flows = Bool::and(&ctx, &[&labels.set_out(src, l), &cut[e].not()]);
                opt.assert(&flows.implies(&labels.set_in(dst, l)));
            }
        }

        for (g, group) in formulation.groups().iter().enumerate() {
            let stages = group.stages();
            let k = stages.len() - 1;
            for &v in &stages[0] {
                opt.assert(&labels.set_out(v, formulation.label(g, 0)));
            }
            for i in 1..k {
                for &v in &stages[i] {
                    let received = labels.set_in(v, formulation.label(g, i - 1));
                    let emitted = labels.set_out(v, formulation.label(g, i));
                    opt.assert(&received.implies(&emitted));
                }
            }
            for &v in &stages[k] {
                opt.assert(&labels.set_in(v, formulation.label(g, k - 1)).not());
            }
        }

        let keys: Vec<(Node, usize)> = labels.set_in.keys().copied().collect();
        for (v, l) in keys {
            let received = labels.set_in(v, l);
            opt.assert(&received.implies(&labels.set_out(v, l)));
        }

        let zero = Int::from_u64(&ctx, 0);
        let costs: Vec<Int> = formulation
            .edges()
            .iter()
            .zip(&cut)
            .filter(|((_, _, w), _)| *w < INFINITE_WEIGHT)
            .map(|(&(_, _, w), c)| c.ite(&Int::from_u64(&ctx, w), &zero))
            .collect();
        let total = if costs.is_empty() {
            zero.clone()
        } else {
            Int::add(&ctx, &costs.iter().collect::<Vec<_>>())
        };
        opt.assert(&total.le(&Int::from_u64(&ctx, formulation.weight(incumbent))));
        opt.minimize(&total);

        cancel.check()?;
        let result = opt.check(&[]);
        crate::trace!(
            "z3: {} edges, {} labels, result {:?}",
            formulation.edges().len(),
            formulation.num_labels(),
            result
        );
        if result != SatResult::Sat {
            return Err(BladeError::SolverFailure {
                result: format!("{:?}", result),
            });
        }
        let model = opt.get_model().ok_or_else(|| BladeError::SolverFailure {
            result: "no model".to_string(),
        })?;
        let chosen = cut
            .iter()
            .enumerate()
            .filter(|(_, c)| model.eval(*c, true).and_then(|b| b.as_bool()) == Some(true))
            .map(|(e, _)| e)
            .collect();
        Ok(Solution {
            cut: chosen,
            optimal: true,
        })
    }
}
