//! Non-speculative taint: the architecturally public values.

use super::{all_in, layout_insts, layout_params, Context, Rule};
use crate::alias::{store_operands, AliasResult};
use crate::inst_predicates::first_result;
use crate::leak::{transmitter_operands, TransmitKind};
use crate::policy::{IntrinsicTaint, InversePolicy, ValuePolicy};
use crate::result::BladeResult;
use cranelift_codegen::ir::{Inst, Value};
use std::collections::BTreeSet;

/// Values that are public without speculation. Everything else is secret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublicValues {
    public: BTreeSet<Value>,
}

impl PublicValues {
    pub(super) fn compute(cx: &Context) -> BladeResult<Self> {
        let func = cx.func;
        let fixpoint = Fixpoint::new(cx)?;
        let mut public = fixpoint.seeds()?;
        let mut iterations = 0;
        loop {
            iterations += 1;
            let next = fixpoint.step(&public);
            if next == public {
                break;
            }
            public = next;
        }
        crate::trace!(
            "{}: public set converged after {} iterations, {} public values",
            func.name,
            iterations,
            public.len()
        );
        Ok(Self { public })
    }

    /// Is `value` public?
    pub fn is_public(&self, value: Value) -> bool {
        self.public.contains(&value)
    }

    /// Number of public values.
    pub fn len(&self) -> usize {
        self.public.len()
    }

    /// Is no value public?
    pub fn is_empty(&self) -> bool {
        self.public.is_empty()
    }

    /// Iterate over the public values in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.public.iter().copied()
    }
}

struct Fixpoint<'a> {
    cx: &'a Context<'a>,
    rules: Vec<(Inst, Rule)>,
    params: Vec<Value>,
    /// Pairs of a load and a store accessing exactly the same bytes.
    must_alias: Vec<(Inst, Inst)>,
}

impl<'a> Fixpoint<'a> {
    fn new(cx: &'a Context<'a>) -> BladeResult<Self> {
        let func = cx.func;
        let mut rules = Vec::new();
        for inst in layout_insts(func) {
            rules.push((inst, cx.rule(inst)?));
        }
        let loads: Vec<Inst> = rules
            .iter()
            .filter(|&&(_, rule)| rule == Rule::Value(ValuePolicy::Load))
            .map(|&(inst, _)| inst)
            .collect();
        let stores: Vec<Inst> = rules
            .iter()
            .map(|&(inst, _)| inst)
            .filter(|&inst| store_operands(func, inst).is_some())
            .collect();
        let mut must_alias = Vec::new();
        for &load in &loads {
            for &store in &stores {
                if cx.alias.load_store_alias(func, cx.intrinsics, load, store)
                    == AliasResult::MustAlias
                {
                    must_alias.push((load, store));
                }
            }
        }
        Ok(Self {
            cx,
            rules,
            params: layout_params(func),
            must_alias,
        })
    }

    /// Values public by definition: results and arguments of ordinary
    /// calls, constants and addresses, and every operand that is
    /// transmitted unconditionally.
    fn seeds(&self) -> BladeResult<BTreeSet<Value>> {
        let func = self.cx.func;
        let mut public = BTreeSet::new();
        for &(inst, rule) in &self.rules {
            let results = func.dfg.inst_results(inst);
            match rule {
                Rule::Value(ValuePolicy::Constant) => public.extend(results.iter().copied()),
                Rule::Value(ValuePolicy::Call) => {
                    public.extend(results.iter().copied());
                    public.extend(func.dfg.inst_args(inst).iter().copied());
                }
                _ => {}
            }
            for (value, kind) in transmitter_operands(func, self.cx.intrinsics, inst)? {
                if kind == TransmitKind::True {
                    public.insert(value);
                }
            }
        }
        Ok(public)
    }

    /// One round of forward and backward propagation. The result always
    /// contains `prev`.
    fn step(&self, prev: &BTreeSet<Value>) -> BTreeSet<Value> {
        let func = self.cx.func;
        let mut next = prev.clone();

        for &param in &self.params {
            if all_in(prev, self.cx.def_use.dependencies_of_val(param)) {
                next.insert(param);
            }
        }

        for &(inst, rule) in &self.rules {
            let result = match first_result(func, inst) {
                Some(result) => result,
                None => continue,
            };
            let args = func.dfg.inst_args(inst);
            let forward = matches!(
                rule,
                Rule::Value(ValuePolicy::Pure) | Rule::Intrinsic(IntrinsicTaint::Passthrough)
            );
            if forward && all_in(prev, args.iter().copied()) {
                next.insert(result);
            }

            if !prev.contains(&result) || rule != Rule::Value(ValuePolicy::Pure) {
                continue;
            }
            match InversePolicy::for_opcode(func.dfg.insts[inst].opcode()) {
                InversePolicy::Invertible => {
                    next.extend(args.iter().copied());
                }
                InversePolicy::InvertibleGivenOther => {
                    if let &[x, y] = args {
                        if prev.contains(&x) {
                            next.insert(y);
                        }
                        if prev.contains(&y) {
                            next.insert(x);
                        }
                    }
                }
                InversePolicy::NotInvertible => {}
            }
        }

        for &(load, store) in &self.must_alias {
            let (loaded, stored) = match (first_result(func, load), store_operands(func, store)) {
                (Some(loaded), Some((stored, _))) => (loaded, stored),
                _ => continue,
            };
            if prev.contains(&stored) {
                next.insert(loaded);
            }
            if prev.contains(&loaded) {
                next.insert(stored);
            }
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::BasicAliasAnalysis;
    use crate::def_use::DefUseGraph;
    use crate::intrinsics::Intrinsics;
    use crate::taint::{compute_taint, ThreatModel};
    use cranelift_codegen::cursor::{Cursor, FuncCursor};
    use cranelift_codegen::flowgraph::ControlFlowGraph;
    use cranelift_codegen::ir::condcodes::IntCC;
    use cranelift_codegen::ir::immediates::Imm64;
    use cranelift_codegen::ir::{
        types, AbiParam, ExtFuncData, ExternalName, Function, GlobalValueData, InstBuilder,
        MemFlags, Signature,
    };
    use cranelift_codegen::isa::CallConv;

    #[test]
    fn propagation() {
        let mut func = Function::new();
        let table = func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::testcase("table"),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        });
        let spill = func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::testcase("spill"),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        });
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I64));
        let signature = func.import_signature(sig);
        let callee = func.import_function(ExtFuncData {
            name: ExternalName::testcase("callee"),
            signature,
            colocated: false,
        });
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        let secret = func.dfg.append_block_param(block0, types::I64);
        let k = func.dfg.append_block_param(block0, types::I32);
        let m = func.dfg.append_block_param(block1, types::I64);
        let (wide, key, sum, other, spilled, reloaded, r);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            // k is recovered from its public extension
            wide = pos.ins().uextend(types::I64, k);
            let base = pos.ins().symbol_value(types::I64, table);
            let addr = pos.ins().iadd(base, wide);
            key = pos.ins().load(types::I64, MemFlags::new(), addr, 0);
            // sum is transmitted; key is public so other is recovered
            other = pos.ins().imul(secret, secret);
            sum = pos.ins().iadd(key, other);
            pos.ins().load(types::I64, MemFlags::new(), sum, 0);
            // spill and reload of a public value
            spilled = pos.ins().bnot(key);
            let spill_addr = pos.ins().symbol_value(types::I64, spill);
            pos.ins().store(MemFlags::new(), spilled, spill_addr, 0);
            reloaded = pos.ins().load(types::I64, MemFlags::new(), spill_addr, 0);
            let call = pos.ins().call(callee, &[secret]);
            r = pos.func.dfg.inst_results(call)[0];
            let c = pos.ins().icmp(IntCC::Equal, r, secret);
            pos.ins().brif(c, block1, &[reloaded], block1, &[key]);
            pos.insert_block(block1);
            pos.ins().return_(&[m]);
        }
        let cfg = ControlFlowGraph::with_function(&func);
        let du = DefUseGraph::for_function(&func, &cfg, false);
        let map = compute_taint(
            &func,
            &Intrinsics::new(),
            &du,
            &BasicAliasAnalysis,
            ThreatModel::NonSpeculative,
        )
        .unwrap();
        let public = map.public().unwrap();

        // seeds
        assert!(public.is_public(r));
        assert!(public.is_public(secret)); // call argument
        assert!(public.is_public(sum));
        // backward through uextend
        assert!(public.is_public(wide));
        assert!(public.is_public(k));
        // forward through pure operators and must-alias memory
        assert!(public.is_public(other));
        assert!(public.is_public(spilled));
        assert!(public.is_public(reloaded));
        assert!(public.is_public(m));
        // backward through iadd, given `other`
        assert!(public.is_public(key));
    }

    #[test]
    fn public_set_only_grows() {
        let mut func = Function::new();
        let block0 = func.dfg.make_block();
        let a = func.dfg.append_block_param(block0, types::I64);
        let b = func.dfg.append_block_param(block0, types::I64);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            let x = pos.ins().bxor(a, b);
            let y = pos.ins().bnot(x);
            let z = pos.ins().ineg(y);
            pos.ins().load(types::I64, MemFlags::new(), z, 0);
            let w = pos.ins().iadd(a, a);
            pos.ins().brif(w, block0, &[a, b], block0, &[b, a]);
        }
        let cfg = ControlFlowGraph::with_function(&func);
        let du = DefUseGraph::for_function(&func, &cfg, false);
        let none = Intrinsics::new();
        let cx = Context {
            func: &func,
            intrinsics: &none,
            def_use: &du,
            alias: &BasicAliasAnalysis,
        };
        let fixpoint = Fixpoint::new(&cx).unwrap();
        let mut prev = fixpoint.seeds().unwrap();
        let mut rounds = 0;
        loop {
            let next = fixpoint.step(&prev);
            assert!(next.is_superset(&prev));
            if next == prev {
                break;
            }
            prev = next;
            rounds += 1;
            assert!(rounds <= func.dfg.num_values());
        }
        // z is transmitted, y and x follow backwards, and w is a branch
        // condition; but a and b stay secret as neither is known alone
        assert!(!prev.contains(&a));
        assert!(!prev.contains(&b));
        assert_eq!(prev.len(), 4);
    }
}
