//! Speculative taint: origins of speculatively loaded data.

use super::{layout_insts, layout_params, Context, Rule};
use crate::alias::{load_address, written_locations};
use crate::inst_predicates::first_result;
use crate::policy::{IntrinsicTaint, ValuePolicy};
use crate::result::BladeResult;
use cranelift_codegen::ir::{Inst, Value};
use std::collections::{BTreeMap, BTreeSet};

/// The speculative taint of a function.
///
/// A value is tainted when it may hold data a load produced under
/// misspeculation; its origins are the loads (and memory copies) that data
/// comes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpeculativeTaint {
    /// Values that transitively depend on a load result.
    address_dependent: BTreeSet<Value>,
    /// Origins of each tainted value.
    origins: BTreeMap<Value, BTreeSet<Inst>>,
    /// Origins of the data each memory copy writes.
    copies: BTreeMap<Inst, BTreeSet<Inst>>,
}

impl SpeculativeTaint {
    pub(super) fn compute(cx: &Context) -> BladeResult<Self> {
        let func = cx.func;
        let insts = layout_insts(func);
        let params = layout_params(func);
        let mut rules = Vec::with_capacity(insts.len());
        for &inst in &insts {
            rules.push((inst, cx.rule(inst)?));
        }
        let writes: Vec<Inst> = insts
            .iter()
            .copied()
            .filter(|&inst| !written_locations(func, cx.intrinsics, inst).is_empty())
            .collect();

        let mut state = Self {
            address_dependent: address_dependencies(cx, &rules, &params),
            ..Self::default()
        };
        let mut iterations = 0;
        loop {
            iterations += 1;
            let next = state.step(cx, &rules, &params, &writes);
            if next == state {
                break;
            }
            state = next;
        }
        crate::trace!(
            "{}: speculative taint converged after {} iterations, {} tainted values",
            func.name,
            iterations,
            state.origins.len()
        );
        Ok(state)
    }

    /// Re-evaluate every value against the previous iteration.
    fn step(&self, cx: &Context, rules: &[(Inst, Rule)], params: &[Value], writes: &[Inst]) -> Self {
        let func = cx.func;
        let mut next = Self {
            address_dependent: self.address_dependent.clone(),
            ..Self::default()
        };

        for &param in params {
            next.set(param, self.union(cx.def_use.dependencies_of_val(param)));
        }

        for &(inst, rule) in rules {
            let result = first_result(func, inst);
            let args = func.dfg.inst_args(inst);
            match rule {
                Rule::Value(ValuePolicy::Pure) | Rule::Intrinsic(IntrinsicTaint::Passthrough) => {
                    if let Some(r) = result {
                        next.set(r, self.union(args.iter().copied()));
                    }
                }
                Rule::Value(ValuePolicy::Load) => {
                    let origins = match load_address(func, inst) {
                        Some(addr) if self.address_dependent.contains(&addr) => {
                            BTreeSet::from([inst])
                        }
                        _ => self.aliasing_write_origins(cx, inst, writes),
                    };
                    if let Some(r) = result {
                        next.set(r, origins);
                    }
                }
                Rule::Intrinsic(IntrinsicTaint::MemoryCopy) => {
                    let origins = match args.get(1) {
                        Some(src) if self.address_dependent.contains(src) => BTreeSet::from([inst]),
                        _ => self.aliasing_write_origins(cx, inst, writes),
                    };
                    if !origins.is_empty() {
                        next.copies.insert(inst, origins);
                    }
                }
                Rule::Value(_) | Rule::Intrinsic(_) => {}
            }
        }
        next
    }

    fn set(&mut self, value: Value, origins: BTreeSet<Inst>) {
        if !origins.is_empty() {
            self.origins.insert(value, origins);
        }
    }

    fn union(&self, values: impl Iterator<Item = Value>) -> BTreeSet<Inst> {
        let mut out = BTreeSet::new();
        for v in values {
            if let Some(origins) = self.origins.get(&v) {
                out.extend(origins.iter().copied());
            }
        }
        out
    }

    /// Origins of the data written to memory `reader` may read, by every
    /// write other than `reader` itself.
    fn aliasing_write_origins(&self, cx: &Context, reader: Inst, writes: &[Inst]) -> BTreeSet<Inst> {
        let mut out = BTreeSet::new();
        for &write in writes {
            if write == reader
                || !cx
                    .alias
                    .load_store_alias(cx.func, cx.intrinsics, reader, write)
                    .may_alias()
            {
                continue;
            }
            match cx.stored_value(write) {
                Some(data) => out.extend(self.union(std::iter::once(data))),
                None => {
                    if let Some(origins) = self.copies.get(&write) {
                        out.extend(origins.iter().copied());
                    }
                }
            }
        }
        out
    }

    /// The origins of `value`, if it is tainted.
    pub fn origins(&self, value: Value) -> Option<&BTreeSet<Inst>> {
        self.origins.get(&value)
    }

    /// Is `value` speculatively tainted?
    pub fn is_tainted(&self, value: Value) -> bool {
        self.origins.contains_key(&value)
    }

    /// Does `value` transitively depend on a load result?
    pub fn has_address_dependency(&self, value: Value) -> bool {
        self.address_dependent.contains(&value)
    }

    /// Iterate over the tainted values in ascending order.
    pub fn tainted_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.origins.keys().copied()
    }

    /// Number of tainted values.
    pub fn num_tainted(&self) -> usize {
        self.origins.len()
    }

    /// Every origin of every tainted value.
    pub fn all_origins(&self) -> BTreeSet<Inst> {
        self.origins.values().flatten().copied().collect()
    }
}

/// Values that transitively depend on the result of a load, through
/// operators and block parameters.
fn address_dependencies(cx: &Context, rules: &[(Inst, Rule)], params: &[Value]) -> BTreeSet<Value> {
    let func = cx.func;
    let mut deps = BTreeSet::new();
    loop {
        let mut next = BTreeSet::new();
        for &param in params {
            if cx.def_use.dependencies_of_val(param).any(|v| deps.contains(&v)) {
                next.insert(param);
            }
        }
        for &(inst, rule) in rules {
            let result = match first_result(func, inst) {
                Some(result) => result,
                None => continue,
            };
            let any_arg = || func.dfg.inst_args(inst).iter().any(|v| deps.contains(v));
            let dependent = match rule {
                Rule::Value(ValuePolicy::Load) => true,
                Rule::Value(ValuePolicy::Pure) | Rule::Intrinsic(IntrinsicTaint::Passthrough) => {
                    any_arg()
                }
                _ => false,
            };
            if dependent {
                next.insert(result);
            }
        }
        if next == deps {
            return deps;
        }
        deps = next;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{compute_taint, ThreatModel};
    use crate::alias::{AliasQuery, AliasResult, BasicAliasAnalysis, MemoryLocation};
    use crate::def_use::DefUseGraph;
    use crate::intrinsics::{Intrinsic, Intrinsics};
    use cranelift_codegen::cursor::{Cursor, FuncCursor};
    use cranelift_codegen::flowgraph::ControlFlowGraph;
    use cranelift_codegen::ir::immediates::Imm64;
    use cranelift_codegen::ir::{
        types, AbiParam, ExtFuncData, ExternalName, Function, GlobalValue, GlobalValueData,
        InstBuilder, MemFlags, Signature,
    };
    use cranelift_codegen::isa::CallConv;
    use std::collections::BTreeSet;

    /// An oracle that claims every pair of accesses is the same location.
    struct AlwaysMust;

    impl AliasQuery for AlwaysMust {
        fn alias(&self, _: &Function, _: &MemoryLocation, _: &MemoryLocation) -> AliasResult {
            AliasResult::MustAlias
        }
    }

    fn global(func: &mut Function, name: &str) -> GlobalValue {
        func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::testcase(name),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        })
    }

    #[test]
    fn address_dependency_taints_regardless_of_alias() {
        // v1 = load v0        ; L0
        // v2 = load v1        ; L1: address from L0
        // v3 = symbol_value a
        // store 7, v3
        // v5 = load v3        ; L2: constant address, must-aliases the store
        let mut func = Function::new();
        let a = global(&mut func, "a");
        let b = global(&mut func, "b");
        let block0 = func.dfg.make_block();
        let p = func.dfg.append_block_param(block0, types::I64);
        let (l0, l1, l2, l3);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            l0 = pos.ins().load(types::I64, MemFlags::new(), p, 0);
            l1 = pos.ins().load(types::I64, MemFlags::new(), l0, 0);
            let slot = pos.ins().symbol_value(types::I64, a);
            let seven = pos.ins().iconst(types::I64, 7);
            pos.ins().store(MemFlags::new(), seven, slot, 0);
            l2 = pos.ins().load(types::I64, MemFlags::new(), slot, 0);
            // a tainted value stored to another global taints its reload
            let other = pos.ins().symbol_value(types::I64, b);
            pos.ins().store(MemFlags::new(), l1, other, 0);
            l3 = pos.ins().load(types::I64, MemFlags::new(), other, 0);
            pos.ins().return_(&[]);
        }
        let cfg = ControlFlowGraph::with_function(&func);
        let du = DefUseGraph::for_function(&func, &cfg, false);
        let none = Intrinsics::new();
        let l1_inst = func.dfg.value_def(l1).unwrap_inst();

        for alias in [&BasicAliasAnalysis as &dyn AliasQuery, &AlwaysMust] {
            let map = compute_taint(&func, &none, &du, alias, ThreatModel::Speculative).unwrap();
            let taint = map.speculative().unwrap();
            assert_eq!(taint.origins(l1), Some(&BTreeSet::from([l1_inst])));
            assert!(taint.has_address_dependency(l0));
            assert!(!taint.has_address_dependency(p));
        }

        let map =
            compute_taint(&func, &none, &du, &BasicAliasAnalysis, ThreatModel::Speculative).unwrap();
        let taint = map.speculative().unwrap();
        // L0's address is a parameter, which may point at the global L1 is
        // stored to.
        assert_eq!(taint.origins(l0), Some(&BTreeSet::from([l1_inst])));
        assert!(!taint.is_tainted(l2));
        assert_eq!(taint.origins(l3), Some(&BTreeSet::from([l1_inst])));
        assert_eq!(taint.all_origins(), BTreeSet::from([l1_inst]));
    }

    #[test]
    fn params_calls_and_copies() {
        let mut func = Function::new();
        let buf = global(&mut func, "buf");
        let mut intrinsics = Intrinsics::new();
        let memcpy = intrinsics.declare(
            &mut func,
            Intrinsic::Memcpy,
            &[types::I64, types::I64, types::I64],
            &[],
        );
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
        let p = func.dfg.append_block_param(block0, types::I64);
        let q = func.dfg.append_block_param(block1, types::I64);
        let (a, x, ret, copy, reload);
        {
            let mut pos = FuncCursor::new(&mut func);
            pos.insert_block(block0);
            a = pos.ins().load(types::I64, MemFlags::new(), p, 0);
            x = pos.ins().load(types::I64, MemFlags::new(), a, 0);
            pos.ins().jump(block1, &[x]);
            pos.insert_block(block1);
            let call = pos.ins().call(callee, &[q]);
            ret = pos.func.dfg.inst_results(call)[0];
            let dst = pos.ins().symbol_value(types::I64, buf);
            let len = pos.ins().iconst(types::I64, 8);
            copy = pos.ins().call(memcpy, &[dst, a, len]);
            reload = pos.ins().load(types::I64, MemFlags::new(), dst, 0);
            pos.ins().return_(&[]);
        }
        let cfg = ControlFlowGraph::with_function(&func);
        let du = DefUseGraph::for_function(&func, &cfg, false);
        let map = compute_taint(
            &func,
            &intrinsics,
            &du,
            &BasicAliasAnalysis,
            ThreatModel::Speculative,
        )
        .unwrap();
        let taint = map.speculative().unwrap();
        let x_inst = func.dfg.value_def(x).unwrap_inst();
        assert_eq!(taint.origins(q), Some(&BTreeSet::from([x_inst])));
        assert!(!taint.is_tainted(ret));
        assert_eq!(taint.origins(reload), Some(&BTreeSet::from([copy])));
        // `a` reads through a parameter, which may alias the copy.
        assert_eq!(taint.origins(a), Some(&BTreeSet::from([copy])));
        assert_eq!(taint.num_tainted(), 4);
    }
}
