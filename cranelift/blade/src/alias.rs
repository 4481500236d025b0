//! Alias queries between memory accesses.
//!
//! The taint engine never looks at addresses itself; it asks an
//! `AliasQuery` oracle whether two accesses may touch the same bytes. Two
//! oracles are provided: `BasicAliasAnalysis`, which resolves addresses to
//! a base plus a constant offset, and `ConservativeAlias`, which only
//! recognizes identical addresses.

use crate::intrinsics::{Intrinsic, Intrinsics};
use cranelift_codegen::ir::{
    Function, GlobalValue, Inst, InstructionData, Opcode, StackSlot, Type, Value, ValueDef,
};
use smallvec::SmallVec;

/// The answer of an alias query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AliasResult {
    /// The two accesses never overlap.
    NoAlias,
    /// The two accesses may overlap.
    MayAlias,
    /// The two accesses always cover exactly the same bytes.
    MustAlias,
}

impl AliasResult {
    /// `MayAlias` or `MustAlias`.
    pub fn may_alias(self) -> bool {
        self != Self::NoAlias
    }
}

/// The start of an access: an address value, or a stack slot accessed
/// directly by `stack_load` and `stack_store`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    /// An address operand.
    Value(Value),
    /// A stack slot.
    Slot(StackSlot),
}

/// A range of memory touched by an instruction: `size` bytes starting at
/// `addr + offset`. `size` is `None` when it is not a compile-time constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLocation {
    /// Where the access starts.
    pub addr: Address,
    /// Constant offset added to `addr`.
    pub offset: i64,
    /// Access size in bytes, if known.
    pub size: Option<u64>,
}

/// Number of bytes a load or store with `opcode` moves, given the type of
/// the value loaded or stored.
fn access_bytes(opcode: Opcode, ty: Type) -> u64 {
    match opcode {
        Opcode::Uload8 | Opcode::Sload8 | Opcode::Istore8 => 1,
        Opcode::Uload16 | Opcode::Sload16 | Opcode::Istore16 => 2,
        Opcode::Uload32 | Opcode::Sload32 | Opcode::Istore32 => 4,
        Opcode::Uload8x8
        | Opcode::Sload8x8
        | Opcode::Uload16x4
        | Opcode::Sload16x4
        | Opcode::Uload32x2
        | Opcode::Sload32x2 => 8,
        _ => u64::from(ty.bytes()),
    }
}

/// The address operand of a load.
pub fn load_address(func: &Function, inst: Inst) -> Option<Value> {
    match func.dfg.insts[inst] {
        InstructionData::Load { arg, .. } => Some(arg),
        InstructionData::LoadNoOffset {
            opcode: Opcode::AtomicLoad,
            arg,
            ..
        } => Some(arg),
        _ => None,
    }
}

/// The data and address operands of a store. Stores to a stack slot have
/// no address operand.
pub fn store_operands(func: &Function, inst: Inst) -> Option<(Value, Option<Value>)> {
    match func.dfg.insts[inst] {
        InstructionData::Store { args, .. } => Some((args[0], Some(args[1]))),
        InstructionData::StoreNoOffset {
            opcode: Opcode::AtomicStore,
            args,
            ..
        } => Some((args[0], Some(args[1]))),
        InstructionData::StackStore { arg, .. } => Some((arg, None)),
        _ => None,
    }
}

/// The byte count argument of a memory intrinsic, when it is a
/// non-negative constant.
fn length_argument(func: &Function, len: Value) -> Option<u64> {
    constant_value(func, len).and_then(|len| u64::try_from(len).ok())
}

/// Memory locations read by `inst`.
pub fn read_locations(
    func: &Function,
    intrinsics: &Intrinsics,
    inst: Inst,
) -> SmallVec<[MemoryLocation; 2]> {
    let mut locs = SmallVec::new();
    let result_type = func
        .dfg
        .inst_results(inst)
        .first()
        .map(|&v| func.dfg.value_type(v));
    match func.dfg.insts[inst] {
        InstructionData::Load {
            opcode,
            arg,
            offset,
            ..
        } => locs.push(MemoryLocation {
            addr: Address::Value(arg),
            offset: i64::from(offset),
            size: result_type.map(|ty| access_bytes(opcode, ty)),
        }),
        InstructionData::LoadNoOffset {
            opcode: Opcode::AtomicLoad,
            arg,
            ..
        } => locs.push(MemoryLocation {
            addr: Address::Value(arg),
            offset: 0,
            size: result_type.map(|ty| u64::from(ty.bytes())),
        }),
        InstructionData::StackLoad {
            opcode: Opcode::StackLoad,
            stack_slot,
            offset,
        } => locs.push(MemoryLocation {
            addr: Address::Slot(stack_slot),
            offset: i64::from(offset),
            size: result_type.map(|ty| u64::from(ty.bytes())),
        }),
        InstructionData::Call { .. } => {
            let args = func.dfg.inst_args(inst);
            if let (Some(Intrinsic::Memcpy | Intrinsic::Memmove), &[_, src, len]) =
                (intrinsics.called_by(func, inst), args)
            {
                locs.push(MemoryLocation {
                    addr: Address::Value(src),
                    offset: 0,
                    size: length_argument(func, len),
                });
            }
        }
        _ => {}
    }
    locs
}

/// Memory locations written by `inst`.
pub fn written_locations(
    func: &Function,
    intrinsics: &Intrinsics,
    inst: Inst,
) -> SmallVec<[MemoryLocation; 2]> {
    let mut locs = SmallVec::new();
    match func.dfg.insts[inst] {
        InstructionData::Store {
            opcode,
            args,
            offset,
            ..
        } => locs.push(MemoryLocation {
            addr: Address::Value(args[1]),
            offset: i64::from(offset),
            size: Some(access_bytes(opcode, func.dfg.value_type(args[0]))),
        }),
        InstructionData::StoreNoOffset {
            opcode: Opcode::AtomicStore,
            args,
            ..
        } => locs.push(MemoryLocation {
            addr: Address::Value(args[1]),
            offset: 0,
            size: Some(u64::from(func.dfg.value_type(args[0]).bytes())),
        }),
        InstructionData::StackStore {
            arg,
            stack_slot,
            offset,
            ..
        } => locs.push(MemoryLocation {
            addr: Address::Slot(stack_slot),
            offset: i64::from(offset),
            size: Some(u64::from(func.dfg.value_type(arg).bytes())),
        }),
        InstructionData::Call { .. } => {
            let args = func.dfg.inst_args(inst);
            if let (
                Some(Intrinsic::Memcpy | Intrinsic::Memmove | Intrinsic::Memset),
                &[dst, _, len],
            ) = (intrinsics.called_by(func, inst), args)
            {
                locs.push(MemoryLocation {
                    addr: Address::Value(dst),
                    offset: 0,
                    size: length_argument(func, len),
                });
            }
        }
        _ => {}
    }
    locs
}

/// The alias oracle consumed by the taint engine.
pub trait AliasQuery {
    /// May `a` and `b` overlap?
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult;

    /// The strongest relation between any location read by `load` and any
    /// location written by `write`.
    fn load_store_alias(
        &self,
        func: &Function,
        intrinsics: &Intrinsics,
        load: Inst,
        write: Inst,
    ) -> AliasResult {
        let mut result = AliasResult::NoAlias;
        for r in read_locations(func, intrinsics, load) {
            for w in written_locations(func, intrinsics, write) {
                match self.alias(func, &r, &w) {
                    AliasResult::MustAlias => return AliasResult::MustAlias,
                    AliasResult::MayAlias => result = AliasResult::MayAlias,
                    AliasResult::NoAlias => {}
                }
            }
        }
        result
    }
}

impl<'a, A: AliasQuery + ?Sized> AliasQuery for &'a A {
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        (**self).alias(func, a, b)
    }
}

/// Only identical addresses with identical offsets and sizes are related;
/// everything else may alias.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConservativeAlias;

impl AliasQuery for ConservativeAlias {
    fn alias(&self, _func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        if a.addr == b.addr && a.offset == b.offset && a.size.is_some() && a.size == b.size {
            AliasResult::MustAlias
        } else {
            AliasResult::MayAlias
        }
    }
}

/// The object an address points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Base {
    StackSlot(StackSlot),
    Global(GlobalValue),
    Value(Value),
}

/// Resolves addresses through constant additions to a base object plus an
/// offset. Distinct stack slots and globals never alias; accesses to the
/// same base are compared by byte range.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicAliasAnalysis;

impl BasicAliasAnalysis {
    fn resolve(func: &Function, addr: Address) -> (Base, i64) {
        let mut value = match addr {
            Address::Value(value) => value,
            Address::Slot(slot) => return (Base::StackSlot(slot), 0),
        };
        let mut offset: i64 = 0;
        loop {
            let inst = match func.dfg.value_def(value) {
                ValueDef::Result(inst, _) => inst,
                _ => return (Base::Value(value), offset),
            };
            match func.dfg.insts[inst] {
                InstructionData::StackLoad {
                    opcode: Opcode::StackAddr,
                    stack_slot,
                    offset: slot_offset,
                } => return (Base::StackSlot(stack_slot), offset.wrapping_add(slot_offset.into())),
                InstructionData::UnaryGlobalValue {
                    opcode: Opcode::SymbolValue | Opcode::GlobalValue,
                    global_value,
                } => return (Base::Global(global_value), offset),
                InstructionData::BinaryImm64 {
                    opcode: Opcode::IaddImm,
                    arg,
                    imm,
                } => {
                    offset = offset.wrapping_add(imm.bits());
                    value = arg;
                }
                InstructionData::Binary {
                    opcode: Opcode::Iadd,
                    args: [x, y],
                } => match (constant_value(func, x), constant_value(func, y)) {
                    (_, Some(c)) => {
                        offset = offset.wrapping_add(c);
                        value = x;
                    }
                    (Some(c), None) => {
                        offset = offset.wrapping_add(c);
                        value = y;
                    }
                    (None, None) => return (Base::Value(value), offset),
                },
                InstructionData::Binary {
                    opcode: Opcode::Isub,
                    args: [x, y],
                } => match constant_value(func, y) {
                    Some(c) => {
                        offset = offset.wrapping_sub(c);
                        value = x;
                    }
                    None => return (Base::Value(value), offset),
                },
                _ => return (Base::Value(value), offset),
            }
        }
    }
}

impl AliasQuery for BasicAliasAnalysis {
    fn alias(&self, func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        let (base_a, off_a) = Self::resolve(func, a.addr);
        let (base_b, off_b) = Self::resolve(func, b.addr);
        let start_a = off_a.wrapping_add(a.offset);
        let start_b = off_b.wrapping_add(b.offset);
        match (base_a, base_b) {
            (Base::Value(_), _) | (_, Base::Value(_)) if base_a != base_b => AliasResult::MayAlias,
            _ if base_a != base_b => AliasResult::NoAlias,
            _ => match (a.size.map(i64::try_from), b.size.map(i64::try_from)) {
                (Some(Ok(size_a)), Some(Ok(size_b))) => {
                    if start_a == start_b && size_a == size_b {
                        AliasResult::MustAlias
                    } else if start_a.saturating_add(size_a) <= start_b
                        || start_b.saturating_add(size_b) <= start_a
                    {
                        AliasResult::NoAlias
                    } else {
                        AliasResult::MayAlias
                    }
                }
                _ => AliasResult::MayAlias,
            },
        }
    }
}

/// The value of `v` when it is an `iconst`.
pub fn constant_value(func: &Function, v: Value) -> Option<i64> {
    let inst = func.dfg.value_def(v).inst()?;
    match func.dfg.insts[inst] {
        InstructionData::UnaryImm {
            opcode: Opcode::Iconst,
            imm,
        } => Some(imm.bits()),
        _ => None,
    }
}
