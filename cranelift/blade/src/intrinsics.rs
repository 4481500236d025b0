//! Compiler intrinsics reached through imported functions.
//!
//! Cranelift IR has no instruction for calling an intrinsic: the host
//! imports one function per intrinsic and calls it with `call`. An
//! `Intrinsics` table records which `FuncRef`s stand for intrinsics, so the
//! policy tables can tell a `memcpy` from an ordinary call. A call through
//! any `FuncRef` missing from the table is an ordinary call.

use core::fmt;
use cranelift_codegen::ir::{
    AbiParam, ExtFuncData, ExternalName, FuncRef, Function, Inst, InstructionData, Signature,
    Type,
};
use cranelift_codegen::isa::CallConv;
use std::collections::BTreeMap;

/// The intrinsics the policy tables know about.
///
/// `Unknown` carries the raw identifier of an intrinsic the tables have no
/// entry for.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Intrinsic {
    /// `memcpy(dst, src, len)`
    Memcpy,
    /// `memmove(dst, src, len)`
    Memmove,
    /// `memset(dst, val, len)`
    Memset,
    /// Population count.
    Ctpop,
    /// Count leading zeros.
    Ctlz,
    /// Count trailing zeros.
    Cttz,
    /// Byte swap.
    Bswap,
    /// Bit reversal.
    Bitreverse,
    /// Unsigned minimum.
    Umin,
    /// Unsigned maximum.
    Umax,
    /// Signed minimum.
    Smin,
    /// Signed maximum.
    Smax,
    /// Absolute value.
    Abs,
    /// Square root.
    Sqrt,
    /// Floating point absolute value.
    Fabs,
    /// Fused multiply-add.
    Fma,
    /// Branch-weight hint; returns its first argument.
    Expect,
    /// Debug info: value location.
    DbgValue,
    /// Debug info: variable declaration.
    DbgDeclare,
    /// Start of an object's lifetime.
    LifetimeStart,
    /// End of an object's lifetime.
    LifetimeEnd,
    /// Optimizer assumption.
    Assume,
    /// Cache prefetch of an address.
    Prefetch,
    /// Save the stack pointer.
    StackSave,
    /// Restore the stack pointer.
    StackRestore,
    /// Initialize a variadic argument list.
    VaStart,
    /// Finish a variadic argument list.
    VaEnd,
    /// Non-local goto target; returns twice.
    Setjmp,
    /// An intrinsic with no policy entry.
    Unknown(u32),
}

impl Intrinsic {
    /// The symbol an import of this intrinsic is named after.
    pub fn symbol(self) -> String {
        match self {
            Self::Unknown(id) => format!("intrinsic_{}", id),
            known => known.to_string(),
        }
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Memcpy => "memcpy",
            Self::Memmove => "memmove",
            Self::Memset => "memset",
            Self::Ctpop => "ctpop",
            Self::Ctlz => "ctlz",
            Self::Cttz => "cttz",
            Self::Bswap => "bswap",
            Self::Bitreverse => "bitreverse",
            Self::Umin => "umin",
            Self::Umax => "umax",
            Self::Smin => "smin",
            Self::Smax => "smax",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Fabs => "fabs",
            Self::Fma => "fma",
            Self::Expect => "expect",
            Self::DbgValue => "dbg_value",
            Self::DbgDeclare => "dbg_declare",
            Self::LifetimeStart => "lifetime_start",
            Self::LifetimeEnd => "lifetime_end",
            Self::Assume => "assume",
            Self::Prefetch => "prefetch",
            Self::StackSave => "stack_save",
            Self::StackRestore => "stack_restore",
            Self::VaStart => "va_start",
            Self::VaEnd => "va_end",
            Self::Setjmp => "setjmp",
            Self::Unknown(id) => return write!(f, "intrinsic#{}", id),
        };
        f.write_str(name)
    }
}

/// The imported functions of one `Function` that are intrinsics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Intrinsics {
    refs: BTreeMap<FuncRef, Intrinsic>,
}

impl Intrinsics {
    /// A table in which every call is an ordinary call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that calls through `func_ref` call `intrinsic`.
    pub fn insert(&mut self, func_ref: FuncRef, intrinsic: Intrinsic) {
        self.refs.insert(func_ref, intrinsic);
    }

    /// Import `intrinsic` into `func` with the given signature and record
    /// it.
    pub fn declare(
        &mut self,
        func: &mut Function,
        intrinsic: Intrinsic,
        params: &[Type],
        returns: &[Type],
    ) -> FuncRef {
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.extend(params.iter().map(|&ty| AbiParam::new(ty)));
        sig.returns.extend(returns.iter().map(|&ty| AbiParam::new(ty)));
        let signature = func.import_signature(sig);
        let func_ref = func.import_function(ExtFuncData {
            name: ExternalName::testcase(intrinsic.symbol()),
            signature,
            colocated: false,
        });
        self.insert(func_ref, intrinsic);
        func_ref
    }

    /// The intrinsic `func_ref` stands for.
    pub fn get(&self, func_ref: FuncRef) -> Option<Intrinsic> {
        self.refs.get(&func_ref).copied()
    }

    /// The intrinsic `inst` calls, if it is a direct call to one.
    pub fn called_by(&self, func: &Function, inst: Inst) -> Option<Intrinsic> {
        match func.dfg.insts[inst] {
            InstructionData::Call { func_ref, .. } => self.get(func_ref),
            _ => None,
        }
    }

    /// Number of recorded intrinsics.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Is no import an intrinsic?
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
