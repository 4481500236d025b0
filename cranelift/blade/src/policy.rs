//! Per-opcode and per-intrinsic policy tables.
//!
//! Every decision the taint engine and the leak classifier make about an
//! instruction kind is taken from the tables in this module. Opcodes with
//! special meaning are listed by name; the rest fall into a category by
//! their flags: calls, control flow, stores, loads, and pure operators.
//! Intrinsics are matched exhaustively, so a new intrinsic does not compile
//! until it has an entry here.

use crate::intrinsics::Intrinsic;
use cranelift_codegen::ir::Opcode;

/// How the taint fix-points treat the result of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValuePolicy {
    /// Constants and addresses of stack slots, globals and functions. Never
    /// speculatively tainted, always public.
    Constant,
    /// A side-effect free operator: the result depends on all operands.
    Pure,
    /// A memory read; the result depends on the aliasing writes.
    Load,
    /// A memory write; no result.
    Store,
    /// A call: an opaque boundary, unless it calls an intrinsic.
    Call,
    /// Control flow, fences and no-ops; no result.
    NoValue,
    /// Read-modify-write atomics, which the fix-points cannot express.
    Unsupported,
}

impl ValuePolicy {
    /// The policy for instructions with the given opcode.
    pub fn for_opcode(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Iconst
            | Opcode::F32const
            | Opcode::F64const
            | Opcode::Vconst
            | Opcode::StackAddr
            | Opcode::DynamicStackAddr
            | Opcode::SymbolValue
            | Opcode::GlobalValue
            | Opcode::TlsValue
            | Opcode::FuncAddr
            | Opcode::GetFramePointer
            | Opcode::GetStackPointer
            | Opcode::GetReturnAddress
            | Opcode::GetPinnedReg => Self::Constant,

            Opcode::AtomicRmw | Opcode::AtomicCas => Self::Unsupported,
            Opcode::Fence | Opcode::Nop => Self::NoValue,

            op if op.is_call() => Self::Call,
            op if op.is_branch() || op.is_terminator() => Self::NoValue,
            op if op.can_store() => Self::Store,
            op if op.can_load() => Self::Load,
            _ => Self::Pure,
        }
    }
}

/// How a public result lets the non-speculative fix-point conclude that
/// operands are public too.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InversePolicy {
    /// The operand is a function of the result alone.
    Invertible,
    /// Either operand is a function of the result and the other operand.
    InvertibleGivenOther,
    /// Nothing can be recovered from the result.
    NotInvertible,
}

impl InversePolicy {
    /// The inverse policy of the given opcode.
    pub fn for_opcode(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Bitcast
            | Opcode::Uextend
            | Opcode::Sextend
            | Opcode::Ineg
            | Opcode::Bnot
            | Opcode::Bswap
            | Opcode::Bitrev
            | Opcode::IaddImm
            | Opcode::IrsubImm
            | Opcode::BxorImm => Self::Invertible,
            Opcode::Iadd | Opcode::Isub | Opcode::Bxor => Self::InvertibleGivenOther,
            _ => Self::NotInvertible,
        }
    }
}

/// How the taint fix-points treat a call to an intrinsic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicTaint {
    /// The result depends on every argument.
    Passthrough,
    /// `memcpy(dst, src, len)` style copy.
    MemoryCopy,
    /// `memset(dst, val, len)` style fill.
    MemoryFill,
    /// The result, if any, is never tainted.
    Opaque,
    /// The fix-point cannot express this intrinsic.
    Invalid,
}

/// Which arguments of an intrinsic are transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntrinsicLeak {
    /// Every argument is a true transmitter.
    AllArgs,
    /// Destination and length are true transmitters, the fill value is a
    /// pseudo transmitter.
    Fill,
    /// The first argument, an address, is a true transmitter.
    Address,
    /// Nothing is transmitted.
    Nothing,
    /// Debugging and optimizer annotations. Nothing is transmitted, but the
    /// classifier warns once per kind.
    Benign,
    /// No entry; classification fails.
    Unknown,
}

/// The taint and leak policy of an intrinsic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntrinsicPolicy {
    /// Propagation rule.
    pub taint: IntrinsicTaint,
    /// Transmission rule.
    pub leak: IntrinsicLeak,
}

impl IntrinsicPolicy {
    /// The policy of the given intrinsic.
    pub fn for_intrinsic(intrinsic: Intrinsic) -> Self {
        let (taint, leak) = match intrinsic {
            Intrinsic::Memcpy | Intrinsic::Memmove => {
                (IntrinsicTaint::MemoryCopy, IntrinsicLeak::AllArgs)
            }
            Intrinsic::Memset => (IntrinsicTaint::MemoryFill, IntrinsicLeak::Fill),

            Intrinsic::Ctpop
            | Intrinsic::Ctlz
            | Intrinsic::Cttz
            | Intrinsic::Bswap
            | Intrinsic::Bitreverse
            | Intrinsic::Umin
            | Intrinsic::Umax
            | Intrinsic::Smin
            | Intrinsic::Smax
            | Intrinsic::Abs
            | Intrinsic::Sqrt
            | Intrinsic::Fabs
            | Intrinsic::Fma
            | Intrinsic::Expect => (IntrinsicTaint::Passthrough, IntrinsicLeak::Nothing),

            Intrinsic::DbgValue
            | Intrinsic::DbgDeclare
            | Intrinsic::LifetimeStart
            | Intrinsic::LifetimeEnd
            | Intrinsic::Assume => (IntrinsicTaint::Opaque, IntrinsicLeak::Benign),

            Intrinsic::Prefetch => (IntrinsicTaint::Opaque, IntrinsicLeak::Address),
            Intrinsic::StackSave => (IntrinsicTaint::Opaque, IntrinsicLeak::Nothing),
            Intrinsic::StackRestore | Intrinsic::VaStart | Intrinsic::VaEnd => {
                (IntrinsicTaint::Opaque, IntrinsicLeak::AllArgs)
            }

            Intrinsic::Setjmp => (IntrinsicTaint::Invalid, IntrinsicLeak::Nothing),
            Intrinsic::Unknown(_) => (IntrinsicTaint::Invalid, IntrinsicLeak::Unknown),
        };
        Self { taint, leak }
    }
}
