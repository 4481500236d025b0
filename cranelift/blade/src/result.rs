//! Result and error types of the blade pass.

use crate::intrinsics::Intrinsic;
use cranelift_codegen::ir::Inst;
use thiserror::Error;

/// An error aborting the pass on one function.
#[derive(Error, Debug)]
pub enum BladeError {
    /// The taint policy has no rule for an instruction.
    #[error("{func}: unhandled instruction {inst} in taint analysis: {what}")]
    UnhandledInstruction {
        /// The function being analyzed.
        func: String,
        /// The offending instruction.
        inst: Inst,
        /// What could not be handled.
        what: String,
    },

    /// The leak policy has no rule for an intrinsic.
    #[error("{func}: unhandled intrinsic {intrinsic} at {inst}")]
    UnhandledIntrinsic {
        /// The function being analyzed.
        func: String,
        /// The offending call.
        inst: Inst,
        /// The intrinsic called.
        intrinsic: Intrinsic,
    },

    /// A waypoint group that no cut can satisfy or that is malformed.
    #[error("invalid waypoint group: {0}")]
    InvalidWaypointGroup(String),

    /// Some walk through a group uses infinite-weight edges only.
    #[error("max-flow is unbounded: a group cannot be separated by finite edges")]
    UnboundedFlow,

    /// A constraint backend did not find a model.
    #[error("constraint solver failed: {result}")]
    SolverFailure {
        /// The solver's answer, `unsat` or `unknown`.
        result: String,
    },

    /// The run was cancelled through its `CancelFlag`.
    #[error("cancelled")]
    Cancelled,

    /// Writing statistics failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` that uses `BladeError` as the error type.
pub type BladeResult<T> = Result<T, BladeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn messages_name_the_function() {
        let err = BladeError::UnhandledInstruction {
            func: "f".to_string(),
            inst: Inst::new(3),
            what: "setjmp".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "f: unhandled instruction inst3 in taint analysis: setjmp"
        );
        let err = BladeError::UnhandledIntrinsic {
            func: "g".to_string(),
            inst: Inst::new(0),
            intrinsic: Intrinsic::Unknown(9),
        };
        assert_eq!(err.to_string(), "g: unhandled intrinsic intrinsic#9 at inst0");
    }
}
