//! Emulation error types.
//!
//! An [`EmulationError`] means the emulator could not continue: the body is ill-typed, a
//! limit was hit, or something outside the emulated surface was reached. Managed exceptions
//! raised by the emulated code are not errors; they surface as
//! [`crate::emulation::Outcome::Faulted`].

use thiserror::Error;

use crate::{assembly::OpCode, metadata::token::Token};

/// Errors that can occur during CIL emulation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmulationError {
    /// Pop from an empty evaluation stack.
    #[error("Stack underflow in {method}")]
    StackUnderflow {
        /// The executing method
        method: Token,
    },

    /// Execution ran past the last instruction of a body.
    #[error("Execution fell off the end of {method}")]
    FellOffEnd {
        /// The executing method
        method: Token,
    },

    /// An operation received values of the wrong kind.
    #[error("Type mismatch in {operation}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Operation being performed
        operation: &'static str,
        /// Expected kind of value
        expected: &'static str,
        /// Kind of value found
        found: &'static str,
    },

    /// An instruction carried the wrong kind of operand.
    #[error("Invalid operand for {opcode}: expected {expected}")]
    InvalidOperand {
        /// The instruction
        opcode: OpCode,
        /// Description of what was expected
        expected: &'static str,
    },

    /// Local variable index out of bounds.
    #[error("Local {index} out of bounds ({count} locals)")]
    LocalIndexOutOfBounds {
        /// The requested index
        index: usize,
        /// Number of locals available
        count: usize,
    },

    /// Argument index out of bounds.
    #[error("Argument {index} out of bounds ({count} arguments)")]
    ArgumentIndexOutOfBounds {
        /// The requested index
        index: usize,
        /// Number of arguments available
        count: usize,
    },

    /// A call passed the wrong number of arguments.
    #[error("{method} expects {expected} arguments, got {found}")]
    ArgumentCount {
        /// The callee
        method: String,
        /// Declared argument count, receiver included
        expected: usize,
        /// Number of arguments passed
        found: usize,
    },

    /// A managed pointer does not point at a live location.
    #[error("Invalid pointer - {0}")]
    InvalidPointer(String),

    /// A heap reference does not identify an object.
    #[error("Invalid heap reference {0}")]
    InvalidHeapReference(u64),

    /// The instruction budget is used up.
    #[error("Instruction limit exceeded: {executed} of {limit}")]
    InstructionLimitExceeded {
        /// Number of instructions executed
        executed: u64,
        /// Maximum allowed
        limit: u64,
    },

    /// Too many nested calls.
    #[error("Call depth {depth} exceeds the limit of {limit}")]
    CallDepthExceeded {
        /// Current call depth
        depth: usize,
        /// Maximum allowed depth
        limit: usize,
    },

    /// A called method has no body.
    #[error("Method {token} has no body")]
    MissingMethodBody {
        /// Token of the method
        token: Token,
    },

    /// An external method was called without a registered hook.
    #[error("No hook registered for {0}")]
    MissingHook(String),

    /// A state machine has neither completed its task nor queued a continuation.
    #[error("Task still pending after its state machine stopped")]
    PendingTask,

    /// A builder completed its task twice.
    #[error("Task {0} already completed")]
    TaskAlreadyCompleted(u64),

    /// The construct is outside the emulated surface.
    #[error("Unsupported - {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn converts_into_crate_error() {
        let err: Error = EmulationError::InstructionLimitExceeded {
            executed: 101,
            limit: 100,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Emulation failed - Instruction limit exceeded: 101 of 100"
        );
        assert!(!err.is_recoverable());
    }
}
