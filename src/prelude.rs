//! # awaitscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types from the
//! awaitscope library. Import this module to get quick access to everything needed to build
//! a module, transform it and check the result.
//!
//! ```rust
//! use awaitscope::prelude::*;
//!
//! let mut module = Module::new("App.dll");
//! let report = Obfuscator::new(ObfuscatorParameters::new()).process(&mut module, &StackLifter);
//! assert_eq!(report.transformed(), 0);
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all awaitscope operations
pub use crate::Error;

/// The result type used throughout awaitscope
pub use crate::Result;

// ================================================================================================
// Container Model
// ================================================================================================

/// Metadata token type for referencing rows
pub use crate::metadata::token::Token;

/// Types, fields and the module arena
pub use crate::metadata::module::{
    BaseType, FieldAttributes, FieldDef, Module, TypeAttributes, TypeDef,
};

/// Methods and call targets
pub use crate::metadata::method::{ExternalMethod, MethodBody, MethodDef, MethodRef};

/// Signatures and runtime library members
pub use crate::metadata::{
    runtime::{ReturnKind, RuntimeMethod, RuntimeType},
    signatures::{MethodSignature, TypeSignature},
};

// ================================================================================================
// Instructions
// ================================================================================================

/// Symbolic instructions and their assembly
pub use crate::assembly::{Instruction, InstructionAssembler, OpCode, Operand};

// ================================================================================================
// Analysis and Transformation
// ================================================================================================

/// Lifting bodies into statement trees
pub use crate::analysis::{AstCfg, Lifter, StackLifter};

/// The async state machine transformation
pub use crate::obfuscation::{
    MethodOutcome, MethodTransformer, ObfuscationReport, Obfuscator, ObfuscatorParameters,
    SkipReason, TransformSummary,
};

// ================================================================================================
// Emulation
// ================================================================================================

/// The reference emulator
pub use crate::emulation::{EmValue, Emulator, EmulatorOptions, FaultKind, Outcome};
