//! Symbolic CIL instructions, their assembly and stack verification.
//!
//! # Key Components
//!
//! - [`OpCode`], [`Operand`], [`Instruction`] - The instruction model
//! - [`ops`] - Operator families shared with expression trees and the emulator
//! - [`InstructionAssembler`] - Fluent emission with symbolic labels
//! - [`analyze_stack`] - Evaluation stack simulation for synthesized bodies

mod assembler;
mod instruction;
pub mod ops;
mod stack;

pub use assembler::InstructionAssembler;
pub use instruction::{FlowType, Instruction, OpCode, Operand, StackBehavior};
pub use stack::{analyze_stack, StackReport};
