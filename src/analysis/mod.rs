//! Program analysis: from stack-machine bodies to typed statement trees.
//!
//! The transformation does not work on raw instructions. It consumes a control flow graph
//! whose blocks hold statements over expression trees with explicit synthetic variables, the
//! form a decompiler front end produces. This module provides that representation, a lifter
//! building it from a [`crate::metadata::method::MethodBody`], and the type inference the
//! transformation uses to type captured variables.
//!
//! # Architecture
//!
//! - [`ast`] - Blocks, statements and expressions, blocks in an offset-indexed arena
//! - [`lifter`] - The [`Lifter`] seam and the default [`StackLifter`]
//! - [`inference`] - [`TypeInference`] over expression trees
//!
//! # Usage
//!
//! ```rust
//! use awaitscope::{
//!     analysis::{Lifter, StackLifter},
//!     assembly::InstructionAssembler,
//!     metadata::{
//!         method::MethodDef,
//!         module::{Module, TypeDef},
//!         signatures::{MethodSignature, TypeSignature},
//!     },
//! };
//!
//! let mut module = Module::new("App.dll");
//! let program = module.add_type(TypeDef::new("App", "Program"));
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldarg(1)?.add()?.ret()?;
//! let add = module.add_method(
//!     program,
//!     MethodDef::new(
//!         "Add",
//!         MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4; 2]),
//!     )
//!     .with_body(asm.into_body(vec![])?),
//! )?;
//!
//! let cfg = StackLifter.lift(&module, add)?;
//! assert_eq!(cfg.statement_count(), 1);
//! # Ok::<(), awaitscope::Error>(())
//! ```

pub mod ast;
pub mod inference;
pub mod lifter;

pub use ast::{AstBlock, AstCfg, Constant, Expression, Statement, StoreTarget, VariableId};
pub use inference::TypeInference;
pub use lifter::{Lifter, StackLifter};
