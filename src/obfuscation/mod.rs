//! The async state machine transformation.
//!
//! This module rewrites ordinary method bodies into the shape the C# compiler produces for
//! `async` methods, without changing what they compute. Each method gets
//!
//! - a **frame** class holding its arguments, locals and synthetic variables
//! - one **awaiter** struct per statement, whose `GetResult` executes that statement
//! - a **state machine** struct whose `MoveNext` awaits those awaiters in program order
//! - a **startup stub** replacing the original body (plus a task-returning proxy for
//!   methods that return a value)
//!
//! Decompilers and analysts then see a chain of awaits over opaque, compiler-looking types
//! instead of the original straight-line code.
//!
//! # Architecture
//!
//! - [`Obfuscator`] - Batch driver: selection, parallel lifting, sequential transformation
//! - [`MethodTransformer`] - All-or-nothing transformation of a single method
//! - [`MoveNextBuilder`] - Suspension points and `GetResult` bodies
//! - [`FrameLayout`], [`StateMachineType`], [`AwaiterFactory`] - The generated types
//! - [`Naming`] - Anonymous or plain names for everything generated
//!
//! # Usage
//!
//! ```rust
//! use awaitscope::{
//!     analysis::StackLifter,
//!     assembly::InstructionAssembler,
//!     metadata::{
//!         method::MethodDef,
//!         module::{Module, TypeDef},
//!         signatures::{MethodSignature, TypeSignature},
//!     },
//!     obfuscation::{MethodOutcome, Obfuscator, ObfuscatorParameters},
//! };
//!
//! let mut module = Module::new("App.dll");
//! let program = module.add_type(TypeDef::new("App", "Program"));
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(1)?.add()?.ret()?;
//! let next = module.add_method(
//!     program,
//!     MethodDef::new(
//!         "Next",
//!         MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4]),
//!     )
//!     .with_body(asm.into_body(vec![])?),
//! )?;
//!
//! let parameters = ObfuscatorParameters::new().with_plain_names();
//! let report = Obfuscator::new(parameters).process(&mut module, &StackLifter);
//!
//! match &report.methods[0].outcome {
//!     MethodOutcome::Transformed(summary) => {
//!         assert_eq!(summary.method, next);
//!         assert_eq!(module.full_name(summary.state_machine)?, "App.Program/StateMachine_Next_1");
//!     }
//!     other => panic!("{other:?}"),
//! }
//! # Ok::<(), awaitscope::Error>(())
//! ```

mod awaiter;
mod config;
mod engine;
mod frame;
mod movenext;
mod naming;
mod statemachine;
mod stub;
mod transformer;

pub use awaiter::{AwaiterFactory, AwaiterType, Carrier};
pub use config::ObfuscatorParameters;
pub use engine::{
    eligibility, MethodOutcome, MethodReport, ObfuscationReport, Obfuscator, SkipReason,
};
pub use frame::FrameLayout;
pub use movenext::MoveNextBuilder;
pub use naming::Naming;
pub use statemachine::StateMachineType;
pub use transformer::{MethodTransformer, TransformSummary};

use crate::{
    assembly::analyze_stack,
    metadata::{method::MethodBody, module::Module, token::Token},
    Result,
};

/// Installs a synthesized body, verifying its stack first if requested.
///
/// A verified body gets the exact `max_stack`; a body failing verification is not installed.
pub(crate) fn install_body(
    module: &mut Module,
    method: Token,
    mut body: MethodBody,
    verify: bool,
) -> Result<()> {
    if verify {
        let signature = &module.method(method)?.signature;
        let report = analyze_stack(&body, module, signature).map_err(|err| {
            malformed_error!(
                "{} failed stack verification: {}",
                module.method_full_name(method),
                err
            )
        })?;
        body.max_stack = report.max_depth;
    }
    module.method_mut(method)?.body = Some(body);
    Ok(())
}
