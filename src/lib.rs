// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # awaitscope
//!
//! A bytecode obfuscator for .NET that rewrites method bodies into async state machines.
//!
//! Every selected method keeps its signature and its observable behaviour, but its body is
//! replaced by a startup stub that creates a state machine and runs it. The original
//! statements end up spread over awaiter structs, one statement per `GetResult`, driven by a
//! `MoveNext` that looks like compiler output for an `async` method. Suspension points are
//! real: an awaiter that does not complete immediately makes the machine yield and resume.
//!
//! ## Features
//!
//! - **🧩 Statement-level splitting** - Each statement becomes its own awaiter type
//! - **🔀 Real suspension points** - Full `AwaitOnCompleted` protocol with resumption states
//! - **🛡️ All-or-nothing per method** - A method that can not be transformed is left untouched
//! - **⚡ Parallel lifting** - Method bodies are analyzed concurrently with `rayon`
//! - **🔍 Reference emulator** - Executes bodies before and after to verify equivalence
//!
//! ## Quick Start
//!
//! ```rust
//! use awaitscope::prelude::*;
//!
//! let mut module = Module::new("App.dll");
//! let program = module.add_type(TypeDef::new("App", "Program"));
//!
//! // static int Add(int a, int b) => a + b;
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
//! let before = module.clone();
//! let report = Obfuscator::new(ObfuscatorParameters::new()).process(&mut module, &StackLifter);
//! assert_eq!(report.transformed(), 1);
//!
//! let args = vec![EmValue::I32(3), EmValue::I32(4)];
//! let expected = Emulator::new(&before).call(add, args.clone())?;
//! let actual = Emulator::new(&module).call(add, args)?;
//! assert_eq!(expected, actual);
//! # Ok::<(), awaitscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - The in-memory module: types, fields, methods, signatures
//! - [`assembly`] - Symbolic instructions, label-based assembly and stack verification
//! - [`analysis`] - Lifting bodies into blocks of statements over expression trees
//! - [`obfuscation`] - The state machine transformation and its batch driver
//! - [`emulation`] - A reference interpreter including the async runtime
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]. Errors concerning a single method, see
//! [`Error::is_recoverable`], never abort a batch: the method is reported as failed and its
//! body stays as it was.

#[macro_use]
mod error;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust
/// use awaitscope::prelude::*;
///
/// let module = Module::new("App.dll");
/// assert_eq!(module.type_count(), 0);
/// ```
pub mod prelude;

/// Program analysis: lifting method bodies into statement trees
pub mod analysis;

/// Symbolic CIL instructions, assembly and stack verification
pub mod assembly;

/// Reference emulator used to check transformed methods
pub mod emulation;

/// The in-memory container model
pub mod metadata;

/// The async state machine transformation
pub mod obfuscation;

/// `awaitscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `awaitscope` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust
/// use awaitscope::{Error, metadata::{module::Module, token::Token}};
///
/// let module = Module::new("App.dll");
/// match module.method(Token::new(0x0600_0001)) {
///     Err(Error::MethodNotFound(token)) => assert_eq!(token.value(), 0x0600_0001),
///     other => panic!("{other:?}"),
/// }
/// ```
pub use error::Error;
