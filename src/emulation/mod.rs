//! Reference emulator for CIL method bodies.
//!
//! The emulator executes methods of a [`crate::metadata::module::Module`] directly from their
//! symbolic instructions. It exists to check transformations: running a method before and
//! after it was rewritten into a state machine must produce the same return value, the same
//! exception and the same sequence of observable calls.
//!
//! # Architecture
//!
//! - [`Emulator`] - The interpreter, one frame per call, plus the single-threaded async
//!   runtime behind the builder and task members of [`crate::metadata::runtime::RuntimeMethod`]
//! - [`EmValue`] - Values on the evaluation stack, in locals and in fields
//! - [`ManagedHeap`] - Arena of objects, strings, boxed values, exceptions and tasks
//! - [`EmulationError`] - Conditions that stop the emulator; managed exceptions are reported
//!   through [`Outcome::Faulted`] instead
//!
//! External methods are not emulated. Register a native implementation with
//! [`Emulator::hook`] under the `Type::Name` of the method.
//!
//! # Example
//!
//! ```rust
//! use awaitscope::emulation::{EmValue, Emulator, EmulatorOptions};
//! use awaitscope::metadata::module::Module;
//!
//! let module = Module::new("Empty.dll");
//! let options = EmulatorOptions {
//!     max_instructions: 10_000,
//!     ..Default::default()
//! };
//! let mut emulator = Emulator::with_options(&module, options);
//! let text = emulator.alloc_string("hello");
//! assert!(matches!(text, EmValue::ObjectRef(_)));
//! ```

mod engine;
mod error;
mod heap;
pub(crate) mod ops;
mod value;

pub use engine::{Emulator, EmulatorOptions, Fault, Outcome, TraceEvent};
pub use error::EmulationError;
pub use heap::{FaultKind, HeapObject, ManagedHeap, TaskState};
pub use value::{default_value, EmValue, HeapRef, ManagedPointer, PointerTarget};
