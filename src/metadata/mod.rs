//! The in-memory container model.
//!
//! A [`module::Module`] holds all type, field and method rows of one binary. Transformations
//! only ever append rows and replace method bodies, which keeps undoing a failed method cheap.
//!
//! # Key Components
//!
//! - [`token`] - Metadata tokens addressing rows
//! - [`signatures`] - Type and method signatures
//! - [`runtime`] - Runtime library members of the async protocol
//! - [`method`] - Method definitions, bodies, exception handlers and call targets
//! - [`module`] - Types, fields and the module arena itself

pub mod method;
pub mod module;
pub mod runtime;
pub mod signatures;
pub mod token;
