//! The managed heap.
//!
//! Objects are never collected: an emulation run is short and every [`HeapRef`] handed out
//! stays valid until the [`crate::emulation::Emulator`] is dropped.

use std::collections::BTreeMap;

use strum::Display;

use crate::{
    emulation::{
        value::{EmValue, HeapRef},
        EmulationError,
    },
    metadata::{signatures::TypeSignature, token::Token},
};

/// Exceptions raised by the execution engine itself, displayed with their runtime type name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FaultKind {
    /// Integer division or remainder by zero
    #[strum(serialize = "System.DivideByZeroException")]
    DivideByZero,
    /// Checked arithmetic or conversion overflow, `int.MinValue / -1`
    #[strum(serialize = "System.OverflowException")]
    Overflow,
    /// Dereferencing null
    #[strum(serialize = "System.NullReferenceException")]
    NullReference,
    /// Array index outside the bounds
    #[strum(serialize = "System.IndexOutOfRangeException")]
    IndexOutOfRange,
    /// `unbox.any` of a value with a different type
    #[strum(serialize = "System.InvalidCastException")]
    InvalidCast,
    /// An object thrown by the emulated code
    #[strum(serialize = "System.Exception")]
    Thrown,
}

/// Completion state of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// Not completed yet
    Pending,
    /// Completed with a result, `None` for a void builder
    Completed(Option<EmValue>),
    /// Completed with an exception
    Faulted(HeapRef),
}

/// An object on the managed heap
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    /// A string
    String(String),
    /// A single-dimensional, zero-based array
    Array {
        /// Element type
        element: TypeSignature,
        /// The elements
        items: Vec<EmValue>,
    },
    /// A class instance; `ty` is `None` for a plain `System.Object`
    Object {
        /// The class
        ty: Option<Token>,
        /// Field values, filled in lazily for fields never written
        fields: BTreeMap<Token, EmValue>,
    },
    /// A boxed value type
    Boxed {
        /// The value type
        ty: TypeSignature,
        /// The value
        value: EmValue,
    },
    /// An exception raised by the engine
    Exception(FaultKind),
    /// A task created by an async method builder
    Task(TaskState),
}

/// The managed heap, an append-only arena indexed by [`HeapRef`]
#[derive(Debug, Clone, Default)]
pub struct ManagedHeap {
    objects: Vec<HeapObject>,
}

impl ManagedHeap {
    /// Creates an empty heap
    #[must_use]
    pub fn new() -> Self {
        ManagedHeap::default()
    }

    /// Allocates `object` and returns its reference
    pub fn alloc(&mut self, object: HeapObject) -> HeapRef {
        let id = self.objects.len() as u64;
        self.objects.push(object);
        HeapRef(id)
    }

    /// Allocates a string
    pub fn alloc_string(&mut self, value: &str) -> HeapRef {
        self.alloc(HeapObject::String(value.to_string()))
    }

    /// Number of objects allocated so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if nothing has been allocated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The object behind `reference`
    ///
    /// # Errors
    /// Returns [`EmulationError::InvalidHeapReference`] for a reference not issued by this heap
    pub fn get(&self, reference: HeapRef) -> Result<&HeapObject, EmulationError> {
        usize::try_from(reference.0)
            .ok()
            .and_then(|index| self.objects.get(index))
            .ok_or(EmulationError::InvalidHeapReference(reference.0))
    }

    /// Mutable access to the object behind `reference`
    ///
    /// # Errors
    /// Returns [`EmulationError::InvalidHeapReference`] for a reference not issued by this heap
    pub fn get_mut(&mut self, reference: HeapRef) -> Result<&mut HeapObject, EmulationError> {
        usize::try_from(reference.0)
            .ok()
            .and_then(|index| self.objects.get_mut(index))
            .ok_or(EmulationError::InvalidHeapReference(reference.0))
    }

    /// The contents of a string object
    ///
    /// # Errors
    /// Returns an error if `reference` is not a string
    pub fn string(&self, reference: HeapRef) -> Result<&str, EmulationError> {
        match self.get(reference)? {
            HeapObject::String(value) => Ok(value),
            _ => Err(EmulationError::TypeMismatch {
                operation: "string access",
                expected: "string",
                found: "object",
            }),
        }
    }

    /// The state of a task object
    ///
    /// # Errors
    /// Returns an error if `reference` is not a task
    pub fn task(&self, reference: HeapRef) -> Result<&TaskState, EmulationError> {
        match self.get(reference)? {
            HeapObject::Task(state) => Ok(state),
            _ => Err(EmulationError::TypeMismatch {
                operation: "task access",
                expected: "task",
                found: "object",
            }),
        }
    }

    /// Moves a pending task into its final state
    ///
    /// # Errors
    /// Returns an error if `reference` is not a task or the task is already completed
    pub fn complete(&mut self, reference: HeapRef, state: TaskState) -> Result<(), EmulationError> {
        match self.get_mut(reference)? {
            HeapObject::Task(current @ TaskState::Pending) => {
                *current = state;
                Ok(())
            }
            HeapObject::Task(_) => Err(EmulationError::TaskAlreadyCompleted(reference.0)),
            _ => Err(EmulationError::TypeMismatch {
                operation: "task completion",
                expected: "task",
                found: "object",
            }),
        }
    }

    /// The class of an object, `None` for engine-created and runtime objects
    #[must_use]
    pub fn type_of(&self, reference: HeapRef) -> Option<Token> {
        match self.get(reference) {
            Ok(HeapObject::Object { ty, .. }) => *ty,
            _ => None,
        }
    }

    /// Classifies an exception object
    #[must_use]
    pub fn fault_kind(&self, exception: HeapRef) -> FaultKind {
        match self.get(exception) {
            Ok(HeapObject::Exception(kind)) => *kind,
            _ => FaultKind::Thrown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_stable() {
        let mut heap = ManagedHeap::new();
        let text = heap.alloc_string("hello");
        let boxed = heap.alloc(HeapObject::Boxed {
            ty: TypeSignature::I4,
            value: EmValue::I32(7),
        });
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.string(text).ok(), Some("hello"));
        assert!(heap.string(boxed).is_err());
        assert_eq!(
            heap.get(HeapRef::new(9)),
            Err(EmulationError::InvalidHeapReference(9))
        );
    }

    #[test]
    fn tasks_complete_once() -> Result<(), EmulationError> {
        let mut heap = ManagedHeap::new();
        let task = heap.alloc(HeapObject::Task(TaskState::Pending));
        heap.complete(task, TaskState::Completed(Some(EmValue::I32(5))))?;
        assert_eq!(
            heap.task(task)?,
            &TaskState::Completed(Some(EmValue::I32(5)))
        );
        assert_eq!(
            heap.complete(task, TaskState::Completed(None)),
            Err(EmulationError::TaskAlreadyCompleted(task.id()))
        );
        Ok(())
    }

    #[test]
    fn fault_classification() {
        let mut heap = ManagedHeap::new();
        let raised = heap.alloc(HeapObject::Exception(FaultKind::DivideByZero));
        let ty = Token::from_parts(Token::TYPE_DEF, 4);
        let thrown = heap.alloc(HeapObject::Object {
            ty: Some(ty),
            fields: BTreeMap::new(),
        });
        assert_eq!(heap.fault_kind(raised), FaultKind::DivideByZero);
        assert_eq!(heap.fault_kind(thrown), FaultKind::Thrown);
        assert_eq!(heap.type_of(thrown), Some(ty));
        assert_eq!(
            FaultKind::DivideByZero.to_string(),
            "System.DivideByZeroException"
        );
    }
}
