//! Members of the runtime library used by the async state machine protocol.
//!
//! Transformed methods reference a fixed set of types and methods from
//! `System.Runtime.CompilerServices` and `System.Threading.Tasks`. Instead of importing them
//! as type references, they are modelled as closed enumerations: [`RuntimeType`] for types and
//! [`RuntimeMethod`] for methods. [`ReturnKind`] selects the right flavour of builder, task and
//! task awaiter for a method, the same way a compiler picks `AsyncVoidMethodBuilder` or
//! `AsyncTaskMethodBuilder<T>` for an `async` method.

use std::fmt;

use crate::metadata::{
    signatures::{MethodSignature, TypeSignature},
    token::Token,
};

/// A type provided by the runtime library
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeType {
    /// `System.Exception`
    Exception,
    /// `System.Action`
    Action,
    /// `System.Runtime.CompilerServices.IAsyncStateMachine`
    IAsyncStateMachine,
    /// `System.Runtime.CompilerServices.INotifyCompletion`
    INotifyCompletion,
    /// `System.Runtime.CompilerServices.AsyncVoidMethodBuilder`
    AsyncVoidMethodBuilder,
    /// `System.Runtime.CompilerServices.AsyncTaskMethodBuilder<T>`
    AsyncTaskMethodBuilder(Box<TypeSignature>),
    /// `System.Threading.Tasks.Task<T>`
    Task(Box<TypeSignature>),
    /// `System.Runtime.CompilerServices.TaskAwaiter<T>`
    TaskAwaiter(Box<TypeSignature>),
}

impl RuntimeType {
    /// Returns `true` for structs
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            RuntimeType::AsyncVoidMethodBuilder
                | RuntimeType::AsyncTaskMethodBuilder(_)
                | RuntimeType::TaskAwaiter(_)
        )
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Exception => write!(f, "System.Exception"),
            RuntimeType::Action => write!(f, "System.Action"),
            RuntimeType::IAsyncStateMachine => {
                write!(f, "System.Runtime.CompilerServices.IAsyncStateMachine")
            }
            RuntimeType::INotifyCompletion => {
                write!(f, "System.Runtime.CompilerServices.INotifyCompletion")
            }
            RuntimeType::AsyncVoidMethodBuilder => {
                write!(f, "System.Runtime.CompilerServices.AsyncVoidMethodBuilder")
            }
            RuntimeType::AsyncTaskMethodBuilder(t) => write!(
                f,
                "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1<{t}>"
            ),
            RuntimeType::Task(t) => write!(f, "System.Threading.Tasks.Task`1<{t}>"),
            RuntimeType::TaskAwaiter(t) => {
                write!(f, "System.Runtime.CompilerServices.TaskAwaiter`1<{t}>")
            }
        }
    }
}

/// What a method hands back to its caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// The method returns nothing
    Void,
    /// The method returns a value of the given type
    Value(TypeSignature),
}

impl ReturnKind {
    /// Derives the return kind from a return type
    #[must_use]
    pub fn from_return_type(return_type: &TypeSignature) -> Self {
        match return_type {
            TypeSignature::Void => ReturnKind::Void,
            other => ReturnKind::Value(other.clone()),
        }
    }

    /// The returned value type, `None` for void
    #[must_use]
    pub fn value_type(&self) -> Option<&TypeSignature> {
        match self {
            ReturnKind::Void => None,
            ReturnKind::Value(t) => Some(t),
        }
    }

    /// The method builder driving a state machine of this return kind
    #[must_use]
    pub fn builder_type(&self) -> TypeSignature {
        TypeSignature::Runtime(match self {
            ReturnKind::Void => RuntimeType::AsyncVoidMethodBuilder,
            ReturnKind::Value(t) => RuntimeType::AsyncTaskMethodBuilder(Box::new(t.clone())),
        })
    }

    /// The task handed out by the builder, `None` for void
    #[must_use]
    pub fn task_type(&self) -> Option<TypeSignature> {
        self.value_type()
            .map(|t| TypeSignature::Runtime(RuntimeType::Task(Box::new(t.clone()))))
    }

    /// The awaiter of the task handed out by the builder, `None` for void
    #[must_use]
    pub fn task_awaiter_type(&self) -> Option<TypeSignature> {
        self.value_type()
            .map(|t| TypeSignature::Runtime(RuntimeType::TaskAwaiter(Box::new(t.clone()))))
    }
}

/// A method provided by the runtime library
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeMethod {
    /// `System.Object::.ctor()`
    ObjectCtor,
    /// `Builder::Create()`
    BuilderCreate(ReturnKind),
    /// `Builder::Start<TStateMachine>(ref TStateMachine)`
    BuilderStart {
        /// Return kind selecting the builder
        kind: ReturnKind,
        /// The state machine type argument
        state_machine: Token,
    },
    /// `Builder::SetStateMachine(IAsyncStateMachine)`
    BuilderSetStateMachine(ReturnKind),
    /// `Builder::SetResult([T])`
    BuilderSetResult(ReturnKind),
    /// `Builder::SetException(Exception)`
    BuilderSetException(ReturnKind),
    /// `Builder::AwaitOnCompleted<TAwaiter, TStateMachine>(ref TAwaiter, ref TStateMachine)`
    BuilderAwaitOnCompleted {
        /// Return kind selecting the builder
        kind: ReturnKind,
        /// The awaiter type argument
        awaiter: Token,
        /// The state machine type argument
        state_machine: Token,
    },
    /// `AsyncTaskMethodBuilder<T>::get_Task()`
    BuilderGetTask(TypeSignature),
    /// `Task<T>::GetAwaiter()`
    TaskGetAwaiter(TypeSignature),
    /// `TaskAwaiter<T>::GetResult()`
    TaskAwaiterGetResult(TypeSignature),
}

impl RuntimeMethod {
    /// The signature of this method as seen from a call site
    #[must_use]
    pub fn signature(&self) -> MethodSignature {
        match self {
            RuntimeMethod::ObjectCtor => MethodSignature::new_instance(TypeSignature::Void, vec![]),
            RuntimeMethod::BuilderCreate(kind) => {
                MethodSignature::new_static(kind.builder_type(), vec![])
            }
            RuntimeMethod::BuilderStart { state_machine, .. } => MethodSignature::new_instance(
                TypeSignature::Void,
                vec![TypeSignature::ValueType(*state_machine).by_ref()],
            ),
            RuntimeMethod::BuilderSetStateMachine(_) => MethodSignature::new_instance(
                TypeSignature::Void,
                vec![TypeSignature::Runtime(RuntimeType::IAsyncStateMachine)],
            ),
            RuntimeMethod::BuilderSetResult(kind) => MethodSignature::new_instance(
                TypeSignature::Void,
                kind.value_type().cloned().into_iter().collect(),
            ),
            RuntimeMethod::BuilderSetException(_) => MethodSignature::new_instance(
                TypeSignature::Void,
                vec![TypeSignature::Runtime(RuntimeType::Exception)],
            ),
            RuntimeMethod::BuilderAwaitOnCompleted {
                awaiter,
                state_machine,
                ..
            } => MethodSignature::new_instance(
                TypeSignature::Void,
                vec![
                    TypeSignature::ValueType(*awaiter).by_ref(),
                    TypeSignature::ValueType(*state_machine).by_ref(),
                ],
            ),
            RuntimeMethod::BuilderGetTask(t) => MethodSignature::new_instance(
                TypeSignature::Runtime(RuntimeType::Task(Box::new(t.clone()))),
                vec![],
            ),
            RuntimeMethod::TaskGetAwaiter(t) => MethodSignature::new_instance(
                TypeSignature::Runtime(RuntimeType::TaskAwaiter(Box::new(t.clone()))),
                vec![],
            ),
            RuntimeMethod::TaskAwaiterGetResult(t) => {
                MethodSignature::new_instance(t.clone(), vec![])
            }
        }
    }

    /// The name of the method, as it appears in a member reference
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeMethod::ObjectCtor => ".ctor",
            RuntimeMethod::BuilderCreate(_) => "Create",
            RuntimeMethod::BuilderStart { .. } => "Start",
            RuntimeMethod::BuilderSetStateMachine(_) => "SetStateMachine",
            RuntimeMethod::BuilderSetResult(_) => "SetResult",
            RuntimeMethod::BuilderSetException(_) => "SetException",
            RuntimeMethod::BuilderAwaitOnCompleted { .. } => "AwaitOnCompleted",
            RuntimeMethod::BuilderGetTask(_) => "get_Task",
            RuntimeMethod::TaskGetAwaiter(_) => "GetAwaiter",
            RuntimeMethod::TaskAwaiterGetResult(_) => "GetResult",
        }
    }
}

impl fmt::Display for RuntimeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match self {
            RuntimeMethod::ObjectCtor => "System.Object".to_string(),
            RuntimeMethod::BuilderCreate(kind)
            | RuntimeMethod::BuilderStart { kind, .. }
            | RuntimeMethod::BuilderSetStateMachine(kind)
            | RuntimeMethod::BuilderSetResult(kind)
            | RuntimeMethod::BuilderSetException(kind)
            | RuntimeMethod::BuilderAwaitOnCompleted { kind, .. } => {
                kind.builder_type().to_string()
            }
            RuntimeMethod::BuilderGetTask(t) => {
                RuntimeType::AsyncTaskMethodBuilder(Box::new(t.clone())).to_string()
            }
            RuntimeMethod::TaskGetAwaiter(t) => RuntimeType::Task(Box::new(t.clone())).to_string(),
            RuntimeMethod::TaskAwaiterGetResult(t) => {
                RuntimeType::TaskAwaiter(Box::new(t.clone())).to_string()
            }
        };
        write!(f, "{owner}::{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_kind_has_no_task() {
        let kind = ReturnKind::from_return_type(&TypeSignature::Void);
        assert_eq!(kind, ReturnKind::Void);
        assert!(kind.task_type().is_none());
        assert_eq!(
            kind.builder_type(),
            TypeSignature::Runtime(RuntimeType::AsyncVoidMethodBuilder)
        );
    }

    #[test]
    fn value_kind_selects_generic_builder() {
        let kind = ReturnKind::from_return_type(&TypeSignature::I4);
        assert_eq!(
            kind.builder_type().to_string(),
            "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1<int32>"
        );
        assert!(kind.builder_type().is_value_type());
        assert!(kind.task_type().is_some_and(|t| t.is_reference()));
    }

    #[test]
    fn set_result_signature_follows_kind() {
        let void = RuntimeMethod::BuilderSetResult(ReturnKind::Void).signature();
        assert!(void.params.is_empty());

        let value = RuntimeMethod::BuilderSetResult(ReturnKind::Value(TypeSignature::R8));
        assert_eq!(value.signature().params, vec![TypeSignature::R8]);
        assert_eq!(
            value.to_string(),
            "System.Runtime.CompilerServices.AsyncTaskMethodBuilder`1<float64>::SetResult"
        );
    }
}
