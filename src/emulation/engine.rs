//! The interpreter and the async runtime model.
//!
//! [`Emulator::call`] runs a method of a [`Module`] to completion. Calls into the module are
//! interpreted recursively, each with its own frame of arguments and locals; managed pointers
//! name locations by frame depth, so a callee can write through a pointer into its caller's
//! locals, which is how value-type receivers and `ref` arguments work.
//!
//! # Async runtime
//!
//! The members of [`RuntimeMethod`] are implemented natively, following the behaviour of the
//! .NET builders on a single thread:
//!
//! - `Create` allocates a pending task, `get_Task` returns it
//! - `Start` runs `MoveNext` on the caller's state machine, then drains the continuation
//!   queue in FIFO order; a task still pending afterwards is an error
//! - `AwaitOnCompleted` boxes the state machine (once; a machine already running from its box
//!   reuses it) and queues its `MoveNext` as continuation
//! - `SetResult`/`SetException` complete the task; a void builder has no task to observe, so
//!   its exception never reaches the caller of `Start`. The runtime would raise it on the
//!   thread pool; the emulator collects it in [`Emulator::unobserved_faults`]
//!
//! With [`EmulatorOptions::force_suspend`], `get_IsCompleted` of every awaiter defined in the
//! module reports `false`, so that every suspension point actually suspends once.
//!
//! # Example
//!
//! ```rust
//! use awaitscope::{
//!     assembly::InstructionAssembler,
//!     emulation::{EmValue, Emulator, Outcome},
//!     metadata::{
//!         method::MethodDef,
//!         module::{Module, TypeDef},
//!         signatures::{MethodSignature, TypeSignature},
//!     },
//! };
//!
//! let mut module = Module::new("App.dll");
//! let program = module.add_type(TypeDef::new("App", "Program"));
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldarg(1)?.mul()?.ret()?;
//! let mul = module.add_method(
//!     program,
//!     MethodDef::new(
//!         "Mul",
//!         MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4; 2]),
//!     )
//!     .with_body(asm.into_body(vec![])?),
//! )?;
//!
//! let mut emulator = Emulator::new(&module);
//! let outcome = emulator.call(mul, vec![EmValue::I32(6), EmValue::I32(7)])?;
//! assert_eq!(outcome, Outcome::Returned(Some(EmValue::I32(42))));
//! # Ok::<(), awaitscope::Error>(())
//! ```

use std::collections::{hash_map::Entry, HashMap, VecDeque};

use log::{debug, trace};

use crate::{
    assembly::{
        ops::{BinaryOp, BranchKind, CompareOp, ConversionType, ElementKind, UnaryOp},
        Instruction, OpCode, Operand,
    },
    emulation::{
        heap::{FaultKind, HeapObject, ManagedHeap, TaskState},
        ops::{self, Trap},
        value::{default_value, instance_fields, EmValue, HeapRef, ManagedPointer, PointerTarget},
        EmulationError,
    },
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodDef, MethodRef},
        module::{InterfaceMethod, Module},
        runtime::{ReturnKind, RuntimeMethod, RuntimeType},
        signatures::TypeSignature,
        token::Token,
    },
    Error,
};

/// Limits and switches of an [`Emulator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorOptions {
    /// Report every module-defined awaiter as not completed, forcing each suspension point to
    /// go through `AwaitOnCompleted` and a resumption
    pub force_suspend: bool,
    /// Maximum number of instructions per [`Emulator::call`]
    pub max_instructions: u64,
    /// Record [`TraceEvent`]s
    pub trace: bool,
    /// Maximum depth of nested calls
    pub max_call_depth: usize,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        EmulatorOptions {
            force_suspend: false,
            max_instructions: 1_000_000,
            trace: false,
            max_call_depth: 128,
        }
    }
}

/// An observable step of the emulated program
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A method was called, by full name
    Call {
        /// `Type::Method`
        method: String,
    },
    /// A value was stored into an instance or static field
    FieldStore {
        /// The field
        field: Token,
        /// The stored value, after conversion to the field type
        value: EmValue,
    },
}

/// An exception that escaped the called method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// What kind of exception
    pub kind: FaultKind,
    /// The exception object
    pub exception: HeapRef,
}

/// How a call ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Normal return, with the return value of a non-void method
    Returned(Option<EmValue>),
    /// An exception propagated out of the method
    Faulted(Fault),
}

impl Outcome {
    /// The returned value, if any
    #[must_use]
    pub fn value(&self) -> Option<&EmValue> {
        match self {
            Outcome::Returned(value) => value.as_ref(),
            Outcome::Faulted(_) => None,
        }
    }

    /// The kind of the escaped exception, if any
    #[must_use]
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Outcome::Returned(_) => None,
            Outcome::Faulted(fault) => Some(fault.kind),
        }
    }
}

/// A native implementation of an external method
type NativeHook<'m> = Box<dyn FnMut(&mut ManagedHeap, &[EmValue]) -> crate::Result<Option<EmValue>> + 'm>;

/// Why execution of a body stopped early
enum Unwind {
    /// A managed exception is propagating
    Exception(HeapRef),
    /// The emulator can not continue
    Error(Error),
}

impl From<Error> for Unwind {
    fn from(err: Error) -> Self {
        Unwind::Error(err)
    }
}

impl From<EmulationError> for Unwind {
    fn from(err: EmulationError) -> Self {
        Unwind::Error(err.into())
    }
}

/// What to do after an instruction
enum Flow {
    Next,
    Jump(usize),
    Leave(usize),
    Return(Option<EmValue>),
}

struct Frame<'m> {
    arguments: Vec<EmValue>,
    argument_types: Vec<TypeSignature>,
    locals: Vec<EmValue>,
    local_types: &'m [TypeSignature],
}

/// Executes method bodies of a module
pub struct Emulator<'m> {
    module: &'m Module,
    options: EmulatorOptions,
    heap: ManagedHeap,
    statics: HashMap<Token, EmValue>,
    frames: Vec<Frame<'m>>,
    hooks: HashMap<String, NativeHook<'m>>,
    continuations: VecDeque<(&'m MethodDef, HeapRef)>,
    trace: Vec<TraceEvent>,
    unobserved: Vec<Fault>,
    executed: u64,
}

impl<'m> Emulator<'m> {
    /// Creates an emulator with default options
    #[must_use]
    pub fn new(module: &'m Module) -> Self {
        Self::with_options(module, EmulatorOptions::default())
    }

    /// Creates an emulator
    #[must_use]
    pub fn with_options(module: &'m Module, options: EmulatorOptions) -> Self {
        Emulator {
            module,
            options,
            heap: ManagedHeap::new(),
            statics: HashMap::new(),
            frames: Vec::new(),
            hooks: HashMap::new(),
            continuations: VecDeque::new(),
            trace: Vec::new(),
            unobserved: Vec::new(),
            executed: 0,
        }
    }

    /// Registers the implementation of an external method, keyed by `Type::Name`.
    ///
    /// The hook receives the heap and the arguments, receiver first, and returns the return
    /// value of a non-void method. Constructors (`Type::.ctor`) return the new object.
    pub fn hook<F>(&mut self, name: &str, hook: F) -> &mut Self
    where
        F: FnMut(&mut ManagedHeap, &[EmValue]) -> crate::Result<Option<EmValue>> + 'm,
    {
        self.hooks.insert(name.to_string(), Box::new(hook));
        self
    }

    /// Calls `method` with `arguments`, receiver first.
    ///
    /// Exceptions escaping the method are part of the [`Outcome`]; the emulator stays usable
    /// afterwards, with heap and static fields preserved.
    ///
    /// # Errors
    /// Returns [`Error::Emulation`] if execution can not continue, and lookup errors for
    /// dangling tokens
    pub fn call(&mut self, method: Token, arguments: Vec<EmValue>) -> crate::Result<Outcome> {
        let def = self.module.method(method)?;
        let expected = def.signature.arg_count();
        if arguments.len() != expected {
            return Err(EmulationError::ArgumentCount {
                method: self.module.method_full_name(method),
                expected,
                found: arguments.len(),
            }
            .into());
        }

        self.executed = 0;
        match self.invoke(&MethodRef::Def(method), arguments) {
            Ok(value) => Ok(Outcome::Returned(value)),
            Err(Unwind::Exception(exception)) => Ok(Outcome::Faulted(Fault {
                kind: self.heap.fault_kind(exception),
                exception,
            })),
            Err(Unwind::Error(err)) => {
                self.frames.clear();
                self.continuations.clear();
                Err(err)
            }
        }
    }

    /// The managed heap
    #[must_use]
    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    /// Mutable access to the heap, to prepare arguments
    pub fn heap_mut(&mut self) -> &mut ManagedHeap {
        &mut self.heap
    }

    /// Allocates a string and returns a reference to it
    pub fn alloc_string(&mut self, value: &str) -> EmValue {
        EmValue::ObjectRef(self.heap.alloc_string(value))
    }

    /// The recorded trace, empty unless [`EmulatorOptions::trace`] is set
    #[must_use]
    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    /// The values stored into `field`, in order
    pub fn field_stores(&self, field: Token) -> impl Iterator<Item = &EmValue> + '_ {
        self.trace.iter().filter_map(move |event| match event {
            TraceEvent::FieldStore { field: f, value } if *f == field => Some(value),
            _ => None,
        })
    }

    /// Exceptions handed to a void builder, which no caller can observe
    #[must_use]
    pub fn unobserved_faults(&self) -> &[Fault] {
        &self.unobserved
    }

    /// Number of instructions executed by the last [`Emulator::call`]
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// The current value of a static field, `None` if it was never accessed
    #[must_use]
    pub fn static_value(&self, field: Token) -> Option<&EmValue> {
        self.statics.get(&field)
    }

    fn record(&mut self, event: TraceEvent) {
        if self.options.trace {
            self.trace.push(event);
        }
    }

    fn raise(&mut self, kind: FaultKind) -> Unwind {
        Unwind::Exception(self.heap.alloc(HeapObject::Exception(kind)))
    }

    fn trap(&mut self, trap: Trap) -> Unwind {
        match trap {
            Trap::Fault(kind) => self.raise(kind),
            Trap::Error(err) => err.into(),
        }
    }

    fn invoke(&mut self, method: &MethodRef, arguments: Vec<EmValue>) -> Result<Option<EmValue>, Unwind> {
        let module = self.module;
        match method {
            MethodRef::Def(token) => {
                let def = module.method(*token)?;
                self.record(TraceEvent::Call {
                    method: module.method_full_name(*token),
                });
                if self.options.force_suspend
                    && def.name == "get_IsCompleted"
                    && module
                        .type_def(def.declaring_type)?
                        .implements(&RuntimeType::INotifyCompletion)
                {
                    return Ok(Some(EmValue::I32(0)));
                }
                self.execute(def, arguments)
            }
            MethodRef::Runtime(runtime) => {
                self.record(TraceEvent::Call {
                    method: runtime.to_string(),
                });
                self.invoke_runtime(runtime, arguments)
            }
            MethodRef::External(external) => {
                let name = external.full_name();
                self.record(TraceEvent::Call {
                    method: name.clone(),
                });
                let Some(hook) = self.hooks.get_mut(&name) else {
                    return Err(EmulationError::MissingHook(name).into());
                };
                Ok(hook(&mut self.heap, &arguments)?)
            }
        }
    }

    fn execute(&mut self, method: &'m MethodDef, arguments: Vec<EmValue>) -> Result<Option<EmValue>, Unwind> {
        let module = self.module;
        let depth = self.frames.len();
        if depth >= self.options.max_call_depth {
            return Err(EmulationError::CallDepthExceeded {
                depth: depth + 1,
                limit: self.options.max_call_depth,
            }
            .into());
        }
        let Some(body) = method.body.as_ref() else {
            return Err(EmulationError::MissingMethodBody {
                token: method.token,
            }
            .into());
        };

        let mut argument_types = Vec::with_capacity(arguments.len());
        let mut coerced = Vec::with_capacity(arguments.len());
        for (index, argument) in arguments.into_iter().enumerate() {
            let index = u16::try_from(index)
                .map_err(|_| EmulationError::Unsupported(format!("argument {index}")))?;
            let ty = module.argument_type(method, index)?;
            coerced.push(argument.coerce(&ty));
            argument_types.push(ty);
        }
        let locals = body
            .locals
            .iter()
            .map(|ty| default_value(module, ty))
            .collect::<crate::Result<Vec<_>>>()?;

        self.frames.push(Frame {
            arguments: coerced,
            argument_types,
            locals,
            local_types: &body.locals,
        });
        let result = self.run(method, body, depth);
        self.frames.pop();
        result
    }

    fn run(&mut self, method: &'m MethodDef, body: &'m MethodBody, frame: usize) -> Result<Option<EmValue>, Unwind> {
        let mut stack = Vec::new();
        let mut pc = 0;

        loop {
            let Some(instruction) = body.instructions.get(pc) else {
                return Err(EmulationError::FellOffEnd {
                    method: method.token,
                }
                .into());
            };

            self.executed += 1;
            if self.executed > self.options.max_instructions {
                return Err(EmulationError::InstructionLimitExceeded {
                    executed: self.executed,
                    limit: self.options.max_instructions,
                }
                .into());
            }

            match self.step(method, frame, instruction, &mut stack) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Leave(target)) => {
                    stack.clear();
                    pc = target;
                }
                Ok(Flow::Return(value)) => return Ok(value),
                Err(Unwind::Exception(exception)) => match self.handler(body, pc, exception) {
                    Some(handler) => {
                        trace!(
                            "{}: exception caught at IL_{:04x}",
                            self.module.method_full_name(method.token),
                            pc
                        );
                        stack.clear();
                        stack.push(EmValue::ObjectRef(exception));
                        pc = handler.handler_start;
                    }
                    None => return Err(Unwind::Exception(exception)),
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn handler(&self, body: &'m MethodBody, pc: usize, exception: HeapRef) -> Option<&'m ExceptionHandler> {
        body.exception_handlers.iter().find(|handler| {
            handler.flags == ExceptionHandlerFlags::EXCEPTION
                && handler.protects(pc)
                && match &handler.catch_type {
                    None
                    | Some(TypeSignature::Object | TypeSignature::Runtime(RuntimeType::Exception)) => {
                        true
                    }
                    Some(TypeSignature::Class(ty)) => self.heap.type_of(exception) == Some(*ty),
                    Some(_) => false,
                }
        })
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        method: &'m MethodDef,
        frame: usize,
        instruction: &'m Instruction,
        stack: &mut Vec<EmValue>,
    ) -> Result<Flow, Unwind> {
        let module = self.module;
        let token = method.token;
        let opcode = instruction.opcode;

        match opcode {
            OpCode::Nop => {}
            OpCode::Dup => {
                let top = stack
                    .last()
                    .cloned()
                    .ok_or(EmulationError::StackUnderflow { method: token })?;
                stack.push(top);
            }
            OpCode::Pop => {
                pop(stack, token)?;
            }

            OpCode::Ldarg => {
                let index = argument_operand(instruction)?;
                let value = self.load(&ManagedPointer::new(PointerTarget::Argument { frame, index }))?;
                stack.push(value);
            }
            OpCode::Ldarga => {
                let index = argument_operand(instruction)?;
                stack.push(EmValue::ManagedPtr(ManagedPointer::new(PointerTarget::Argument {
                    frame,
                    index,
                })));
            }
            OpCode::Starg => {
                let index = argument_operand(instruction)?;
                let value = pop(stack, token)?;
                self.store(&ManagedPointer::new(PointerTarget::Argument { frame, index }), value)?;
            }
            OpCode::Ldloc => {
                let index = local_operand(instruction)?;
                let value = self.load(&ManagedPointer::new(PointerTarget::Local { frame, index }))?;
                stack.push(value);
            }
            OpCode::Ldloca => {
                let index = local_operand(instruction)?;
                stack.push(EmValue::ManagedPtr(ManagedPointer::new(PointerTarget::Local {
                    frame,
                    index,
                })));
            }
            OpCode::Stloc => {
                let index = local_operand(instruction)?;
                let value = pop(stack, token)?;
                self.store(&ManagedPointer::new(PointerTarget::Local { frame, index }), value)?;
            }

            OpCode::Ldnull => stack.push(EmValue::Null),
            OpCode::LdcI4 => match instruction.operand {
                Operand::Int32(value) => stack.push(EmValue::I32(value)),
                _ => return Err(invalid_operand(instruction, "int32")),
            },
            OpCode::LdcI8 => match instruction.operand {
                Operand::Int64(value) => stack.push(EmValue::I64(value)),
                _ => return Err(invalid_operand(instruction, "int64")),
            },
            OpCode::LdcR4 => match instruction.operand {
                Operand::Float32(value) => stack.push(EmValue::F32(value)),
                _ => return Err(invalid_operand(instruction, "float32")),
            },
            OpCode::LdcR8 => match instruction.operand {
                Operand::Float64(value) => stack.push(EmValue::F64(value)),
                _ => return Err(invalid_operand(instruction, "float64")),
            },
            OpCode::Ldstr => match &instruction.operand {
                Operand::String(value) => {
                    let value = self.alloc_string(value);
                    stack.push(value);
                }
                _ => return Err(invalid_operand(instruction, "string")),
            },

            OpCode::Br => return Ok(Flow::Jump(target_operand(instruction)?)),
            OpCode::Leave => return Ok(Flow::Leave(target_operand(instruction)?)),
            OpCode::Brtrue | OpCode::Brfalse => {
                let target = target_operand(instruction)?;
                let value = pop(stack, token)?;
                let truth = value.is_true().ok_or(EmulationError::TypeMismatch {
                    operation: "conditional branch",
                    expected: "integer or reference",
                    found: value.type_name(),
                })?;
                if truth == (opcode == OpCode::Brtrue) {
                    return Ok(Flow::Jump(target));
                }
            }
            OpCode::Beq
            | OpCode::BneUn
            | OpCode::Bge
            | OpCode::BgeUn
            | OpCode::Bgt
            | OpCode::BgtUn
            | OpCode::Ble
            | OpCode::BleUn
            | OpCode::Blt
            | OpCode::BltUn => {
                let target = target_operand(instruction)?;
                let right = pop(stack, token)?;
                let left = pop(stack, token)?;
                let Some(kind) = BranchKind::from_opcode(opcode) else {
                    return Err(invalid_operand(instruction, "branch"));
                };
                if ops::branch_taken(kind, &left, &right).map_err(|trap| self.trap(trap))? {
                    return Ok(Flow::Jump(target));
                }
            }
            OpCode::Switch => {
                let Operand::Targets(targets) = &instruction.operand else {
                    return Err(invalid_operand(instruction, "switch targets"));
                };
                let value = pop(stack, token)?;
                let Some(selector) = value.as_i32() else {
                    return Err(EmulationError::TypeMismatch {
                        operation: "switch",
                        expected: "int32",
                        found: value.type_name(),
                    }
                    .into());
                };
                if let Some(&target) = usize::try_from(selector).ok().and_then(|i| targets.get(i)) {
                    return Ok(Flow::Jump(target));
                }
            }
            OpCode::Ret => {
                let signature = &method.signature;
                if signature.returns_value() {
                    let value = pop(stack, token)?;
                    return Ok(Flow::Return(Some(value.coerce(&signature.return_type))));
                }
                return Ok(Flow::Return(None));
            }
            OpCode::Throw => {
                return match pop(stack, token)? {
                    EmValue::ObjectRef(exception) => Err(Unwind::Exception(exception)),
                    EmValue::Null => Err(self.raise(FaultKind::NullReference)),
                    other => Err(EmulationError::TypeMismatch {
                        operation: "throw",
                        expected: "object",
                        found: other.type_name(),
                    }
                    .into()),
                };
            }

            OpCode::Add
            | OpCode::AddOvf
            | OpCode::AddOvfUn
            | OpCode::Sub
            | OpCode::SubOvf
            | OpCode::SubOvfUn
            | OpCode::Mul
            | OpCode::MulOvf
            | OpCode::MulOvfUn
            | OpCode::Div
            | OpCode::DivUn
            | OpCode::Rem
            | OpCode::RemUn
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::ShrUn => {
                let right = pop(stack, token)?;
                let left = pop(stack, token)?;
                let Some(op) = BinaryOp::from_opcode(opcode) else {
                    return Err(invalid_operand(instruction, "binary operator"));
                };
                let value = ops::binary(op, &left, &right).map_err(|trap| self.trap(trap))?;
                stack.push(value);
            }
            OpCode::Neg | OpCode::Not => {
                let value = pop(stack, token)?;
                let Some(op) = UnaryOp::from_opcode(opcode) else {
                    return Err(invalid_operand(instruction, "unary operator"));
                };
                let value = ops::unary(op, &value).map_err(|trap| self.trap(trap))?;
                stack.push(value);
            }
            OpCode::Ceq | OpCode::Cgt | OpCode::CgtUn | OpCode::Clt | OpCode::CltUn => {
                let right = pop(stack, token)?;
                let left = pop(stack, token)?;
                let Some(op) = CompareOp::from_opcode(opcode) else {
                    return Err(invalid_operand(instruction, "comparison"));
                };
                let result = ops::compare(op, &left, &right).map_err(|trap| self.trap(trap))?;
                stack.push(EmValue::I32(i32::from(result)));
            }
            OpCode::ConvI1
            | OpCode::ConvI2
            | OpCode::ConvI4
            | OpCode::ConvI8
            | OpCode::ConvU1
            | OpCode::ConvU2
            | OpCode::ConvU4
            | OpCode::ConvU8
            | OpCode::ConvI
            | OpCode::ConvU
            | OpCode::ConvR4
            | OpCode::ConvR8
            | OpCode::ConvRUn
            | OpCode::ConvOvfI4
            | OpCode::ConvOvfI8
            | OpCode::ConvOvfU4
            | OpCode::ConvOvfU8 => {
                let value = pop(stack, token)?;
                let Some(conversion) = ConversionType::from_opcode(opcode) else {
                    return Err(invalid_operand(instruction, "conversion"));
                };
                let value = ops::convert(conversion, &value).map_err(|trap| self.trap(trap))?;
                stack.push(value);
            }

            OpCode::Ldfld => {
                let field = field_operand(instruction)?;
                let instance = pop(stack, token)?;
                let value = self.load_field(instance, field)?;
                stack.push(value);
            }
            OpCode::Ldflda => {
                let field = field_operand(instruction)?;
                let pointer = match pop(stack, token)? {
                    EmValue::ObjectRef(object) => {
                        ManagedPointer::new(PointerTarget::ObjectField { object, field })
                    }
                    EmValue::ManagedPtr(pointer) => pointer.field(field),
                    EmValue::Null => return Err(self.raise(FaultKind::NullReference)),
                    other => {
                        return Err(EmulationError::TypeMismatch {
                            operation: "ldflda",
                            expected: "object or pointer",
                            found: other.type_name(),
                        }
                        .into())
                    }
                };
                stack.push(EmValue::ManagedPtr(pointer));
            }
            OpCode::Stfld => {
                let field = field_operand(instruction)?;
                let value = pop(stack, token)?;
                let instance = pop(stack, token)?;
                let pointer = match instance {
                    EmValue::ObjectRef(object) => {
                        ManagedPointer::new(PointerTarget::ObjectField { object, field })
                    }
                    EmValue::ManagedPtr(pointer) => pointer.field(field),
                    EmValue::Null => return Err(self.raise(FaultKind::NullReference)),
                    other => {
                        return Err(EmulationError::TypeMismatch {
                            operation: "stfld",
                            expected: "object or pointer",
                            found: other.type_name(),
                        }
                        .into())
                    }
                };
                self.store(&pointer, value)?;
            }
            OpCode::Ldsfld => {
                let field = field_operand(instruction)?;
                let value = self.load(&ManagedPointer::new(PointerTarget::StaticField(field)))?;
                stack.push(value);
            }
            OpCode::Ldsflda => {
                let field = field_operand(instruction)?;
                stack.push(EmValue::ManagedPtr(ManagedPointer::new(
                    PointerTarget::StaticField(field),
                )));
            }
            OpCode::Stsfld => {
                let field = field_operand(instruction)?;
                let value = pop(stack, token)?;
                self.store(&ManagedPointer::new(PointerTarget::StaticField(field)), value)?;
            }
            OpCode::Ldobj => {
                let pointer = pointer_operand(pop(stack, token)?, "ldobj")?;
                let value = self.load(&pointer)?;
                stack.push(value);
            }
            OpCode::Initobj => {
                let ty = type_operand(instruction)?;
                let pointer = pointer_operand(pop(stack, token)?, "initobj")?;
                let value = default_value(module, ty)?;
                self.store(&pointer, value)?;
            }

            OpCode::Newobj => {
                let constructor = method_operand(instruction)?;
                let count = module.method_signature(constructor)?.params.len();
                let arguments = pop_many(stack, count, token)?;
                let object = self.new_object(constructor, arguments)?;
                stack.push(object);
            }
            OpCode::Call | OpCode::Callvirt => {
                let callee = method_operand(instruction)?;
                let signature = module.method_signature(callee)?;
                let arguments = pop_many(stack, signature.arg_count(), token)?;
                if opcode == OpCode::Callvirt
                    && signature.has_this
                    && arguments.first() == Some(&EmValue::Null)
                {
                    return Err(self.raise(FaultKind::NullReference));
                }
                if let Some(value) = self.invoke(callee, arguments)? {
                    stack.push(value);
                }
            }

            OpCode::Newarr => {
                let element = type_operand(instruction)?;
                let length = pop(stack, token)?;
                let Some(length) = length.as_i64() else {
                    return Err(EmulationError::TypeMismatch {
                        operation: "newarr",
                        expected: "integer length",
                        found: length.type_name(),
                    }
                    .into());
                };
                let Ok(length) = usize::try_from(length) else {
                    return Err(self.raise(FaultKind::Overflow));
                };
                let items = vec![default_value(module, element)?; length];
                let array = self.heap.alloc(HeapObject::Array {
                    element: element.clone(),
                    items,
                });
                stack.push(EmValue::ObjectRef(array));
            }
            OpCode::Ldlen => {
                let array = pop(stack, token)?;
                let length = self.with_array(&array, |items| Ok(items.len()))?;
                let length = i64::try_from(length)
                    .map_err(|_| EmulationError::Unsupported("array length".to_string()))?;
                stack.push(EmValue::NativeInt(length));
            }
            OpCode::LdelemI4 | OpCode::LdelemI8 | OpCode::LdelemR8 | OpCode::LdelemRef => {
                let index = pop(stack, token)?;
                let array = pop(stack, token)?;
                let index = element_index(&index)?;
                let element = self.with_array(&array, |items| {
                    Ok(index.and_then(|i| items.get(i)).cloned())
                })?;
                match element {
                    Some(value) => stack.push(value),
                    None => return Err(self.raise(FaultKind::IndexOutOfRange)),
                }
            }
            OpCode::StelemI4 | OpCode::StelemI8 | OpCode::StelemR8 | OpCode::StelemRef => {
                let value = pop(stack, token)?;
                let index = pop(stack, token)?;
                let array = pop(stack, token)?;
                let index = element_index(&index)?;
                let Some(kind) = ElementKind::from_store(opcode) else {
                    return Err(invalid_operand(instruction, "element store"));
                };
                let value = match kind {
                    ElementKind::Ref => value,
                    other => value.coerce(&other.element_type()),
                };
                let object = self.array_ref(&array)?;
                let stored = match self.heap.get_mut(object)? {
                    HeapObject::Array { items, .. } => match index.and_then(|i| items.get_mut(i)) {
                        Some(slot) => {
                            *slot = value;
                            true
                        }
                        None => false,
                    },
                    _ => return Err(not_an_array().into()),
                };
                if !stored {
                    return Err(self.raise(FaultKind::IndexOutOfRange));
                }
            }

            OpCode::Box => {
                let ty = type_operand(instruction)?;
                let value = pop(stack, token)?;
                if ty.is_reference() {
                    stack.push(value);
                } else {
                    let boxed = self.heap.alloc(HeapObject::Boxed {
                        ty: ty.clone(),
                        value: value.coerce(ty),
                    });
                    stack.push(EmValue::ObjectRef(boxed));
                }
            }
            OpCode::UnboxAny => {
                let ty = type_operand(instruction)?;
                let value = pop(stack, token)?;
                if ty.is_reference() {
                    stack.push(value);
                } else {
                    let unboxed = match value {
                        EmValue::ObjectRef(object) => match self.heap.get(object)? {
                            HeapObject::Boxed { ty: boxed, value } if boxed == ty => {
                                Some(value.clone())
                            }
                            _ => None,
                        },
                        EmValue::Null => return Err(self.raise(FaultKind::NullReference)),
                        other => {
                            return Err(EmulationError::TypeMismatch {
                                operation: "unbox.any",
                                expected: "object",
                                found: other.type_name(),
                            }
                            .into())
                        }
                    };
                    match unboxed {
                        Some(value) => stack.push(value),
                        None => return Err(self.raise(FaultKind::InvalidCast)),
                    }
                }
            }
        }

        Ok(Flow::Next)
    }

    /// Allocates the object of a `newobj` and runs its constructor
    fn new_object(&mut self, constructor: &MethodRef, arguments: Vec<EmValue>) -> Result<EmValue, Unwind> {
        let module = self.module;
        match constructor {
            MethodRef::Def(token) => {
                let owner = module.type_def(module.method(*token)?.declaring_type)?;
                if owner.is_value_type() {
                    let ty = owner.signature();
                    let value = default_value(module, &ty)?;
                    let temp = self.heap.alloc(HeapObject::Boxed { ty, value });
                    let mut call = vec![EmValue::ManagedPtr(ManagedPointer::new(
                        PointerTarget::Boxed(temp),
                    ))];
                    call.extend(arguments);
                    self.invoke(constructor, call)?;
                    match self.heap.get(temp)? {
                        HeapObject::Boxed { value, .. } => Ok(value.clone()),
                        _ => Err(EmulationError::InvalidHeapReference(temp.id()).into()),
                    }
                } else {
                    let object = self.heap.alloc(HeapObject::Object {
                        ty: Some(owner.token),
                        fields: instance_fields(module, owner.token)?,
                    });
                    let mut call = vec![EmValue::ObjectRef(object)];
                    call.extend(arguments);
                    self.invoke(constructor, call)?;
                    Ok(EmValue::ObjectRef(object))
                }
            }
            MethodRef::Runtime(RuntimeMethod::ObjectCtor) => {
                let object = self.heap.alloc(HeapObject::Object {
                    ty: None,
                    fields: Default::default(),
                });
                Ok(EmValue::ObjectRef(object))
            }
            MethodRef::Runtime(other) => Err(EmulationError::Unsupported(format!(
                "newobj {other}"
            ))
            .into()),
            MethodRef::External(_) => match self.invoke(constructor, arguments)? {
                Some(object) => Ok(object),
                None => Err(EmulationError::Unsupported(format!(
                    "constructor hook {constructor} returned no object"
                ))
                .into()),
            },
        }
    }

    fn invoke_runtime(&mut self, method: &RuntimeMethod, arguments: Vec<EmValue>) -> Result<Option<EmValue>, Unwind> {
        match method {
            RuntimeMethod::ObjectCtor | RuntimeMethod::BuilderSetStateMachine(_) => Ok(None),
            RuntimeMethod::BuilderCreate(_) => {
                let task = self.heap.alloc(HeapObject::Task(TaskState::Pending));
                Ok(Some(EmValue::Builder(Some(task))))
            }
            RuntimeMethod::BuilderStart {
                kind,
                state_machine,
            } => {
                let task = self.builder_task(argument(&arguments, 0)?)?;
                let machine = argument(&arguments, 1)?.clone();
                self.start(kind, *state_machine, task, machine)?;
                Ok(None)
            }
            RuntimeMethod::BuilderSetResult(_) => {
                let task = self.builder_task(argument(&arguments, 0)?)?;
                let result = arguments.get(1).cloned();
                self.heap.complete(task, TaskState::Completed(result))?;
                Ok(None)
            }
            RuntimeMethod::BuilderSetException(_) => {
                let task = self.builder_task(argument(&arguments, 0)?)?;
                let exception = match argument(&arguments, 1)? {
                    EmValue::ObjectRef(exception) => *exception,
                    other => {
                        return Err(EmulationError::TypeMismatch {
                            operation: "SetException",
                            expected: "exception",
                            found: other.type_name(),
                        }
                        .into())
                    }
                };
                self.heap.complete(task, TaskState::Faulted(exception))?;
                Ok(None)
            }
            RuntimeMethod::BuilderAwaitOnCompleted {
                awaiter,
                state_machine,
                ..
            } => {
                self.await_on_completed(*awaiter, *state_machine, &arguments)?;
                Ok(None)
            }
            RuntimeMethod::BuilderGetTask(_) => {
                let task = self.builder_task(argument(&arguments, 0)?)?;
                Ok(Some(EmValue::ObjectRef(task)))
            }
            RuntimeMethod::TaskGetAwaiter(_) => match argument(&arguments, 0)? {
                EmValue::ObjectRef(task) => Ok(Some(EmValue::TaskAwaiter(Some(*task)))),
                EmValue::Null => Err(self.raise(FaultKind::NullReference)),
                other => Err(EmulationError::TypeMismatch {
                    operation: "GetAwaiter",
                    expected: "task",
                    found: other.type_name(),
                }
                .into()),
            },
            RuntimeMethod::TaskAwaiterGetResult(_) => {
                let awaiter = self.deref(argument(&arguments, 0)?)?;
                let EmValue::TaskAwaiter(Some(task)) = awaiter else {
                    return Err(EmulationError::TypeMismatch {
                        operation: "GetResult",
                        expected: "initialized task awaiter",
                        found: awaiter.type_name(),
                    }
                    .into());
                };
                match self.heap.task(task)? {
                    TaskState::Completed(value) => Ok(value.clone()),
                    TaskState::Faulted(exception) => Err(Unwind::Exception(*exception)),
                    TaskState::Pending => Err(EmulationError::PendingTask.into()),
                }
            }
        }
    }

    /// Runs a state machine until its continuation queue is empty
    fn start(&mut self, kind: &ReturnKind, state_machine: Token, task: HeapRef, machine: EmValue) -> Result<(), Unwind> {
        let move_next = self.move_next(state_machine)?;
        let outer = std::mem::take(&mut self.continuations);
        let result = self.drain(move_next, machine);
        self.continuations = outer;
        result?;

        match self.heap.task(task)? {
            TaskState::Pending => Err(EmulationError::PendingTask.into()),
            TaskState::Faulted(exception) if *kind == ReturnKind::Void => {
                let fault = Fault {
                    kind: self.heap.fault_kind(*exception),
                    exception: *exception,
                };
                debug!("void state machine {} faulted with {:?}", state_machine, fault.kind);
                self.unobserved.push(fault);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn drain(&mut self, move_next: &'m MethodDef, machine: EmValue) -> Result<(), Unwind> {
        self.execute(move_next, vec![machine])?;
        while let Some((move_next, boxed)) = self.continuations.pop_front() {
            trace!(
                "resuming {} from {}",
                self.module.method_full_name(move_next.token),
                boxed
            );
            let machine = EmValue::ManagedPtr(ManagedPointer::new(PointerTarget::Boxed(boxed)));
            self.execute(move_next, vec![machine])?;
        }
        Ok(())
    }

    fn await_on_completed(&mut self, awaiter: Token, state_machine: Token, arguments: &[EmValue]) -> Result<(), Unwind> {
        let module = self.module;
        let boxed = match argument(arguments, 2)? {
            EmValue::ManagedPtr(ManagedPointer {
                target: PointerTarget::Boxed(boxed),
                path,
            }) if path.is_empty() => *boxed,
            EmValue::ManagedPtr(pointer) => {
                let value = self.load(pointer)?;
                self.heap.alloc(HeapObject::Boxed {
                    ty: TypeSignature::ValueType(state_machine),
                    value,
                })
            }
            other => {
                return Err(EmulationError::TypeMismatch {
                    operation: "AwaitOnCompleted",
                    expected: "state machine pointer",
                    found: other.type_name(),
                }
                .into())
            }
        };

        if let Some(on_completed) = module.find_method(awaiter, "OnCompleted") {
            let receiver = argument(arguments, 1)?.clone();
            self.invoke(&MethodRef::Def(on_completed), vec![receiver, EmValue::Null])?;
        }

        let move_next = self.move_next(state_machine)?;
        self.continuations.push_back((move_next, boxed));
        Ok(())
    }

    fn move_next(&self, state_machine: Token) -> Result<&'m MethodDef, Unwind> {
        let module = self.module;
        let ty = module.type_def(state_machine)?;
        let token = ty
            .method_impls
            .iter()
            .find(|imp| imp.declaration == InterfaceMethod::MoveNext)
            .map(|imp| imp.body)
            .or_else(|| module.find_method(state_machine, "MoveNext"))
            .ok_or_else(|| {
                EmulationError::Unsupported(format!("{} has no MoveNext", ty.name))
            })?;
        Ok(module.method(token)?)
    }

    fn builder_task(&mut self, builder: &EmValue) -> Result<HeapRef, Unwind> {
        match self.deref(builder)? {
            EmValue::Builder(Some(task)) => Ok(task),
            other => Err(EmulationError::TypeMismatch {
                operation: "builder access",
                expected: "initialized builder",
                found: other.type_name(),
            }
            .into()),
        }
    }

    /// Loads through a managed pointer; other values are taken as they are
    fn deref(&mut self, value: &EmValue) -> Result<EmValue, Unwind> {
        match value {
            EmValue::ManagedPtr(pointer) => self.load(pointer),
            other => Ok(other.clone()),
        }
    }

    fn load_field(&mut self, instance: EmValue, field: Token) -> Result<EmValue, Unwind> {
        match instance {
            EmValue::ObjectRef(object) => {
                self.load(&ManagedPointer::new(PointerTarget::ObjectField { object, field }))
            }
            EmValue::ManagedPtr(pointer) => self.load(&pointer.field(field)),
            EmValue::Struct { mut fields, .. } => fields.remove(&field).ok_or_else(|| {
                EmulationError::InvalidPointer(format!("struct has no field {field}")).into()
            }),
            EmValue::Null => Err(self.raise(FaultKind::NullReference)),
            other => Err(EmulationError::TypeMismatch {
                operation: "ldfld",
                expected: "object, pointer or struct",
                found: other.type_name(),
            }
            .into()),
        }
    }

    fn load(&mut self, pointer: &ManagedPointer) -> Result<EmValue, Unwind> {
        let root = self.slot(&pointer.target)?;
        Ok(project(root, &pointer.path)?.clone())
    }

    /// Stores `value` through `pointer`, converted to the type of the location
    fn store(&mut self, pointer: &ManagedPointer, value: EmValue) -> Result<(), Unwind> {
        let value = match self.location_type(pointer)? {
            Some(ty) => value.coerce(&ty),
            None => value,
        };

        let field = match (pointer.path.last(), &pointer.target) {
            (Some(field), _)
            | (
                None,
                PointerTarget::StaticField(field) | PointerTarget::ObjectField { field, .. },
            ) => Some(*field),
            _ => None,
        };
        if let Some(field) = field {
            self.record(TraceEvent::FieldStore {
                field,
                value: value.clone(),
            });
        }

        let root = self.slot(&pointer.target)?;
        *project(root, &pointer.path)? = value;
        Ok(())
    }

    fn location_type(&self, pointer: &ManagedPointer) -> Result<Option<TypeSignature>, Unwind> {
        let module = self.module;
        if let Some(field) = pointer.path.last() {
            return Ok(Some(module.field(*field)?.signature.clone()));
        }
        Ok(match &pointer.target {
            PointerTarget::Local { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|f| f.local_types.get(usize::from(*index)))
                .cloned(),
            PointerTarget::Argument { frame, index } => self
                .frames
                .get(*frame)
                .and_then(|f| f.argument_types.get(usize::from(*index)))
                .cloned(),
            PointerTarget::StaticField(field) | PointerTarget::ObjectField { field, .. } => {
                Some(module.field(*field)?.signature.clone())
            }
            PointerTarget::Boxed(object) => match self.heap.get(*object)? {
                HeapObject::Boxed { ty, .. } => Some(ty.clone()),
                _ => None,
            },
        })
    }

    /// The root storage location of a pointer
    fn slot(&mut self, target: &PointerTarget) -> Result<&mut EmValue, Unwind> {
        let module = self.module;
        match target {
            PointerTarget::Local { frame, index } => {
                let frame = self
                    .frames
                    .get_mut(*frame)
                    .ok_or_else(|| EmulationError::InvalidPointer(format!("frame {frame}")))?;
                let count = frame.locals.len();
                frame.locals.get_mut(usize::from(*index)).ok_or_else(|| {
                    EmulationError::LocalIndexOutOfBounds {
                        index: usize::from(*index),
                        count,
                    }
                    .into()
                })
            }
            PointerTarget::Argument { frame, index } => {
                let frame = self
                    .frames
                    .get_mut(*frame)
                    .ok_or_else(|| EmulationError::InvalidPointer(format!("frame {frame}")))?;
                let count = frame.arguments.len();
                frame.arguments.get_mut(usize::from(*index)).ok_or_else(|| {
                    EmulationError::ArgumentIndexOutOfBounds {
                        index: usize::from(*index),
                        count,
                    }
                    .into()
                })
            }
            PointerTarget::StaticField(field) => match self.statics.entry(*field) {
                Entry::Occupied(entry) => Ok(entry.into_mut()),
                Entry::Vacant(entry) => {
                    let value = default_value(module, &module.field(*field)?.signature)?;
                    Ok(entry.insert(value))
                }
            },
            PointerTarget::ObjectField { object, field } => {
                let default = default_value(module, &module.field(*field)?.signature)?;
                match self.heap.get_mut(*object)? {
                    HeapObject::Object { fields, .. } => Ok(fields.entry(*field).or_insert(default)),
                    HeapObject::Boxed {
                        value: EmValue::Struct { fields, .. },
                        ..
                    } => fields.get_mut(field).ok_or_else(|| {
                        EmulationError::InvalidPointer(format!("boxed struct has no field {field}"))
                            .into()
                    }),
                    _ => Err(EmulationError::TypeMismatch {
                        operation: "field access",
                        expected: "object with fields",
                        found: "heap object",
                    }
                    .into()),
                }
            }
            PointerTarget::Boxed(object) => match self.heap.get_mut(*object)? {
                HeapObject::Boxed { value, .. } => Ok(value),
                _ => Err(EmulationError::TypeMismatch {
                    operation: "unbox",
                    expected: "boxed value",
                    found: "heap object",
                }
                .into()),
            },
        }
    }

    fn array_ref(&mut self, array: &EmValue) -> Result<HeapRef, Unwind> {
        match array {
            EmValue::ObjectRef(object) => Ok(*object),
            EmValue::Null => Err(self.raise(FaultKind::NullReference)),
            other => Err(EmulationError::TypeMismatch {
                operation: "array access",
                expected: "array",
                found: other.type_name(),
            }
            .into()),
        }
    }

    fn with_array<T>(
        &mut self,
        array: &EmValue,
        read: impl FnOnce(&[EmValue]) -> Result<T, Unwind>,
    ) -> Result<T, Unwind> {
        let object = self.array_ref(array)?;
        match self.heap.get(object)? {
            HeapObject::Array { items, .. } => read(items),
            _ => Err(not_an_array().into()),
        }
    }
}

/// Follows a path of struct fields below a root location
fn project<'a>(value: &'a mut EmValue, path: &[Token]) -> Result<&'a mut EmValue, EmulationError> {
    let Some((field, rest)) = path.split_first() else {
        return Ok(value);
    };
    match value {
        EmValue::Struct { fields, .. } => {
            let inner = fields
                .get_mut(field)
                .ok_or_else(|| EmulationError::InvalidPointer(format!("struct has no field {field}")))?;
            project(inner, rest)
        }
        other => Err(EmulationError::TypeMismatch {
            operation: "field address",
            expected: "struct",
            found: other.type_name(),
        }),
    }
}

fn pop(stack: &mut Vec<EmValue>, method: Token) -> Result<EmValue, Unwind> {
    stack
        .pop()
        .ok_or_else(|| EmulationError::StackUnderflow { method }.into())
}

fn pop_many(stack: &mut Vec<EmValue>, count: usize, method: Token) -> Result<Vec<EmValue>, Unwind> {
    if stack.len() < count {
        return Err(EmulationError::StackUnderflow { method }.into());
    }
    Ok(stack.split_off(stack.len() - count))
}

fn argument(arguments: &[EmValue], index: usize) -> Result<&EmValue, EmulationError> {
    arguments
        .get(index)
        .ok_or(EmulationError::ArgumentIndexOutOfBounds {
            index,
            count: arguments.len(),
        })
}

fn element_index(index: &EmValue) -> Result<Option<usize>, Unwind> {
    match index.as_i64() {
        Some(index) => Ok(usize::try_from(index).ok()),
        None => Err(EmulationError::TypeMismatch {
            operation: "array index",
            expected: "integer",
            found: index.type_name(),
        }
        .into()),
    }
}

fn not_an_array() -> EmulationError {
    EmulationError::TypeMismatch {
        operation: "array access",
        expected: "array",
        found: "heap object",
    }
}

fn pointer_operand(value: EmValue, operation: &'static str) -> Result<ManagedPointer, Unwind> {
    match value {
        EmValue::ManagedPtr(pointer) => Ok(pointer),
        other => Err(EmulationError::TypeMismatch {
            operation,
            expected: "managed pointer",
            found: other.type_name(),
        }
        .into()),
    }
}

fn invalid_operand(instruction: &Instruction, expected: &'static str) -> Unwind {
    EmulationError::InvalidOperand {
        opcode: instruction.opcode,
        expected,
    }
    .into()
}

fn target_operand(instruction: &Instruction) -> Result<usize, Unwind> {
    match instruction.operand {
        Operand::Target(target) => Ok(target),
        _ => Err(invalid_operand(instruction, "resolved branch target")),
    }
}

fn argument_operand(instruction: &Instruction) -> Result<u16, Unwind> {
    match instruction.operand {
        Operand::Argument(index) => Ok(index),
        _ => Err(invalid_operand(instruction, "argument index")),
    }
}

fn local_operand(instruction: &Instruction) -> Result<u16, Unwind> {
    match instruction.operand {
        Operand::Local(index) => Ok(index),
        _ => Err(invalid_operand(instruction, "local index")),
    }
}

fn field_operand(instruction: &Instruction) -> Result<Token, Unwind> {
    match instruction.operand {
        Operand::Field(field) => Ok(field),
        _ => Err(invalid_operand(instruction, "field")),
    }
}

fn method_operand(instruction: &Instruction) -> Result<&MethodRef, Unwind> {
    match &instruction.operand {
        Operand::Method(method) => Ok(method),
        _ => Err(invalid_operand(instruction, "method")),
    }
}

fn type_operand(instruction: &Instruction) -> Result<&TypeSignature, Unwind> {
    match &instruction.operand {
        Operand::Type(ty) => Ok(ty),
        _ => Err(invalid_operand(instruction, "type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::{
            method::ExternalMethod,
            module::{BaseType, FieldAttributes, FieldDef, TypeDef},
            signatures::MethodSignature,
        },
    };

    fn define(
        module: &mut Module,
        owner: Token,
        method: MethodDef,
        asm: InstructionAssembler,
        locals: Vec<TypeSignature>,
    ) -> crate::Result<Token> {
        module.add_method(owner, method.with_body(asm.into_body(locals)?))
    }

    fn static_i4(name: &str, params: usize) -> MethodDef {
        MethodDef::new(
            name,
            MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4; params]),
        )
    }

    #[test]
    fn arithmetic_and_branches() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let program = module.add_type(TypeDef::new("Test", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .ldc_i4(0)?
            .bge("positive")?
            .ldarg(0)?
            .neg()?
            .ret()?
            .label("positive")?
            .ldarg(0)?
            .ret()?;
        let abs = define(&mut module, program, static_i4("Abs", 1), asm, vec![])?;

        let mut emulator = Emulator::new(&module);
        for (input, expected) in [(-5, 5), (5, 5), (0, 0)] {
            let outcome = emulator.call(abs, vec![EmValue::I32(input)])?;
            assert_eq!(outcome.value(), Some(&EmValue::I32(expected)));
        }
        assert_eq!(emulator.executed(), 5);
        Ok(())
    }

    #[test]
    fn division_by_zero_escapes_as_fault() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let program = module.add_type(TypeDef::new("Test", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.ldarg(1)?.div()?.ret()?;
        let div = define(&mut module, program, static_i4("Div", 2), asm, vec![])?;

        let mut emulator = Emulator::new(&module);
        let outcome = emulator.call(div, vec![EmValue::I32(1), EmValue::I32(0)])?;
        assert_eq!(outcome.fault_kind(), Some(FaultKind::DivideByZero));

        // the emulator stays usable after a fault
        let outcome = emulator.call(div, vec![EmValue::I32(9), EmValue::I32(3)])?;
        assert_eq!(outcome, Outcome::Returned(Some(EmValue::I32(3))));
        Ok(())
    }

    #[test]
    fn catch_handler_receives_exception() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let program = module.add_type(TypeDef::new("Test", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.label("try")?
            .ldc_i4(10)?
            .ldarg(0)?
            .div()?
            .stloc(0)?
            .leave("end")?
            .label("handler")?
            .pop()?
            .ldc_i4(-1)?
            .stloc(0)?
            .leave("end")?
            .label("end")?
            .ldloc(0)?
            .ret()?
            .catch_region(
                "try",
                "handler",
                "end",
                TypeSignature::Runtime(RuntimeType::Exception),
            )?;
        let safe = define(
            &mut module,
            program,
            static_i4("SafeDiv", 1),
            asm,
            vec![TypeSignature::I4],
        )?;

        let mut emulator = Emulator::new(&module);
        let caught = emulator.call(safe, vec![EmValue::I32(0)])?;
        assert_eq!(caught.value(), Some(&EmValue::I32(-1)));
        let normal = emulator.call(safe, vec![EmValue::I32(2)])?;
        assert_eq!(normal.value(), Some(&EmValue::I32(5)));
        Ok(())
    }

    #[test]
    fn objects_keep_their_fields() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let counter = module.add_type(TypeDef::new("Test", "Counter"));
        let value = module.add_field(
            counter,
            FieldDef::new("value", FieldAttributes::PUBLIC, TypeSignature::I4),
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .call(MethodRef::Runtime(RuntimeMethod::ObjectCtor))?
            .ldarg(0)?
            .ldarg(1)?
            .stfld(value)?
            .ret()?;
        let ctor = define(
            &mut module,
            counter,
            MethodDef::new_constructor(vec![TypeSignature::I4]),
            asm,
            vec![],
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .newobj(MethodRef::Def(ctor))?
            .ldfld(value)?
            .ldc_i4(1)?
            .add()?
            .ret()?;
        let next = define(&mut module, counter, static_i4("Next", 1), asm, vec![])?;

        let options = EmulatorOptions {
            trace: true,
            ..Default::default()
        };
        let mut emulator = Emulator::with_options(&module, options);
        let outcome = emulator.call(next, vec![EmValue::I32(41)])?;
        assert_eq!(outcome.value(), Some(&EmValue::I32(42)));
        assert_eq!(
            emulator.field_stores(value).collect::<Vec<_>>(),
            vec![&EmValue::I32(41)]
        );
        assert!(emulator.trace().contains(&TraceEvent::Call {
            method: "Test.Counter::.ctor".to_string()
        }));
        Ok(())
    }

    #[test]
    fn structs_live_in_locals() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let point = module.add_type(TypeDef::new("Test", "Point").with_base(BaseType::ValueType));
        let x = module.add_field(
            point,
            FieldDef::new("X", FieldAttributes::PUBLIC, TypeSignature::I4),
        )?;
        let program = module.add_type(TypeDef::new("Test", "Program"));

        let ty = TypeSignature::ValueType(point);
        let mut asm = InstructionAssembler::new();
        asm.ldloca(0)?
            .initobj(ty.clone())?
            .ldloca(0)?
            .ldarg(0)?
            .stfld(x)?
            .ldloc(0)?
            .ldfld(x)?
            .ret()?;
        let roundtrip = define(&mut module, program, static_i4("Roundtrip", 1), asm, vec![ty])?;

        let mut emulator = Emulator::new(&module);
        let outcome = emulator.call(roundtrip, vec![EmValue::I32(9)])?;
        assert_eq!(outcome.value(), Some(&EmValue::I32(9)));
        Ok(())
    }

    #[test]
    fn external_calls_go_through_hooks() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let program = module.add_type(TypeDef::new("Test", "Program"));
        let max = ExternalMethod::new(
            "System.Math",
            "Max",
            MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4; 2]),
        );
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .ldarg(1)?
            .call(MethodRef::External(max))?
            .ret()?;
        let larger = define(&mut module, program, static_i4("Larger", 2), asm, vec![])?;

        let mut emulator = Emulator::new(&module);
        let missing = emulator.call(larger, vec![EmValue::I32(1), EmValue::I32(2)]);
        assert!(matches!(
            missing,
            Err(Error::Emulation(EmulationError::MissingHook(ref name))) if name == "System.Math::Max"
        ));

        emulator.hook("System.Math::Max", |_, args| {
            let a = args.first().and_then(EmValue::as_i32).unwrap_or_default();
            let b = args.get(1).and_then(EmValue::as_i32).unwrap_or_default();
            Ok(Some(EmValue::I32(a.max(b))))
        });
        let outcome = emulator.call(larger, vec![EmValue::I32(3), EmValue::I32(8)])?;
        assert_eq!(outcome.value(), Some(&EmValue::I32(8)));
        Ok(())
    }

    #[test]
    fn limits_stop_runaway_code() -> crate::Result<()> {
        let mut module = Module::new("Test.dll");
        let program = module.add_type(TypeDef::new("Test", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.label("spin")?.br("spin")?;
        let spin = define(&mut module, program, static_i4("Spin", 0), asm, vec![])?;

        let options = EmulatorOptions {
            max_instructions: 50,
            ..Default::default()
        };
        let mut emulator = Emulator::with_options(&module, options);
        let result = emulator.call(spin, vec![]);
        assert!(matches!(
            result,
            Err(Error::Emulation(EmulationError::InstructionLimitExceeded {
                executed: 51,
                limit: 50
            }))
        ));

        let wrong = emulator.call(spin, vec![EmValue::I32(1)]);
        assert!(matches!(
            wrong,
            Err(Error::Emulation(EmulationError::ArgumentCount { expected: 0, found: 1, .. }))
        ));
        Ok(())
    }
}
