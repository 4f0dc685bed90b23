//! Runtime values of the emulator.
//!
//! [`EmValue`] covers the CIL evaluation stack types (int32, int64, native int, floating
//! point, object references and managed pointers) plus struct values and the opaque runtime
//! structs of the async protocol. Narrow integer types only exist in storage: loading them
//! widens to [`EmValue::I32`], storing narrows again through [`EmValue::coerce`].

use std::{collections::BTreeMap, fmt};

use crate::{
    metadata::{module::Module, runtime::RuntimeType, signatures::TypeSignature, token::Token},
    Result,
};

/// Reference to an object on the [`crate::emulation::ManagedHeap`].
///
/// Two `HeapRef` values are equal if they point to the same heap object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub(crate) u64);

impl HeapRef {
    /// Creates a new heap reference with the given ID
    #[must_use]
    pub fn new(id: u64) -> Self {
        HeapRef(id)
    }

    /// Returns the internal ID of this heap reference
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({})", self.0)
    }
}

/// The storage location a managed pointer starts at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PointerTarget {
    /// A local variable of the call frame at depth `frame`
    Local {
        /// Call depth of the frame
        frame: usize,
        /// Local index
        index: u16,
    },
    /// An argument of the call frame at depth `frame`
    Argument {
        /// Call depth of the frame
        frame: usize,
        /// Argument index, receiver included
        index: u16,
    },
    /// A static field
    StaticField(Token),
    /// A field of a heap object
    ObjectField {
        /// The object
        object: HeapRef,
        /// The field
        field: Token,
    },
    /// The value inside a boxed struct
    Boxed(HeapRef),
}

/// Managed pointer for `ldloca`, `ldarga`, `ldflda` and value type receivers.
///
/// The pointer names a root location and a path of struct fields below it, so that nested
/// struct fields can be addressed without copying the enclosing struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedPointer {
    /// Root location
    pub target: PointerTarget,
    /// Struct fields descended into, outermost first
    pub path: Vec<Token>,
}

impl ManagedPointer {
    /// Points at `target` itself
    #[must_use]
    pub fn new(target: PointerTarget) -> Self {
        ManagedPointer {
            target,
            path: Vec::new(),
        }
    }

    /// Points at `field` of the struct this pointer points at
    #[must_use]
    pub fn field(&self, field: Token) -> Self {
        let mut path = self.path.clone();
        path.push(field);
        ManagedPointer {
            target: self.target.clone(),
            path,
        }
    }
}

/// A value during emulation
#[derive(Clone, Debug, PartialEq)]
pub enum EmValue {
    /// 32-bit integer, also holds bool, char and the narrow integer types
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Native-sized integer, 64 bits wide
    NativeInt(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// The null reference
    Null,
    /// Reference to a heap object
    ObjectRef(HeapRef),
    /// Managed pointer to a storage location
    ManagedPtr(ManagedPointer),
    /// A struct value with all of its instance fields
    Struct {
        /// The struct type
        ty: Token,
        /// Field values
        fields: BTreeMap<Token, EmValue>,
    },
    /// An async method builder; `None` until `Create` initializes it
    Builder(Option<HeapRef>),
    /// A task awaiter; `None` while default-initialized
    TaskAwaiter(Option<HeapRef>),
}

impl EmValue {
    /// Short name of the value kind, used in error messages
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            EmValue::I32(_) => "int32",
            EmValue::I64(_) => "int64",
            EmValue::NativeInt(_) => "native int",
            EmValue::F32(_) => "float32",
            EmValue::F64(_) => "float64",
            EmValue::Null => "null",
            EmValue::ObjectRef(_) => "object",
            EmValue::ManagedPtr(_) => "managed pointer",
            EmValue::Struct { .. } => "struct",
            EmValue::Builder(_) => "builder",
            EmValue::TaskAwaiter(_) => "task awaiter",
        }
    }

    /// The value as `i32`, if it is an [`EmValue::I32`]
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            EmValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as `i64`, for any integer kind
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EmValue::I32(v) => Some(i64::from(*v)),
            EmValue::I64(v) | EmValue::NativeInt(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as `f64`, for both float kinds
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EmValue::F32(v) => Some(f64::from(*v)),
            EmValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// The referenced heap object, if this is an object reference
    #[must_use]
    pub fn as_object(&self) -> Option<HeapRef> {
        match self {
            EmValue::ObjectRef(r) => Some(*r),
            _ => None,
        }
    }

    /// Truthiness as tested by `brtrue` and `brfalse`.
    ///
    /// Returns `None` for struct values, which can not be tested.
    #[must_use]
    pub fn is_true(&self) -> Option<bool> {
        match self {
            EmValue::I32(v) => Some(*v != 0),
            EmValue::I64(v) | EmValue::NativeInt(v) => Some(*v != 0),
            EmValue::F32(v) => Some(*v != 0.0),
            EmValue::F64(v) => Some(*v != 0.0),
            EmValue::Null => Some(false),
            EmValue::ObjectRef(_) | EmValue::ManagedPtr(_) => Some(true),
            EmValue::Struct { .. } | EmValue::Builder(_) | EmValue::TaskAwaiter(_) => None,
        }
    }

    /// Converts a stack value into the representation of a storage location of type `ty`.
    ///
    /// Narrow integers are truncated, `bool` and `char` as unsigned; `float32` slots round.
    /// Values that need no conversion are returned unchanged.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn coerce(self, ty: &TypeSignature) -> EmValue {
        let int = self.as_i64();
        match (ty, int) {
            (TypeSignature::Boolean | TypeSignature::U1, Some(v)) => EmValue::I32(i32::from(v as u8)),
            (TypeSignature::I1, Some(v)) => EmValue::I32(i32::from(v as i8)),
            (TypeSignature::Char | TypeSignature::U2, Some(v)) => {
                EmValue::I32(i32::from(v as u16))
            }
            (TypeSignature::I2, Some(v)) => EmValue::I32(i32::from(v as i16)),
            (TypeSignature::I4 | TypeSignature::U4, Some(v)) => EmValue::I32(v as i32),
            (TypeSignature::I8 | TypeSignature::U8, Some(v)) => EmValue::I64(v),
            (TypeSignature::I | TypeSignature::U, Some(v)) => EmValue::NativeInt(v),
            (TypeSignature::R4, _) => match self {
                EmValue::F64(v) => EmValue::F32(v as f32),
                other => other,
            },
            (TypeSignature::R8, _) => match self {
                EmValue::F32(v) => EmValue::F64(f64::from(v)),
                other => other,
            },
            _ => self,
        }
    }
}

impl fmt::Display for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::I32(v) => write!(f, "{v}"),
            EmValue::I64(v) => write!(f, "{v}L"),
            EmValue::NativeInt(v) => write!(f, "{v}n"),
            EmValue::F32(v) => write!(f, "{v}f"),
            EmValue::F64(v) => write!(f, "{v}"),
            EmValue::Null => write!(f, "null"),
            EmValue::ObjectRef(r) => write!(f, "{r}"),
            EmValue::ManagedPtr(p) => write!(f, "&{:?}", p.target),
            EmValue::Struct { ty, fields } => write!(f, "struct {ty} ({} fields)", fields.len()),
            EmValue::Builder(task) => write!(f, "builder({task:?})"),
            EmValue::TaskAwaiter(task) => write!(f, "awaiter({task:?})"),
        }
    }
}

/// The zero value of a storage location of type `ty`.
///
/// Structs get every instance field set to its own zero value.
///
/// # Errors
/// Returns an error if a struct type or one of its fields can not be resolved
pub fn default_value(module: &Module, ty: &TypeSignature) -> Result<EmValue> {
    Ok(match ty {
        TypeSignature::Boolean
        | TypeSignature::Char
        | TypeSignature::I1
        | TypeSignature::U1
        | TypeSignature::I2
        | TypeSignature::U2
        | TypeSignature::I4
        | TypeSignature::U4 => EmValue::I32(0),
        TypeSignature::I8 | TypeSignature::U8 => EmValue::I64(0),
        TypeSignature::I | TypeSignature::U => EmValue::NativeInt(0),
        TypeSignature::R4 => EmValue::F32(0.0),
        TypeSignature::R8 => EmValue::F64(0.0),
        TypeSignature::ValueType(token) => EmValue::Struct {
            ty: *token,
            fields: instance_fields(module, *token)?,
        },
        TypeSignature::Runtime(
            RuntimeType::AsyncVoidMethodBuilder | RuntimeType::AsyncTaskMethodBuilder(_),
        ) => EmValue::Builder(None),
        TypeSignature::Runtime(RuntimeType::TaskAwaiter(_)) => EmValue::TaskAwaiter(None),
        _ => EmValue::Null,
    })
}

/// Zero values for all instance fields of `ty`
///
/// # Errors
/// Returns an error if the type or one of its fields can not be resolved
pub fn instance_fields(module: &Module, ty: Token) -> Result<BTreeMap<Token, EmValue>> {
    let mut fields = BTreeMap::new();
    for &token in &module.type_def(ty)?.fields {
        let field = module.field(token)?;
        if !field.is_static() {
            fields.insert(token, default_value(module, &field.signature)?);
        }
    }
    Ok(fields)
}
