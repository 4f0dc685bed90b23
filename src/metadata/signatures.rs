//! Type and method signatures.
//!
//! [`TypeSignature`] follows the element types of ECMA-335 §II.23.1.16, reduced to what method
//! bodies handled by this crate can reference. Types that are provided by the runtime library
//! rather than the module itself, such as the async method builders, are expressed through
//! [`TypeSignature::Runtime`].

use std::fmt;

use crate::metadata::{runtime::RuntimeType, token::Token};

/// Represents a type in field, local, parameter and method signatures
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TypeSignature {
    /// void
    #[default]
    Void,
    /// bool
    Boolean,
    /// char
    Char,
    /// signed 8bit integer
    I1,
    /// unsigned 8bit integer
    U1,
    /// signed 16bit integer
    I2,
    /// unsigned 16bit integer
    U2,
    /// signed 32bit integer
    I4,
    /// unsigned 32bit integer
    U4,
    /// signed 64bit integer
    I8,
    /// unsigned 64bit integer
    U8,
    /// 32bit floating-point
    R4,
    /// 64bit floating-point
    R8,
    /// signed integer, sized to executing platform
    I,
    /// unsigned integer, sized to executing platform
    U,
    /// System.String
    String,
    /// System.Object
    Object,
    /// Value type defined in the module
    ValueType(Token),
    /// Class defined in the module
    Class(Token),
    /// Single dimension, zero based array
    SzArray(Box<TypeSignature>),
    /// Type by reference
    ByRef(Box<TypeSignature>),
    /// Type provided by the runtime library
    Runtime(RuntimeType),
}

impl TypeSignature {
    /// Returns `true` if values of this type live on the stack or inline in their owner
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        match self {
            TypeSignature::Boolean
            | TypeSignature::Char
            | TypeSignature::I1
            | TypeSignature::U1
            | TypeSignature::I2
            | TypeSignature::U2
            | TypeSignature::I4
            | TypeSignature::U4
            | TypeSignature::I8
            | TypeSignature::U8
            | TypeSignature::R4
            | TypeSignature::R8
            | TypeSignature::I
            | TypeSignature::U
            | TypeSignature::ValueType(_) => true,
            TypeSignature::Runtime(runtime) => runtime.is_value_type(),
            TypeSignature::Void
            | TypeSignature::String
            | TypeSignature::Object
            | TypeSignature::Class(_)
            | TypeSignature::SzArray(_)
            | TypeSignature::ByRef(_) => false,
        }
    }

    /// Returns `true` for object references (classes, strings, arrays, boxed values)
    #[must_use]
    pub fn is_reference(&self) -> bool {
        match self {
            TypeSignature::String
            | TypeSignature::Object
            | TypeSignature::Class(_)
            | TypeSignature::SzArray(_) => true,
            TypeSignature::Runtime(runtime) => !runtime.is_value_type(),
            _ => false,
        }
    }

    /// Returns `true` for managed pointers
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSignature::ByRef(_))
    }

    /// The type a value of this signature has while it sits on the evaluation stack.
    ///
    /// Integers narrower than 32 bits widen to `int32`, unsigned integers share the slot of
    /// their signed counterpart and all object references collapse to `object`
    /// (ECMA-335 §I.12.3.2.1).
    #[must_use]
    pub fn stack_type(&self) -> TypeSignature {
        match self {
            TypeSignature::Boolean
            | TypeSignature::Char
            | TypeSignature::I1
            | TypeSignature::U1
            | TypeSignature::I2
            | TypeSignature::U2
            | TypeSignature::I4
            | TypeSignature::U4 => TypeSignature::I4,
            TypeSignature::I8 | TypeSignature::U8 => TypeSignature::I8,
            TypeSignature::I | TypeSignature::U => TypeSignature::I,
            TypeSignature::Class(_) | TypeSignature::Object => TypeSignature::Object,
            other => other.clone(),
        }
    }

    /// Wraps this type into a by-reference type
    #[must_use]
    pub fn by_ref(self) -> TypeSignature {
        TypeSignature::ByRef(Box::new(self))
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Void => write!(f, "void"),
            TypeSignature::Boolean => write!(f, "bool"),
            TypeSignature::Char => write!(f, "char"),
            TypeSignature::I1 => write!(f, "int8"),
            TypeSignature::U1 => write!(f, "uint8"),
            TypeSignature::I2 => write!(f, "int16"),
            TypeSignature::U2 => write!(f, "uint16"),
            TypeSignature::I4 => write!(f, "int32"),
            TypeSignature::U4 => write!(f, "uint32"),
            TypeSignature::I8 => write!(f, "int64"),
            TypeSignature::U8 => write!(f, "uint64"),
            TypeSignature::R4 => write!(f, "float32"),
            TypeSignature::R8 => write!(f, "float64"),
            TypeSignature::I => write!(f, "native int"),
            TypeSignature::U => write!(f, "native uint"),
            TypeSignature::String => write!(f, "string"),
            TypeSignature::Object => write!(f, "object"),
            TypeSignature::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSignature::Class(token) => write!(f, "class {token}"),
            TypeSignature::SzArray(element) => write!(f, "{element}[]"),
            TypeSignature::ByRef(inner) => write!(f, "{inner}&"),
            TypeSignature::Runtime(runtime) => write!(f, "{runtime}"),
        }
    }
}

/// Signature of a method (ECMA-335 §II.23.2.1), without calling convention details
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MethodSignature {
    /// The method takes an implicit receiver as argument 0
    pub has_this: bool,
    /// The return type of this method
    pub return_type: TypeSignature,
    /// The explicit parameters of this method
    pub params: Vec<TypeSignature>,
}

impl MethodSignature {
    /// Creates the signature of a static method
    #[must_use]
    pub fn new_static(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        MethodSignature {
            has_this: false,
            return_type,
            params,
        }
    }

    /// Creates the signature of an instance method
    #[must_use]
    pub fn new_instance(return_type: TypeSignature, params: Vec<TypeSignature>) -> Self {
        MethodSignature {
            has_this: true,
            return_type,
            params,
        }
    }

    /// Number of values a call site pops, including the receiver
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Returns `true` if calls push a value
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != TypeSignature::Void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_types() {
        assert_eq!(TypeSignature::U1.stack_type(), TypeSignature::I4);
        assert_eq!(TypeSignature::Boolean.stack_type(), TypeSignature::I4);
        assert_eq!(TypeSignature::U8.stack_type(), TypeSignature::I8);
        assert_eq!(TypeSignature::U.stack_type(), TypeSignature::I);
        assert_eq!(TypeSignature::R4.stack_type(), TypeSignature::R4);
        assert_eq!(
            TypeSignature::Class(Token::from_parts(Token::TYPE_DEF, 1)).stack_type(),
            TypeSignature::Object
        );
    }

    #[test]
    fn value_and_reference_kinds() {
        let vt = TypeSignature::ValueType(Token::from_parts(Token::TYPE_DEF, 2));
        assert!(vt.is_value_type());
        assert!(!vt.is_reference());
        assert!(TypeSignature::String.is_reference());
        assert!(TypeSignature::SzArray(Box::new(TypeSignature::I4)).is_reference());
        assert!(!TypeSignature::Void.is_value_type());
        assert!(TypeSignature::I4.by_ref().is_by_ref());
    }

    #[test]
    fn arg_count_includes_receiver() {
        let sig = MethodSignature::new_instance(TypeSignature::Void, vec![TypeSignature::I4]);
        assert_eq!(sig.arg_count(), 2);
        assert!(!sig.returns_value());
    }
}
