//! Method definitions, bodies and references.
//!
//! A [`MethodDef`] is a row of the module's method table. Its optional [`MethodBody`] holds the
//! resolved instruction stream, the local variable types and the exception handling regions.
//! Call sites reference callees through [`MethodRef`], which distinguishes methods defined in
//! the module from runtime library members and other imported methods.

use std::fmt;

use bitflags::bitflags;

use crate::{
    assembly::Instruction,
    metadata::{
        module::CustomAttribute,
        runtime::{ReturnKind, RuntimeMethod},
        signatures::{MethodSignature, TypeSignature},
        token::Token,
    },
};

/// Bitmask for the member access part of [`MethodAccessFlags`]
pub const METHOD_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    /// Accessibility of a method, see ECMA-335 §II.23.1.10
    pub struct MethodAccessFlags: u32 {
        /// Member not referenceable
        const COMPILER_CONTROLLED = 0x0000;
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by sub-types only in this Assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessibly by anyone in the Assembly
        const ASSEM = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessibly by sub-types anywhere, plus anyone in assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessibly by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    /// Modifiers of a method, see ECMA-335 §II.23.1.10
    pub struct MethodModifiers: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name+sig, else just by name
        const HIDE_BY_SIG = 0x0080;
        /// Method always gets a new slot in the vtable
        const NEW_SLOT = 0x0100;
        /// Method is abstract
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// CLI provides 'special' behavior, depending upon the name of the method
        const RTSPECIAL_NAME = 0x1000;
    }
}

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause.
        const FILTER = 0x0001;
        /// A finally clause.
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// Exception handler defining a protected region and its handler.
///
/// All positions are instruction indices into [`MethodBody::instructions`], end positions are
/// exclusive.
///
/// ```text
/// try {
///     // try_start .. try_end
/// }
/// catch (catch_type) {
///     // handler_start .. handler_end
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    /// Kind of the handler clause
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction
    pub try_start: usize,
    /// First instruction after the protected region
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// First instruction after the handler
    pub handler_end: usize,
    /// Caught exception type, for [`ExceptionHandlerFlags::EXCEPTION`] clauses
    pub catch_type: Option<TypeSignature>,
}

impl ExceptionHandler {
    /// Returns `true` if `index` lies inside the protected region
    #[must_use]
    pub fn protects(&self, index: usize) -> bool {
        index >= self.try_start && index < self.try_end
    }
}

/// The body of a method
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Zero-initialize all locals on entry
    pub init_locals: bool,
    /// Types of the local variables
    pub locals: Vec<TypeSignature>,
    /// Resolved instruction stream, branch targets are instruction indices
    pub instructions: Vec<Instruction>,
    /// Exception handling regions
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".maxstack {}", self.max_stack)?;
        if !self.locals.is_empty() {
            let locals: Vec<String> = self.locals.iter().map(ToString::to_string).collect();
            writeln!(f, ".locals init ({})", locals.join(", "))?;
        }
        for (index, instruction) in self.instructions.iter().enumerate() {
            for handler in &self.exception_handlers {
                if handler.try_start == index {
                    writeln!(f, "  .try {{")?;
                }
                if handler.handler_start == index {
                    writeln!(f, "  }} catch {{")?;
                }
            }
            writeln!(f, "  IL_{index:04x}: {instruction}")?;
        }
        Ok(())
    }
}

/// A method defined in the module.
///
/// # Examples
///
/// ```rust
/// use awaitscope::metadata::{
///     method::{MethodAccessFlags, MethodDef},
///     signatures::{MethodSignature, TypeSignature},
/// };
///
/// let method = MethodDef::new(
///     "Add",
///     MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4, TypeSignature::I4]),
/// )
/// .with_access(MethodAccessFlags::PUBLIC)
/// .with_params(&["a", "b"]);
///
/// assert!(method.is_static());
/// assert_eq!(method.param_names, vec!["a", "b"]);
/// ```
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Token of this method, assigned when it is added to a module
    pub token: Token,
    /// Name of the method
    pub name: String,
    /// Accessibility
    pub access: MethodAccessFlags,
    /// Static, virtual, special name and friends
    pub modifiers: MethodModifiers,
    /// Signature of the method
    pub signature: MethodSignature,
    /// Names of the explicit parameters
    pub param_names: Vec<String>,
    /// Implementation, `None` for abstract and runtime provided methods
    pub body: Option<MethodBody>,
    /// Owning type, assigned when the method is added to a module
    pub declaring_type: Token,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl MethodDef {
    /// Creates a method with default parameter names and no body
    #[must_use]
    pub fn new(name: &str, signature: MethodSignature) -> Self {
        let mut modifiers = MethodModifiers::HIDE_BY_SIG;
        if !signature.has_this {
            modifiers |= MethodModifiers::STATIC;
        }

        let param_names = (0..signature.params.len())
            .map(|i| format!("arg{i}"))
            .collect();

        MethodDef {
            token: Token(0),
            name: name.to_string(),
            access: MethodAccessFlags::PUBLIC,
            modifiers,
            signature,
            param_names,
            body: None,
            declaring_type: Token(0),
            custom_attributes: Vec::new(),
        }
    }

    /// Creates an instance constructor (`.ctor`) with the given parameters
    #[must_use]
    pub fn new_constructor(params: Vec<TypeSignature>) -> Self {
        MethodDef::new(
            ".ctor",
            MethodSignature::new_instance(TypeSignature::Void, params),
        )
        .with_modifiers(
            MethodModifiers::HIDE_BY_SIG
                | MethodModifiers::SPECIAL_NAME
                | MethodModifiers::RTSPECIAL_NAME,
        )
    }

    /// Sets the accessibility
    #[must_use]
    pub fn with_access(mut self, access: MethodAccessFlags) -> Self {
        self.access = access;
        self
    }

    /// Replaces the modifiers, `STATIC` is derived from the signature
    #[must_use]
    pub fn with_modifiers(mut self, modifiers: MethodModifiers) -> Self {
        self.modifiers = modifiers;
        self.modifiers
            .set(MethodModifiers::STATIC, !self.signature.has_this);
        self
    }

    /// Sets the parameter names
    #[must_use]
    pub fn with_params(mut self, names: &[&str]) -> Self {
        self.param_names = names.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the body
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Attaches a custom attribute
    #[must_use]
    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.custom_attributes.push(attribute);
        self
    }

    /// Returns `true` for methods without a receiver
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.modifiers.contains(MethodModifiers::STATIC)
    }

    /// Returns `true` for instance and type constructors
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.modifiers.contains(MethodModifiers::RTSPECIAL_NAME)
            && (self.name == ".ctor" || self.name == ".cctor")
    }

    /// Returns `true` if only the declaring type may reference this method
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.access.bits() & METHOD_ACCESS_MASK == MethodAccessFlags::PRIVATE.bits()
    }

    /// Returns `true` unless every type of the assembly may call this method
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        let access = self.access.bits() & METHOD_ACCESS_MASK;
        access != MethodAccessFlags::ASSEM.bits()
            && access != MethodAccessFlags::FAM_OR_ASSEM.bits()
            && access != MethodAccessFlags::PUBLIC.bits()
    }

    /// Returns `true` if the method carries the given attribute
    #[must_use]
    pub fn has_attribute(&self, attribute: CustomAttribute) -> bool {
        self.custom_attributes.contains(&attribute)
    }

    /// What the method hands back to its caller
    #[must_use]
    pub fn return_kind(&self) -> ReturnKind {
        ReturnKind::from_return_type(&self.signature.return_type)
    }

    /// Name of the argument at `index`, counting the receiver as argument 0
    #[must_use]
    pub fn argument_name(&self, index: u16) -> String {
        let index = usize::from(index);
        if self.signature.has_this {
            if index == 0 {
                return "this".to_string();
            }
            return self
                .param_names
                .get(index - 1)
                .cloned()
                .unwrap_or_else(|| format!("arg{}", index - 1));
        }
        self.param_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("arg{index}"))
    }
}

/// An imported method that is neither defined in the module nor part of the async protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalMethod {
    /// Full name of the declaring type, e.g. `System.Console`
    pub declaring_type: String,
    /// Name of the method
    pub name: String,
    /// Signature of the method
    pub signature: MethodSignature,
}

impl ExternalMethod {
    /// Creates a reference to an imported method
    #[must_use]
    pub fn new(declaring_type: &str, name: &str, signature: MethodSignature) -> Self {
        ExternalMethod {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            signature,
        }
    }

    /// `Type::Name`, the key under which emulator hooks are registered
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }
}

/// The callee of a call, callvirt or newobj instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodRef {
    /// A method defined in the module
    Def(Token),
    /// A member of the runtime library used by the async protocol
    Runtime(RuntimeMethod),
    /// Any other imported method
    External(ExternalMethod),
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodRef::Def(token) => write!(f, "{token}"),
            MethodRef::Runtime(method) => write!(f, "{method}"),
            MethodRef::External(method) => write!(f, "{}", method.full_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_modifier_follows_signature() {
        let method = MethodDef::new(
            "Run",
            MethodSignature::new_instance(TypeSignature::Void, vec![]),
        )
        .with_modifiers(MethodModifiers::VIRTUAL | MethodModifiers::STATIC);
        assert!(!method.is_static());
        assert!(method.modifiers.contains(MethodModifiers::VIRTUAL));
    }

    #[test]
    fn constructor_detection() {
        assert!(MethodDef::new_constructor(vec![]).is_constructor());
        let fake = MethodDef::new(
            ".ctor",
            MethodSignature::new_instance(TypeSignature::Void, vec![]),
        );
        assert!(!fake.is_constructor());
    }

    #[test]
    fn private_access() {
        let method = MethodDef::new(
            "Helper",
            MethodSignature::new_static(TypeSignature::Void, vec![]),
        )
        .with_access(MethodAccessFlags::PRIVATE);
        assert!(method.is_private());
        assert!(!method
            .with_access(MethodAccessFlags::FAM_OR_ASSEM)
            .is_private());
    }

    #[test]
    fn argument_names_count_receiver() {
        let method = MethodDef::new(
            "Scale",
            MethodSignature::new_instance(TypeSignature::I4, vec![TypeSignature::I4]),
        )
        .with_params(&["factor"]);
        assert_eq!(method.argument_name(0), "this");
        assert_eq!(method.argument_name(1), "factor");
        assert_eq!(method.argument_name(2), "arg1");
    }

    #[test]
    fn handler_range() {
        let handler = ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start: 2,
            try_end: 5,
            handler_start: 5,
            handler_end: 8,
            catch_type: None,
        };
        assert!(handler.protects(2));
        assert!(handler.protects(4));
        assert!(!handler.protects(5));
    }
}
