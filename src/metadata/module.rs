//! The in-memory module: an arena of type, field and method rows.
//!
//! Rows are addressed by [`Token`]s and only ever appended. This makes it cheap to undo a
//! failed transformation: [`Module::checkpoint`] remembers the table sizes and member list
//! lengths, [`Module::rollback`] truncates everything that was added afterwards.
//!
//! # Examples
//!
//! ```rust
//! use awaitscope::metadata::{
//!     method::MethodDef,
//!     module::{Module, TypeDef},
//!     signatures::{MethodSignature, TypeSignature},
//! };
//!
//! let mut module = Module::new("App.dll");
//! let program = module.add_type(TypeDef::new("App", "Program"));
//! let checkpoint = module.checkpoint();
//!
//! let method = MethodDef::new("Run", MethodSignature::new_static(TypeSignature::Void, vec![]));
//! module.add_method(program, method)?;
//! assert_eq!(module.method_count(), 1);
//!
//! module.rollback(checkpoint);
//! assert_eq!(module.method_count(), 0);
//! assert!(module.type_def(program)?.methods.is_empty());
//! # Ok::<(), awaitscope::Error>(())
//! ```

use bitflags::bitflags;

use crate::{
    metadata::{
        method::{MethodDef, MethodRef},
        runtime::RuntimeType,
        signatures::{MethodSignature, TypeSignature},
        token::Token,
    },
    Error, Result,
};

/// Bitmask for the visibility part of [`TypeAttributes`]
pub const TYPE_VISIBILITY_MASK: u32 = 0x0000_0007;

/// Bitmask for the access part of [`FieldAttributes`]
pub const FIELD_ACCESS_MASK: u32 = 0x0007;

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    /// Flags of a type definition, see ECMA-335 §II.23.1.15
    pub struct TypeAttributes: u32 {
        /// Class is not public scope
        const NOT_PUBLIC = 0x0000_0000;
        /// Class is public scope
        const PUBLIC = 0x0000_0001;
        /// Class is nested with public visibility
        const NESTED_PUBLIC = 0x0000_0002;
        /// Class is nested with private visibility
        const NESTED_PRIVATE = 0x0000_0003;
        /// Class is nested with family visibility
        const NESTED_FAMILY = 0x0000_0004;
        /// Class is nested with assembly visibility
        const NESTED_ASSEMBLY = 0x0000_0005;
        /// Class is nested with family and assembly visibility
        const NESTED_FAM_AND_ASSEM = 0x0000_0006;
        /// Class is nested with family or assembly visibility
        const NESTED_FAM_OR_ASSEM = 0x0000_0007;
        /// Class fields are laid out sequentially
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Class is abstract
        const ABSTRACT = 0x0000_0080;
        /// Class cannot be extended
        const SEALED = 0x0000_0100;
        /// Initialize the class before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    /// Flags of a field definition, see ECMA-335 §II.23.1.5
    pub struct FieldAttributes: u32 {
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible only by sub-types in this Assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible by anyone in the Assembly
        const ASSEMBLY = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by sub-types anywhere, plus anyone in the Assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by anyone who has visibility to this scope
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialized, not written to after init
        const INIT_ONLY = 0x0020;
    }
}

/// Custom attributes the transformation attaches to generated members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustomAttribute {
    /// `System.Runtime.CompilerServices.CompilerGeneratedAttribute`
    CompilerGenerated,
    /// `System.Runtime.CompilerServices.ExtensionAttribute`
    Extension,
}

/// The kind of a type's base class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// `System.Object`
    Object,
    /// `System.ValueType`
    ValueType,
    /// `System.Exception`
    Exception,
}

/// Interface methods a type can implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceMethod {
    /// `IAsyncStateMachine::MoveNext`
    MoveNext,
    /// `IAsyncStateMachine::SetStateMachine`
    SetStateMachine,
    /// `INotifyCompletion::OnCompleted`
    OnCompleted,
}

/// Binds an interface method to the method implementing it (MethodImpl table)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodImpl {
    /// The implemented interface method
    pub declaration: InterfaceMethod,
    /// The implementing method
    pub body: Token,
}

/// A property with a getter
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    /// Name of the property
    pub name: String,
    /// Type of the property
    pub signature: TypeSignature,
    /// The getter method
    pub getter: Token,
}

/// A type defined in the module
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Token of this type, assigned when it is added to a module
    pub token: Token,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Name of the type
    pub name: String,
    /// Visibility, layout and semantics flags
    pub flags: TypeAttributes,
    /// Base class
    pub base: BaseType,
    /// Implemented runtime interfaces
    pub interfaces: Vec<RuntimeType>,
    /// Fields in declaration order
    pub fields: Vec<Token>,
    /// Methods in declaration order
    pub methods: Vec<Token>,
    /// Properties
    pub properties: Vec<PropertyDef>,
    /// Explicit interface method implementations
    pub method_impls: Vec<MethodImpl>,
    /// Types nested in this type
    pub nested_types: Vec<Token>,
    /// Enclosing type for nested types
    pub enclosing_type: Option<Token>,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
}

impl TypeDef {
    /// Creates a public class
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        TypeDef {
            token: Token(0),
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags: TypeAttributes::PUBLIC | TypeAttributes::BEFORE_FIELD_INIT,
            base: BaseType::Object,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            method_impls: Vec::new(),
            nested_types: Vec::new(),
            enclosing_type: None,
            custom_attributes: Vec::new(),
        }
    }

    /// Sets the flags
    #[must_use]
    pub fn with_flags(mut self, flags: TypeAttributes) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the base class
    #[must_use]
    pub fn with_base(mut self, base: BaseType) -> Self {
        self.base = base;
        self
    }

    /// Adds an implemented interface
    #[must_use]
    pub fn with_interface(mut self, interface: RuntimeType) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Attaches a custom attribute
    #[must_use]
    pub fn with_attribute(mut self, attribute: CustomAttribute) -> Self {
        self.custom_attributes.push(attribute);
        self
    }

    /// Returns `true` for structs
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.base == BaseType::ValueType
    }

    /// The signature referring to this type
    #[must_use]
    pub fn signature(&self) -> TypeSignature {
        if self.is_value_type() {
            TypeSignature::ValueType(self.token)
        } else {
            TypeSignature::Class(self.token)
        }
    }

    /// Returns `true` if the type implements the given interface
    #[must_use]
    pub fn implements(&self, interface: &RuntimeType) -> bool {
        self.interfaces.contains(interface)
    }
}

/// A field defined in the module
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Token of this field, assigned when it is added to a module
    pub token: Token,
    /// Name of the field
    pub name: String,
    /// Access and storage flags
    pub flags: FieldAttributes,
    /// Type of the field
    pub signature: TypeSignature,
    /// Owning type, assigned when the field is added to a module
    pub declaring_type: Token,
}

impl FieldDef {
    /// Creates a field
    #[must_use]
    pub fn new(name: &str, flags: FieldAttributes, signature: TypeSignature) -> Self {
        FieldDef {
            token: Token(0),
            name: name.to_string(),
            flags,
            signature,
            declaring_type: Token(0),
        }
    }

    /// Returns `true` for static fields
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }

    /// Returns `true` if only the declaring type may reference this field
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.flags.bits() & FIELD_ACCESS_MASK == FieldAttributes::PRIVATE.bits()
    }

    /// Returns `true` unless every type of the assembly may reference this field
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        let access = self.flags.bits() & FIELD_ACCESS_MASK;
        access != FieldAttributes::ASSEMBLY.bits()
            && access != FieldAttributes::FAM_OR_ASSEM.bits()
            && access != FieldAttributes::PUBLIC.bits()
    }
}

/// Sizes of the module tables and member lists at a point in time
#[derive(Debug, Clone)]
pub struct ModuleCheckpoint {
    types: usize,
    fields: usize,
    methods: usize,
    members: Vec<MemberCounts>,
}

#[derive(Debug, Clone, Copy)]
struct MemberCounts {
    fields: usize,
    methods: usize,
    properties: usize,
    method_impls: usize,
    nested_types: usize,
}

/// A module: the container of all types, fields and methods
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Name of the module, usually the file name
    pub name: String,
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
}

impl Module {
    /// Creates an empty module
    #[must_use]
    pub fn new(name: &str) -> Self {
        Module {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Adds a top-level type and returns its token
    pub fn add_type(&mut self, mut ty: TypeDef) -> Token {
        let token = Token::from_parts(Token::TYPE_DEF, self.next_rid(self.types.len()));
        ty.token = token;
        ty.enclosing_type = None;
        self.types.push(ty);
        token
    }

    /// Adds a type nested inside `enclosing` and returns its token
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `enclosing` is not a type of this module
    pub fn add_nested_type(&mut self, enclosing: Token, mut ty: TypeDef) -> Result<Token> {
        self.type_def(enclosing)?;
        ty.namespace = String::new();
        let token = self.add_type(ty);
        self.nest_type(token, enclosing)?;
        Ok(token)
    }

    /// Moves a top-level type into `enclosing`. Top-level visibility becomes the matching
    /// nested visibility: public types stay public, other types stay assembly-wide.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if either token is not a type of this module, or
    /// [`Error::Malformed`] if `ty` is already nested
    pub fn nest_type(&mut self, ty: Token, enclosing: Token) -> Result<()> {
        self.type_def(enclosing)?;
        let nested = self.type_def_mut(ty)?;
        if nested.enclosing_type.is_some() {
            return Err(malformed_error!("Type {} is already nested", ty));
        }
        nested.enclosing_type = Some(enclosing);
        nested.namespace.clear();
        let visibility = match nested.flags.bits() & TYPE_VISIBILITY_MASK {
            v if v == TypeAttributes::PUBLIC.bits() => TypeAttributes::NESTED_PUBLIC.bits(),
            v if v == TypeAttributes::NOT_PUBLIC.bits() => TypeAttributes::NESTED_ASSEMBLY.bits(),
            v => v,
        };
        nested.flags = TypeAttributes::from_bits_retain(
            (nested.flags.bits() & !TYPE_VISIBILITY_MASK) | visibility,
        );
        self.type_def_mut(enclosing)?.nested_types.push(ty);
        Ok(())
    }

    /// Adds a field to `owner` and returns its token
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `owner` is not a type of this module
    pub fn add_field(&mut self, owner: Token, mut field: FieldDef) -> Result<Token> {
        let token = Token::from_parts(Token::FIELD, self.next_rid(self.fields.len()));
        self.type_def_mut(owner)?.fields.push(token);
        field.token = token;
        field.declaring_type = owner;
        self.fields.push(field);
        Ok(token)
    }

    /// Adds a method to `owner` and returns its token
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if `owner` is not a type of this module
    pub fn add_method(&mut self, owner: Token, mut method: MethodDef) -> Result<Token> {
        let token = Token::from_parts(Token::METHOD_DEF, self.next_rid(self.methods.len()));
        self.type_def_mut(owner)?.methods.push(token);
        method.token = token;
        method.declaring_type = owner;
        self.methods.push(method);
        Ok(token)
    }

    fn next_rid(&self, len: usize) -> u32 {
        u32::try_from(len + 1).unwrap_or(u32::MAX)
    }

    /// Looks up a type
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the token does not reference a type row
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        if token.table() != Token::TYPE_DEF {
            return Err(Error::TypeNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.types.get(i))
            .ok_or(Error::TypeNotFound(token))
    }

    /// Looks up a type for modification
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the token does not reference a type row
    pub fn type_def_mut(&mut self, token: Token) -> Result<&mut TypeDef> {
        if token.table() != Token::TYPE_DEF {
            return Err(Error::TypeNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.types.get_mut(i))
            .ok_or(Error::TypeNotFound(token))
    }

    /// Looks up a field
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the token does not reference a field row
    pub fn field(&self, token: Token) -> Result<&FieldDef> {
        if token.table() != Token::FIELD {
            return Err(Error::FieldNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.fields.get(i))
            .ok_or(Error::FieldNotFound(token))
    }

    /// Looks up a field for modification
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the token does not reference a field row
    pub fn field_mut(&mut self, token: Token) -> Result<&mut FieldDef> {
        if token.table() != Token::FIELD {
            return Err(Error::FieldNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.fields.get_mut(i))
            .ok_or(Error::FieldNotFound(token))
    }

    /// Looks up a method
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the token does not reference a method row
    pub fn method(&self, token: Token) -> Result<&MethodDef> {
        if token.table() != Token::METHOD_DEF {
            return Err(Error::MethodNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.methods.get(i))
            .ok_or(Error::MethodNotFound(token))
    }

    /// Looks up a method for modification
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the token does not reference a method row
    pub fn method_mut(&mut self, token: Token) -> Result<&mut MethodDef> {
        if token.table() != Token::METHOD_DEF {
            return Err(Error::MethodNotFound(token));
        }
        token
            .index()
            .and_then(|i| self.methods.get_mut(i))
            .ok_or(Error::MethodNotFound(token))
    }

    /// All types in token order
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.iter()
    }

    /// All methods in token order
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.methods.iter()
    }

    /// Number of type rows
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Number of field rows
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Number of method rows
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Finds a method of `owner` by name
    #[must_use]
    pub fn find_method(&self, owner: Token, name: &str) -> Option<Token> {
        let ty = self.type_def(owner).ok()?;
        ty.methods
            .iter()
            .copied()
            .find(|&m| self.method(m).is_ok_and(|m| m.name == name))
    }

    /// Finds a field of `owner` by name
    #[must_use]
    pub fn find_field(&self, owner: Token, name: &str) -> Option<Token> {
        let ty = self.type_def(owner).ok()?;
        ty.fields
            .iter()
            .copied()
            .find(|&f| self.field(f).is_ok_and(|f| f.name == name))
    }

    /// Finds a type by its full name, see [`Module::full_name`]
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        self.types
            .iter()
            .find(|ty| self.full_name(ty.token).is_ok_and(|name| name == full_name))
            .map(|ty| ty.token)
    }

    /// The full name of a type: `Namespace.Name`, nested types as `Outer/Inner`
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the token does not reference a type row
    pub fn full_name(&self, token: Token) -> Result<String> {
        let ty = self.type_def(token)?;
        match ty.enclosing_type {
            Some(enclosing) => Ok(format!("{}/{}", self.full_name(enclosing)?, ty.name)),
            None if ty.namespace.is_empty() => Ok(ty.name.clone()),
            None => Ok(format!("{}.{}", ty.namespace, ty.name)),
        }
    }

    /// `Type::Method` for diagnostics
    #[must_use]
    pub fn method_full_name(&self, token: Token) -> String {
        match self.method(token) {
            Ok(method) => match self.full_name(method.declaring_type) {
                Ok(owner) => format!("{owner}::{}", method.name),
                Err(_) => method.name.clone(),
            },
            Err(_) => token.to_string(),
        }
    }

    /// Returns `true` if `ty` is `owner` or nested (transitively) inside it
    #[must_use]
    pub fn is_within(&self, ty: Token, owner: Token) -> bool {
        let mut current = Some(ty);
        while let Some(token) = current {
            if token == owner {
                return true;
            }
            current = self.type_def(token).ok().and_then(|t| t.enclosing_type);
        }
        false
    }

    /// Returns `true` if code in `from` may name the type.
    ///
    /// Top-level types are visible to the whole assembly. A nested type whose visibility is
    /// private or involves family access is only visible inside its enclosing type, and every
    /// enclosing type on the way up must be visible as well. Types generated by this crate
    /// never derive from a type of the module, so family access is treated as private.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if a type on the nesting chain is missing
    pub fn type_accessible_from(&self, ty: Token, from: Token) -> Result<bool> {
        let mut current = ty;
        loop {
            let def = self.type_def(current)?;
            let Some(enclosing) = def.enclosing_type else {
                return Ok(true);
            };
            let visibility = def.flags.bits() & TYPE_VISIBILITY_MASK;
            let restricted = visibility != TypeAttributes::NESTED_PUBLIC.bits()
                && visibility != TypeAttributes::NESTED_ASSEMBLY.bits()
                && visibility != TypeAttributes::NESTED_FAM_OR_ASSEM.bits();
            if restricted && !self.is_within(from, enclosing) {
                return Ok(false);
            }
            current = enclosing;
        }
    }

    /// Returns `true` if code in `from` may name every type definition inside the signature
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] for a dangling type token
    pub fn signature_accessible_from(&self, signature: &TypeSignature, from: Token) -> Result<bool> {
        match signature {
            TypeSignature::Class(token) | TypeSignature::ValueType(token) => {
                self.type_accessible_from(*token, from)
            }
            TypeSignature::SzArray(inner) | TypeSignature::ByRef(inner) => {
                self.signature_accessible_from(inner, from)
            }
            _ => Ok(true),
        }
    }

    /// Returns `true` if code in `from` may reference the field
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the token does not reference a field row
    pub fn field_accessible_from(&self, field: Token, from: Token) -> Result<bool> {
        let field = self.field(field)?;
        if field.is_restricted() && !self.is_within(from, field.declaring_type) {
            return Ok(false);
        }
        self.type_accessible_from(field.declaring_type, from)
    }

    /// Returns `true` if code in `from` may call the method
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the token does not reference a method row
    pub fn method_accessible_from(&self, method: Token, from: Token) -> Result<bool> {
        let method = self.method(method)?;
        if method.is_restricted() && !self.is_within(from, method.declaring_type) {
            return Ok(false);
        }
        self.type_accessible_from(method.declaring_type, from)
    }

    /// The signature of any callee
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] for a dangling method token
    pub fn method_signature(&self, method: &MethodRef) -> Result<MethodSignature> {
        match method {
            MethodRef::Def(token) => Ok(self.method(*token)?.signature.clone()),
            MethodRef::Runtime(runtime) => Ok(runtime.signature()),
            MethodRef::External(external) => Ok(external.signature.clone()),
        }
    }

    /// The type of argument `index` of a method, counting the receiver as argument 0.
    ///
    /// The receiver of a class method is the class itself, the receiver of a value type method
    /// is a managed pointer to it.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the index is out of range
    pub fn argument_type(&self, method: &MethodDef, index: u16) -> Result<TypeSignature> {
        let mut index = usize::from(index);
        if method.signature.has_this {
            if index == 0 {
                let owner = self.type_def(method.declaring_type)?;
                return Ok(if owner.is_value_type() {
                    owner.signature().by_ref()
                } else {
                    owner.signature()
                });
            }
            index -= 1;
        }
        method.signature.params.get(index).cloned().ok_or_else(|| {
            malformed_error!(
                "Argument {} out of range in {}",
                index,
                self.method_full_name(method.token)
            )
        })
    }

    /// Remembers the current size of every table and member list
    #[must_use]
    pub fn checkpoint(&self) -> ModuleCheckpoint {
        ModuleCheckpoint {
            types: self.types.len(),
            fields: self.fields.len(),
            methods: self.methods.len(),
            members: self
                .types
                .iter()
                .map(|ty| MemberCounts {
                    fields: ty.fields.len(),
                    methods: ty.methods.len(),
                    properties: ty.properties.len(),
                    method_impls: ty.method_impls.len(),
                    nested_types: ty.nested_types.len(),
                })
                .collect(),
        }
    }

    /// Discards every row and member added after `checkpoint` was taken.
    ///
    /// Modifications of rows that already existed at the checkpoint, other than appended
    /// members, are not undone.
    pub fn rollback(&mut self, checkpoint: ModuleCheckpoint) {
        self.types.truncate(checkpoint.types);
        self.fields.truncate(checkpoint.fields);
        self.methods.truncate(checkpoint.methods);

        for (ty, counts) in self.types.iter_mut().zip(&checkpoint.members) {
            ty.fields.truncate(counts.fields);
            ty.methods.truncate(counts.methods);
            ty.properties.truncate(counts.properties);
            ty.method_impls.truncate(counts.method_impls);
            ty.nested_types.truncate(counts.nested_types);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::MethodAccessFlags;

    fn sample() -> (Module, Token) {
        let mut module = Module::new("Sample.dll");
        let program = module.add_type(TypeDef::new("Sample", "Program"));
        (module, program)
    }

    #[test]
    fn tokens_are_sequential() -> Result<()> {
        let (mut module, program) = sample();
        let a = module.add_field(
            program,
            FieldDef::new("a", FieldAttributes::PRIVATE, TypeSignature::I4),
        )?;
        let b = module.add_field(
            program,
            FieldDef::new("b", FieldAttributes::PUBLIC, TypeSignature::I8),
        )?;

        assert_eq!(program, Token(0x0200_0001));
        assert_eq!(a, Token(0x0400_0001));
        assert_eq!(b, Token(0x0400_0002));
        assert_eq!(module.field(b)?.declaring_type, program);
        assert_eq!(module.find_field(program, "a"), Some(a));
        Ok(())
    }

    #[test]
    fn wrong_table_is_not_found() {
        let (module, program) = sample();
        assert!(matches!(
            module.method(program),
            Err(Error::MethodNotFound(_))
        ));
        assert!(matches!(
            module.type_def(Token(0x0200_0009)),
            Err(Error::TypeNotFound(_))
        ));
    }

    #[test]
    fn nested_names_and_visibility() -> Result<()> {
        let (mut module, program) = sample();
        let secret = module.add_field(
            program,
            FieldDef::new("secret", FieldAttributes::PRIVATE, TypeSignature::I4),
        )?;
        let inner = module.add_nested_type(program, TypeDef::new("Ignored", "Inner"))?;
        let outsider = module.add_type(TypeDef::new("Sample", "Outsider"));

        assert_eq!(module.full_name(inner)?, "Sample.Program/Inner");
        assert_eq!(module.find_type("Sample.Program/Inner"), Some(inner));
        assert!(module.field_accessible_from(secret, inner)?);
        assert!(!module.field_accessible_from(secret, outsider)?);
        assert!(module.nest_type(inner, outsider).is_err());
        assert_eq!(
            module.type_def(inner)?.flags.bits() & TYPE_VISIBILITY_MASK,
            TypeAttributes::NESTED_PUBLIC.bits()
        );
        Ok(())
    }

    #[test]
    fn family_members_and_private_types_need_the_owner() -> Result<()> {
        let (mut module, program) = sample();
        let outsider = module.add_type(TypeDef::new("Sample", "Outsider"));
        let inner = module.add_nested_type(program, TypeDef::new("", "Inner"))?;
        let hidden = module.add_nested_type(
            program,
            TypeDef::new("", "Hidden").with_flags(TypeAttributes::NESTED_PRIVATE),
        )?;
        let open = module.add_nested_type(
            hidden,
            TypeDef::new("", "Open").with_flags(TypeAttributes::NESTED_PUBLIC),
        )?;
        let shielded = module.add_field(
            program,
            FieldDef::new("shielded", FieldAttributes::FAMILY, TypeSignature::I4),
        )?;
        let shared = module.add_field(
            program,
            FieldDef::new("shared", FieldAttributes::FAM_OR_ASSEM, TypeSignature::I4),
        )?;
        let protected = module.add_method(
            program,
            MethodDef::new("Protected", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_access(MethodAccessFlags::FAMILY),
        )?;
        let ctor = module.add_method(
            hidden,
            MethodDef::new(".ctor", MethodSignature::new_instance(TypeSignature::Void, vec![])),
        )?;

        assert!(!module.field_accessible_from(shielded, outsider)?);
        assert!(module.field_accessible_from(shielded, inner)?);
        assert!(module.field_accessible_from(shared, outsider)?);
        assert!(!module.method_accessible_from(protected, outsider)?);
        assert!(module.method_accessible_from(protected, inner)?);

        assert!(!module.type_accessible_from(hidden, outsider)?);
        assert!(module.type_accessible_from(hidden, inner)?);
        assert!(!module.type_accessible_from(open, outsider)?);
        assert!(!module.method_accessible_from(ctor, outsider)?);
        assert!(module.method_accessible_from(ctor, inner)?);
        assert!(!module.signature_accessible_from(
            &TypeSignature::SzArray(Box::new(TypeSignature::Class(hidden))),
            outsider
        )?);
        assert!(module.signature_accessible_from(&TypeSignature::Class(inner), outsider)?);
        Ok(())
    }

    #[test]
    fn rollback_discards_members_of_existing_types() -> Result<()> {
        let (mut module, program) = sample();
        let keep = module.add_method(
            program,
            MethodDef::new("Keep", MethodSignature::new_static(TypeSignature::Void, vec![])),
        )?;
        let checkpoint = module.checkpoint();

        module.add_method(
            program,
            MethodDef::new("Drop", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_access(MethodAccessFlags::ASSEM),
        )?;
        let nested = module.add_nested_type(program, TypeDef::new("", "Gone"))?;
        module.add_field(
            nested,
            FieldDef::new("x", FieldAttributes::PUBLIC, TypeSignature::I4),
        )?;

        module.rollback(checkpoint);

        assert_eq!(module.type_count(), 1);
        assert_eq!(module.field_count(), 0);
        assert_eq!(module.method_count(), 1);
        let ty = module.type_def(program)?;
        assert_eq!(ty.methods, vec![keep]);
        assert!(ty.nested_types.is_empty());
        Ok(())
    }

    #[test]
    fn receiver_types() -> Result<()> {
        let (mut module, program) = sample();
        let point = module.add_type(TypeDef::new("Sample", "Point").with_base(BaseType::ValueType));

        let on_class = module.add_method(
            program,
            MethodDef::new("M", MethodSignature::new_instance(TypeSignature::I4, vec![TypeSignature::R8])),
        )?;
        let on_struct = module.add_method(
            point,
            MethodDef::new("N", MethodSignature::new_instance(TypeSignature::Void, vec![])),
        )?;

        let m = module.method(on_class)?;
        assert_eq!(module.argument_type(m, 0)?, TypeSignature::Class(program));
        assert_eq!(module.argument_type(m, 1)?, TypeSignature::R8);
        assert!(module.argument_type(m, 2).is_err());

        let n = module.method(on_struct)?;
        assert_eq!(
            module.argument_type(n, 0)?,
            TypeSignature::ValueType(point).by_ref()
        );
        Ok(())
    }
}
