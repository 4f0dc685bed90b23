//! The frame: a heap object holding the variables of one invocation.
//!
//! Every argument, local and synthetic variable of a transformed method lives in a field of
//! its frame, so that the code moved into awaiters can reach it through the single reference
//! each awaiter carries.

use std::collections::HashMap;

use crate::{
    analysis::VariableId,
    assembly::InstructionAssembler,
    metadata::{
        method::{MethodDef, MethodRef},
        module::{CustomAttribute, FieldAttributes, FieldDef, Module, TypeAttributes, TypeDef},
        runtime::RuntimeMethod,
        signatures::TypeSignature,
        token::Token,
    },
    obfuscation::naming::{Naming, THIS_FIELD},
    Result,
};

/// The frame class generated for one method
#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// The frame class
    pub ty: Token,
    /// Its parameterless constructor
    pub constructor: Token,
    arguments: Vec<Token>,
    locals: Vec<Token>,
    synthetic: HashMap<VariableId, Token>,
}

impl FrameLayout {
    /// Creates the frame class for `method`, with one field per argument and local.
    ///
    /// # Errors
    /// Returns an error if `method` or one of its argument types can not be resolved
    pub fn create(module: &mut Module, naming: &Naming, method: Token) -> Result<Self> {
        let def = module.method(method)?.clone();

        let mut argument_fields = Vec::new();
        for index in 0..argument_count(&def)? {
            let name = if def.signature.has_this && index == 0 {
                THIS_FIELD.to_string()
            } else {
                def.argument_name(index)
            };
            argument_fields.push((name, module.argument_type(&def, index)?));
        }
        let locals = def
            .body
            .as_ref()
            .map(|body| body.locals.clone())
            .unwrap_or_default();
        if let Some(index) = locals.iter().position(TypeSignature::is_by_ref) {
            return Err(unsupported_error!(
                "by-reference local {} in {}",
                index,
                def.name
            ));
        }

        let ty = module.add_type(
            TypeDef::new("", &naming.frame())
                .with_flags(TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT)
                .with_attribute(CustomAttribute::CompilerGenerated),
        );
        for signature in argument_fields.iter().map(|(_, s)| s).chain(&locals) {
            if !module.signature_accessible_from(signature, ty)? {
                return Err(unsupported_error!(
                    "{} of {} is not visible outside its declaring type",
                    signature,
                    def.name
                ));
            }
        }

        let mut arguments = Vec::with_capacity(argument_fields.len());
        for (name, signature) in argument_fields {
            arguments.push(module.add_field(
                ty,
                FieldDef::new(&name, FieldAttributes::PUBLIC, signature),
            )?);
        }

        let mut local_fields = Vec::with_capacity(locals.len());
        for (index, signature) in locals.into_iter().enumerate() {
            local_fields.push(module.add_field(
                ty,
                FieldDef::new(&Naming::local_field(index), FieldAttributes::PUBLIC, signature),
            )?);
        }

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .call(MethodRef::Runtime(RuntimeMethod::ObjectCtor))?
            .ret()?;
        let constructor = module.add_method(
            ty,
            MethodDef::new_constructor(vec![]).with_body(asm.into_body(vec![])?),
        )?;

        Ok(FrameLayout {
            ty,
            constructor,
            arguments,
            locals: local_fields,
            synthetic: HashMap::new(),
        })
    }

    /// The type of a frame reference
    #[must_use]
    pub fn signature(&self) -> TypeSignature {
        TypeSignature::Class(self.ty)
    }

    /// The field backing argument `index`, counting the receiver as argument 0
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the method has no such argument
    pub fn argument_field(&self, index: u16) -> Result<Token> {
        self.arguments
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| malformed_error!("Frame has no field for argument {}", index))
    }

    /// All argument fields, receiver first
    #[must_use]
    pub fn argument_fields(&self) -> &[Token] {
        &self.arguments
    }

    /// The field backing local `index`
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the method has no such local
    pub fn local_field(&self, index: u16) -> Result<Token> {
        self.locals
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| malformed_error!("Frame has no field for local {}", index))
    }

    /// The field backing a synthetic variable, created on first use.
    ///
    /// A known `ty` (re)types the field; a field first seen without a type is an `object`.
    /// Managed pointers can not live in a class field, so a by-reference `ty` is rejected, as
    /// is a type the frame can not name.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] for a by-reference or hidden `ty`, or an
    /// error if the field can not be added to the frame
    pub fn synthetic_field(
        &mut self,
        module: &mut Module,
        var: VariableId,
        ty: Option<TypeSignature>,
    ) -> Result<Token> {
        if ty.as_ref().is_some_and(TypeSignature::is_by_ref) {
            return Err(unsupported_error!(
                "managed pointer held in synthetic variable {}",
                var.0
            ));
        }
        if let Some(ty) = &ty {
            if !module.signature_accessible_from(ty, self.ty)? {
                return Err(unsupported_error!(
                    "synthetic variable {} of hidden type {}",
                    var.0,
                    ty
                ));
            }
        }
        if let Some(&field) = self.synthetic.get(&var) {
            if let Some(ty) = ty {
                module.field_mut(field)?.signature = ty;
            }
            return Ok(field);
        }

        let field = module.add_field(
            self.ty,
            FieldDef::new(
                &Naming::variable_field(var),
                FieldAttributes::PUBLIC,
                ty.unwrap_or(TypeSignature::Object),
            ),
        )?;
        self.synthetic.insert(var, field);
        Ok(field)
    }

    /// The field of a synthetic variable, if one was created
    #[must_use]
    pub fn existing_synthetic_field(&self, var: VariableId) -> Option<Token> {
        self.synthetic.get(&var).copied()
    }
}

pub(crate) fn argument_count(def: &MethodDef) -> Result<u16> {
    u16::try_from(def.signature.arg_count())
        .map_err(|_| malformed_error!("Too many arguments in {}", def.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::signatures::MethodSignature;

    fn setup() -> Result<(Module, Token)> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let method = module.add_method(
            program,
            MethodDef::new(
                "Run",
                MethodSignature::new_instance(
                    TypeSignature::Void,
                    vec![TypeSignature::I4, TypeSignature::String],
                ),
            )
            .with_params(&["count", "label"])
            .with_body(asm.into_body(vec![TypeSignature::I8])?),
        )?;
        Ok((module, method))
    }

    #[test]
    fn fields_mirror_arguments_and_locals() -> Result<()> {
        let (mut module, method) = setup()?;
        let naming = Naming::new(true, module.method(method)?);
        let frame = FrameLayout::create(&mut module, &naming, method)?;

        let ty = module.type_def(frame.ty)?;
        assert_eq!(ty.name, "<>AnonType_1_Frame");
        assert!(ty.enclosing_type.is_none());
        assert!(ty.custom_attributes.contains(&CustomAttribute::CompilerGenerated));
        assert_eq!(ty.fields.len(), 4);

        let this = module.field(frame.argument_field(0)?)?;
        assert_eq!(this.name, "<>4__this");
        assert!(matches!(this.signature, TypeSignature::Class(_)));
        assert_eq!(module.field(frame.argument_field(1)?)?.name, "count");
        assert_eq!(module.field(frame.argument_field(2)?)?.signature, TypeSignature::String);

        let local = module.field(frame.local_field(0)?)?;
        assert_eq!(local.name, "<l>5__0");
        assert_eq!(local.signature, TypeSignature::I8);

        assert!(frame.argument_field(3).is_err());
        assert!(frame.local_field(1).is_err());
        assert_eq!(module.method(frame.constructor)?.name, ".ctor");
        Ok(())
    }

    #[test]
    fn synthetic_fields_are_created_once() -> Result<()> {
        let (mut module, method) = setup()?;
        let naming = Naming::new(false, module.method(method)?);
        let mut frame = FrameLayout::create(&mut module, &naming, method)?;

        let untyped = frame.synthetic_field(&mut module, VariableId(4), None)?;
        assert_eq!(module.field(untyped)?.signature, TypeSignature::Object);
        assert_eq!(module.field(untyped)?.name, "<>s__4");

        let typed = frame.synthetic_field(&mut module, VariableId(4), Some(TypeSignature::R8))?;
        assert_eq!(typed, untyped);
        assert_eq!(module.field(typed)?.signature, TypeSignature::R8);
        assert_eq!(frame.existing_synthetic_field(VariableId(4)), Some(typed));
        assert_eq!(frame.existing_synthetic_field(VariableId(5)), None);
        Ok(())
    }

    #[test]
    fn managed_pointers_never_become_fields() -> Result<()> {
        let (mut module, method) = setup()?;
        let naming = Naming::new(true, module.method(method)?);
        let mut frame = FrameLayout::create(&mut module, &naming, method)?;
        let fields = module.field_count();

        let err = frame.synthetic_field(&mut module, VariableId(0), Some(TypeSignature::I4.by_ref()));
        assert!(matches!(err, Err(crate::Error::UnsupportedConstruct(_))));
        assert_eq!(module.field_count(), fields);
        assert_eq!(frame.existing_synthetic_field(VariableId(0)), None);

        if let Some(body) = module.method_mut(method)?.body.as_mut() {
            body.locals = vec![TypeSignature::I4.by_ref()];
        }
        let err = FrameLayout::create(&mut module, &naming, method);
        assert!(matches!(err, Err(crate::Error::UnsupportedConstruct(_))));
        Ok(())
    }

    #[test]
    fn hidden_types_never_become_fields() -> Result<()> {
        let (mut module, method) = setup()?;
        let program = module.method(method)?.declaring_type;
        let hidden = module.add_nested_type(
            program,
            TypeDef::new("", "Hidden").with_flags(TypeAttributes::NESTED_PRIVATE),
        )?;
        let naming = Naming::new(true, module.method(method)?);
        let mut frame = FrameLayout::create(&mut module, &naming, method)?;

        let err = frame.synthetic_field(&mut module, VariableId(1), Some(TypeSignature::Class(hidden)));
        assert!(matches!(err, Err(crate::Error::UnsupportedConstruct(_))));

        if let Some(body) = module.method_mut(method)?.body.as_mut() {
            body.locals = vec![TypeSignature::SzArray(Box::new(TypeSignature::Class(hidden)))];
        }
        let err = FrameLayout::create(&mut module, &naming, method);
        assert!(matches!(err, Err(crate::Error::UnsupportedConstruct(_))));
        Ok(())
    }
}
