//! Custom awaiters: one value type per suspension point.
//!
//! An awaiter carries a reference to the frame. Its `GetResult` method holds the code of one
//! statement of the original method and operates on the frame fields instead of locals and
//! arguments. Awaiters are obtained through `GetAwaiter` extension methods, so that
//! `MoveNext` can chain them: the awaiter produced by one suspension point is the input of the
//! next one within the same block.

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        method::{MethodAccessFlags, MethodDef, MethodModifiers, MethodRef},
        module::{
            BaseType, CustomAttribute, FieldAttributes, FieldDef, InterfaceMethod, MethodImpl,
            Module, PropertyDef, TypeAttributes, TypeDef, TYPE_VISIBILITY_MASK,
        },
        runtime::RuntimeType,
        signatures::{MethodSignature, TypeSignature},
        token::Token,
    },
    obfuscation::{
        frame::FrameLayout,
        naming::{Naming, AWAITER_FRAME_FIELD},
    },
    Result,
};

/// The value a `GetAwaiter` extension method is invoked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    /// The frame itself, at the start of a block
    Frame,
    /// The awaiter produced by the previous suspension point of the block
    Awaiter {
        /// The awaiter struct
        ty: Token,
        /// Its `Frame` field
        frame_field: Token,
    },
}

impl Carrier {
    /// The type of the carried value
    #[must_use]
    pub fn signature(&self, frame: &FrameLayout) -> TypeSignature {
        match self {
            Carrier::Frame => frame.signature(),
            Carrier::Awaiter { ty, .. } => TypeSignature::ValueType(*ty),
        }
    }
}

/// An awaiter generated for one suspension point
#[derive(Debug, Clone)]
pub struct AwaiterType {
    /// Index of the suspension point, unique within the method
    pub id: usize,
    /// The awaiter struct
    pub ty: Token,
    /// Its `Frame` field
    pub frame_field: Token,
    /// `.ctor(input)`
    pub constructor: Token,
    /// `get_IsCompleted`
    pub is_completed: Token,
    /// `OnCompleted(Action)`
    pub on_completed: Token,
    /// `GetResult`, created without a body
    pub get_result: Token,
    /// The `GetAwaiter` extension method in the container class
    pub get_awaiter: Token,
    /// What `GetAwaiter` is invoked on
    pub input: Carrier,
    /// Return type of `GetResult`; the awaiter itself if the statement produces no value
    pub output: TypeSignature,
}

impl AwaiterType {
    /// This awaiter as the input of the next suspension point
    #[must_use]
    pub fn carrier(&self) -> Carrier {
        Carrier::Awaiter {
            ty: self.ty,
            frame_field: self.frame_field,
        }
    }

    /// The type of an awaiter value
    #[must_use]
    pub fn signature(&self) -> TypeSignature {
        TypeSignature::ValueType(self.ty)
    }

    /// Returns `true` if `GetResult` returns the awaiter itself
    #[must_use]
    pub fn chains(&self) -> bool {
        self.output == self.signature()
    }

    /// Moves the awaiter into `enclosing`, giving its `GetResult` access to private members.
    ///
    /// # Errors
    /// Returns an error if either type can not be resolved or the awaiter is already nested
    pub fn nest_into(&self, module: &mut Module, enclosing: Token) -> Result<()> {
        module.nest_type(self.ty, enclosing)?;
        let ty = module.type_def_mut(self.ty)?;
        let bits = (ty.flags.bits() & !TYPE_VISIBILITY_MASK) | TypeAttributes::NESTED_ASSEMBLY.bits();
        ty.flags = TypeAttributes::from_bits_retain(bits);
        Ok(())
    }
}

/// Creates awaiters and collects their `GetAwaiter` methods in one container class
#[derive(Debug, Clone)]
pub struct AwaiterFactory {
    /// The static container class
    pub container: Token,
}

impl AwaiterFactory {
    /// Creates the container class
    #[must_use]
    pub fn new(module: &mut Module, naming: &Naming) -> Self {
        let container = module.add_type(
            TypeDef::new("", &naming.container())
                .with_flags(
                    TypeAttributes::ABSTRACT
                        | TypeAttributes::SEALED
                        | TypeAttributes::BEFORE_FIELD_INIT,
                )
                .with_attribute(CustomAttribute::CompilerGenerated),
        );
        AwaiterFactory { container }
    }

    /// Creates the awaiter of suspension point `id`.
    ///
    /// `output` is the type `GetResult` returns; `None` makes `GetResult` return the awaiter
    /// itself so that it can carry the frame to the next suspension point.
    ///
    /// # Errors
    /// Returns an error if a member can not be added to the module
    pub fn create(
        &self,
        module: &mut Module,
        naming: &Naming,
        frame: &FrameLayout,
        id: usize,
        input: Carrier,
        output: Option<TypeSignature>,
    ) -> Result<AwaiterType> {
        let ty = module.add_type(
            TypeDef::new("", &naming.awaiter(id))
                .with_flags(
                    TypeAttributes::SEQUENTIAL_LAYOUT
                        | TypeAttributes::SEALED
                        | TypeAttributes::BEFORE_FIELD_INIT,
                )
                .with_base(BaseType::ValueType)
                .with_interface(RuntimeType::INotifyCompletion)
                .with_attribute(CustomAttribute::CompilerGenerated),
        );
        let frame_field = module.add_field(
            ty,
            FieldDef::new(AWAITER_FRAME_FIELD, FieldAttributes::PUBLIC, frame.signature()),
        )?;
        let input_type = input.signature(frame);
        let output = output.unwrap_or(TypeSignature::ValueType(ty));

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.ldarg(1)?;
        if let Carrier::Awaiter { frame_field, .. } = input {
            asm.ldfld(frame_field)?;
        }
        asm.stfld(frame_field)?.ret()?;
        let constructor = module.add_method(
            ty,
            MethodDef::new_constructor(vec![input_type.clone()])
                .with_params(&["input"])
                .with_body(asm.into_body(vec![])?),
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1)?.ret()?;
        let is_completed = module.add_method(
            ty,
            MethodDef::new(
                "get_IsCompleted",
                MethodSignature::new_instance(TypeSignature::Boolean, vec![]),
            )
            .with_modifiers(MethodModifiers::HIDE_BY_SIG | MethodModifiers::SPECIAL_NAME)
            .with_body(asm.into_body(vec![])?),
        )?;
        module.type_def_mut(ty)?.properties.push(PropertyDef {
            name: "IsCompleted".to_string(),
            signature: TypeSignature::Boolean,
            getter: is_completed,
        });

        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let on_completed = module.add_method(
            ty,
            MethodDef::new(
                "OnCompleted",
                MethodSignature::new_instance(
                    TypeSignature::Void,
                    vec![TypeSignature::Runtime(RuntimeType::Action)],
                ),
            )
            .with_params(&["continuation"])
            .with_modifiers(
                MethodModifiers::FINAL
                    | MethodModifiers::HIDE_BY_SIG
                    | MethodModifiers::NEW_SLOT
                    | MethodModifiers::VIRTUAL,
            )
            .with_body(asm.into_body(vec![])?),
        )?;
        module.type_def_mut(ty)?.method_impls.push(MethodImpl {
            declaration: InterfaceMethod::OnCompleted,
            body: on_completed,
        });

        let get_result = module.add_method(
            ty,
            MethodDef::new(
                "GetResult",
                MethodSignature::new_instance(output.clone(), vec![]),
            ),
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .newobj(MethodRef::Def(constructor))?
            .ret()?;
        let get_awaiter = module.add_method(
            self.container,
            MethodDef::new(
                "GetAwaiter",
                MethodSignature::new_static(TypeSignature::ValueType(ty), vec![input_type]),
            )
            .with_params(&["input"])
            .with_access(MethodAccessFlags::ASSEM)
            .with_attribute(CustomAttribute::Extension)
            .with_body(asm.into_body(vec![])?),
        )?;

        Ok(AwaiterType {
            id,
            ty,
            frame_field,
            constructor,
            is_completed,
            on_completed,
            get_result,
            get_awaiter,
            input,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::analyze_stack;

    fn setup() -> Result<(Module, Token, Naming, FrameLayout)> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let method = module.add_method(
            program,
            MethodDef::new("Main", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_body(asm.into_body(vec![])?),
        )?;
        let naming = Naming::new(true, module.method(method)?);
        let frame = FrameLayout::create(&mut module, &naming, method)?;
        Ok((module, program, naming, frame))
    }

    #[test]
    fn awaiter_members() -> Result<()> {
        let (mut module, _, naming, frame) = setup()?;
        let factory = AwaiterFactory::new(&mut module, &naming);
        let awaiter = factory.create(&mut module, &naming, &frame, 0, Carrier::Frame, None)?;

        let ty = module.type_def(awaiter.ty)?;
        assert_eq!(ty.name, "<>AnonType_1_0");
        assert!(ty.is_value_type());
        assert!(ty.implements(&RuntimeType::INotifyCompletion));
        assert_eq!(ty.properties.len(), 1);
        assert_eq!(ty.method_impls[0].body, awaiter.on_completed);
        assert!(awaiter.chains());

        let get_awaiter = module.method(awaiter.get_awaiter)?;
        assert!(get_awaiter.is_static());
        assert!(get_awaiter.has_attribute(CustomAttribute::Extension));
        assert_eq!(get_awaiter.declaring_type, factory.container);
        assert_eq!(get_awaiter.signature.params, vec![frame.signature()]);
        assert!(module.method(awaiter.get_result)?.body.is_none());

        for method in [awaiter.constructor, awaiter.is_completed, awaiter.get_awaiter] {
            let def = module.method(method)?;
            let body = def.body.as_ref().ok_or_else(|| malformed_error!("no body"))?;
            analyze_stack(body, &module, &def.signature)?;
        }
        Ok(())
    }

    #[test]
    fn chained_awaiters_take_the_previous_awaiter() -> Result<()> {
        let (mut module, _, naming, frame) = setup()?;
        let factory = AwaiterFactory::new(&mut module, &naming);
        let first = factory.create(&mut module, &naming, &frame, 0, Carrier::Frame, None)?;
        let second = factory.create(
            &mut module,
            &naming,
            &frame,
            1,
            first.carrier(),
            Some(TypeSignature::Boolean),
        )?;

        assert!(!second.chains());
        assert_eq!(
            module.method(second.get_result)?.signature.return_type,
            TypeSignature::Boolean
        );
        let ctor = module.method(second.constructor)?;
        assert_eq!(ctor.signature.params, vec![first.signature()]);
        let body = ctor.body.as_ref().ok_or_else(|| malformed_error!("no body"))?;
        assert_eq!(body.instructions.len(), 5);
        Ok(())
    }

    #[test]
    fn nesting_switches_visibility() -> Result<()> {
        let (mut module, program, naming, frame) = setup()?;
        let factory = AwaiterFactory::new(&mut module, &naming);
        let awaiter = factory.create(&mut module, &naming, &frame, 2, Carrier::Frame, None)?;
        awaiter.nest_into(&mut module, program)?;

        let ty = module.type_def(awaiter.ty)?;
        assert_eq!(ty.enclosing_type, Some(program));
        assert!(ty.flags.contains(TypeAttributes::NESTED_ASSEMBLY));
        assert!(ty.flags.contains(TypeAttributes::SEALED));
        assert_eq!(module.full_name(awaiter.ty)?, "App.Program/<>AnonType_1_2");
        Ok(())
    }
}
