//! The state machine struct driving a transformed method.
//!
//! The layout follows what the C# compiler generates for an `async` method: a struct nested in
//! the declaring type, implementing `IAsyncStateMachine`, with a state field, a method builder
//! and one field per argument. Its `MoveNext` body is filled in by
//! [`crate::obfuscation::MoveNextBuilder`].

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        method::{MethodAccessFlags, MethodDef, MethodModifiers, MethodRef},
        module::{
            BaseType, CustomAttribute, FieldAttributes, FieldDef, InterfaceMethod, MethodImpl,
            Module, TypeAttributes, TypeDef,
        },
        runtime::{ReturnKind, RuntimeMethod, RuntimeType},
        signatures::{MethodSignature, TypeSignature},
        token::Token,
    },
    obfuscation::{
        frame::argument_count,
        naming::{Naming, BUILDER_FIELD, CONDITION_FIELD, STATE_FIELD, THIS_FIELD},
    },
    Result,
};

/// The state machine generated for one method
#[derive(Debug, Clone)]
pub struct StateMachineType {
    /// The state machine struct
    pub ty: Token,
    /// `<>1__state`: -1 while running, the resume point while suspended, -2 when done
    pub state: Token,
    /// `<>t__builder`
    pub builder: Token,
    /// `<>s__1`, buffers the result of a conditional suspension point
    pub condition: Token,
    /// Copies of the arguments, receiver first
    pub arguments: Vec<Token>,
    /// `IAsyncStateMachine.MoveNext`, created without a body
    pub move_next: Token,
    /// `IAsyncStateMachine.SetStateMachine`
    pub set_state_machine: Token,
    /// Return kind of the transformed method, selects the builder
    pub kind: ReturnKind,
}

impl StateMachineType {
    /// Creates the state machine struct for `method` inside its declaring type
    ///
    /// # Errors
    /// Returns an error if `method` or its declaring type can not be resolved
    pub fn create(module: &mut Module, naming: &Naming, method: Token) -> Result<Self> {
        let def = module.method(method)?.clone();
        let kind = def.return_kind();

        let ty = module.add_nested_type(
            def.declaring_type,
            TypeDef::new("", &naming.state_machine())
                .with_flags(
                    TypeAttributes::SEALED
                        | TypeAttributes::SEQUENTIAL_LAYOUT
                        | TypeAttributes::NESTED_ASSEMBLY
                        | TypeAttributes::BEFORE_FIELD_INIT,
                )
                .with_base(BaseType::ValueType)
                .with_interface(RuntimeType::IAsyncStateMachine)
                .with_attribute(CustomAttribute::CompilerGenerated),
        )?;

        let state = module.add_field(
            ty,
            FieldDef::new(STATE_FIELD, FieldAttributes::PUBLIC, TypeSignature::I4),
        )?;
        let builder = module.add_field(
            ty,
            FieldDef::new(BUILDER_FIELD, FieldAttributes::PUBLIC, kind.builder_type()),
        )?;
        let condition = module.add_field(
            ty,
            FieldDef::new(CONDITION_FIELD, FieldAttributes::PRIVATE, TypeSignature::Boolean),
        )?;

        let mut arguments = Vec::new();
        for index in 0..argument_count(&def)? {
            let name = if def.signature.has_this && index == 0 {
                THIS_FIELD.to_string()
            } else {
                def.argument_name(index)
            };
            let signature = module.argument_type(&def, index)?;
            arguments.push(module.add_field(
                ty,
                FieldDef::new(&name, FieldAttributes::PUBLIC, signature),
            )?);
        }

        let modifiers = MethodModifiers::FINAL
            | MethodModifiers::HIDE_BY_SIG
            | MethodModifiers::NEW_SLOT
            | MethodModifiers::VIRTUAL;

        let move_next = module.add_method(
            ty,
            MethodDef::new(
                "MoveNext",
                MethodSignature::new_instance(TypeSignature::Void, vec![]),
            )
            .with_access(MethodAccessFlags::PRIVATE)
            .with_modifiers(modifiers),
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .ldflda(builder)?
            .ldarg(1)?
            .call(MethodRef::Runtime(RuntimeMethod::BuilderSetStateMachine(
                kind.clone(),
            )))?
            .ret()?;
        let set_state_machine = module.add_method(
            ty,
            MethodDef::new(
                "SetStateMachine",
                MethodSignature::new_instance(
                    TypeSignature::Void,
                    vec![TypeSignature::Runtime(RuntimeType::IAsyncStateMachine)],
                ),
            )
            .with_params(&["stateMachine"])
            .with_access(MethodAccessFlags::PRIVATE)
            .with_modifiers(modifiers)
            .with_body(asm.into_body(vec![])?),
        )?;

        let impls = &mut module.type_def_mut(ty)?.method_impls;
        impls.push(MethodImpl {
            declaration: InterfaceMethod::MoveNext,
            body: move_next,
        });
        impls.push(MethodImpl {
            declaration: InterfaceMethod::SetStateMachine,
            body: set_state_machine,
        });

        Ok(StateMachineType {
            ty,
            state,
            builder,
            condition,
            arguments,
            move_next,
            set_state_machine,
            kind,
        })
    }

    /// The type of a state machine value
    #[must_use]
    pub fn signature(&self) -> TypeSignature {
        TypeSignature::ValueType(self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_of_a_value_returning_method() -> Result<()> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let method = module.add_method(
            program,
            MethodDef::new(
                "Sum",
                MethodSignature::new_instance(TypeSignature::I8, vec![TypeSignature::I4]),
            )
            .with_params(&["n"]),
        )?;
        let naming = Naming::new(true, module.method(method)?);
        let sm = StateMachineType::create(&mut module, &naming, method)?;

        let ty = module.type_def(sm.ty)?;
        assert_eq!(module.full_name(sm.ty)?, "App.Program/<Sum>d__1");
        assert!(ty.is_value_type());
        assert!(ty.implements(&RuntimeType::IAsyncStateMachine));
        assert_eq!(ty.method_impls.len(), 2);
        assert_eq!(ty.methods, vec![sm.move_next, sm.set_state_machine]);

        assert_eq!(module.field(sm.state)?.signature, TypeSignature::I4);
        assert_eq!(
            module.field(sm.builder)?.signature,
            TypeSignature::Runtime(RuntimeType::AsyncTaskMethodBuilder(Box::new(
                TypeSignature::I8
            )))
        );
        assert!(module.field(sm.condition)?.is_private());
        assert_eq!(sm.arguments.len(), 2);
        assert_eq!(module.field(sm.arguments[0])?.name, "<>4__this");
        assert_eq!(module.field(sm.arguments[1])?.name, "n");

        assert!(module.method(sm.move_next)?.body.is_none());
        let set = module.method(sm.set_state_machine)?;
        assert!(set.is_private());
        assert!(set.modifiers.contains(MethodModifiers::VIRTUAL));
        assert_eq!(set.body.as_ref().map(|b| b.instructions.len()), Some(5));
        Ok(())
    }

    #[test]
    fn void_methods_use_the_void_builder() -> Result<()> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let method = module.add_method(
            program,
            MethodDef::new("Main", MethodSignature::new_static(TypeSignature::Void, vec![])),
        )?;
        let naming = Naming::new(false, module.method(method)?);
        let sm = StateMachineType::create(&mut module, &naming, method)?;

        assert_eq!(sm.kind, ReturnKind::Void);
        assert!(sm.arguments.is_empty());
        assert_eq!(module.type_def(sm.ty)?.name, "StateMachine_Main_1");
        assert_eq!(
            module.field(sm.builder)?.signature,
            TypeSignature::Runtime(RuntimeType::AsyncVoidMethodBuilder)
        );
        Ok(())
    }
}
