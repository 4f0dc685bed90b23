//! Replacement bodies that start a state machine.
//!
//! A void method becomes a startup stub: it initializes the state machine, copies its
//! arguments into it and hands it to `AsyncVoidMethodBuilder.Start`. A value-returning method
//! gets a task-returning proxy holding the startup stub, and its own body becomes a forwarder
//! that calls the proxy and blocks on the result:
//!
//! ```text
//! int Compute(int x) => <Compute>g__ComputeAsync|3_0(x).GetAwaiter().GetResult();
//! ```

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        method::{MethodAccessFlags, MethodBody, MethodDef, MethodRef},
        module::{CustomAttribute, Module},
        runtime::{RuntimeMethod, RuntimeType},
        signatures::{MethodSignature, TypeSignature},
        token::Token,
    },
    obfuscation::{naming::Naming, statemachine::StateMachineType},
    Result,
};

/// The body creating, initializing and starting a state machine.
///
/// The arguments of the method owning the body are copied into the state machine; for a
/// value-returning state machine the body returns the builder's task.
///
/// # Errors
/// Returns an error if the body can not be assembled
pub fn startup_body(state_machine: &StateMachineType) -> Result<MethodBody> {
    let kind = &state_machine.kind;
    let mut asm = InstructionAssembler::new();

    asm.ldloca(0)?
        .call(MethodRef::Runtime(RuntimeMethod::BuilderCreate(kind.clone())))?
        .stfld(state_machine.builder)?;
    for (index, &field) in state_machine.arguments.iter().enumerate() {
        let index = u16::try_from(index)
            .map_err(|_| malformed_error!("Argument {} out of range", index))?;
        asm.ldloca(0)?.ldarg(index)?.stfld(field)?;
    }
    asm.ldloca(0)?
        .ldc_i4(-1)?
        .stfld(state_machine.state)?
        .ldloca(0)?
        .ldflda(state_machine.builder)?
        .ldloca(0)?
        .call(MethodRef::Runtime(RuntimeMethod::BuilderStart {
            kind: kind.clone(),
            state_machine: state_machine.ty,
        }))?;
    if let Some(value) = kind.value_type() {
        asm.ldloca(0)?
            .ldflda(state_machine.builder)?
            .call(MethodRef::Runtime(RuntimeMethod::BuilderGetTask(value.clone())))?;
    }
    asm.ret()?;

    asm.into_body(vec![state_machine.signature()])
}

/// Adds the task-returning proxy of a value-returning method to its declaring type.
///
/// # Errors
/// Returns an error if `method` can not be resolved or does not return a value
pub fn create_proxy(module: &mut Module, naming: &Naming, method: Token) -> Result<Token> {
    let def = module.method(method)?;
    let Some(task) = def.return_kind().task_type() else {
        return Err(malformed_error!(
            "{} returns no value and needs no proxy",
            module.method_full_name(method)
        ));
    };

    let signature = MethodSignature {
        has_this: def.signature.has_this,
        return_type: task,
        params: def.signature.params.clone(),
    };
    let names: Vec<&str> = def.param_names.iter().map(String::as_str).collect();
    let proxy = MethodDef::new(&naming.proxy(), signature)
        .with_params(&names)
        .with_access(MethodAccessFlags::ASSEM)
        .with_attribute(CustomAttribute::CompilerGenerated);

    let owner = def.declaring_type;
    module.add_method(owner, proxy)
}

/// The body of a value-returning method after transformation: run the proxy to completion
/// and return its result.
///
/// # Errors
/// Returns an error if `method` can not be resolved or does not return a value
pub fn forwarder_body(module: &Module, method: Token, proxy: Token) -> Result<MethodBody> {
    let def = module.method(method)?;
    let Some(value) = def.return_kind().value_type().cloned() else {
        return Err(malformed_error!(
            "{} returns no value",
            module.method_full_name(method)
        ));
    };
    let count = u16::try_from(def.signature.arg_count())
        .map_err(|_| malformed_error!("Too many arguments in {}", def.name))?;

    let mut asm = InstructionAssembler::new();
    for index in 0..count {
        asm.ldarg(index)?;
    }
    asm.call(MethodRef::Def(proxy))?
        .callvirt(MethodRef::Runtime(RuntimeMethod::TaskGetAwaiter(value.clone())))?
        .stloc(0)?
        .ldloca(0)?
        .call(MethodRef::Runtime(RuntimeMethod::TaskAwaiterGetResult(
            value.clone(),
        )))?
        .ret()?;

    asm.into_body(vec![TypeSignature::Runtime(RuntimeType::TaskAwaiter(
        Box::new(value),
    ))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{analyze_stack, OpCode},
        metadata::module::TypeDef,
    };

    fn setup(returns: TypeSignature) -> Result<(Module, Token, Naming, StateMachineType)> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let method = module.add_method(
            program,
            MethodDef::new(
                "Scale",
                MethodSignature::new_instance(returns, vec![TypeSignature::I4, TypeSignature::R8]),
            )
            .with_params(&["factor", "value"]),
        )?;
        let naming = Naming::new(true, module.method(method)?);
        let sm = StateMachineType::create(&mut module, &naming, method)?;
        Ok((module, method, naming, sm))
    }

    #[test]
    fn void_startup_stub() -> Result<()> {
        let (module, method, _, sm) = setup(TypeSignature::Void)?;
        let body = startup_body(&sm)?;

        assert_eq!(body.locals, vec![sm.signature()]);
        // create, three argument copies, state, start, ret
        assert_eq!(body.instructions.len(), 3 + 3 * 3 + 3 + 4 + 1);
        assert_eq!(body.instructions.last().map(|i| i.opcode), Some(OpCode::Ret));
        analyze_stack(&body, &module, &module.method(method)?.signature)?;
        Ok(())
    }

    #[test]
    fn proxy_and_forwarder() -> Result<()> {
        let (mut module, method, naming, sm) = setup(TypeSignature::R8)?;
        let proxy = create_proxy(&mut module, &naming, method)?;

        let def = module.method(proxy)?;
        assert_eq!(def.name, "<Scale>g__ScaleAsync|1_0");
        assert_eq!(def.param_names, vec!["factor", "value"]);
        assert!(def.has_attribute(CustomAttribute::CompilerGenerated));
        assert!(!def.is_static());
        assert_eq!(
            def.signature.return_type,
            TypeSignature::Runtime(RuntimeType::Task(Box::new(TypeSignature::R8)))
        );

        let stub = startup_body(&sm)?;
        analyze_stack(&stub, &module, &module.method(proxy)?.signature)?;

        let forwarder = forwarder_body(&module, method, proxy)?;
        assert_eq!(
            forwarder.locals,
            vec![TypeSignature::Runtime(RuntimeType::TaskAwaiter(Box::new(
                TypeSignature::R8
            )))]
        );
        let report = analyze_stack(&forwarder, &module, &module.method(method)?.signature)?;
        assert_eq!(report.max_depth, 3);
        Ok(())
    }

    #[test]
    fn void_methods_have_no_proxy() -> Result<()> {
        let (mut module, method, naming, _) = setup(TypeSignature::Void)?;
        assert!(create_proxy(&mut module, &naming, method).is_err());
        assert!(forwarder_body(&module, method, method).is_err());
        Ok(())
    }
}
