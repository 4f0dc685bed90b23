//! Transformation of a single method.
//!
//! [`MethodTransformer::apply`] is all-or-nothing: every type and member created for the
//! method is discarded again if any step fails, and the original body is only replaced once
//! everything else is in place.

use log::debug;

use crate::{
    analysis::AstCfg,
    metadata::{module::Module, runtime::ReturnKind, token::Token},
    obfuscation::{
        awaiter::AwaiterFactory,
        config::ObfuscatorParameters,
        frame::FrameLayout,
        install_body,
        movenext::MoveNextBuilder,
        naming::Naming,
        statemachine::StateMachineType,
        stub::{create_proxy, forwarder_body, startup_body},
    },
    Error, Result,
};

/// What was generated for one transformed method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSummary {
    /// The transformed method
    pub method: Token,
    /// The state machine struct
    pub state_machine: Token,
    /// Its `MoveNext` method
    pub move_next: Token,
    /// Its `<>1__state` field
    pub state_field: Token,
    /// The frame class
    pub frame: Token,
    /// The class holding the `GetAwaiter` extension methods
    pub container: Token,
    /// The awaiter structs in suspension point order
    pub awaiters: Vec<Token>,
    /// The task-returning proxy of a value-returning method
    pub proxy: Option<Token>,
}

/// Rewrites one method into a state machine
pub struct MethodTransformer;

impl MethodTransformer {
    /// Transforms `method`, whose lifted form is `cfg`.
    ///
    /// # Errors
    /// Returns [`Error::Transform`] naming the method and wrapping the cause. The module is
    /// left exactly as it was before the call in that case.
    pub fn apply(
        module: &mut Module,
        method: Token,
        cfg: &AstCfg,
        parameters: &ObfuscatorParameters,
    ) -> Result<TransformSummary> {
        let checkpoint = module.checkpoint();
        match Self::transform(module, method, cfg, parameters) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                module.rollback(checkpoint);
                Err(Error::Transform {
                    method: module.method_full_name(method),
                    source: Box::new(err),
                })
            }
        }
    }

    fn transform(
        module: &mut Module,
        method: Token,
        cfg: &AstCfg,
        parameters: &ObfuscatorParameters,
    ) -> Result<TransformSummary> {
        let def = module.method(method)?;
        if def.body.is_none() {
            return Err(malformed_error!(
                "{} has no body",
                module.method_full_name(method)
            ));
        }
        let naming = Naming::new(parameters.use_anonymous_types, def);
        let verify = parameters.verify_stack;

        let frame = FrameLayout::create(module, &naming, method)?;
        let state_machine = StateMachineType::create(module, &naming, method)?;
        let factory = AwaiterFactory::new(module, &naming);

        let frame_type = frame.ty;
        let container = factory.container;
        let sm = state_machine.clone();

        let awaiters = MoveNextBuilder::new(
            module,
            method,
            naming.clone(),
            frame,
            state_machine,
            factory,
            verify,
        )?
        .build(module, cfg)?;

        let (body, proxy) = match sm.kind {
            ReturnKind::Void => (startup_body(&sm)?, None),
            ReturnKind::Value(_) => {
                let proxy = create_proxy(module, &naming, method)?;
                install_body(module, proxy, startup_body(&sm)?, verify)?;
                (forwarder_body(module, method, proxy)?, Some(proxy))
            }
        };
        install_body(module, method, body, verify)?;

        debug!(
            "Transformed {} into {} with {} awaiters",
            module.method_full_name(method),
            naming.state_machine(),
            awaiters.len()
        );

        Ok(TransformSummary {
            method,
            state_machine: sm.ty,
            move_next: sm.move_next,
            state_field: sm.state,
            frame: frame_type,
            container,
            awaiters: awaiters.iter().map(|awaiter| awaiter.ty).collect(),
            proxy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{Lifter, StackLifter},
        assembly::InstructionAssembler,
        metadata::{
            method::MethodDef,
            module::TypeDef,
            signatures::{MethodSignature, TypeSignature},
        },
    };

    fn module_with(body: InstructionAssembler, returns: TypeSignature) -> Result<(Module, Token)> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let method = module.add_method(
            program,
            MethodDef::new(
                "Twice",
                MethodSignature::new_static(returns, vec![TypeSignature::I4]),
            )
            .with_body(body.into_body(vec![])?),
        )?;
        Ok((module, method))
    }

    #[test]
    fn value_method_gets_proxy_and_forwarder() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.ldc_i4(2)?.mul()?.ret()?;
        let (mut module, method) = module_with(asm, TypeSignature::I4)?;
        let cfg = StackLifter.lift(&module, method)?;

        let summary =
            MethodTransformer::apply(&mut module, method, &cfg, &ObfuscatorParameters::default())?;
        assert_eq!(summary.awaiters.len(), 1);
        let proxy = summary.proxy.ok_or_else(|| malformed_error!("no proxy"))?;
        assert!(module.method(proxy)?.body.is_some());
        assert!(module.method(summary.move_next)?.body.is_some());

        let body = module
            .method(method)?
            .body
            .clone()
            .ok_or_else(|| malformed_error!("no body"))?;
        assert_eq!(body.locals.len(), 1);
        Ok(())
    }

    #[test]
    fn failure_restores_the_module() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let (mut module, method) = module_with(asm, TypeSignature::Void)?;
        let original = module.method(method)?.body.clone();
        let types = module.type_count();
        let fields = module.field_count();
        let methods = module.method_count();

        let mut cfg = AstCfg::new();
        cfg.add_block(crate::analysis::AstBlock {
            offset: 0,
            statements: vec![crate::analysis::Statement::Switch {
                value: crate::analysis::Expression::Argument(0),
                targets: vec![0],
            }],
        })?;

        let err = MethodTransformer::apply(
            &mut module,
            method,
            &cfg,
            &ObfuscatorParameters::default(),
        );
        match err {
            Err(Error::Transform { method: name, source }) => {
                assert_eq!(name, "App.Program::Twice");
                assert!(matches!(*source, Error::UnsupportedConstruct(_)));
            }
            other => panic!("expected a transform error, got {other:?}"),
        }
        assert_eq!(module.type_count(), types);
        assert_eq!(module.field_count(), fields);
        assert_eq!(module.method_count(), methods);
        assert_eq!(module.method(method)?.body, original);
        assert!(module.type_def(Token(0x0200_0001))?.nested_types.is_empty());
        Ok(())
    }
}
