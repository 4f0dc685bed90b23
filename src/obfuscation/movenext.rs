//! Synthesis of `MoveNext` and of the awaiter `GetResult` bodies.
//!
//! Every statement of the lifted method becomes one suspension point. Its code moves into the
//! `GetResult` method of a fresh awaiter, rewritten to access frame fields instead of locals
//! and arguments, and `MoveNext` awaits that awaiter the way compiled `async` code awaits a
//! task:
//!
//! ```text
//! call     GetAwaiter_k          // input: frame or previous awaiter
//! stloc    aw_k
//! ldloca   aw_k
//! call     get_IsCompleted
//! brtrue   next_k
//! ...                            // save state k, park awaiter, AwaitOnCompleted
//! leave    return
//! resume_k:
//! ...                            // restore awaiter, state = -1
//! next_k:
//! ldloca   aw_k
//! call     GetResult
//! ```
//!
//! Within one block the awaiters form a chain: `GetResult` of a plain statement returns the
//! awaiter itself, which is then the input of the next `GetAwaiter`. The value travelling
//! along this chain is the carrier; a block starts with the frame as carrier and control
//! leaves a block only with an empty evaluation stack.

use log::debug;

use crate::{
    analysis::{AstBlock, AstCfg, Constant, Expression, Statement, StoreTarget, TypeInference},
    assembly::{
        ops::{BranchKind, CompareOp, ConversionType},
        InstructionAssembler, Operand,
    },
    metadata::{
        method::MethodRef,
        module::{FieldAttributes, FieldDef, Module},
        runtime::{RuntimeMethod, RuntimeType},
        signatures::TypeSignature,
        token::Token,
    },
    obfuscation::{
        awaiter::{AwaiterFactory, AwaiterType, Carrier},
        frame::FrameLayout,
        install_body,
        naming::{Naming, FRAME_FIELD},
        statemachine::StateMachineType,
    },
    Result,
};

const STATE_LOCAL: u16 = 0;
const CONDITION_LOCAL: u16 = 1;
const RESULT_LOCAL: u16 = 2;

const TRY_LABEL: &str = "try";
const NORMAL_RETURN_LABEL: &str = "normal_return";
const HANDLER_LABEL: &str = "handler";
const HANDLER_END_LABEL: &str = "handler_end";
const RETURN_LABEL: &str = "return";

fn block_label(offset: usize) -> String {
    format!("block_{offset}")
}

/// The awaiter whose `GetResult` body is being written
struct Scope {
    awaiter: Token,
    frame_field: Token,
    nest: bool,
}

impl Scope {
    /// Pushes the frame referenced by the awaiter
    fn load_frame(&self, asm: &mut InstructionAssembler) -> Result<()> {
        asm.ldarg(0)?.ldfld(self.frame_field)?;
        Ok(())
    }
}

/// Builds the `MoveNext` body of a state machine from a lifted method
pub struct MoveNextBuilder {
    declaring_type: Token,
    method_name: String,
    naming: Naming,
    frame: FrameLayout,
    state_machine: StateMachineType,
    factory: AwaiterFactory,
    inference: TypeInference,
    frame_field: Token,
    asm: InstructionAssembler,
    locals: Vec<TypeSignature>,
    awaiters: Vec<AwaiterType>,
    resume_labels: Vec<String>,
    switch: usize,
    verify: bool,
}

impl MoveNextBuilder {
    /// Prepares the builder and emits the prologue of `MoveNext`: dispatch on the saved state
    /// and, on first entry, creation of the frame from the argument copies.
    ///
    /// # Errors
    /// Returns an error if `method` can not be resolved or a member can not be added
    pub fn new(
        module: &mut Module,
        method: Token,
        naming: Naming,
        frame: FrameLayout,
        state_machine: StateMachineType,
        factory: AwaiterFactory,
        verify: bool,
    ) -> Result<Self> {
        let declaring_type = module.method(method)?.declaring_type;
        let method_name = module.method_full_name(method);
        let inference = TypeInference::new(module, method)?;

        let frame_field = module.add_field(
            state_machine.ty,
            FieldDef::new(FRAME_FIELD, FieldAttributes::PUBLIC, frame.signature()),
        )?;

        let mut locals = vec![TypeSignature::I4, TypeSignature::Boolean];
        if let Some(ty) = state_machine.kind.value_type() {
            locals.push(ty.clone());
        }

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .ldfld(state_machine.state)?
            .stloc(STATE_LOCAL)?
            .label(TRY_LABEL)?
            .ldloc(STATE_LOCAL)?
            .switch(&[])?;
        let switch = asm.len() - 1;

        asm.ldarg(0)?.newobj(MethodRef::Def(frame.constructor))?;
        for (&source, &target) in state_machine
            .arguments
            .iter()
            .zip(frame.argument_fields())
        {
            asm.dup()?.ldarg(0)?.ldfld(source)?.stfld(target)?;
        }
        asm.stfld(frame_field)?;

        Ok(MoveNextBuilder {
            declaring_type,
            method_name,
            naming,
            frame,
            state_machine,
            factory,
            inference,
            frame_field,
            asm,
            locals,
            awaiters: Vec::new(),
            resume_labels: Vec::new(),
            switch,
            verify,
        })
    }

    /// Translates all blocks of `cfg` and installs `MoveNext`.
    ///
    /// Returns the awaiters in suspension point order.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] for statements without a translation
    /// and [`crate::Error::Malformed`] for inconsistent input or an unbalanced body
    pub fn build(mut self, module: &mut Module, cfg: &AstCfg) -> Result<Vec<AwaiterType>> {
        cfg.validate()?;
        for block in cfg.blocks() {
            self.translate_block(module, block)?;
        }
        debug!(
            "{}: {} blocks, {} suspension points",
            self.method_name,
            cfg.blocks().len(),
            self.awaiters.len()
        );
        self.finish(module)
    }

    fn translate_block(&mut self, module: &mut Module, block: &AstBlock) -> Result<()> {
        self.asm
            .label(&block_label(block.offset))?
            .ldarg(0)?
            .ldfld(self.frame_field)?;

        let mut carrier = Some(Carrier::Frame);
        for statement in &block.statements {
            carrier = self.translate(module, statement, carrier)?;
        }
        if carrier.is_some() {
            self.asm.pop()?;
        }
        Ok(())
    }

    fn translate(
        &mut self,
        module: &mut Module,
        statement: &Statement,
        carrier: Option<Carrier>,
    ) -> Result<Option<Carrier>> {
        let Some(carrier) = carrier else {
            return Err(malformed_error!(
                "Statement after the end of a block in {}: {:?}",
                self.method_name,
                statement
            ));
        };

        match statement {
            Statement::Nop => {
                self.asm.nop()?;
                Ok(Some(carrier))
            }
            Statement::Branch { target } => {
                self.asm.pop()?.br(&block_label(*target))?;
                Ok(None)
            }
            Statement::Switch { .. } => Err(unsupported_error!(
                "switch statement in {}",
                self.method_name
            )),
            Statement::Return { value: None } => {
                if self.state_machine.kind.value_type().is_some() {
                    return Err(malformed_error!(
                        "Return without value in {}",
                        self.method_name
                    ));
                }
                self.asm.pop()?.br(NORMAL_RETURN_LABEL)?;
                Ok(None)
            }
            Statement::Return { value: Some(_) } => {
                let Some(ty) = self.state_machine.kind.value_type().cloned() else {
                    return Err(malformed_error!(
                        "Return with value in void method {}",
                        self.method_name
                    ));
                };
                let awaiter = self.awaiter_for(module, carrier, Some(ty), statement)?;
                self.suspend(module, &awaiter, false)?;
                self.asm.stloc(RESULT_LOCAL)?.br(NORMAL_RETURN_LABEL)?;
                Ok(None)
            }
            Statement::ConditionalBranch { target, .. } => {
                let awaiter =
                    self.awaiter_for(module, carrier, Some(TypeSignature::Boolean), statement)?;
                self.suspend(module, &awaiter, true)?;
                let condition = self.state_machine.condition;
                self.asm
                    .stfld(condition)?
                    .ldarg(0)?
                    .ldfld(condition)?
                    .stloc(CONDITION_LOCAL)?
                    .ldloc(CONDITION_LOCAL)?
                    .brtrue(&block_label(*target))?;
                Ok(None)
            }
            _ => {
                let awaiter = self.awaiter_for(module, carrier, None, statement)?;
                self.suspend(module, &awaiter, false)?;
                Ok(Some(awaiter.carrier()))
            }
        }
    }

    /// Emits the await of `awaiter`, leaving the result of `GetResult` on the stack.
    ///
    /// With `load_this` the state machine reference is pushed below the result.
    fn suspend(&mut self, module: &mut Module, awaiter: &AwaiterType, load_this: bool) -> Result<()> {
        let k = awaiter.id;
        let state = i32::try_from(k)
            .map_err(|_| malformed_error!("Too many suspension points in {}", self.method_name))?;
        let local = u16::try_from(self.locals.len())
            .map_err(|_| malformed_error!("Too many locals in {}", self.method_name))?;
        self.locals.push(awaiter.signature());

        let slot = module.add_field(
            self.state_machine.ty,
            FieldDef::new(
                &Naming::awaiter_slot(k),
                FieldAttributes::PRIVATE,
                awaiter.signature(),
            ),
        )?;

        let resume = format!("resume_{k}");
        let next = format!("next_{k}");
        let sm = &self.state_machine;

        self.asm
            .call(MethodRef::Def(awaiter.get_awaiter))?
            .stloc(local)?
            .ldloca(local)?
            .call(MethodRef::Def(awaiter.is_completed))?
            .brtrue(&next)?
            .ldarg(0)?
            .ldc_i4(state)?
            .dup()?
            .stloc(STATE_LOCAL)?
            .stfld(sm.state)?
            .ldarg(0)?
            .ldloc(local)?
            .stfld(slot)?
            .ldarg(0)?
            .ldflda(sm.builder)?
            .ldloca(local)?
            .ldarg(0)?
            .call(MethodRef::Runtime(RuntimeMethod::BuilderAwaitOnCompleted {
                kind: sm.kind.clone(),
                awaiter: awaiter.ty,
                state_machine: sm.ty,
            }))?
            .leave(RETURN_LABEL)?
            .label(&resume)?
            .ldarg(0)?
            .ldfld(slot)?
            .stloc(local)?
            .ldarg(0)?
            .ldflda(slot)?
            .initobj(awaiter.signature())?
            .ldarg(0)?
            .ldc_i4(-1)?
            .dup()?
            .stloc(STATE_LOCAL)?
            .stfld(sm.state)?
            .label(&next)?;
        if load_this {
            self.asm.ldarg(0)?;
        }
        self.asm
            .ldloca(local)?
            .call(MethodRef::Def(awaiter.get_result))?;

        self.resume_labels.push(resume);
        Ok(())
    }

    /// Creates the awaiter of the next suspension point and moves `statement` into it
    fn awaiter_for(
        &mut self,
        module: &mut Module,
        input: Carrier,
        output: Option<TypeSignature>,
        statement: &Statement,
    ) -> Result<AwaiterType> {
        let id = self.awaiters.len();
        let awaiter =
            self.factory
                .create(module, &self.naming, &self.frame, id, input, output)?;

        let mut scope = Scope {
            awaiter: awaiter.ty,
            frame_field: awaiter.frame_field,
            nest: false,
        };
        check_type(module, &mut scope, &awaiter.output)?;
        let mut asm = InstructionAssembler::new();
        match statement {
            Statement::ConditionalBranch { kind, operands, .. } => {
                if operands.len() != kind.operand_count() {
                    return Err(malformed_error!(
                        "{:?} with {} operands in {}",
                        kind,
                        operands.len(),
                        self.method_name
                    ));
                }
                for operand in operands {
                    self.emit_expression(module, &mut asm, &mut scope, operand)?;
                }
                self.emit_condition(module, &mut asm, *kind, operands)?;
                asm.ret()?;
            }
            Statement::Return { value: Some(value) } => {
                self.emit_expression(module, &mut asm, &mut scope, value)?;
                asm.ret()?;
            }
            Statement::Throw { exception } => {
                self.emit_expression(module, &mut asm, &mut scope, exception)?;
                asm.throw()?;
            }
            other => {
                self.emit_statement(module, &mut asm, &mut scope, other)?;
                asm.ldarg(0)?.ldobj(awaiter.signature())?.ret()?;
            }
        }

        if scope.nest {
            awaiter.nest_into(module, self.declaring_type)?;
            if !module.type_accessible_from(awaiter.ty, self.factory.container)? {
                return Err(unsupported_error!(
                    "awaiter {} of {} needs a declaring type hidden from {}",
                    id,
                    self.method_name,
                    module.full_name(self.factory.container)?
                ));
            }
            debug!(
                "{}: awaiter {} nested for restricted member access",
                self.method_name, id
            );
        }
        install_body(module, awaiter.get_result, asm.into_body(vec![])?, self.verify)?;

        self.awaiters.push(awaiter.clone());
        Ok(awaiter)
    }

    /// Replaces a conditional branch by the comparison computing its outcome.
    ///
    /// Negated comparisons of floating point operands use the opposite ordering flavour, so
    /// that unordered operands (NaN) take the same path as before.
    fn emit_condition(
        &self,
        module: &Module,
        asm: &mut InstructionAssembler,
        kind: BranchKind,
        operands: &[Expression],
    ) -> Result<()> {
        let operand_type = operands
            .first()
            .and_then(|operand| self.inference.infer(module, operand))
            .map(|ty| ty.stack_type());
        let float = matches!(operand_type, Some(TypeSignature::R4 | TypeSignature::R8));

        let negated = |asm: &mut InstructionAssembler, op: CompareOp| -> Result<()> {
            asm.compare(op)?.ldc_i4(0)?.ceq()?;
            Ok(())
        };

        match kind {
            BranchKind::True | BranchKind::False => {
                match operand_type {
                    Some(ty) if ty.is_reference() || ty.is_by_ref() => asm.ldnull()?,
                    Some(TypeSignature::I8) => asm.ldc_i8(0)?,
                    Some(TypeSignature::I) => asm.ldc_i4(0)?.conv(ConversionType::I)?,
                    Some(TypeSignature::R4 | TypeSignature::R8) => asm.ldc_r8(0.0)?,
                    _ => asm.ldc_i4(0)?,
                };
                asm.compare(if kind == BranchKind::True {
                    CompareOp::CgtUn
                } else {
                    CompareOp::Ceq
                })?;
            }
            BranchKind::Eq => {
                asm.ceq()?;
            }
            BranchKind::NeUn => negated(asm, CompareOp::Ceq)?,
            BranchKind::Lt => {
                asm.clt()?;
            }
            BranchKind::LtUn => {
                asm.compare(CompareOp::CltUn)?;
            }
            BranchKind::Gt => {
                asm.cgt()?;
            }
            BranchKind::GtUn => {
                asm.compare(CompareOp::CgtUn)?;
            }
            BranchKind::Le => negated(asm, if float { CompareOp::CgtUn } else { CompareOp::Cgt })?,
            BranchKind::LeUn => {
                negated(asm, if float { CompareOp::Cgt } else { CompareOp::CgtUn })?;
            }
            BranchKind::Ge => negated(asm, if float { CompareOp::CltUn } else { CompareOp::Clt })?,
            BranchKind::GeUn => {
                negated(asm, if float { CompareOp::Clt } else { CompareOp::CltUn })?;
            }
        }
        Ok(())
    }

    fn emit_statement(
        &mut self,
        module: &mut Module,
        asm: &mut InstructionAssembler,
        scope: &mut Scope,
        statement: &Statement,
    ) -> Result<()> {
        match statement {
            Statement::Nop => {
                asm.nop()?;
            }
            Statement::Assign { targets, value } => {
                let Some((&first, rest)) = targets.split_first() else {
                    return Err(malformed_error!(
                        "Assignment without target in {}",
                        self.method_name
                    ));
                };
                let ty = self.inference.infer(module, value);
                let field = self.frame.synthetic_field(module, first, ty.clone())?;
                if let Some(ty) = &ty {
                    for &target in targets {
                        self.inference.record(target, ty.clone());
                    }
                }

                scope.load_frame(asm)?;
                self.emit_expression(module, asm, scope, value)?;
                asm.stfld(field)?;

                for &target in rest {
                    let copy = self.frame.synthetic_field(module, target, ty.clone())?;
                    scope.load_frame(asm)?;
                    scope.load_frame(asm)?;
                    asm.ldfld(field)?.stfld(copy)?;
                }
            }
            Statement::Expression(expression) => {
                self.emit_expression(module, asm, scope, expression)?;
                let produces_value = match expression {
                    Expression::Call { method, .. } => module.method_signature(method)?.returns_value(),
                    _ => true,
                };
                if produces_value {
                    asm.pop()?;
                }
            }
            Statement::Store { target, value } => match target {
                StoreTarget::Local(index) => {
                    let field = self.frame.local_field(*index)?;
                    scope.load_frame(asm)?;
                    self.emit_expression(module, asm, scope, value)?;
                    asm.stfld(field)?;
                }
                StoreTarget::Argument(index) => {
                    let field = self.frame.argument_field(*index)?;
                    scope.load_frame(asm)?;
                    self.emit_expression(module, asm, scope, value)?;
                    asm.stfld(field)?;
                }
                StoreTarget::Field { field, instance } => {
                    check_field(module, scope, *field)?;
                    self.emit_expression(module, asm, scope, instance)?;
                    self.emit_expression(module, asm, scope, value)?;
                    asm.stfld(*field)?;
                }
                StoreTarget::StaticField(field) => {
                    check_field(module, scope, *field)?;
                    self.emit_expression(module, asm, scope, value)?;
                    asm.stsfld(*field)?;
                }
                StoreTarget::Element { kind, array, index } => {
                    self.emit_expression(module, asm, scope, array)?;
                    self.emit_expression(module, asm, scope, index)?;
                    self.emit_expression(module, asm, scope, value)?;
                    asm.stelem(*kind)?;
                }
            },
            Statement::InitObject { ty, address } => {
                check_type(module, scope, ty)?;
                self.emit_expression(module, asm, scope, address)?;
                asm.initobj(ty.clone())?;
            }
            other => {
                return Err(malformed_error!(
                    "{:?} can not be moved into an awaiter",
                    other
                ))
            }
        }
        Ok(())
    }

    fn emit_expression(
        &mut self,
        module: &mut Module,
        asm: &mut InstructionAssembler,
        scope: &mut Scope,
        expression: &Expression,
    ) -> Result<()> {
        match expression {
            Expression::Constant(constant) => {
                match constant {
                    Constant::I4(value) => asm.ldc_i4(*value)?,
                    Constant::I8(value) => asm.ldc_i8(*value)?,
                    Constant::R4(value) => asm.ldc_r4(*value)?,
                    Constant::R8(value) => asm.ldc_r8(*value)?,
                    Constant::String(value) => asm.ldstr(value)?,
                    Constant::Null => asm.ldnull()?,
                };
            }
            Expression::Argument(index) => {
                let field = self.frame.argument_field(*index)?;
                scope.load_frame(asm)?;
                asm.ldfld(field)?;
            }
            Expression::ArgumentAddress(index) => {
                let field = self.frame.argument_field(*index)?;
                scope.load_frame(asm)?;
                asm.ldflda(field)?;
            }
            Expression::Local(index) => {
                let field = self.frame.local_field(*index)?;
                scope.load_frame(asm)?;
                asm.ldfld(field)?;
            }
            Expression::LocalAddress(index) => {
                let field = self.frame.local_field(*index)?;
                scope.load_frame(asm)?;
                asm.ldflda(field)?;
            }
            Expression::Variable(var) => {
                // read before the assignment was translated (back edge): typed later
                let field = self.frame.synthetic_field(module, *var, None)?;
                scope.load_frame(asm)?;
                asm.ldfld(field)?;
            }
            Expression::Field { field, instance } => {
                check_field(module, scope, *field)?;
                match instance {
                    Some(instance) => {
                        self.emit_expression(module, asm, scope, instance)?;
                        asm.ldfld(*field)?;
                    }
                    None => {
                        asm.ldsfld(*field)?;
                    }
                }
            }
            Expression::FieldAddress { field, instance } => {
                check_field(module, scope, *field)?;
                match instance {
                    Some(instance) => {
                        self.emit_expression(module, asm, scope, instance)?;
                        asm.ldflda(*field)?;
                    }
                    None => {
                        asm.ldsflda(*field)?;
                    }
                }
            }
            Expression::Unary { op, operand } => {
                self.emit_expression(module, asm, scope, operand)?;
                asm.unary(*op)?;
            }
            Expression::Binary { op, left, right } => {
                self.emit_expression(module, asm, scope, left)?;
                self.emit_expression(module, asm, scope, right)?;
                asm.binary(*op)?;
            }
            Expression::Compare { op, left, right } => {
                self.emit_expression(module, asm, scope, left)?;
                self.emit_expression(module, asm, scope, right)?;
                asm.compare(*op)?;
            }
            Expression::Convert {
                conversion,
                operand,
            } => {
                self.emit_expression(module, asm, scope, operand)?;
                asm.conv(*conversion)?;
            }
            Expression::Call {
                method,
                virtual_call,
                arguments,
            } => {
                check_method(module, scope, method)?;
                for argument in arguments {
                    self.emit_expression(module, asm, scope, argument)?;
                }
                if *virtual_call {
                    asm.callvirt(method.clone())?;
                } else {
                    asm.call(method.clone())?;
                }
            }
            Expression::NewObject {
                constructor,
                arguments,
            } => {
                check_method(module, scope, constructor)?;
                for argument in arguments {
                    self.emit_expression(module, asm, scope, argument)?;
                }
                asm.newobj(constructor.clone())?;
            }
            Expression::NewArray { element, length } => {
                check_type(module, scope, element)?;
                self.emit_expression(module, asm, scope, length)?;
                asm.newarr(element.clone())?;
            }
            Expression::ArrayLength(array) => {
                self.emit_expression(module, asm, scope, array)?;
                asm.ldlen()?;
            }
            Expression::LoadElement { kind, array, index } => {
                self.emit_expression(module, asm, scope, array)?;
                self.emit_expression(module, asm, scope, index)?;
                asm.ldelem(*kind)?;
            }
            Expression::BoxValue { ty, value } => {
                check_type(module, scope, ty)?;
                self.emit_expression(module, asm, scope, value)?;
                asm.box_value(ty.clone())?;
            }
            Expression::UnboxAny { ty, value } => {
                check_type(module, scope, ty)?;
                self.emit_expression(module, asm, scope, value)?;
                asm.unbox_any(ty.clone())?;
            }
            Expression::LoadObject { ty, address } => {
                check_type(module, scope, ty)?;
                self.emit_expression(module, asm, scope, address)?;
                asm.ldobj(ty.clone())?;
            }
        }
        Ok(())
    }

    /// Closes the protected region, adds the handler and the completion code, patches the
    /// state dispatch and installs the body
    fn finish(mut self, module: &mut Module) -> Result<Vec<AwaiterType>> {
        let exception = u16::try_from(self.locals.len())
            .map_err(|_| malformed_error!("Too many locals in {}", self.method_name))?;
        self.locals.push(TypeSignature::Runtime(RuntimeType::Exception));

        let sm = &self.state_machine;
        self.asm
            .label(NORMAL_RETURN_LABEL)?
            .leave(HANDLER_END_LABEL)?
            .label(HANDLER_LABEL)?
            .stloc(exception)?
            .ldarg(0)?
            .ldc_i4(-2)?
            .stfld(sm.state)?
            .ldarg(0)?
            .ldflda(sm.builder)?
            .ldloc(exception)?
            .call(MethodRef::Runtime(RuntimeMethod::BuilderSetException(
                sm.kind.clone(),
            )))?
            .leave(RETURN_LABEL)?
            .label(HANDLER_END_LABEL)?
            .ldarg(0)?
            .ldc_i4(-2)?
            .stfld(sm.state)?
            .ldarg(0)?
            .ldflda(sm.builder)?;
        if sm.kind.value_type().is_some() {
            self.asm.ldloc(RESULT_LOCAL)?;
        }
        self.asm
            .call(MethodRef::Runtime(RuntimeMethod::BuilderSetResult(
                sm.kind.clone(),
            )))?
            .label(RETURN_LABEL)?
            .ret()?
            .catch_region(
                TRY_LABEL,
                HANDLER_LABEL,
                HANDLER_END_LABEL,
                TypeSignature::Runtime(RuntimeType::Exception),
            )?;
        self.asm
            .set_operand(self.switch, Operand::Labels(self.resume_labels.clone()))?;

        let move_next = self.state_machine.move_next;
        let body = self.asm.into_body(self.locals)?;
        install_body(module, move_next, body, self.verify)?;
        Ok(self.awaiters)
    }
}

fn check_field(module: &Module, scope: &mut Scope, field: Token) -> Result<()> {
    if !module.field_accessible_from(field, scope.awaiter)? {
        scope.nest = true;
    }
    Ok(())
}

fn check_method(module: &Module, scope: &mut Scope, method: &MethodRef) -> Result<()> {
    if let MethodRef::Def(token) = method {
        if !module.method_accessible_from(*token, scope.awaiter)? {
            scope.nest = true;
        }
    }
    Ok(())
}

fn check_type(module: &Module, scope: &mut Scope, ty: &TypeSignature) -> Result<()> {
    if !module.signature_accessible_from(ty, scope.awaiter)? {
        scope.nest = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{AstBlock, VariableId},
        assembly::{ops::BinaryOp, OpCode},
        metadata::{
            method::{MethodAccessFlags, MethodDef},
            module::{TypeAttributes, TypeDef},
            signatures::MethodSignature,
        },
        Error,
    };

    fn builder(module: &mut Module, method: Token) -> Result<MoveNextBuilder> {
        let naming = Naming::new(true, module.method(method)?);
        let frame = FrameLayout::create(module, &naming, method)?;
        let sm = StateMachineType::create(module, &naming, method)?;
        let factory = AwaiterFactory::new(module, &naming);
        MoveNextBuilder::new(module, method, naming, frame, sm, factory, true)
    }

    fn method(module: &mut Module, returns: TypeSignature) -> Result<(Token, Token)> {
        let program = module.add_type(TypeDef::new("App", "Program"));
        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let method = module.add_method(
            program,
            MethodDef::new(
                "Run",
                MethodSignature::new_static(returns, vec![TypeSignature::I4]),
            )
            .with_body(asm.into_body(vec![])?),
        )?;
        Ok((program, method))
    }

    fn cfg(blocks: Vec<(usize, Vec<Statement>)>) -> Result<AstCfg> {
        let mut cfg = AstCfg::new();
        for (offset, statements) in blocks {
            cfg.add_block(AstBlock { offset, statements })?;
        }
        Ok(cfg)
    }

    #[test]
    fn abs_value_state_machine() -> Result<()> {
        let mut module = Module::new("test.dll");
        let (program, method) = method(&mut module, TypeSignature::I4)?;
        let cfg = cfg(vec![
            (
                0,
                vec![Statement::ConditionalBranch {
                    kind: BranchKind::Ge,
                    operands: vec![
                        Expression::Argument(0),
                        Expression::Constant(Constant::I4(0)),
                    ],
                    target: 5,
                }],
            ),
            (
                3,
                vec![Statement::Return {
                    value: Some(Expression::Unary {
                        op: crate::assembly::ops::UnaryOp::Neg,
                        operand: Box::new(Expression::Argument(0)),
                    }),
                }],
            ),
            (
                5,
                vec![Statement::Return {
                    value: Some(Expression::Argument(0)),
                }],
            ),
        ])?;

        let awaiters = builder(&mut module, method)?.build(&mut module, &cfg)?;
        assert_eq!(awaiters.len(), 3);
        assert_eq!(awaiters[0].output, TypeSignature::Boolean);
        assert_eq!(awaiters[1].output, TypeSignature::I4);

        let sm = module
            .type_def(program)?
            .nested_types
            .first()
            .copied()
            .ok_or_else(|| malformed_error!("no state machine"))?;
        let move_next = module
            .find_method(sm, "MoveNext")
            .ok_or_else(|| malformed_error!("no MoveNext"))?;
        let body = module
            .method(move_next)?
            .body
            .clone()
            .ok_or_else(|| malformed_error!("no body"))?;

        // state, condition, result, three awaiters, exception
        assert_eq!(body.locals.len(), 7);
        assert_eq!(body.exception_handlers.len(), 1);
        let dispatch = body
            .instructions
            .iter()
            .find(|i| i.opcode == OpCode::Switch)
            .ok_or_else(|| malformed_error!("no switch"))?;
        assert_eq!(dispatch.targets().len(), 3);
        assert!(module.find_field(sm, "<>u__3").is_some());
        assert!(module.find_field(sm, "<x>5__1").is_some());
        Ok(())
    }

    #[test]
    fn statements_chain_within_a_block() -> Result<()> {
        let mut module = Module::new("test.dll");
        let (_, method) = method(&mut module, TypeSignature::Void)?;
        let cfg = cfg(vec![(
            0,
            vec![
                Statement::Assign {
                    targets: vec![VariableId(0), VariableId(1)],
                    value: Expression::Binary {
                        op: BinaryOp::Mul,
                        left: Box::new(Expression::Argument(0)),
                        right: Box::new(Expression::Constant(Constant::I8(3))),
                    },
                },
                Statement::Nop,
                Statement::Store {
                    target: StoreTarget::Argument(0),
                    value: Expression::Constant(Constant::I4(1)),
                },
                Statement::Return { value: None },
            ],
        )])?;

        let awaiters = builder(&mut module, method)?.build(&mut module, &cfg)?;
        assert_eq!(awaiters.len(), 2);
        assert_eq!(awaiters[0].input, Carrier::Frame);
        assert_eq!(awaiters[1].input, awaiters[0].carrier());
        assert!(awaiters[0].chains());

        let frame = module
            .find_type("<>AnonType_1_Frame")
            .ok_or_else(|| malformed_error!("no frame"))?;
        let s0 = module
            .find_field(frame, "<>s__0")
            .ok_or_else(|| malformed_error!("no field"))?;
        let s1 = module
            .find_field(frame, "<>s__1")
            .ok_or_else(|| malformed_error!("no field"))?;
        assert_eq!(module.field(s0)?.signature, TypeSignature::I8);
        assert_eq!(module.field(s1)?.signature, TypeSignature::I8);
        Ok(())
    }

    #[test]
    fn rejects_untranslatable_input() -> Result<()> {
        let mut module = Module::new("test.dll");
        let (_, method) = method(&mut module, TypeSignature::Void)?;

        let switch = cfg(vec![(
            0,
            vec![Statement::Switch {
                value: Expression::Argument(0),
                targets: vec![0],
            }],
        )])?;
        let err = builder(&mut module, method)?.build(&mut module, &switch);
        assert!(matches!(err, Err(Error::UnsupportedConstruct(_))));

        let mismatch = cfg(vec![(
            0,
            vec![Statement::Return {
                value: Some(Expression::Argument(0)),
            }],
        )])?;
        let err = builder(&mut module, method)?.build(&mut module, &mismatch);
        assert!(matches!(err, Err(Error::Malformed { .. })));

        let trailing = cfg(vec![(
            0,
            vec![Statement::Return { value: None }, Statement::Nop],
        )])?;
        let err = builder(&mut module, method)?.build(&mut module, &trailing);
        assert!(matches!(err, Err(Error::Malformed { .. })));
        Ok(())
    }

    #[test]
    fn restricted_operands_nest_the_awaiter() -> Result<()> {
        let mut module = Module::new("test.dll");
        let (program, method) = method(&mut module, TypeSignature::Void)?;
        let helper = module.add_nested_type(
            program,
            TypeDef::new("", "Helper").with_flags(TypeAttributes::NESTED_PRIVATE),
        )?;
        let ctor = module.add_method(helper, MethodDef::new_constructor(vec![]))?;
        let protected = module.add_method(
            program,
            MethodDef::new("Protected", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_access(MethodAccessFlags::FAMILY),
        )?;
        let open = module.add_method(
            program,
            MethodDef::new("Open", MethodSignature::new_static(TypeSignature::Void, vec![])),
        )?;
        let call = |method: Token| {
            Statement::Expression(Expression::Call {
                method: MethodRef::Def(method),
                virtual_call: false,
                arguments: vec![],
            })
        };
        let cfg = cfg(vec![(
            0,
            vec![
                Statement::Expression(Expression::NewObject {
                    constructor: MethodRef::Def(ctor),
                    arguments: vec![],
                }),
                call(protected),
                Statement::Expression(Expression::NewArray {
                    element: TypeSignature::Class(helper),
                    length: Box::new(Expression::Constant(Constant::I4(1))),
                }),
                call(open),
                Statement::Return { value: None },
            ],
        )])?;

        let awaiters = builder(&mut module, method)?.build(&mut module, &cfg)?;
        let enclosing = awaiters
            .iter()
            .map(|a| module.type_def(a.ty).map(|ty| ty.enclosing_type))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(enclosing, vec![Some(program), Some(program), Some(program), None]);
        Ok(())
    }

    #[test]
    fn hidden_declaring_types_are_rejected_when_nesting() -> Result<()> {
        let mut module = Module::new("test.dll");
        let outer = module.add_type(TypeDef::new("App", "Outer"));
        let hidden = module.add_nested_type(
            outer,
            TypeDef::new("", "Hidden").with_flags(TypeAttributes::NESTED_PRIVATE),
        )?;
        let mut asm = InstructionAssembler::new();
        asm.ret()?;
        let method = module.add_method(
            hidden,
            MethodDef::new("Run", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_body(asm.into_body(vec![])?),
        )?;
        let secret = module.add_method(
            hidden,
            MethodDef::new("Secret", MethodSignature::new_static(TypeSignature::Void, vec![]))
                .with_access(MethodAccessFlags::PRIVATE),
        )?;
        let cfg = cfg(vec![(
            0,
            vec![
                Statement::Expression(Expression::Call {
                    method: MethodRef::Def(secret),
                    virtual_call: false,
                    arguments: vec![],
                }),
                Statement::Return { value: None },
            ],
        )])?;

        let err = builder(&mut module, method)?.build(&mut module, &cfg);
        assert!(matches!(err, Err(Error::UnsupportedConstruct(_))));
        Ok(())
    }
}
