//! Lifting of stack-machine bodies into statement trees.
//!
//! [`StackLifter`] splits a body into basic blocks at branch targets and after every
//! instruction that transfers control, then simulates the evaluation stack of each block
//! symbolically: pushes build [`Expression`] trees, instructions with side effects emit
//! [`Statement`]s. Two rules keep the evaluation order of the original body intact:
//!
//! - call and `newobj` results are assigned to synthetic variables right where the call happens
//! - before any statement is emitted, every pending stack entry that is not a literal or a
//!   synthetic variable is spilled into a fresh synthetic variable
//!
//! Bodies whose evaluation stack is not empty at a block boundary, or that use `dup`, `leave` or
//! exception handlers, are rejected as unsupported.

use std::collections::BTreeSet;

use crate::{
    analysis::ast::{AstBlock, AstCfg, Constant, Expression, Statement, StoreTarget},
    assembly::{
        ops::{BinaryOp, BranchKind, CompareOp, ConversionType, ElementKind, UnaryOp},
        FlowType, Instruction, OpCode, Operand,
    },
    metadata::{method::MethodRef, module::Module, token::Token},
    Result,
};

/// Turns the body of a method into an [`AstCfg`].
///
/// Lifters only read the module; the batch driver runs them in parallel.
pub trait Lifter: Sync {
    /// Lifts the body of `method`
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConstruct`] for bodies the lifter can not express, or
    /// [`crate::Error::Malformed`] for broken bodies
    fn lift(&self, module: &Module, method: Token) -> Result<AstCfg>;
}

/// The default [`Lifter`], a symbolic evaluation-stack simulation
#[derive(Debug, Clone, Copy, Default)]
pub struct StackLifter;

impl Lifter for StackLifter {
    fn lift(&self, module: &Module, method: Token) -> Result<AstCfg> {
        let method = module.method(method)?;
        let Some(body) = method.body.as_ref() else {
            return Err(malformed_error!(
                "{} has no body",
                module.method_full_name(method.token)
            ));
        };

        if !body.exception_handlers.is_empty() {
            return Err(unsupported_error!(
                "{} has {} exception handler(s)",
                module.method_full_name(method.token),
                body.exception_handlers.len()
            ));
        }
        if body.instructions.is_empty() {
            return Err(malformed_error!(
                "{} has an empty body",
                module.method_full_name(method.token)
            ));
        }

        let returns_value = method.signature.returns_value();
        let leaders = find_leaders(&body.instructions)?;
        let starts: Vec<usize> = leaders.iter().copied().collect();

        let mut cfg = AstCfg::new();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(body.instructions.len());
            let mut block = BlockLifter {
                module,
                cfg: &mut cfg,
                returns_value,
                stack: Vec::new(),
                statements: Vec::new(),
            };

            for index in start..end {
                block.step(index, &body.instructions[index])?;
            }

            let last = &body.instructions[end - 1];
            if !last.opcode.ends_block() && end == body.instructions.len() {
                return Err(malformed_error!(
                    "Control flow runs past the end of the body after IL_{:04x}",
                    end - 1
                ));
            }
            if !block.stack.is_empty() {
                return Err(unsupported_error!(
                    "{} value(s) on the evaluation stack cross the block boundary at IL_{:04x}",
                    block.stack.len(),
                    end
                ));
            }

            let statements = block.statements;
            cfg.add_block(AstBlock {
                offset: start,
                statements,
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn find_leaders(instructions: &[Instruction]) -> Result<BTreeSet<usize>> {
    let mut leaders = BTreeSet::new();
    leaders.insert(0);

    for (index, instruction) in instructions.iter().enumerate() {
        match instruction.opcode.flow_type() {
            FlowType::ConditionalBranch
            | FlowType::UnconditionalBranch
            | FlowType::Switch
            | FlowType::Leave => {
                if matches!(
                    instruction.operand,
                    Operand::Label(_) | Operand::Labels(_)
                ) {
                    return Err(malformed_error!(
                        "Unresolved branch target at IL_{:04x}",
                        index
                    ));
                }
                for target in instruction.targets() {
                    if target >= instructions.len() {
                        return Err(malformed_error!(
                            "Branch at IL_{:04x} targets IL_{:04x}, past the end of the body",
                            index,
                            target
                        ));
                    }
                    leaders.insert(target);
                }
                if index + 1 < instructions.len() {
                    leaders.insert(index + 1);
                }
            }
            FlowType::Return | FlowType::Throw => {
                if index + 1 < instructions.len() {
                    leaders.insert(index + 1);
                }
            }
            FlowType::Sequential | FlowType::Call => {}
        }
    }

    Ok(leaders)
}

struct BlockLifter<'a> {
    module: &'a Module,
    cfg: &'a mut AstCfg,
    returns_value: bool,
    stack: Vec<Expression>,
    statements: Vec<Statement>,
}

impl BlockLifter<'_> {
    fn pop(&mut self, index: usize) -> Result<Expression> {
        self.stack.pop().ok_or_else(|| {
            malformed_error!("Evaluation stack underflow at IL_{:04x}", index)
        })
    }

    fn pop_boxed(&mut self, index: usize) -> Result<Box<Expression>> {
        Ok(Box::new(self.pop(index)?))
    }

    fn pop_many(&mut self, count: usize, index: usize) -> Result<Vec<Expression>> {
        if self.stack.len() < count {
            return Err(malformed_error!(
                "Evaluation stack underflow at IL_{:04x}: needs {}, has {}",
                index,
                count,
                self.stack.len()
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    /// Moves every pending stack entry with an observable evaluation time into a variable
    fn spill(&mut self) {
        for slot in 0..self.stack.len() {
            if self.stack[slot].is_stable() {
                continue;
            }
            let var = self.cfg.new_variable();
            let value = std::mem::replace(&mut self.stack[slot], Expression::Variable(var));
            self.statements.push(Statement::Assign {
                targets: vec![var],
                value,
            });
        }
    }

    fn emit(&mut self, statement: Statement) {
        self.spill();
        self.statements.push(statement);
    }

    fn push(&mut self, expr: Expression) {
        self.stack.push(expr);
    }

    fn branch_target(instruction: &Instruction, index: usize) -> Result<usize> {
        match instruction.operand {
            Operand::Target(target) => Ok(target),
            _ => Err(malformed_error!(
                "Branch at IL_{:04x} has no resolved target",
                index
            )),
        }
    }

    fn field_operand(instruction: &Instruction, index: usize) -> Result<Token> {
        match instruction.operand {
            Operand::Field(field) => Ok(field),
            _ => Err(malformed_error!(
                "{} at IL_{:04x} expects a field operand",
                instruction.opcode,
                index
            )),
        }
    }

    fn type_operand(
        instruction: &Instruction,
        index: usize,
    ) -> Result<crate::metadata::signatures::TypeSignature> {
        match &instruction.operand {
            Operand::Type(ty) => Ok(ty.clone()),
            _ => Err(malformed_error!(
                "{} at IL_{:04x} expects a type operand",
                instruction.opcode,
                index
            )),
        }
    }

    fn method_operand(instruction: &Instruction, index: usize) -> Result<MethodRef> {
        match &instruction.operand {
            Operand::Method(method) => Ok(method.clone()),
            _ => Err(malformed_error!(
                "{} at IL_{:04x} expects a method operand",
                instruction.opcode,
                index
            )),
        }
    }

    fn index_operand(instruction: &Instruction, index: usize) -> Result<u16> {
        match instruction.operand {
            Operand::Argument(i) | Operand::Local(i) => Ok(i),
            _ => Err(malformed_error!(
                "{} at IL_{:04x} expects an index operand",
                instruction.opcode,
                index
            )),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, index: usize, instruction: &Instruction) -> Result<()> {
        let opcode = instruction.opcode;

        if let Some(op) = BinaryOp::from_opcode(opcode) {
            let right = self.pop_boxed(index)?;
            let left = self.pop_boxed(index)?;
            self.push(Expression::Binary { op, left, right });
            return Ok(());
        }
        if let Some(op) = CompareOp::from_opcode(opcode) {
            let right = self.pop_boxed(index)?;
            let left = self.pop_boxed(index)?;
            self.push(Expression::Compare { op, left, right });
            return Ok(());
        }
        if let Some(op) = UnaryOp::from_opcode(opcode) {
            let operand = self.pop_boxed(index)?;
            self.push(Expression::Unary { op, operand });
            return Ok(());
        }
        if let Some(conversion) = ConversionType::from_opcode(opcode) {
            let operand = self.pop_boxed(index)?;
            self.push(Expression::Convert {
                conversion,
                operand,
            });
            return Ok(());
        }
        if let Some(kind) = BranchKind::from_opcode(opcode) {
            let target = Self::branch_target(instruction, index)?;
            let operands = self.pop_many(kind.operand_count(), index)?;
            self.emit(Statement::ConditionalBranch {
                kind,
                operands,
                target,
            });
            return Ok(());
        }
        if let Some(kind) = ElementKind::from_load(opcode) {
            let index_expr = self.pop_boxed(index)?;
            let array = self.pop_boxed(index)?;
            self.push(Expression::LoadElement {
                kind,
                array,
                index: index_expr,
            });
            return Ok(());
        }
        if let Some(kind) = ElementKind::from_store(opcode) {
            let value = self.pop(index)?;
            let index_expr = self.pop(index)?;
            let array = self.pop(index)?;
            self.emit(Statement::Store {
                target: StoreTarget::Element {
                    kind,
                    array,
                    index: index_expr,
                },
                value,
            });
            return Ok(());
        }

        match opcode {
            OpCode::Nop => self.statements.push(Statement::Nop),
            OpCode::Dup => {
                return Err(unsupported_error!("dup at IL_{:04x}", index));
            }
            OpCode::Pop => {
                let value = self.pop(index)?;
                if !value.is_stable() {
                    self.emit(Statement::Expression(value));
                }
            }
            OpCode::Ldarg => {
                let i = Self::index_operand(instruction, index)?;
                self.push(Expression::Argument(i));
            }
            OpCode::Ldarga => {
                let i = Self::index_operand(instruction, index)?;
                self.push(Expression::ArgumentAddress(i));
            }
            OpCode::Starg => {
                let i = Self::index_operand(instruction, index)?;
                let value = self.pop(index)?;
                self.emit(Statement::Store {
                    target: StoreTarget::Argument(i),
                    value,
                });
            }
            OpCode::Ldloc => {
                let i = Self::index_operand(instruction, index)?;
                self.push(Expression::Local(i));
            }
            OpCode::Ldloca => {
                let i = Self::index_operand(instruction, index)?;
                self.push(Expression::LocalAddress(i));
            }
            OpCode::Stloc => {
                let i = Self::index_operand(instruction, index)?;
                let value = self.pop(index)?;
                self.emit(Statement::Store {
                    target: StoreTarget::Local(i),
                    value,
                });
            }
            OpCode::Ldnull => self.push(Expression::Constant(Constant::Null)),
            OpCode::LdcI4 => match instruction.operand {
                Operand::Int32(v) => self.push(Expression::Constant(Constant::I4(v))),
                _ => return Err(malformed_error!("ldc.i4 at IL_{:04x} without int32", index)),
            },
            OpCode::LdcI8 => match instruction.operand {
                Operand::Int64(v) => self.push(Expression::Constant(Constant::I8(v))),
                _ => return Err(malformed_error!("ldc.i8 at IL_{:04x} without int64", index)),
            },
            OpCode::LdcR4 => match instruction.operand {
                Operand::Float32(v) => self.push(Expression::Constant(Constant::R4(v))),
                _ => {
                    return Err(malformed_error!(
                        "ldc.r4 at IL_{:04x} without float32",
                        index
                    ))
                }
            },
            OpCode::LdcR8 => match instruction.operand {
                Operand::Float64(v) => self.push(Expression::Constant(Constant::R8(v))),
                _ => {
                    return Err(malformed_error!(
                        "ldc.r8 at IL_{:04x} without float64",
                        index
                    ))
                }
            },
            OpCode::Ldstr => match &instruction.operand {
                Operand::String(s) => {
                    self.push(Expression::Constant(Constant::String(s.clone())));
                }
                _ => return Err(malformed_error!("ldstr at IL_{:04x} without string", index)),
            },
            OpCode::Br => {
                let target = Self::branch_target(instruction, index)?;
                self.emit(Statement::Branch { target });
            }
            OpCode::Switch => {
                let targets = match &instruction.operand {
                    Operand::Targets(targets) => targets.clone(),
                    _ => {
                        return Err(malformed_error!(
                            "switch at IL_{:04x} has no resolved targets",
                            index
                        ))
                    }
                };
                let value = self.pop(index)?;
                self.emit(Statement::Switch { value, targets });
            }
            OpCode::Leave => {
                return Err(unsupported_error!("leave at IL_{:04x}", index));
            }
            OpCode::Ret => {
                let value = if self.returns_value {
                    Some(self.pop(index)?)
                } else {
                    None
                };
                self.emit(Statement::Return { value });
            }
            OpCode::Throw => {
                let exception = self.pop(index)?;
                self.emit(Statement::Throw { exception });
            }
            OpCode::Ldfld | OpCode::Ldflda => {
                let field = Self::field_operand(instruction, index)?;
                let instance = Some(self.pop_boxed(index)?);
                self.push(if opcode == OpCode::Ldfld {
                    Expression::Field { field, instance }
                } else {
                    Expression::FieldAddress { field, instance }
                });
            }
            OpCode::Stfld => {
                let field = Self::field_operand(instruction, index)?;
                let value = self.pop(index)?;
                let instance = self.pop(index)?;
                self.emit(Statement::Store {
                    target: StoreTarget::Field { field, instance },
                    value,
                });
            }
            OpCode::Ldsfld => {
                let field = Self::field_operand(instruction, index)?;
                self.push(Expression::Field {
                    field,
                    instance: None,
                });
            }
            OpCode::Ldsflda => {
                let field = Self::field_operand(instruction, index)?;
                self.push(Expression::FieldAddress {
                    field,
                    instance: None,
                });
            }
            OpCode::Stsfld => {
                let field = Self::field_operand(instruction, index)?;
                let value = self.pop(index)?;
                self.emit(Statement::Store {
                    target: StoreTarget::StaticField(field),
                    value,
                });
            }
            OpCode::Ldobj => {
                let ty = Self::type_operand(instruction, index)?;
                let address = self.pop_boxed(index)?;
                self.push(Expression::LoadObject { ty, address });
            }
            OpCode::Initobj => {
                let ty = Self::type_operand(instruction, index)?;
                let address = self.pop(index)?;
                self.emit(Statement::InitObject { ty, address });
            }
            OpCode::Newobj => {
                let constructor = Self::method_operand(instruction, index)?;
                let signature = self.module.method_signature(&constructor)?;
                let arguments = self.pop_many(signature.params.len(), index)?;
                let var = self.cfg.new_variable();
                self.emit(Statement::Assign {
                    targets: vec![var],
                    value: Expression::NewObject {
                        constructor,
                        arguments,
                    },
                });
                self.push(Expression::Variable(var));
            }
            OpCode::Call | OpCode::Callvirt => {
                let method = Self::method_operand(instruction, index)?;
                let signature = self.module.method_signature(&method)?;
                let arguments = self.pop_many(signature.arg_count(), index)?;
                let call = Expression::Call {
                    method,
                    virtual_call: opcode == OpCode::Callvirt,
                    arguments,
                };
                if signature.returns_value() {
                    let var = self.cfg.new_variable();
                    self.emit(Statement::Assign {
                        targets: vec![var],
                        value: call,
                    });
                    self.push(Expression::Variable(var));
                } else {
                    self.emit(Statement::Expression(call));
                }
            }
            OpCode::Newarr => {
                let element = Self::type_operand(instruction, index)?;
                let length = self.pop_boxed(index)?;
                self.push(Expression::NewArray { element, length });
            }
            OpCode::Ldlen => {
                let array = self.pop_boxed(index)?;
                self.push(Expression::ArrayLength(array));
            }
            OpCode::Box => {
                let ty = Self::type_operand(instruction, index)?;
                let value = self.pop_boxed(index)?;
                self.push(Expression::BoxValue { ty, value });
            }
            OpCode::UnboxAny => {
                let ty = Self::type_operand(instruction, index)?;
                let value = self.pop_boxed(index)?;
                self.push(Expression::UnboxAny { ty, value });
            }
            other => {
                return Err(malformed_error!(
                    "Unexpected {} at IL_{:04x}",
                    other,
                    index
                ))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::{
            method::{ExternalMethod, MethodDef},
            module::TypeDef,
            signatures::{MethodSignature, TypeSignature},
        },
        Error,
    };

    fn lift(
        params: Vec<TypeSignature>,
        ret: TypeSignature,
        locals: Vec<TypeSignature>,
        build: impl FnOnce(&mut InstructionAssembler) -> Result<()>,
    ) -> Result<AstCfg> {
        let mut module = Module::new("test.dll");
        let ty = module.add_type(TypeDef::new("Test", "Program"));
        let mut asm = InstructionAssembler::new();
        build(&mut asm)?;
        let body = asm.into_body(locals)?;
        let method = module.add_method(
            ty,
            MethodDef::new("Run", MethodSignature::new_static(ret, params)).with_body(body),
        )?;
        StackLifter.lift(&module, method)
    }

    fn write_line() -> MethodRef {
        MethodRef::External(ExternalMethod::new(
            "System.Console",
            "WriteLine",
            MethodSignature::new_static(TypeSignature::Void, vec![TypeSignature::I4]),
        ))
    }

    fn read() -> MethodRef {
        MethodRef::External(ExternalMethod::new(
            "System.Console",
            "Read",
            MethodSignature::new_static(TypeSignature::I4, vec![]),
        ))
    }

    #[test]
    fn single_block_return() -> Result<()> {
        let cfg = lift(
            vec![TypeSignature::I4, TypeSignature::I4],
            TypeSignature::I4,
            vec![],
            |asm| {
                asm.ldarg(0)?.ldarg(1)?.add()?.ret()?;
                Ok(())
            },
        )?;

        assert_eq!(cfg.blocks().len(), 1);
        let entry = cfg.entry().expect("entry block");
        assert_eq!(entry.statements.len(), 1);
        assert_eq!(entry.statements[0].to_string(), "return add(arg0, arg1)");
        Ok(())
    }

    #[test]
    fn blocks_split_at_branches() -> Result<()> {
        let cfg = lift(vec![TypeSignature::I4], TypeSignature::I4, vec![], |asm| {
            asm.ldarg(0)?
                .ldc_i4(0)?
                .bge("positive")?
                .ldarg(0)?
                .neg()?
                .ret()?
                .label("positive")?
                .ldarg(0)?
                .ret()?;
            Ok(())
        })?;

        let offsets: Vec<usize> = cfg.blocks().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(
            cfg.blocks()[0].statements[0].to_string(),
            "if bge(arg0, 0) goto IL_0006"
        );
        assert_eq!(cfg.blocks()[1].statements[0].to_string(), "return neg(arg0)");
        Ok(())
    }

    #[test]
    fn call_results_become_variables() -> Result<()> {
        let cfg = lift(vec![], TypeSignature::Void, vec![], |asm| {
            asm.call(read())?.ldc_i4(1)?.add()?.call(write_line())?.ret()?;
            Ok(())
        })?;

        let statements: Vec<String> = cfg.blocks()[0]
            .statements
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            statements,
            vec![
                "s0 = System.Console::Read()",
                "System.Console::WriteLine(add(s0, 1))",
                "return",
            ]
        );
        assert_eq!(cfg.variable_count(), 1);
        Ok(())
    }

    #[test]
    fn addresses_of_locals_stay_on_the_stack() -> Result<()> {
        // Accumulate(ref loc0, Read())
        let accumulate = MethodRef::External(ExternalMethod::new(
            "App.Refs",
            "Accumulate",
            MethodSignature::new_static(
                TypeSignature::Void,
                vec![TypeSignature::I4.by_ref(), TypeSignature::I4],
            ),
        ));
        let cfg = lift(vec![], TypeSignature::I4, vec![TypeSignature::I4], |asm| {
            asm.ldc_i4(5)?
                .stloc(0)?
                .ldloca(0)?
                .call(read())?
                .call(accumulate)?
                .ldloc(0)?
                .ret()?;
            Ok(())
        })?;

        let statements: Vec<String> = cfg.blocks()[0]
            .statements
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            statements,
            vec![
                "loc0 = 5",
                "s0 = System.Console::Read()",
                "App.Refs::Accumulate(&loc0, s0)",
                "return loc0",
            ]
        );
        assert_eq!(cfg.variable_count(), 1);
        Ok(())
    }

    #[test]
    fn pending_loads_are_spilled_before_stores() -> Result<()> {
        // loc0 is loaded, then overwritten, then the old value is used
        let cfg = lift(vec![], TypeSignature::I4, vec![TypeSignature::I4], |asm| {
            asm.ldloc(0)?.ldc_i4(5)?.stloc(0)?.ret()?;
            Ok(())
        })?;

        let statements: Vec<String> = cfg.blocks()[0]
            .statements
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(statements, vec!["s0 = loc0", "loc0 = 5", "return s0"]);
        Ok(())
    }

    #[test]
    fn stack_across_blocks_is_unsupported() {
        let result = lift(vec![TypeSignature::I4], TypeSignature::I4, vec![], |asm| {
            asm.ldc_i4(1)?
                .ldarg(0)?
                .brtrue("one")?
                .ldc_i4(2)?
                .add()?
                .ret()?
                .label("one")?
                .ret()?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::UnsupportedConstruct(_))));
    }

    #[test]
    fn dup_is_unsupported() {
        let result = lift(vec![TypeSignature::I4], TypeSignature::I4, vec![], |asm| {
            asm.ldarg(0)?.dup()?.add()?.ret()?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::UnsupportedConstruct(_))));
    }

    #[test]
    fn switch_is_lifted() -> Result<()> {
        let cfg = lift(vec![TypeSignature::I4], TypeSignature::Void, vec![], |asm| {
            asm.ldarg(0)?
                .switch(&["a", "b"])?
                .label("a")?
                .ret()?
                .label("b")?
                .ret()?;
            Ok(())
        })?;
        assert!(matches!(
            cfg.blocks()[0].statements[0],
            Statement::Switch { .. }
        ));
        Ok(())
    }

    #[test]
    fn falling_off_the_end_is_malformed() {
        let result = lift(vec![], TypeSignature::Void, vec![], |asm| {
            asm.nop()?;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }
}
