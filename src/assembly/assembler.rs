//! Fluent construction of instruction streams.
//!
//! [`InstructionAssembler`] collects instructions with symbolic labels and resolves them to
//! instruction indices in [`InstructionAssembler::finish`]. It is used to build the input
//! methods of tests as well as every body the transformation synthesizes.
//!
//! # Examples
//!
//! ```rust
//! use awaitscope::assembly::InstructionAssembler;
//!
//! // if (arg0 < 0) return -arg0; return arg0;
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?
//!     .ldc_i4(0)?
//!     .bge("positive")?
//!     .ldarg(0)?
//!     .neg()?
//!     .ret()?
//!     .label("positive")?
//!     .ldarg(0)?
//!     .ret()?;
//!
//! let (instructions, handlers) = asm.finish()?;
//! assert_eq!(instructions.len(), 8);
//! assert!(handlers.is_empty());
//! # Ok::<(), awaitscope::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        ops::{BinaryOp, BranchKind, CompareOp, ConversionType, ElementKind, UnaryOp},
        Instruction, OpCode, Operand,
    },
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodRef},
        signatures::TypeSignature,
        token::Token,
    },
    Result,
};

#[derive(Debug, Clone)]
struct PendingHandler {
    try_start: String,
    handler_start: String,
    handler_end: String,
    catch_type: TypeSignature,
}

/// Builds an instruction stream with symbolic labels.
#[derive(Debug, Default)]
pub struct InstructionAssembler {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
    handlers: Vec<PendingHandler>,
}

impl InstructionAssembler {
    /// Creates an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions emitted so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if nothing has been emitted yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Appends an instruction
    ///
    /// # Errors
    /// Never fails; returns `Result` to chain with the other emitters
    pub fn emit(&mut self, opcode: OpCode, operand: Operand) -> Result<&mut Self> {
        self.instructions.push(Instruction::new(opcode, operand));
        Ok(self)
    }

    /// Appends an instruction without operand
    ///
    /// # Errors
    /// Never fails; returns `Result` to chain with the other emitters
    pub fn simple(&mut self, opcode: OpCode) -> Result<&mut Self> {
        self.emit(opcode, Operand::None)
    }

    /// Replaces the operand of the instruction at `index`, for tables only known later
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if nothing was emitted at `index`
    pub fn set_operand(&mut self, index: usize, operand: Operand) -> Result<()> {
        match self.instructions.get_mut(index) {
            Some(instruction) => {
                instruction.operand = operand;
                Ok(())
            }
            None => Err(malformed_error!("No instruction at IL_{:04x}", index)),
        }
    }

    /// Binds `name` to the position of the next emitted instruction
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the label is already defined
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        Ok(self)
    }

    /// Returns `true` if `name` has been bound
    #[must_use]
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    /// Registers a catch clause.
    ///
    /// The protected region spans `try_start` up to `handler_start`, the handler spans
    /// `handler_start` up to `handler_end`.
    ///
    /// # Errors
    /// Never fails; labels are checked by [`InstructionAssembler::finish`]
    pub fn catch_region(
        &mut self,
        try_start: &str,
        handler_start: &str,
        handler_end: &str,
        catch_type: TypeSignature,
    ) -> Result<&mut Self> {
        self.handlers.push(PendingHandler {
            try_start: try_start.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
            catch_type,
        });
        Ok(self)
    }

    /// Resolves all labels
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an instruction or handler references an undefined
    /// label
    pub fn finish(self) -> Result<(Vec<Instruction>, Vec<ExceptionHandler>)> {
        let resolve = |name: &str| -> Result<usize> {
            self.labels
                .get(name)
                .copied()
                .ok_or_else(|| malformed_error!("Undefined label '{}'", name))
        };

        let mut instructions = Vec::with_capacity(self.instructions.len());
        for instruction in &self.instructions {
            let operand = match &instruction.operand {
                Operand::Label(name) => Operand::Target(resolve(name)?),
                Operand::Labels(names) => Operand::Targets(
                    names
                        .iter()
                        .map(|name| resolve(name))
                        .collect::<Result<Vec<_>>>()?,
                ),
                other => other.clone(),
            };
            instructions.push(Instruction::new(instruction.opcode, operand));
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let handler_start = resolve(&handler.handler_start)?;
            handlers.push(ExceptionHandler {
                flags: ExceptionHandlerFlags::EXCEPTION,
                try_start: resolve(&handler.try_start)?,
                try_end: handler_start,
                handler_start,
                handler_end: resolve(&handler.handler_end)?,
                catch_type: Some(handler.catch_type.clone()),
            });
        }

        Ok((instructions, handlers))
    }

    /// Resolves all labels and wraps the result into a method body.
    ///
    /// `max_stack` is left at 8; synthesized bodies get their exact value from
    /// [`crate::assembly::analyze_stack`].
    ///
    /// # Errors
    /// See [`InstructionAssembler::finish`]
    pub fn into_body(self, locals: Vec<TypeSignature>) -> Result<MethodBody> {
        let (instructions, exception_handlers) = self.finish()?;
        Ok(MethodBody {
            max_stack: 8,
            init_locals: true,
            locals,
            instructions,
            exception_handlers,
        })
    }

    /// `nop`
    ///
    /// # Errors
    /// Never fails
    pub fn nop(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Nop)
    }

    /// `dup`
    ///
    /// # Errors
    /// Never fails
    pub fn dup(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Dup)
    }

    /// `pop`
    ///
    /// # Errors
    /// Never fails
    pub fn pop(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Pop)
    }

    /// `ldarg index`
    ///
    /// # Errors
    /// Never fails
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Ldarg, Operand::Argument(index))
    }

    /// `ldarga index`
    ///
    /// # Errors
    /// Never fails
    pub fn ldarga(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Ldarga, Operand::Argument(index))
    }

    /// `starg index`
    ///
    /// # Errors
    /// Never fails
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Starg, Operand::Argument(index))
    }

    /// `ldloc index`
    ///
    /// # Errors
    /// Never fails
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Ldloc, Operand::Local(index))
    }

    /// `ldloca index`
    ///
    /// # Errors
    /// Never fails
    pub fn ldloca(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Ldloca, Operand::Local(index))
    }

    /// `stloc index`
    ///
    /// # Errors
    /// Never fails
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::Stloc, Operand::Local(index))
    }

    /// `ldnull`
    ///
    /// # Errors
    /// Never fails
    pub fn ldnull(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Ldnull)
    }

    /// `ldc.i4 value`
    ///
    /// # Errors
    /// Never fails
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(OpCode::LdcI4, Operand::Int32(value))
    }

    /// `ldc.i8 value`
    ///
    /// # Errors
    /// Never fails
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit(OpCode::LdcI8, Operand::Int64(value))
    }

    /// `ldc.r4 value`
    ///
    /// # Errors
    /// Never fails
    pub fn ldc_r4(&mut self, value: f32) -> Result<&mut Self> {
        self.emit(OpCode::LdcR4, Operand::Float32(value))
    }

    /// `ldc.r8 value`
    ///
    /// # Errors
    /// Never fails
    pub fn ldc_r8(&mut self, value: f64) -> Result<&mut Self> {
        self.emit(OpCode::LdcR8, Operand::Float64(value))
    }

    /// `ldstr value`
    ///
    /// # Errors
    /// Never fails
    pub fn ldstr(&mut self, value: &str) -> Result<&mut Self> {
        self.emit(OpCode::Ldstr, Operand::String(value.to_string()))
    }

    /// `br label`
    ///
    /// # Errors
    /// Never fails
    pub fn br(&mut self, label: &str) -> Result<&mut Self> {
        self.emit(OpCode::Br, Operand::Label(label.to_string()))
    }

    /// `leave label`
    ///
    /// # Errors
    /// Never fails
    pub fn leave(&mut self, label: &str) -> Result<&mut Self> {
        self.emit(OpCode::Leave, Operand::Label(label.to_string()))
    }

    /// Any conditional branch
    ///
    /// # Errors
    /// Never fails
    pub fn branch(&mut self, kind: BranchKind, label: &str) -> Result<&mut Self> {
        self.emit(kind.opcode(), Operand::Label(label.to_string()))
    }

    /// `brtrue label`
    ///
    /// # Errors
    /// Never fails
    pub fn brtrue(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::True, label)
    }

    /// `brfalse label`
    ///
    /// # Errors
    /// Never fails
    pub fn brfalse(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::False, label)
    }

    /// `beq label`
    ///
    /// # Errors
    /// Never fails
    pub fn beq(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::Eq, label)
    }

    /// `bge label`
    ///
    /// # Errors
    /// Never fails
    pub fn bge(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::Ge, label)
    }

    /// `bgt label`
    ///
    /// # Errors
    /// Never fails
    pub fn bgt(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::Gt, label)
    }

    /// `ble label`
    ///
    /// # Errors
    /// Never fails
    pub fn ble(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::Le, label)
    }

    /// `blt label`
    ///
    /// # Errors
    /// Never fails
    pub fn blt(&mut self, label: &str) -> Result<&mut Self> {
        self.branch(BranchKind::Lt, label)
    }

    /// `switch (labels...)`
    ///
    /// # Errors
    /// Never fails
    pub fn switch(&mut self, labels: &[&str]) -> Result<&mut Self> {
        self.emit(
            OpCode::Switch,
            Operand::Labels(labels.iter().map(ToString::to_string).collect()),
        )
    }

    /// `ret`
    ///
    /// # Errors
    /// Never fails
    pub fn ret(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Ret)
    }

    /// `throw`
    ///
    /// # Errors
    /// Never fails
    pub fn throw(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Throw)
    }

    /// Any binary operator
    ///
    /// # Errors
    /// Never fails
    pub fn binary(&mut self, op: BinaryOp) -> Result<&mut Self> {
        self.simple(op.opcode())
    }

    /// `add`
    ///
    /// # Errors
    /// Never fails
    pub fn add(&mut self) -> Result<&mut Self> {
        self.binary(BinaryOp::Add)
    }

    /// `sub`
    ///
    /// # Errors
    /// Never fails
    pub fn sub(&mut self) -> Result<&mut Self> {
        self.binary(BinaryOp::Sub)
    }

    /// `mul`
    ///
    /// # Errors
    /// Never fails
    pub fn mul(&mut self) -> Result<&mut Self> {
        self.binary(BinaryOp::Mul)
    }

    /// `div`
    ///
    /// # Errors
    /// Never fails
    pub fn div(&mut self) -> Result<&mut Self> {
        self.binary(BinaryOp::Div)
    }

    /// `rem`
    ///
    /// # Errors
    /// Never fails
    pub fn rem(&mut self) -> Result<&mut Self> {
        self.binary(BinaryOp::Rem)
    }

    /// Any unary operator
    ///
    /// # Errors
    /// Never fails
    pub fn unary(&mut self, op: UnaryOp) -> Result<&mut Self> {
        self.simple(op.opcode())
    }

    /// `neg`
    ///
    /// # Errors
    /// Never fails
    pub fn neg(&mut self) -> Result<&mut Self> {
        self.unary(UnaryOp::Neg)
    }

    /// Any comparison
    ///
    /// # Errors
    /// Never fails
    pub fn compare(&mut self, op: CompareOp) -> Result<&mut Self> {
        self.simple(op.opcode())
    }

    /// `ceq`
    ///
    /// # Errors
    /// Never fails
    pub fn ceq(&mut self) -> Result<&mut Self> {
        self.compare(CompareOp::Ceq)
    }

    /// `clt`
    ///
    /// # Errors
    /// Never fails
    pub fn clt(&mut self) -> Result<&mut Self> {
        self.compare(CompareOp::Clt)
    }

    /// `cgt`
    ///
    /// # Errors
    /// Never fails
    pub fn cgt(&mut self) -> Result<&mut Self> {
        self.compare(CompareOp::Cgt)
    }

    /// Any numeric conversion
    ///
    /// # Errors
    /// Never fails
    pub fn conv(&mut self, conversion: ConversionType) -> Result<&mut Self> {
        self.simple(conversion.opcode())
    }

    /// `ldfld field`
    ///
    /// # Errors
    /// Never fails
    pub fn ldfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Ldfld, Operand::Field(field))
    }

    /// `ldflda field`
    ///
    /// # Errors
    /// Never fails
    pub fn ldflda(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Ldflda, Operand::Field(field))
    }

    /// `stfld field`
    ///
    /// # Errors
    /// Never fails
    pub fn stfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Stfld, Operand::Field(field))
    }

    /// `ldsfld field`
    ///
    /// # Errors
    /// Never fails
    pub fn ldsfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Ldsfld, Operand::Field(field))
    }

    /// `ldsflda field`
    ///
    /// # Errors
    /// Never fails
    pub fn ldsflda(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Ldsflda, Operand::Field(field))
    }

    /// `stsfld field`
    ///
    /// # Errors
    /// Never fails
    pub fn stsfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::Stsfld, Operand::Field(field))
    }

    /// `ldobj type`
    ///
    /// # Errors
    /// Never fails
    pub fn ldobj(&mut self, ty: TypeSignature) -> Result<&mut Self> {
        self.emit(OpCode::Ldobj, Operand::Type(ty))
    }

    /// `initobj type`
    ///
    /// # Errors
    /// Never fails
    pub fn initobj(&mut self, ty: TypeSignature) -> Result<&mut Self> {
        self.emit(OpCode::Initobj, Operand::Type(ty))
    }

    /// `newobj constructor`
    ///
    /// # Errors
    /// Never fails
    pub fn newobj(&mut self, constructor: MethodRef) -> Result<&mut Self> {
        self.emit(OpCode::Newobj, Operand::Method(constructor))
    }

    /// `newarr element`
    ///
    /// # Errors
    /// Never fails
    pub fn newarr(&mut self, element: TypeSignature) -> Result<&mut Self> {
        self.emit(OpCode::Newarr, Operand::Type(element))
    }

    /// `ldlen`
    ///
    /// # Errors
    /// Never fails
    pub fn ldlen(&mut self) -> Result<&mut Self> {
        self.simple(OpCode::Ldlen)
    }

    /// `ldelem.<kind>`
    ///
    /// # Errors
    /// Never fails
    pub fn ldelem(&mut self, kind: ElementKind) -> Result<&mut Self> {
        self.simple(kind.load_opcode())
    }

    /// `stelem.<kind>`
    ///
    /// # Errors
    /// Never fails
    pub fn stelem(&mut self, kind: ElementKind) -> Result<&mut Self> {
        self.simple(kind.store_opcode())
    }

    /// `box type`
    ///
    /// # Errors
    /// Never fails
    pub fn box_value(&mut self, ty: TypeSignature) -> Result<&mut Self> {
        self.emit(OpCode::Box, Operand::Type(ty))
    }

    /// `unbox.any type`
    ///
    /// # Errors
    /// Never fails
    pub fn unbox_any(&mut self, ty: TypeSignature) -> Result<&mut Self> {
        self.emit(OpCode::UnboxAny, Operand::Type(ty))
    }

    /// `call method`
    ///
    /// # Errors
    /// Never fails
    pub fn call(&mut self, method: MethodRef) -> Result<&mut Self> {
        self.emit(OpCode::Call, Operand::Method(method))
    }

    /// `callvirt method`
    ///
    /// # Errors
    /// Never fails
    pub fn callvirt(&mut self, method: MethodRef) -> Result<&mut Self> {
        self.emit(OpCode::Callvirt, Operand::Method(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_resolution() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?
            .brtrue("end")?
            .ldc_i4(1)?
            .pop()?
            .label("end")?
            .ret()?;

        let (instructions, _) = asm.finish()?;
        assert_eq!(instructions[1].operand, Operand::Target(4));
        assert_eq!(instructions[4].opcode, OpCode::Ret);
        Ok(())
    }

    #[test]
    fn test_backward_branch_and_switch() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("top")?
            .ldarg(0)?
            .switch(&["top", "out"])?
            .br("top")?
            .label("out")?
            .ret()?;

        let (instructions, _) = asm.finish()?;
        assert_eq!(instructions[1].operand, Operand::Targets(vec![0, 3]));
        assert_eq!(instructions[2].targets(), vec![0]);
        Ok(())
    }

    #[test]
    fn test_duplicate_label() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("a")?.nop()?;
        assert!(asm.label("a").is_err());
        Ok(())
    }

    #[test]
    fn test_undefined_label() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.br("nowhere")?;
        assert!(asm.finish().is_err());
        Ok(())
    }

    #[test]
    fn test_catch_region() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("try")?
            .nop()?
            .leave("end")?
            .label("handler")?
            .pop()?
            .leave("end")?
            .label("end")?
            .ret()?
            .catch_region(
                "try",
                "handler",
                "end",
                TypeSignature::Runtime(crate::metadata::runtime::RuntimeType::Exception),
            )?;

        let body = asm.into_body(vec![])?;
        let handler = &body.exception_handlers[0];
        assert_eq!(handler.try_start, 0);
        assert_eq!(handler.try_end, 2);
        assert_eq!(handler.handler_start, 2);
        assert_eq!(handler.handler_end, 4);
        Ok(())
    }

    #[test]
    fn test_patched_switch_table() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.switch(&[])?;
        let switch = asm.len() - 1;
        asm.label("a")?.ret()?;
        asm.set_operand(switch, Operand::Labels(vec!["a".to_string()]))?;
        assert!(asm.set_operand(10, Operand::None).is_err());

        let (instructions, _) = asm.finish()?;
        assert_eq!(instructions[1].operand, Operand::Targets(vec![2]));
        Ok(())
    }
}
