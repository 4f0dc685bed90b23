//! Symbolic CIL instructions.
//!
//! Instructions are kept in their long, canonical form: `ldarg 0` instead of `ldarg.0`,
//! `br` instead of `br.s`. Operands referencing other instructions are labels while a body is
//! being assembled and instruction indices ([`Operand::Target`]) once it has been finished.

use std::fmt;

use strum::{Display, EnumIter};

use crate::metadata::{method::MethodRef, signatures::TypeSignature, token::Token};

/// The supported CIL opcodes, displayed with their mnemonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[allow(missing_docs)]
pub enum OpCode {
    #[strum(serialize = "nop")]
    Nop,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "pop")]
    Pop,
    #[strum(serialize = "ldarg")]
    Ldarg,
    #[strum(serialize = "ldarga")]
    Ldarga,
    #[strum(serialize = "starg")]
    Starg,
    #[strum(serialize = "ldloc")]
    Ldloc,
    #[strum(serialize = "ldloca")]
    Ldloca,
    #[strum(serialize = "stloc")]
    Stloc,
    #[strum(serialize = "ldnull")]
    Ldnull,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    #[strum(serialize = "ldc.r4")]
    LdcR4,
    #[strum(serialize = "ldc.r8")]
    LdcR8,
    #[strum(serialize = "ldstr")]
    Ldstr,
    #[strum(serialize = "br")]
    Br,
    #[strum(serialize = "brfalse")]
    Brfalse,
    #[strum(serialize = "brtrue")]
    Brtrue,
    #[strum(serialize = "beq")]
    Beq,
    #[strum(serialize = "bne.un")]
    BneUn,
    #[strum(serialize = "bge")]
    Bge,
    #[strum(serialize = "bge.un")]
    BgeUn,
    #[strum(serialize = "bgt")]
    Bgt,
    #[strum(serialize = "bgt.un")]
    BgtUn,
    #[strum(serialize = "ble")]
    Ble,
    #[strum(serialize = "ble.un")]
    BleUn,
    #[strum(serialize = "blt")]
    Blt,
    #[strum(serialize = "blt.un")]
    BltUn,
    #[strum(serialize = "switch")]
    Switch,
    #[strum(serialize = "leave")]
    Leave,
    #[strum(serialize = "ret")]
    Ret,
    #[strum(serialize = "throw")]
    Throw,
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "add.ovf")]
    AddOvf,
    #[strum(serialize = "add.ovf.un")]
    AddOvfUn,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "sub.ovf")]
    SubOvf,
    #[strum(serialize = "sub.ovf.un")]
    SubOvfUn,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "mul.ovf")]
    MulOvf,
    #[strum(serialize = "mul.ovf.un")]
    MulOvfUn,
    #[strum(serialize = "div")]
    Div,
    #[strum(serialize = "div.un")]
    DivUn,
    #[strum(serialize = "rem")]
    Rem,
    #[strum(serialize = "rem.un")]
    RemUn,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "shl")]
    Shl,
    #[strum(serialize = "shr")]
    Shr,
    #[strum(serialize = "shr.un")]
    ShrUn,
    #[strum(serialize = "neg")]
    Neg,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "conv.i1")]
    ConvI1,
    #[strum(serialize = "conv.i2")]
    ConvI2,
    #[strum(serialize = "conv.i4")]
    ConvI4,
    #[strum(serialize = "conv.i8")]
    ConvI8,
    #[strum(serialize = "conv.u1")]
    ConvU1,
    #[strum(serialize = "conv.u2")]
    ConvU2,
    #[strum(serialize = "conv.u4")]
    ConvU4,
    #[strum(serialize = "conv.u8")]
    ConvU8,
    #[strum(serialize = "conv.i")]
    ConvI,
    #[strum(serialize = "conv.u")]
    ConvU,
    #[strum(serialize = "conv.r4")]
    ConvR4,
    #[strum(serialize = "conv.r8")]
    ConvR8,
    #[strum(serialize = "conv.r.un")]
    ConvRUn,
    #[strum(serialize = "conv.ovf.i4")]
    ConvOvfI4,
    #[strum(serialize = "conv.ovf.i8")]
    ConvOvfI8,
    #[strum(serialize = "conv.ovf.u4")]
    ConvOvfU4,
    #[strum(serialize = "conv.ovf.u8")]
    ConvOvfU8,
    #[strum(serialize = "ceq")]
    Ceq,
    #[strum(serialize = "cgt")]
    Cgt,
    #[strum(serialize = "cgt.un")]
    CgtUn,
    #[strum(serialize = "clt")]
    Clt,
    #[strum(serialize = "clt.un")]
    CltUn,
    #[strum(serialize = "ldfld")]
    Ldfld,
    #[strum(serialize = "ldflda")]
    Ldflda,
    #[strum(serialize = "stfld")]
    Stfld,
    #[strum(serialize = "ldsfld")]
    Ldsfld,
    #[strum(serialize = "ldsflda")]
    Ldsflda,
    #[strum(serialize = "stsfld")]
    Stsfld,
    #[strum(serialize = "ldobj")]
    Ldobj,
    #[strum(serialize = "initobj")]
    Initobj,
    #[strum(serialize = "newobj")]
    Newobj,
    #[strum(serialize = "newarr")]
    Newarr,
    #[strum(serialize = "ldlen")]
    Ldlen,
    #[strum(serialize = "ldelem.i4")]
    LdelemI4,
    #[strum(serialize = "ldelem.i8")]
    LdelemI8,
    #[strum(serialize = "ldelem.r8")]
    LdelemR8,
    #[strum(serialize = "ldelem.ref")]
    LdelemRef,
    #[strum(serialize = "stelem.i4")]
    StelemI4,
    #[strum(serialize = "stelem.i8")]
    StelemI8,
    #[strum(serialize = "stelem.r8")]
    StelemR8,
    #[strum(serialize = "stelem.ref")]
    StelemRef,
    #[strum(serialize = "box")]
    Box,
    #[strum(serialize = "unbox.any")]
    UnboxAny,
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "callvirt")]
    Callvirt,
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// Stack effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u8,
    /// Number of items pushed to stack
    pub pushes: u8,
}

impl OpCode {
    /// How this opcode affects control flow
    #[must_use]
    pub fn flow_type(self) -> FlowType {
        match self {
            OpCode::Br => FlowType::UnconditionalBranch,
            OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Beq
            | OpCode::BneUn
            | OpCode::Bge
            | OpCode::BgeUn
            | OpCode::Bgt
            | OpCode::BgtUn
            | OpCode::Ble
            | OpCode::BleUn
            | OpCode::Blt
            | OpCode::BltUn => FlowType::ConditionalBranch,
            OpCode::Switch => FlowType::Switch,
            OpCode::Leave => FlowType::Leave,
            OpCode::Ret => FlowType::Return,
            OpCode::Throw => FlowType::Throw,
            OpCode::Call | OpCode::Callvirt | OpCode::Newobj => FlowType::Call,
            _ => FlowType::Sequential,
        }
    }

    /// Returns `true` if execution never continues with the next instruction
    #[must_use]
    pub fn ends_block(self) -> bool {
        matches!(
            self.flow_type(),
            FlowType::UnconditionalBranch | FlowType::Return | FlowType::Throw | FlowType::Leave
        )
    }

    /// The stack effect of this opcode.
    ///
    /// Returns `None` for call, callvirt, newobj and ret, whose effect depends on a method
    /// signature.
    #[must_use]
    pub fn stack_behavior(self) -> Option<StackBehavior> {
        let (pops, pushes) = match self {
            OpCode::Nop | OpCode::Br | OpCode::Leave => (0, 0),
            OpCode::Dup => (1, 2),
            OpCode::Pop
            | OpCode::Starg
            | OpCode::Stloc
            | OpCode::Brfalse
            | OpCode::Brtrue
            | OpCode::Switch
            | OpCode::Throw
            | OpCode::Stsfld
            | OpCode::Initobj => (1, 0),
            OpCode::Ldarg
            | OpCode::Ldarga
            | OpCode::Ldloc
            | OpCode::Ldloca
            | OpCode::Ldnull
            | OpCode::LdcI4
            | OpCode::LdcI8
            | OpCode::LdcR4
            | OpCode::LdcR8
            | OpCode::Ldstr
            | OpCode::Ldsfld
            | OpCode::Ldsflda => (0, 1),
            OpCode::Beq
            | OpCode::BneUn
            | OpCode::Bge
            | OpCode::BgeUn
            | OpCode::Bgt
            | OpCode::BgtUn
            | OpCode::Ble
            | OpCode::BleUn
            | OpCode::Blt
            | OpCode::BltUn
            | OpCode::Stfld => (2, 0),
            OpCode::Add
            | OpCode::AddOvf
            | OpCode::AddOvfUn
            | OpCode::Sub
            | OpCode::SubOvf
            | OpCode::SubOvfUn
            | OpCode::Mul
            | OpCode::MulOvf
            | OpCode::MulOvfUn
            | OpCode::Div
            | OpCode::DivUn
            | OpCode::Rem
            | OpCode::RemUn
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr
            | OpCode::ShrUn
            | OpCode::Ceq
            | OpCode::Cgt
            | OpCode::CgtUn
            | OpCode::Clt
            | OpCode::CltUn
            | OpCode::LdelemI4
            | OpCode::LdelemI8
            | OpCode::LdelemR8
            | OpCode::LdelemRef => (2, 1),
            OpCode::Neg
            | OpCode::Not
            | OpCode::ConvI1
            | OpCode::ConvI2
            | OpCode::ConvI4
            | OpCode::ConvI8
            | OpCode::ConvU1
            | OpCode::ConvU2
            | OpCode::ConvU4
            | OpCode::ConvU8
            | OpCode::ConvI
            | OpCode::ConvU
            | OpCode::ConvR4
            | OpCode::ConvR8
            | OpCode::ConvRUn
            | OpCode::ConvOvfI4
            | OpCode::ConvOvfI8
            | OpCode::ConvOvfU4
            | OpCode::ConvOvfU8
            | OpCode::Ldfld
            | OpCode::Ldflda
            | OpCode::Ldobj
            | OpCode::Newarr
            | OpCode::Ldlen
            | OpCode::Box
            | OpCode::UnboxAny => (1, 1),
            OpCode::StelemI4 | OpCode::StelemI8 | OpCode::StelemR8 | OpCode::StelemRef => (3, 0),
            OpCode::Ret | OpCode::Call | OpCode::Callvirt | OpCode::Newobj => return None,
        };
        Some(StackBehavior { pops, pushes })
    }
}

/// The operand of an instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// 32-bit integer constant
    Int32(i32),
    /// 64-bit integer constant
    Int64(i64),
    /// 32-bit float constant
    Float32(f32),
    /// 64-bit float constant
    Float64(f64),
    /// String literal
    String(String),
    /// Method argument index
    Argument(u16),
    /// Local variable index
    Local(u16),
    /// Unresolved branch target
    Label(String),
    /// Resolved branch target, an instruction index
    Target(usize),
    /// Unresolved switch table
    Labels(Vec<String>),
    /// Resolved switch table
    Targets(Vec<usize>),
    /// Field reference
    Field(Token),
    /// Method reference
    Method(MethodRef),
    /// Type reference
    Type(TypeSignature),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int32(v) => write!(f, "{v}"),
            Operand::Int64(v) => write!(f, "{v}"),
            Operand::Float32(v) => write!(f, "{v}"),
            Operand::Float64(v) => write!(f, "{v}"),
            Operand::String(s) => write!(f, "{s:?}"),
            Operand::Argument(a) => write!(f, "A_{a}"),
            Operand::Local(l) => write!(f, "V_{l}"),
            Operand::Label(label) => write!(f, "{label}"),
            Operand::Target(t) => write!(f, "IL_{t:04x}"),
            Operand::Labels(labels) => write!(f, "({})", labels.join(", ")),
            Operand::Targets(targets) => {
                let targets: Vec<String> = targets.iter().map(|t| format!("IL_{t:04x}")).collect();
                write!(f, "({})", targets.join(", "))
            }
            Operand::Field(token) => write!(f, "{token}"),
            Operand::Method(method) => write!(f, "{method}"),
            Operand::Type(ty) => write!(f, "{ty}"),
        }
    }
}

/// A single instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// What to do
    pub opcode: OpCode,
    /// What to do it with
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// Creates an instruction without operand
    #[must_use]
    pub fn simple(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// Resolved branch targets of this instruction
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Target(t) => vec![*t],
            Operand::Targets(t) => t.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn mnemonics_are_unique() {
        let mut seen = HashSet::new();
        for opcode in OpCode::iter() {
            assert!(seen.insert(opcode.to_string()), "duplicate {opcode}");
        }
        assert_eq!(OpCode::BneUn.to_string(), "bne.un");
        assert_eq!(OpCode::ConvRUn.to_string(), "conv.r.un");
    }

    #[test]
    fn every_fixed_opcode_has_stack_behavior() {
        for opcode in OpCode::iter() {
            let dynamic = matches!(
                opcode,
                OpCode::Ret | OpCode::Call | OpCode::Callvirt | OpCode::Newobj
            );
            assert_eq!(opcode.stack_behavior().is_none(), dynamic, "{opcode}");
        }
    }

    #[test]
    fn block_enders() {
        assert!(OpCode::Br.ends_block());
        assert!(OpCode::Throw.ends_block());
        assert!(!OpCode::Brtrue.ends_block());
        assert!(!OpCode::Call.ends_block());
    }

    #[test]
    fn display() {
        assert_eq!(
            Instruction::new(OpCode::LdcI4, Operand::Int32(-1)).to_string(),
            "ldc.i4 -1"
        );
        assert_eq!(
            Instruction::new(OpCode::Switch, Operand::Targets(vec![3, 10])).to_string(),
            "switch (IL_0003, IL_000a)"
        );
        assert_eq!(Instruction::simple(OpCode::Ret).to_string(), "ret");
    }
}
