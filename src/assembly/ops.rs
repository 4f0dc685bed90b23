//! Operation kinds shared by instructions, expression trees and the emulator.
//!
//! Every family of instructions that only differs in its operator (arithmetic, comparisons,
//! conversions, conditional branches, array element accesses) is described by one enum here,
//! with lossless mappings to and from [`OpCode`].

use crate::{assembly::OpCode, metadata::signatures::TypeSignature};

/// Binary arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `add`
    Add,
    /// `add.ovf`
    AddOvf,
    /// `add.ovf.un`
    AddOvfUn,
    /// `sub`
    Sub,
    /// `sub.ovf`
    SubOvf,
    /// `sub.ovf.un`
    SubOvfUn,
    /// `mul`
    Mul,
    /// `mul.ovf`
    MulOvf,
    /// `mul.ovf.un`
    MulOvfUn,
    /// `div`
    Div,
    /// `div.un`
    DivUn,
    /// `rem`
    Rem,
    /// `rem.un`
    RemUn,
    /// `and`
    And,
    /// `or`
    Or,
    /// `xor`
    Xor,
    /// `shl`
    Shl,
    /// `shr`
    Shr,
    /// `shr.un`
    ShrUn,
}

impl BinaryOp {
    /// Maps an opcode to its operator
    #[must_use]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        Some(match opcode {
            OpCode::Add => BinaryOp::Add,
            OpCode::AddOvf => BinaryOp::AddOvf,
            OpCode::AddOvfUn => BinaryOp::AddOvfUn,
            OpCode::Sub => BinaryOp::Sub,
            OpCode::SubOvf => BinaryOp::SubOvf,
            OpCode::SubOvfUn => BinaryOp::SubOvfUn,
            OpCode::Mul => BinaryOp::Mul,
            OpCode::MulOvf => BinaryOp::MulOvf,
            OpCode::MulOvfUn => BinaryOp::MulOvfUn,
            OpCode::Div => BinaryOp::Div,
            OpCode::DivUn => BinaryOp::DivUn,
            OpCode::Rem => BinaryOp::Rem,
            OpCode::RemUn => BinaryOp::RemUn,
            OpCode::And => BinaryOp::And,
            OpCode::Or => BinaryOp::Or,
            OpCode::Xor => BinaryOp::Xor,
            OpCode::Shl => BinaryOp::Shl,
            OpCode::Shr => BinaryOp::Shr,
            OpCode::ShrUn => BinaryOp::ShrUn,
            _ => return None,
        })
    }

    /// The opcode implementing this operator
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::AddOvf => OpCode::AddOvf,
            BinaryOp::AddOvfUn => OpCode::AddOvfUn,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::SubOvf => OpCode::SubOvf,
            BinaryOp::SubOvfUn => OpCode::SubOvfUn,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::MulOvf => OpCode::MulOvf,
            BinaryOp::MulOvfUn => OpCode::MulOvfUn,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::DivUn => OpCode::DivUn,
            BinaryOp::Rem => OpCode::Rem,
            BinaryOp::RemUn => OpCode::RemUn,
            BinaryOp::And => OpCode::And,
            BinaryOp::Or => OpCode::Or,
            BinaryOp::Xor => OpCode::Xor,
            BinaryOp::Shl => OpCode::Shl,
            BinaryOp::Shr => OpCode::Shr,
            BinaryOp::ShrUn => OpCode::ShrUn,
        }
    }

    /// Returns `true` for shl, shr and shr.un
    #[must_use]
    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `neg`
    Neg,
    /// `not`
    Not,
}

impl UnaryOp {
    /// Maps an opcode to its operator
    #[must_use]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Neg => Some(UnaryOp::Neg),
            OpCode::Not => Some(UnaryOp::Not),
            _ => None,
        }
    }

    /// The opcode implementing this operator
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            UnaryOp::Neg => OpCode::Neg,
            UnaryOp::Not => OpCode::Not,
        }
    }
}

/// Comparisons producing 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `ceq`
    Ceq,
    /// `cgt`
    Cgt,
    /// `cgt.un`
    CgtUn,
    /// `clt`
    Clt,
    /// `clt.un`
    CltUn,
}

impl CompareOp {
    /// Maps an opcode to its comparison
    #[must_use]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::Ceq => Some(CompareOp::Ceq),
            OpCode::Cgt => Some(CompareOp::Cgt),
            OpCode::CgtUn => Some(CompareOp::CgtUn),
            OpCode::Clt => Some(CompareOp::Clt),
            OpCode::CltUn => Some(CompareOp::CltUn),
            _ => None,
        }
    }

    /// The opcode implementing this comparison
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            CompareOp::Ceq => OpCode::Ceq,
            CompareOp::Cgt => OpCode::Cgt,
            CompareOp::CgtUn => OpCode::CgtUn,
            CompareOp::Clt => OpCode::Clt,
            CompareOp::CltUn => OpCode::CltUn,
        }
    }
}

/// Numeric conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionType {
    /// `conv.i1`
    I1,
    /// `conv.i2`
    I2,
    /// `conv.i4`
    I4,
    /// `conv.i8`
    I8,
    /// `conv.u1`
    U1,
    /// `conv.u2`
    U2,
    /// `conv.u4`
    U4,
    /// `conv.u8`
    U8,
    /// `conv.i`
    I,
    /// `conv.u`
    U,
    /// `conv.r4`
    R4,
    /// `conv.r8`
    R8,
    /// `conv.r.un`
    RUn,
    /// `conv.ovf.i4`
    OvfI4,
    /// `conv.ovf.i8`
    OvfI8,
    /// `conv.ovf.u4`
    OvfU4,
    /// `conv.ovf.u8`
    OvfU8,
}

impl ConversionType {
    /// Maps an opcode to its conversion
    #[must_use]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        Some(match opcode {
            OpCode::ConvI1 => ConversionType::I1,
            OpCode::ConvI2 => ConversionType::I2,
            OpCode::ConvI4 => ConversionType::I4,
            OpCode::ConvI8 => ConversionType::I8,
            OpCode::ConvU1 => ConversionType::U1,
            OpCode::ConvU2 => ConversionType::U2,
            OpCode::ConvU4 => ConversionType::U4,
            OpCode::ConvU8 => ConversionType::U8,
            OpCode::ConvI => ConversionType::I,
            OpCode::ConvU => ConversionType::U,
            OpCode::ConvR4 => ConversionType::R4,
            OpCode::ConvR8 => ConversionType::R8,
            OpCode::ConvRUn => ConversionType::RUn,
            OpCode::ConvOvfI4 => ConversionType::OvfI4,
            OpCode::ConvOvfI8 => ConversionType::OvfI8,
            OpCode::ConvOvfU4 => ConversionType::OvfU4,
            OpCode::ConvOvfU8 => ConversionType::OvfU8,
            _ => return None,
        })
    }

    /// The opcode implementing this conversion
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            ConversionType::I1 => OpCode::ConvI1,
            ConversionType::I2 => OpCode::ConvI2,
            ConversionType::I4 => OpCode::ConvI4,
            ConversionType::I8 => OpCode::ConvI8,
            ConversionType::U1 => OpCode::ConvU1,
            ConversionType::U2 => OpCode::ConvU2,
            ConversionType::U4 => OpCode::ConvU4,
            ConversionType::U8 => OpCode::ConvU8,
            ConversionType::I => OpCode::ConvI,
            ConversionType::U => OpCode::ConvU,
            ConversionType::R4 => OpCode::ConvR4,
            ConversionType::R8 => OpCode::ConvR8,
            ConversionType::RUn => OpCode::ConvRUn,
            ConversionType::OvfI4 => OpCode::ConvOvfI4,
            ConversionType::OvfI8 => OpCode::ConvOvfI8,
            ConversionType::OvfU4 => OpCode::ConvOvfU4,
            ConversionType::OvfU8 => OpCode::ConvOvfU8,
        }
    }

    /// The type of the converted value
    #[must_use]
    pub fn target_type(self) -> TypeSignature {
        match self {
            ConversionType::I1 => TypeSignature::I1,
            ConversionType::I2 => TypeSignature::I2,
            ConversionType::I4 | ConversionType::OvfI4 => TypeSignature::I4,
            ConversionType::I8 | ConversionType::OvfI8 => TypeSignature::I8,
            ConversionType::U1 => TypeSignature::U1,
            ConversionType::U2 => TypeSignature::U2,
            ConversionType::U4 | ConversionType::OvfU4 => TypeSignature::U4,
            ConversionType::U8 | ConversionType::OvfU8 => TypeSignature::U8,
            ConversionType::I => TypeSignature::I,
            ConversionType::U => TypeSignature::U,
            ConversionType::R4 => TypeSignature::R4,
            ConversionType::R8 | ConversionType::RUn => TypeSignature::R8,
        }
    }
}

/// Conditional branch flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// `brtrue`, one operand
    True,
    /// `brfalse`, one operand
    False,
    /// `beq`
    Eq,
    /// `bne.un`
    NeUn,
    /// `bge`
    Ge,
    /// `bge.un`
    GeUn,
    /// `bgt`
    Gt,
    /// `bgt.un`
    GtUn,
    /// `ble`
    Le,
    /// `ble.un`
    LeUn,
    /// `blt`
    Lt,
    /// `blt.un`
    LtUn,
}

impl BranchKind {
    /// Maps an opcode to its branch kind
    #[must_use]
    pub fn from_opcode(opcode: OpCode) -> Option<Self> {
        Some(match opcode {
            OpCode::Brtrue => BranchKind::True,
            OpCode::Brfalse => BranchKind::False,
            OpCode::Beq => BranchKind::Eq,
            OpCode::BneUn => BranchKind::NeUn,
            OpCode::Bge => BranchKind::Ge,
            OpCode::BgeUn => BranchKind::GeUn,
            OpCode::Bgt => BranchKind::Gt,
            OpCode::BgtUn => BranchKind::GtUn,
            OpCode::Ble => BranchKind::Le,
            OpCode::BleUn => BranchKind::LeUn,
            OpCode::Blt => BranchKind::Lt,
            OpCode::BltUn => BranchKind::LtUn,
            _ => return None,
        })
    }

    /// The opcode implementing this branch
    #[must_use]
    pub fn opcode(self) -> OpCode {
        match self {
            BranchKind::True => OpCode::Brtrue,
            BranchKind::False => OpCode::Brfalse,
            BranchKind::Eq => OpCode::Beq,
            BranchKind::NeUn => OpCode::BneUn,
            BranchKind::Ge => OpCode::Bge,
            BranchKind::GeUn => OpCode::BgeUn,
            BranchKind::Gt => OpCode::Bgt,
            BranchKind::GtUn => OpCode::BgtUn,
            BranchKind::Le => OpCode::Ble,
            BranchKind::LeUn => OpCode::BleUn,
            BranchKind::Lt => OpCode::Blt,
            BranchKind::LtUn => OpCode::BltUn,
        }
    }

    /// Number of values the branch pops
    #[must_use]
    pub fn operand_count(self) -> usize {
        match self {
            BranchKind::True | BranchKind::False => 1,
            _ => 2,
        }
    }
}

/// Element kinds of the typed array access instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// `ldelem.i4` / `stelem.i4`
    I4,
    /// `ldelem.i8` / `stelem.i8`
    I8,
    /// `ldelem.r8` / `stelem.r8`
    R8,
    /// `ldelem.ref` / `stelem.ref`
    Ref,
}

impl ElementKind {
    /// Maps an element load opcode to its element kind
    #[must_use]
    pub fn from_load(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::LdelemI4 => Some(ElementKind::I4),
            OpCode::LdelemI8 => Some(ElementKind::I8),
            OpCode::LdelemR8 => Some(ElementKind::R8),
            OpCode::LdelemRef => Some(ElementKind::Ref),
            _ => None,
        }
    }

    /// Maps an element store opcode to its element kind
    #[must_use]
    pub fn from_store(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::StelemI4 => Some(ElementKind::I4),
            OpCode::StelemI8 => Some(ElementKind::I8),
            OpCode::StelemR8 => Some(ElementKind::R8),
            OpCode::StelemRef => Some(ElementKind::Ref),
            _ => None,
        }
    }

    /// The element load opcode
    #[must_use]
    pub fn load_opcode(self) -> OpCode {
        match self {
            ElementKind::I4 => OpCode::LdelemI4,
            ElementKind::I8 => OpCode::LdelemI8,
            ElementKind::R8 => OpCode::LdelemR8,
            ElementKind::Ref => OpCode::LdelemRef,
        }
    }

    /// The element store opcode
    #[must_use]
    pub fn store_opcode(self) -> OpCode {
        match self {
            ElementKind::I4 => OpCode::StelemI4,
            ElementKind::I8 => OpCode::StelemI8,
            ElementKind::R8 => OpCode::StelemR8,
            ElementKind::Ref => OpCode::StelemRef,
        }
    }

    /// The type of a loaded element
    #[must_use]
    pub fn element_type(self) -> TypeSignature {
        match self {
            ElementKind::I4 => TypeSignature::I4,
            ElementKind::I8 => TypeSignature::I8,
            ElementKind::R8 => TypeSignature::R8,
            ElementKind::Ref => TypeSignature::Object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_mappings_are_consistent() {
        for opcode in OpCode::iter() {
            if let Some(op) = BinaryOp::from_opcode(opcode) {
                assert_eq!(op.opcode(), opcode);
            }
            if let Some(op) = UnaryOp::from_opcode(opcode) {
                assert_eq!(op.opcode(), opcode);
            }
            if let Some(op) = CompareOp::from_opcode(opcode) {
                assert_eq!(op.opcode(), opcode);
            }
            if let Some(op) = ConversionType::from_opcode(opcode) {
                assert_eq!(op.opcode(), opcode);
            }
            if let Some(kind) = BranchKind::from_opcode(opcode) {
                assert_eq!(kind.opcode(), opcode);
            }
            if let Some(kind) = ElementKind::from_load(opcode) {
                assert_eq!(kind.load_opcode(), opcode);
            }
            if let Some(kind) = ElementKind::from_store(opcode) {
                assert_eq!(kind.store_opcode(), opcode);
            }
        }
    }

    #[test]
    fn conversion_targets() {
        assert_eq!(ConversionType::RUn.target_type(), TypeSignature::R8);
        assert_eq!(ConversionType::OvfU4.target_type(), TypeSignature::U4);
        assert_eq!(ConversionType::I.target_type(), TypeSignature::I);
    }

    #[test]
    fn branch_operands() {
        assert_eq!(BranchKind::True.operand_count(), 1);
        assert_eq!(BranchKind::LeUn.operand_count(), 2);
        assert!(BinaryOp::ShrUn.is_shift());
        assert!(!BinaryOp::Xor.is_shift());
    }
}
