//! Arithmetic, comparison and conversion on evaluation stack values.
//!
//! Operand pairs follow the binary numeric promotion of ECMA-335 §III.1.5: int32 with int32,
//! int64 with int64, native int with int32 or native int, and floats with floats. Everything
//! else is a [`EmulationError::TypeMismatch`]. Runtime exceptions of the operations (division
//! by zero, overflow) are reported as [`Trap::Fault`] so that the engine can raise them as
//! managed exceptions.

use std::cmp::Ordering;

use crate::{
    assembly::ops::{BinaryOp, BranchKind, CompareOp, ConversionType, UnaryOp},
    emulation::{heap::FaultKind, value::EmValue, EmulationError},
};

/// Why an operation did not produce a value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Trap {
    /// The operation raises a runtime exception
    Fault(FaultKind),
    /// The operands are invalid
    Error(EmulationError),
}

impl From<EmulationError> for Trap {
    fn from(err: EmulationError) -> Self {
        Trap::Error(err)
    }
}

fn mismatch(operation: &'static str, expected: &'static str, found: &EmValue) -> Trap {
    Trap::Error(EmulationError::TypeMismatch {
        operation,
        expected,
        found: found.type_name(),
    })
}

enum Operands {
    I32(i32, i32),
    I64(i64, i64),
    Native(i64, i64),
    Float(f64, f64, bool),
}

fn operands(operation: &'static str, left: &EmValue, right: &EmValue) -> Result<Operands, Trap> {
    match (left, right) {
        (EmValue::I32(a), EmValue::I32(b)) => Ok(Operands::I32(*a, *b)),
        (EmValue::I64(a), EmValue::I64(b)) => Ok(Operands::I64(*a, *b)),
        (EmValue::NativeInt(a), EmValue::NativeInt(b)) => Ok(Operands::Native(*a, *b)),
        (EmValue::NativeInt(a), EmValue::I32(b)) => Ok(Operands::Native(*a, i64::from(*b))),
        (EmValue::I32(a), EmValue::NativeInt(b)) => Ok(Operands::Native(i64::from(*a), *b)),
        (EmValue::F32(a), EmValue::F32(b)) => {
            Ok(Operands::Float(f64::from(*a), f64::from(*b), true))
        }
        (EmValue::F32(_) | EmValue::F64(_), EmValue::F32(_) | EmValue::F64(_)) => {
            match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Operands::Float(a, b, false)),
                _ => Err(mismatch(operation, "float", right)),
            }
        }
        (EmValue::I32(_) | EmValue::I64(_) | EmValue::NativeInt(_), _)
        | (EmValue::F32(_) | EmValue::F64(_), _) => {
            Err(mismatch(operation, "matching numeric operand", right))
        }
        _ => Err(mismatch(operation, "numeric operand", left)),
    }
}

macro_rules! integer_op {
    ($op:expr, $a:expr, $b:expr, $signed:ty, $unsigned:ty) => {{
        let a: $signed = $a;
        let b: $signed = $b;
        let (ua, ub) = (a as $unsigned, b as $unsigned);
        let overflow = Trap::Fault(FaultKind::Overflow);
        let divide_by_zero = Trap::Fault(FaultKind::DivideByZero);
        match $op {
            BinaryOp::Add => Ok(a.wrapping_add(b)),
            BinaryOp::AddOvf => a.checked_add(b).ok_or(overflow),
            BinaryOp::AddOvfUn => ua.checked_add(ub).map(|v| v as $signed).ok_or(overflow),
            BinaryOp::Sub => Ok(a.wrapping_sub(b)),
            BinaryOp::SubOvf => a.checked_sub(b).ok_or(overflow),
            BinaryOp::SubOvfUn => ua.checked_sub(ub).map(|v| v as $signed).ok_or(overflow),
            BinaryOp::Mul => Ok(a.wrapping_mul(b)),
            BinaryOp::MulOvf => a.checked_mul(b).ok_or(overflow),
            BinaryOp::MulOvfUn => ua.checked_mul(ub).map(|v| v as $signed).ok_or(overflow),
            BinaryOp::Div if b == 0 => Err(divide_by_zero),
            BinaryOp::Div => a.checked_div(b).ok_or(overflow),
            BinaryOp::DivUn if b == 0 => Err(divide_by_zero),
            BinaryOp::DivUn => Ok((ua / ub) as $signed),
            BinaryOp::Rem if b == 0 => Err(divide_by_zero),
            BinaryOp::Rem => a.checked_rem(b).ok_or(overflow),
            BinaryOp::RemUn if b == 0 => Err(divide_by_zero),
            BinaryOp::RemUn => Ok((ua % ub) as $signed),
            BinaryOp::And => Ok(a & b),
            BinaryOp::Or => Ok(a | b),
            BinaryOp::Xor => Ok(a ^ b),
            BinaryOp::Shl => Ok(a.wrapping_shl(b as u32)),
            BinaryOp::Shr => Ok(a.wrapping_shr(b as u32)),
            BinaryOp::ShrUn => Ok(ua.wrapping_shr(b as u32) as $signed),
        }
    }};
}

/// Applies a binary operator
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub(crate) fn binary(op: BinaryOp, left: &EmValue, right: &EmValue) -> Result<EmValue, Trap> {
    if op.is_shift() {
        let Some(amount) = right.as_i64() else {
            return Err(mismatch("shift", "integer shift amount", right));
        };
        return match left {
            EmValue::I32(v) => integer_op!(op, *v, amount as i32, i32, u32).map(EmValue::I32),
            EmValue::I64(v) => integer_op!(op, *v, amount, i64, u64).map(EmValue::I64),
            EmValue::NativeInt(v) => {
                integer_op!(op, *v, amount, i64, u64).map(EmValue::NativeInt)
            }
            other => Err(mismatch("shift", "integer", other)),
        };
    }

    match operands("binary operation", left, right)? {
        Operands::I32(a, b) => integer_op!(op, a, b, i32, u32).map(EmValue::I32),
        Operands::I64(a, b) => integer_op!(op, a, b, i64, u64).map(EmValue::I64),
        Operands::Native(a, b) => integer_op!(op, a, b, i64, u64).map(EmValue::NativeInt),
        Operands::Float(a, b, single) => {
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => return Err(mismatch("binary operation", "integer", left)),
            };
            Ok(if single {
                EmValue::F32(result as f32)
            } else {
                EmValue::F64(result)
            })
        }
    }
}

/// Applies `neg` or `not`
pub(crate) fn unary(op: UnaryOp, value: &EmValue) -> Result<EmValue, Trap> {
    match (op, value) {
        (UnaryOp::Neg, EmValue::I32(v)) => Ok(EmValue::I32(v.wrapping_neg())),
        (UnaryOp::Neg, EmValue::I64(v)) => Ok(EmValue::I64(v.wrapping_neg())),
        (UnaryOp::Neg, EmValue::NativeInt(v)) => Ok(EmValue::NativeInt(v.wrapping_neg())),
        (UnaryOp::Neg, EmValue::F32(v)) => Ok(EmValue::F32(-v)),
        (UnaryOp::Neg, EmValue::F64(v)) => Ok(EmValue::F64(-v)),
        (UnaryOp::Not, EmValue::I32(v)) => Ok(EmValue::I32(!v)),
        (UnaryOp::Not, EmValue::I64(v)) => Ok(EmValue::I64(!v)),
        (UnaryOp::Not, EmValue::NativeInt(v)) => Ok(EmValue::NativeInt(!v)),
        (_, other) => Err(mismatch("unary operation", "integer", other)),
    }
}

/// Identity of a reference for comparisons; null sorts below every object
fn reference_rank(value: &EmValue) -> Option<u64> {
    match value {
        EmValue::Null => Some(0),
        EmValue::ObjectRef(r) => Some(r.id() + 1),
        _ => None,
    }
}

/// Orders two values, `None` if they are unordered (a NaN is involved)
#[allow(clippy::cast_sign_loss)]
fn order(left: &EmValue, right: &EmValue, unsigned: bool) -> Result<Option<Ordering>, Trap> {
    if let (Some(a), Some(b)) = (reference_rank(left), reference_rank(right)) {
        return Ok(Some(a.cmp(&b)));
    }
    match (left, right) {
        (EmValue::ManagedPtr(a), EmValue::ManagedPtr(b)) => {
            return Ok(Some(if a == b { Ordering::Equal } else { Ordering::Greater }));
        }
        (EmValue::ManagedPtr(_), EmValue::Null) => return Ok(Some(Ordering::Greater)),
        (EmValue::Null, EmValue::ManagedPtr(_)) => return Ok(Some(Ordering::Less)),
        _ => {}
    }

    Ok(match operands("comparison", left, right)? {
        Operands::I32(a, b) if unsigned => Some((a as u32).cmp(&(b as u32))),
        Operands::I32(a, b) => Some(a.cmp(&b)),
        Operands::I64(a, b) | Operands::Native(a, b) if unsigned => Some((a as u64).cmp(&(b as u64))),
        Operands::I64(a, b) | Operands::Native(a, b) => Some(a.cmp(&b)),
        Operands::Float(a, b, _) => a.partial_cmp(&b),
    })
}

/// Evaluates `ceq`, `cgt(.un)` or `clt(.un)`.
///
/// The unsigned flavours treat integers as unsigned and are true for unordered floats.
pub(crate) fn compare(op: CompareOp, left: &EmValue, right: &EmValue) -> Result<bool, Trap> {
    let unsigned = matches!(op, CompareOp::CgtUn | CompareOp::CltUn);
    let ordering = order(left, right, unsigned)?;
    Ok(match op {
        CompareOp::Ceq => ordering == Some(Ordering::Equal),
        CompareOp::Cgt => ordering == Some(Ordering::Greater),
        CompareOp::CgtUn => matches!(ordering, Some(Ordering::Greater) | None),
        CompareOp::Clt => ordering == Some(Ordering::Less),
        CompareOp::CltUn => matches!(ordering, Some(Ordering::Less) | None),
    })
}

/// Decides a two-operand conditional branch
pub(crate) fn branch_taken(kind: BranchKind, left: &EmValue, right: &EmValue) -> Result<bool, Trap> {
    let unsigned = matches!(
        kind,
        BranchKind::GeUn | BranchKind::GtUn | BranchKind::LeUn | BranchKind::LtUn
    );
    let ordering = order(left, right, unsigned)?;
    Ok(match kind {
        BranchKind::Eq => ordering == Some(Ordering::Equal),
        BranchKind::NeUn => ordering != Some(Ordering::Equal),
        BranchKind::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        BranchKind::GeUn => ordering != Some(Ordering::Less),
        BranchKind::Gt => ordering == Some(Ordering::Greater),
        BranchKind::GtUn => matches!(ordering, Some(Ordering::Greater) | None),
        BranchKind::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        BranchKind::LeUn => ordering != Some(Ordering::Greater),
        BranchKind::Lt => ordering == Some(Ordering::Less),
        BranchKind::LtUn => matches!(ordering, Some(Ordering::Less) | None),
        BranchKind::True | BranchKind::False => {
            return Err(Trap::Error(EmulationError::Unsupported(format!(
                "{kind:?} takes a single operand"
            ))))
        }
    })
}

/// Applies a `conv` instruction.
///
/// int32 sources are sign-extended, except for `conv.u8`, `conv.u` and `conv.r.un`, which
/// zero-extend them.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
pub(crate) fn convert(conversion: ConversionType, value: &EmValue) -> Result<EmValue, Trap> {
    let overflow = || Trap::Fault(FaultKind::Overflow);

    if let Some(float) = value.as_f64() {
        return Ok(match conversion {
            ConversionType::I1 => EmValue::I32(i32::from(float as i64 as i8)),
            ConversionType::U1 => EmValue::I32(i32::from(float as i64 as u8)),
            ConversionType::I2 => EmValue::I32(i32::from(float as i64 as i16)),
            ConversionType::U2 => EmValue::I32(i32::from(float as i64 as u16)),
            ConversionType::I4 => EmValue::I32(float as i64 as i32),
            ConversionType::U4 => EmValue::I32(float as i64 as u32 as i32),
            ConversionType::I8 => EmValue::I64(float as i64),
            ConversionType::U8 => EmValue::I64(float as u64 as i64),
            ConversionType::I => EmValue::NativeInt(float as i64),
            ConversionType::U => EmValue::NativeInt(float as u64 as i64),
            ConversionType::R4 => EmValue::F32(float as f32),
            ConversionType::R8 | ConversionType::RUn => EmValue::F64(float),
            ConversionType::OvfI4 => {
                if float.is_nan() || float <= f64::from(i32::MIN) - 1.0 || float >= f64::from(i32::MAX) + 1.0 {
                    return Err(overflow());
                }
                EmValue::I32(float as i32)
            }
            ConversionType::OvfI8 => {
                if float.is_nan() || float < -9.223_372_036_854_775_808e18 || float >= 9.223_372_036_854_775_808e18 {
                    return Err(overflow());
                }
                EmValue::I64(float as i64)
            }
            ConversionType::OvfU4 => {
                if float.is_nan() || float <= -1.0 || float >= f64::from(u32::MAX) + 1.0 {
                    return Err(overflow());
                }
                EmValue::I32(float as u32 as i32)
            }
            ConversionType::OvfU8 => {
                if float.is_nan() || float <= -1.0 || float >= 1.844_674_407_370_955_2e19 {
                    return Err(overflow());
                }
                EmValue::I64(float as u64 as i64)
            }
        });
    }

    let (signed, unsigned) = match value {
        EmValue::I32(v) => (i64::from(*v), u64::from(*v as u32)),
        EmValue::I64(v) | EmValue::NativeInt(v) => (*v, *v as u64),
        other => return Err(mismatch("conversion", "numeric value", other)),
    };

    Ok(match conversion {
        ConversionType::I1 => EmValue::I32(i32::from(signed as i8)),
        ConversionType::U1 => EmValue::I32(i32::from(signed as u8)),
        ConversionType::I2 => EmValue::I32(i32::from(signed as i16)),
        ConversionType::U2 => EmValue::I32(i32::from(signed as u16)),
        ConversionType::I4 | ConversionType::U4 => EmValue::I32(signed as i32),
        ConversionType::I8 => EmValue::I64(signed),
        ConversionType::U8 => EmValue::I64(unsigned as i64),
        ConversionType::I => EmValue::NativeInt(signed),
        ConversionType::U => EmValue::NativeInt(unsigned as i64),
        ConversionType::R4 => EmValue::F32(signed as f32),
        ConversionType::R8 => EmValue::F64(signed as f64),
        ConversionType::RUn => EmValue::F64(unsigned as f64),
        ConversionType::OvfI4 => EmValue::I32(i32::try_from(signed).map_err(|_| overflow())?),
        ConversionType::OvfI8 => EmValue::I64(signed),
        ConversionType::OvfU4 => {
            EmValue::I32(u32::try_from(signed).map_err(|_| overflow())? as i32)
        }
        ConversionType::OvfU8 => {
            EmValue::I64(u64::try_from(signed).map_err(|_| overflow())? as i64)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::value::HeapRef;

    fn fault(result: Result<EmValue, Trap>) -> Option<FaultKind> {
        match result {
            Err(Trap::Fault(kind)) => Some(kind),
            _ => None,
        }
    }

    #[test]
    fn integer_arithmetic() {
        let i = EmValue::I32;
        assert_eq!(binary(BinaryOp::Add, &i(i32::MAX), &i(1)), Ok(i(i32::MIN)));
        assert_eq!(binary(BinaryOp::Div, &i(-7), &i(2)), Ok(i(-3)));
        assert_eq!(binary(BinaryOp::Rem, &i(-7), &i(2)), Ok(i(-1)));
        assert_eq!(binary(BinaryOp::DivUn, &i(-2), &i(2)), Ok(i(i32::MAX)));
        assert_eq!(binary(BinaryOp::ShrUn, &i(-1), &i(28)), Ok(i(15)));
        assert_eq!(binary(BinaryOp::Shr, &i(-16), &i(2)), Ok(i(-4)));
        assert_eq!(
            binary(BinaryOp::Shl, &EmValue::I64(1), &i(40)),
            Ok(EmValue::I64(1 << 40))
        );
        assert_eq!(
            binary(BinaryOp::Add, &EmValue::NativeInt(8), &i(2)),
            Ok(EmValue::NativeInt(10))
        );
    }

    #[test]
    fn integer_faults() {
        let i = EmValue::I32;
        assert_eq!(fault(binary(BinaryOp::Div, &i(1), &i(0))), Some(FaultKind::DivideByZero));
        assert_eq!(fault(binary(BinaryOp::RemUn, &i(1), &i(0))), Some(FaultKind::DivideByZero));
        assert_eq!(fault(binary(BinaryOp::Div, &i(i32::MIN), &i(-1))), Some(FaultKind::Overflow));
        assert_eq!(fault(binary(BinaryOp::AddOvf, &i(i32::MAX), &i(1))), Some(FaultKind::Overflow));
        assert_eq!(fault(binary(BinaryOp::SubOvfUn, &i(0), &i(1))), Some(FaultKind::Overflow));
        assert_eq!(
            fault(binary(BinaryOp::MulOvf, &EmValue::I64(i64::MAX), &EmValue::I64(2))),
            Some(FaultKind::Overflow)
        );
    }

    #[test]
    fn float_arithmetic_never_traps() {
        assert_eq!(
            binary(BinaryOp::Div, &EmValue::F64(1.0), &EmValue::F64(0.0)),
            Ok(EmValue::F64(f64::INFINITY))
        );
        assert_eq!(
            binary(BinaryOp::Mul, &EmValue::F32(1.5), &EmValue::F32(2.0)),
            Ok(EmValue::F32(3.0))
        );
        assert_eq!(
            binary(BinaryOp::Add, &EmValue::F32(1.0), &EmValue::F64(0.5)),
            Ok(EmValue::F64(1.5))
        );
        assert!(binary(BinaryOp::And, &EmValue::F64(1.0), &EmValue::F64(1.0)).is_err());
    }

    #[test]
    fn mismatched_operands_are_errors() {
        assert!(matches!(
            binary(BinaryOp::Add, &EmValue::I32(1), &EmValue::I64(1)),
            Err(Trap::Error(EmulationError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            unary(UnaryOp::Not, &EmValue::F64(1.0)),
            Err(Trap::Error(_))
        ));
    }

    #[test]
    fn comparisons() {
        let i = EmValue::I32;
        assert_eq!(compare(CompareOp::Clt, &i(-1), &i(0)), Ok(true));
        assert_eq!(compare(CompareOp::CltUn, &i(-1), &i(0)), Ok(false));
        let nan = EmValue::F64(f64::NAN);
        let one = EmValue::F64(1.0);
        assert_eq!(compare(CompareOp::Cgt, &nan, &one), Ok(false));
        assert_eq!(compare(CompareOp::CgtUn, &nan, &one), Ok(true));
        assert_eq!(compare(CompareOp::Ceq, &nan, &nan), Ok(false));

        let object = EmValue::ObjectRef(HeapRef::new(0));
        assert_eq!(compare(CompareOp::CgtUn, &object, &EmValue::Null), Ok(true));
        assert_eq!(compare(CompareOp::CgtUn, &EmValue::Null, &EmValue::Null), Ok(false));
        assert_eq!(compare(CompareOp::Ceq, &object, &object), Ok(true));
    }

    #[test]
    fn branches_on_unordered_floats() {
        let nan = EmValue::F64(f64::NAN);
        let one = EmValue::F64(1.0);
        assert_eq!(branch_taken(BranchKind::Ge, &nan, &one), Ok(false));
        assert_eq!(branch_taken(BranchKind::GeUn, &nan, &one), Ok(true));
        assert_eq!(branch_taken(BranchKind::NeUn, &nan, &nan), Ok(true));
        assert_eq!(branch_taken(BranchKind::Le, &one, &one), Ok(true));
        assert_eq!(
            branch_taken(BranchKind::LtUn, &EmValue::I32(1), &EmValue::I32(-1)),
            Ok(true)
        );
    }

    #[test]
    fn conversions() {
        let i = EmValue::I32;
        assert_eq!(convert(ConversionType::I1, &i(200)), Ok(i(-56)));
        assert_eq!(convert(ConversionType::U2, &i(-1)), Ok(i(0xffff)));
        assert_eq!(convert(ConversionType::I8, &i(-1)), Ok(EmValue::I64(-1)));
        assert_eq!(convert(ConversionType::U8, &i(-1)), Ok(EmValue::I64(0xffff_ffff)));
        assert_eq!(convert(ConversionType::RUn, &i(-1)), Ok(EmValue::F64(4_294_967_295.0)));
        assert_eq!(convert(ConversionType::I4, &EmValue::F64(-2.75)), Ok(i(-2)));
        assert_eq!(convert(ConversionType::R4, &i(3)), Ok(EmValue::F32(3.0)));
        assert_eq!(
            fault(convert(ConversionType::OvfI4, &EmValue::I64(1 << 31))),
            Some(FaultKind::Overflow)
        );
        assert_eq!(fault(convert(ConversionType::OvfU4, &i(-1))), Some(FaultKind::Overflow));
        assert_eq!(
            fault(convert(ConversionType::OvfI4, &EmValue::F64(f64::NAN))),
            Some(FaultKind::Overflow)
        );
        assert!(convert(ConversionType::I4, &EmValue::Null).is_err());
    }
}
