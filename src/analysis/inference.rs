//! Type inference over expression trees.
//!
//! The synthetic variables introduced by the lifter carry no declared type. When a variable is
//! moved into a frame field, the field gets the type [`TypeInference::infer`] computes for the
//! assigned expression; variables whose type can not be determined become `object` fields.
//!
//! Inference is a single bottom-up pass per expression. Results for synthetic variables are
//! memoized through [`TypeInference::record`] as their assignments are translated, which
//! works because assignments are translated in program order.

use std::collections::HashMap;

use crate::{
    analysis::ast::{Constant, Expression, VariableId},
    metadata::{
        method::MethodRef,
        module::{Module, TypeDef},
        signatures::TypeSignature,
        token::Token,
    },
    Result,
};

/// Infers the types of expressions of one method
#[derive(Debug, Clone)]
pub struct TypeInference {
    arguments: Vec<TypeSignature>,
    locals: Vec<TypeSignature>,
    variables: HashMap<VariableId, TypeSignature>,
}

impl TypeInference {
    /// Captures the argument and local types of `method`
    ///
    /// # Errors
    /// Returns [`crate::Error::MethodNotFound`] if `method` is not a method of `module`
    pub fn new(module: &Module, method: Token) -> Result<Self> {
        let def = module.method(method)?;
        let count = u16::try_from(def.signature.arg_count())
            .map_err(|_| malformed_error!("Too many arguments in {}", method))?;
        let arguments = (0..count)
            .map(|i| module.argument_type(def, i))
            .collect::<Result<Vec<_>>>()?;
        let locals = def
            .body
            .as_ref()
            .map(|body| body.locals.clone())
            .unwrap_or_default();

        Ok(TypeInference {
            arguments,
            locals,
            variables: HashMap::new(),
        })
    }

    /// Remembers the type of a synthetic variable
    pub fn record(&mut self, variable: VariableId, ty: TypeSignature) {
        self.variables.insert(variable, ty);
    }

    /// The memoized type of a synthetic variable
    #[must_use]
    pub fn variable_type(&self, variable: VariableId) -> Option<&TypeSignature> {
        self.variables.get(&variable)
    }

    /// The type of the value `expr` produces, `None` if it can not be determined
    #[must_use]
    pub fn infer(&self, module: &Module, expr: &Expression) -> Option<TypeSignature> {
        match expr {
            Expression::Constant(constant) => Some(match constant {
                Constant::I4(_) => TypeSignature::I4,
                Constant::I8(_) => TypeSignature::I8,
                Constant::R4(_) => TypeSignature::R4,
                Constant::R8(_) => TypeSignature::R8,
                Constant::String(_) => TypeSignature::String,
                Constant::Null => TypeSignature::Object,
            }),
            Expression::Argument(index) => self.arguments.get(usize::from(*index)).cloned(),
            Expression::ArgumentAddress(index) => self
                .arguments
                .get(usize::from(*index))
                .map(|ty| ty.clone().by_ref()),
            Expression::Local(index) => self.locals.get(usize::from(*index)).cloned(),
            Expression::LocalAddress(index) => self
                .locals
                .get(usize::from(*index))
                .map(|ty| ty.clone().by_ref()),
            Expression::Variable(var) => self.variables.get(var).cloned(),
            Expression::Field { field, .. } => {
                module.field(*field).ok().map(|f| f.signature.clone())
            }
            Expression::FieldAddress { field, .. } => module
                .field(*field)
                .ok()
                .map(|f| f.signature.clone().by_ref()),
            Expression::Unary { operand, .. } => {
                self.infer(module, operand).map(|ty| ty.stack_type())
            }
            Expression::Binary { op, left, right } => {
                let left = self.infer(module, left);
                if op.is_shift() {
                    return left.map(|ty| ty.stack_type());
                }
                let right = self.infer(module, right);
                match (left, right) {
                    (Some(left), Some(right)) => Some(promote(&left, &right)),
                    (Some(known), None) | (None, Some(known)) => Some(known),
                    (None, None) => None,
                }
            }
            Expression::Compare { .. } => Some(TypeSignature::Boolean),
            Expression::Convert { conversion, .. } => Some(conversion.target_type()),
            Expression::Call { method, .. } => module
                .method_signature(method)
                .ok()
                .map(|sig| sig.return_type)
                .filter(|ty| *ty != TypeSignature::Void),
            Expression::NewObject { constructor, .. } => match constructor {
                MethodRef::Def(token) => {
                    let ctor = module.method(*token).ok()?;
                    module
                        .type_def(ctor.declaring_type)
                        .ok()
                        .map(TypeDef::signature)
                }
                _ => None,
            },
            Expression::NewArray { element, .. } => {
                Some(TypeSignature::SzArray(Box::new(element.clone())))
            }
            Expression::ArrayLength(_) => Some(TypeSignature::I),
            Expression::LoadElement { kind, .. } => Some(kind.element_type()),
            Expression::BoxValue { .. } => Some(TypeSignature::Object),
            Expression::UnboxAny { ty, .. } | Expression::LoadObject { ty, .. } => {
                Some(ty.clone())
            }
        }
    }
}

/// Binary numeric promotion (ECMA-335 §III.1.5, table 2)
fn promote(left: &TypeSignature, right: &TypeSignature) -> TypeSignature {
    use TypeSignature::{I, I4, I8, R4, R8};

    match (left.stack_type(), right.stack_type()) {
        (I4, I4) => I4,
        (I4 | I8, I4 | I8) => I8,
        (I, I4 | I8 | I) | (I4 | I8, I) => I,
        (R4, R4) => R4,
        (R4 | R8, R4 | R8) => R8,
        _ => left.clone(),
    }
}
