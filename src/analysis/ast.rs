//! Statement and expression trees of a lifted method body.
//!
//! A lifted body is an [`AstCfg`]: basic blocks in an arena ordered by their original
//! instruction offset, each holding a list of [`Statement`]s. Values that the stack machine kept
//! on the evaluation stack are folded into [`Expression`] trees; values that had to be
//! materialized (call results, values spilled before a side effect) live in synthetic variables
//! identified by [`VariableId`].
//!
//! Branch targets are block offsets, never references to blocks, so loops need no special
//! treatment.

use std::fmt;

use crate::{
    assembly::ops::{BinaryOp, BranchKind, CompareOp, ConversionType, ElementKind, UnaryOp},
    metadata::{method::MethodRef, signatures::TypeSignature, token::Token},
};

/// Identifier of a synthetic variable introduced by lifting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub u32);

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `ldc.i4`
    I4(i32),
    /// `ldc.i8`
    I8(i64),
    /// `ldc.r4`
    R4(f32),
    /// `ldc.r8`
    R8(f64),
    /// `ldstr`
    String(String),
    /// `ldnull`
    Null,
}

/// An expression tree.
///
/// Operands are evaluated left to right, in the order the original instructions pushed them.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Expression {
    /// A literal
    Constant(Constant),
    /// Value of an argument; argument 0 is the receiver of instance methods
    Argument(u16),
    /// Address of an argument
    ArgumentAddress(u16),
    /// Value of a local
    Local(u16),
    /// Address of a local
    LocalAddress(u16),
    /// Value of a synthetic variable
    Variable(VariableId),
    /// Field load, static if `instance` is `None`
    Field {
        field: Token,
        instance: Option<Box<Expression>>,
    },
    /// Field address, static if `instance` is `None`
    FieldAddress {
        field: Token,
        instance: Option<Box<Expression>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Convert {
        conversion: ConversionType,
        operand: Box<Expression>,
    },
    /// Method call; `arguments` include the receiver of instance methods
    Call {
        method: MethodRef,
        virtual_call: bool,
        arguments: Vec<Expression>,
    },
    NewObject {
        constructor: MethodRef,
        arguments: Vec<Expression>,
    },
    NewArray {
        element: TypeSignature,
        length: Box<Expression>,
    },
    ArrayLength(Box<Expression>),
    LoadElement {
        kind: ElementKind,
        array: Box<Expression>,
        index: Box<Expression>,
    },
    BoxValue {
        ty: TypeSignature,
        value: Box<Expression>,
    },
    UnboxAny {
        ty: TypeSignature,
        value: Box<Expression>,
    },
    /// `ldobj` through a managed pointer
    LoadObject {
        ty: TypeSignature,
        address: Box<Expression>,
    },
}

impl Expression {
    /// Returns `true` for expressions that can be evaluated at any point without changing the
    /// result: literals, synthetic variables, which are assigned exactly once, and addresses
    /// of storage locations that do not move.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        match self {
            Expression::Constant(_)
            | Expression::Variable(_)
            | Expression::ArgumentAddress(_)
            | Expression::LocalAddress(_) => true,
            Expression::FieldAddress { instance, .. } => {
                instance.as_ref().is_none_or(|instance| instance.is_stable())
            }
            _ => false,
        }
    }

    /// Visits this expression and all of its operands, parents first
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        match self {
            Expression::Field { instance, .. } | Expression::FieldAddress { instance, .. } => {
                if let Some(instance) = instance {
                    instance.walk(visit);
                }
            }
            Expression::Unary { operand, .. } | Expression::Convert { operand, .. } => {
                operand.walk(visit);
            }
            Expression::Binary { left, right, .. } | Expression::Compare { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expression::Call { arguments, .. } | Expression::NewObject { arguments, .. } => {
                for argument in arguments {
                    argument.walk(visit);
                }
            }
            Expression::NewArray { length, .. } => length.walk(visit),
            Expression::ArrayLength(array) => array.walk(visit),
            Expression::LoadElement { array, index, .. } => {
                array.walk(visit);
                index.walk(visit);
            }
            Expression::BoxValue { value, .. } | Expression::UnboxAny { value, .. } => {
                value.walk(visit);
            }
            Expression::LoadObject { address, .. } => address.walk(visit),
            Expression::Constant(_)
            | Expression::Argument(_)
            | Expression::ArgumentAddress(_)
            | Expression::Local(_)
            | Expression::LocalAddress(_)
            | Expression::Variable(_) => {}
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(Constant::I4(v)) => write!(f, "{v}"),
            Expression::Constant(Constant::I8(v)) => write!(f, "{v}L"),
            Expression::Constant(Constant::R4(v)) => write!(f, "{v}f"),
            Expression::Constant(Constant::R8(v)) => write!(f, "{v}d"),
            Expression::Constant(Constant::String(s)) => write!(f, "{s:?}"),
            Expression::Constant(Constant::Null) => write!(f, "null"),
            Expression::Argument(index) => write!(f, "arg{index}"),
            Expression::ArgumentAddress(index) => write!(f, "&arg{index}"),
            Expression::Local(index) => write!(f, "loc{index}"),
            Expression::LocalAddress(index) => write!(f, "&loc{index}"),
            Expression::Variable(var) => write!(f, "{var}"),
            Expression::Field { field, instance } => match instance {
                Some(instance) => write!(f, "{instance}.{field}"),
                None => write!(f, "{field}"),
            },
            Expression::FieldAddress { field, instance } => match instance {
                Some(instance) => write!(f, "&{instance}.{field}"),
                None => write!(f, "&{field}"),
            },
            Expression::Unary { op, operand } => write!(f, "{}({operand})", op.opcode()),
            Expression::Binary { op, left, right } => {
                write!(f, "{}({left}, {right})", op.opcode())
            }
            Expression::Compare { op, left, right } => {
                write!(f, "{}({left}, {right})", op.opcode())
            }
            Expression::Convert {
                conversion,
                operand,
            } => write!(f, "{}({operand})", conversion.opcode()),
            Expression::Call {
                method, arguments, ..
            } => {
                let args: Vec<String> = arguments.iter().map(ToString::to_string).collect();
                write!(f, "{method}({})", args.join(", "))
            }
            Expression::NewObject {
                constructor,
                arguments,
            } => {
                let args: Vec<String> = arguments.iter().map(ToString::to_string).collect();
                write!(f, "new {constructor}({})", args.join(", "))
            }
            Expression::NewArray { element, length } => write!(f, "new {element}[{length}]"),
            Expression::ArrayLength(array) => write!(f, "{array}.Length"),
            Expression::LoadElement { array, index, .. } => write!(f, "{array}[{index}]"),
            Expression::BoxValue { ty, value } => write!(f, "box<{ty}>({value})"),
            Expression::UnboxAny { ty, value } => write!(f, "unbox<{ty}>({value})"),
            Expression::LoadObject { ty, address } => write!(f, "*({ty}*){address}"),
        }
    }
}

/// The location a [`Statement::Store`] writes to
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum StoreTarget {
    Local(u16),
    Argument(u16),
    Field {
        field: Token,
        instance: Expression,
    },
    StaticField(Token),
    Element {
        kind: ElementKind,
        array: Expression,
        index: Expression,
    },
}

/// A statement of a basic block
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Statement {
    Nop,
    /// Assigns a value to one or more synthetic variables
    Assign {
        targets: Vec<VariableId>,
        value: Expression,
    },
    /// Evaluates an expression for its side effects, discarding the value if there is one
    Expression(Expression),
    Store {
        target: StoreTarget,
        value: Expression,
    },
    /// `initobj` through a managed pointer
    InitObject {
        ty: TypeSignature,
        address: Expression,
    },
    Branch {
        target: usize,
    },
    ConditionalBranch {
        kind: BranchKind,
        operands: Vec<Expression>,
        target: usize,
    },
    Switch {
        value: Expression,
        targets: Vec<usize>,
    },
    Return {
        value: Option<Expression>,
    },
    Throw {
        exception: Expression,
    },
}

impl Statement {
    /// Returns `true` if control never falls through to the next statement
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Statement::Branch { .. } | Statement::Return { .. } | Statement::Throw { .. }
        )
    }

    /// Block offsets this statement may transfer control to
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Statement::Branch { target } | Statement::ConditionalBranch { target, .. } => {
                vec![*target]
            }
            Statement::Switch { targets, .. } => targets.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Nop => write!(f, "nop"),
            Statement::Assign { targets, value } => {
                let targets: Vec<String> = targets.iter().map(ToString::to_string).collect();
                write!(f, "{} = {value}", targets.join(" = "))
            }
            Statement::Expression(expr) => write!(f, "{expr}"),
            Statement::Store { target, value } => match target {
                StoreTarget::Local(index) => write!(f, "loc{index} = {value}"),
                StoreTarget::Argument(index) => write!(f, "arg{index} = {value}"),
                StoreTarget::Field { field, instance } => {
                    write!(f, "{instance}.{field} = {value}")
                }
                StoreTarget::StaticField(field) => write!(f, "{field} = {value}"),
                StoreTarget::Element { array, index, .. } => {
                    write!(f, "{array}[{index}] = {value}")
                }
            },
            Statement::InitObject { ty, address } => write!(f, "*({ty}*){address} = default"),
            Statement::Branch { target } => write!(f, "goto IL_{target:04x}"),
            Statement::ConditionalBranch {
                kind,
                operands,
                target,
            } => {
                let operands: Vec<String> = operands.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "if {}({}) goto IL_{target:04x}",
                    kind.opcode(),
                    operands.join(", ")
                )
            }
            Statement::Switch { value, targets } => {
                write!(f, "switch ({value}) {targets:?}")
            }
            Statement::Return { value: Some(value) } => write!(f, "return {value}"),
            Statement::Return { value: None } => write!(f, "return"),
            Statement::Throw { exception } => write!(f, "throw {exception}"),
        }
    }
}

/// A basic block: its original offset and its statements
#[derive(Debug, Clone, PartialEq)]
pub struct AstBlock {
    /// Index of the first original instruction, also the block's label
    pub offset: usize,
    /// Statements in program order
    pub statements: Vec<Statement>,
}

/// Control flow graph of a lifted method
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AstCfg {
    blocks: Vec<AstBlock>,
    variable_count: u32,
}

impl AstCfg {
    /// Creates an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block, keeping the arena ordered by offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a block with the same offset exists
    pub fn add_block(&mut self, block: AstBlock) -> crate::Result<()> {
        match self.blocks.binary_search_by_key(&block.offset, |b| b.offset) {
            Ok(_) => Err(malformed_error!(
                "Duplicate block at IL_{:04x}",
                block.offset
            )),
            Err(position) => {
                self.blocks.insert(position, block);
                Ok(())
            }
        }
    }

    /// Allocates a new synthetic variable
    pub fn new_variable(&mut self) -> VariableId {
        let id = VariableId(self.variable_count);
        self.variable_count += 1;
        id
    }

    /// All blocks in offset order
    #[must_use]
    pub fn blocks(&self) -> &[AstBlock] {
        &self.blocks
    }

    /// The block starting at `offset`
    #[must_use]
    pub fn block_at(&self, offset: usize) -> Option<&AstBlock> {
        self.blocks
            .binary_search_by_key(&offset, |b| b.offset)
            .ok()
            .map(|i| &self.blocks[i])
    }

    /// The entry block (offset 0)
    #[must_use]
    pub fn entry(&self) -> Option<&AstBlock> {
        self.block_at(0)
    }

    /// Number of synthetic variables in use
    #[must_use]
    pub fn variable_count(&self) -> u32 {
        self.variable_count
    }

    /// Total number of statements over all blocks
    #[must_use]
    pub fn statement_count(&self) -> usize {
        self.blocks.iter().map(|b| b.statements.len()).sum()
    }

    /// Checks that every branch target names a block
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for the first dangling target
    pub fn validate(&self) -> crate::Result<()> {
        if self.entry().is_none() {
            return Err(malformed_error!("Graph has no entry block"));
        }
        for block in &self.blocks {
            for statement in &block.statements {
                for target in statement.targets() {
                    if self.block_at(target).is_none() {
                        return Err(malformed_error!(
                            "Block IL_{:04x} branches to IL_{:04x}, which starts no block",
                            block.offset,
                            target
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: usize, statements: Vec<Statement>) -> AstBlock {
        AstBlock { offset, statements }
    }

    #[test]
    fn blocks_stay_ordered() -> crate::Result<()> {
        let mut cfg = AstCfg::new();
        cfg.add_block(block(7, vec![Statement::Return { value: None }]))?;
        cfg.add_block(block(0, vec![Statement::Branch { target: 7 }]))?;
        cfg.add_block(block(3, vec![Statement::Nop]))?;

        let offsets: Vec<usize> = cfg.blocks().iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 3, 7]);
        assert!(cfg.block_at(3).is_some());
        assert!(cfg.block_at(4).is_none());
        assert!(cfg.add_block(block(3, vec![])).is_err());
        cfg.validate()
    }

    #[test]
    fn dangling_target() -> crate::Result<()> {
        let mut cfg = AstCfg::new();
        cfg.add_block(block(0, vec![Statement::Branch { target: 5 }]))?;
        assert!(cfg.validate().is_err());
        Ok(())
    }

    #[test]
    fn walk_visits_operands_in_order() {
        let expr = Expression::Binary {
            op: BinaryOp::Add,
            left: Box::new(Expression::Argument(0)),
            right: Box::new(Expression::Convert {
                conversion: ConversionType::I4,
                operand: Box::new(Expression::Local(1)),
            }),
        };

        let mut seen = Vec::new();
        expr.walk(&mut |e| seen.push(e.to_string()));
        assert_eq!(
            seen,
            vec!["add(arg0, conv.i4(loc1))", "arg0", "conv.i4(loc1)", "loc1"]
        );
    }

    #[test]
    fn statement_display() {
        let stmt = Statement::ConditionalBranch {
            kind: BranchKind::Ge,
            operands: vec![
                Expression::Argument(0),
                Expression::Constant(Constant::I4(0)),
            ],
            target: 9,
        };
        assert_eq!(stmt.to_string(), "if bge(arg0, 0) goto IL_0009");
        assert!(!stmt.is_terminator());
        assert_eq!(stmt.targets(), vec![9]);
    }
}
