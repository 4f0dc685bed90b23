//! Evaluation stack verification.
//!
//! [`analyze_stack`] simulates the depth of the evaluation stack along every path through a
//! body, the same bookkeeping an encoder does while emitting branches, but over a finished
//! instruction list. Bodies produced by this crate keep the stack empty whenever control
//! leaves straight-line code, which makes the check stricter than plain CIL verification:
//!
//! - every path reaching an instruction must agree on its depth
//! - no instruction may pop more than the stack holds
//! - branches, `switch`, `leave` and `ret` must leave the stack empty
//! - execution must not run past the last instruction
//!
//! Catch handlers start with the exception object on the stack.

use crate::{
    assembly::{FlowType, OpCode, Operand},
    metadata::{
        method::MethodBody,
        module::Module,
        signatures::MethodSignature,
    },
    Result,
};

/// Result of a successful stack analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackReport {
    /// The deepest the stack gets on any path, the value for `.maxstack`
    pub max_depth: u16,
    /// Number of instructions reachable from the entry point or a handler
    pub reachable: usize,
}

fn pops_and_pushes(
    module: &Module,
    signature: &MethodSignature,
    opcode: OpCode,
    operand: &Operand,
) -> Result<(usize, usize)> {
    if let Some(behavior) = opcode.stack_behavior() {
        return Ok((usize::from(behavior.pops), usize::from(behavior.pushes)));
    }

    let callee = |operand: &Operand| -> Result<MethodSignature> {
        match operand {
            Operand::Method(method) => module.method_signature(method),
            other => Err(malformed_error!("{} expects a method operand, got {:?}", opcode, other)),
        }
    };

    match opcode {
        OpCode::Ret => Ok((usize::from(signature.returns_value()), 0)),
        OpCode::Call | OpCode::Callvirt => {
            let sig = callee(operand)?;
            Ok((sig.arg_count(), usize::from(sig.returns_value())))
        }
        OpCode::Newobj => {
            let sig = callee(operand)?;
            Ok((sig.params.len(), 1))
        }
        other => Err(malformed_error!("No stack behavior for {}", other)),
    }
}

/// Simulates the evaluation stack of `body`.
///
/// `signature` is the signature of the method owning the body; it decides whether `ret`
/// consumes a value.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] describing the first violation found
///
/// # Examples
///
/// ```rust
/// use awaitscope::{
///     assembly::{analyze_stack, InstructionAssembler},
///     metadata::{module::Module, signatures::{MethodSignature, TypeSignature}},
/// };
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldarg(0)?.ldarg(1)?.add()?.ret()?;
/// let body = asm.into_body(vec![])?;
///
/// let signature =
///     MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4, TypeSignature::I4]);
/// let report = analyze_stack(&body, &Module::new("m"), &signature)?;
/// assert_eq!(report.max_depth, 2);
/// # Ok::<(), awaitscope::Error>(())
/// ```
pub fn analyze_stack(
    body: &MethodBody,
    module: &Module,
    signature: &MethodSignature,
) -> Result<StackReport> {
    let count = body.instructions.len();
    let mut depths: Vec<Option<usize>> = vec![None; count];
    let mut worklist: Vec<(usize, usize)> = vec![(0, 0)];
    worklist.extend(body.exception_handlers.iter().map(|h| (h.handler_start, 1)));

    let mut max_depth = 0usize;

    while let Some((index, depth)) = worklist.pop() {
        if index >= count {
            return Err(malformed_error!(
                "Control flow runs past the end of the body at IL_{:04x}",
                index
            ));
        }

        match depths[index] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(malformed_error!(
                    "Stack depth mismatch at IL_{:04x}: {} vs {}",
                    index,
                    known,
                    depth
                ))
            }
            None => depths[index] = Some(depth),
        }
        max_depth = max_depth.max(depth);

        let instruction = &body.instructions[index];
        let (pops, pushes) =
            pops_and_pushes(module, signature, instruction.opcode, &instruction.operand)?;
        if pops > depth {
            return Err(malformed_error!(
                "Stack underflow at IL_{:04x} ({}): needs {}, has {}",
                index,
                instruction,
                pops,
                depth
            ));
        }
        let after = depth - pops + pushes;
        max_depth = max_depth.max(after);

        let flow = instruction.opcode.flow_type();
        let leaves_straight_line = matches!(
            flow,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
                | FlowType::Return
        );
        if leaves_straight_line && after != 0 {
            return Err(malformed_error!(
                "Stack not empty at IL_{:04x} ({}): {} values left",
                index,
                instruction,
                after
            ));
        }

        match flow {
            FlowType::Sequential | FlowType::Call => worklist.push((index + 1, after)),
            FlowType::ConditionalBranch | FlowType::Switch => {
                worklist.push((index + 1, after));
                worklist.extend(instruction.targets().into_iter().map(|t| (t, after)));
            }
            FlowType::UnconditionalBranch | FlowType::Leave => {
                let targets = instruction.targets();
                if targets.is_empty() {
                    return Err(malformed_error!(
                        "Branch at IL_{:04x} has no resolved target",
                        index
                    ));
                }
                worklist.extend(targets.into_iter().map(|t| (t, after)));
            }
            FlowType::Return | FlowType::Throw => {}
        }
    }

    Ok(StackReport {
        max_depth: u16::try_from(max_depth)
            .map_err(|_| malformed_error!("Stack depth {} out of range", max_depth))?,
        reachable: depths.iter().filter(|d| d.is_some()).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::{
            method::{ExternalMethod, MethodRef},
            runtime::RuntimeType,
            signatures::{MethodSignature, TypeSignature},
        },
    };

    fn void_sig() -> MethodSignature {
        MethodSignature::new_static(TypeSignature::Void, vec![])
    }

    #[test]
    fn test_balanced_loop() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(0)?
            .stloc(0)?
            .label("head")?
            .ldloc(0)?
            .ldc_i4(10)?
            .bge("exit")?
            .ldloc(0)?
            .ldc_i4(1)?
            .add()?
            .stloc(0)?
            .br("head")?
            .label("exit")?
            .ret()?;
        let body = asm.into_body(vec![TypeSignature::I4])?;

        let report = analyze_stack(&body, &Module::new("m"), &void_sig())?;
        assert_eq!(report.max_depth, 2);
        assert_eq!(report.reachable, body.instructions.len());
        Ok(())
    }

    #[test]
    fn test_underflow() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1)?.add()?.ret()?;
        let body = asm.into_body(vec![])?;
        assert!(analyze_stack(&body, &Module::new("m"), &void_sig()).is_err());
        Ok(())
    }

    #[test]
    fn test_value_left_at_branch() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1)?.br("end")?.label("end")?.pop()?.ret()?;
        let body = asm.into_body(vec![])?;
        assert!(analyze_stack(&body, &Module::new("m"), &void_sig()).is_err());
        Ok(())
    }

    #[test]
    fn test_falls_off_end() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.nop()?;
        let body = asm.into_body(vec![])?;
        assert!(analyze_stack(&body, &Module::new("m"), &void_sig()).is_err());
        Ok(())
    }

    #[test]
    fn test_call_effects_and_handler_depth() -> Result<()> {
        let write_line = ExternalMethod::new(
            "System.Console",
            "WriteLine",
            MethodSignature::new_static(TypeSignature::Void, vec![TypeSignature::String]),
        );

        let mut asm = InstructionAssembler::new();
        asm.label("try")?
            .ldstr("hello")?
            .call(MethodRef::External(write_line))?
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
                TypeSignature::Runtime(RuntimeType::Exception),
            )?;
        let body = asm.into_body(vec![])?;

        let report = analyze_stack(&body, &Module::new("m"), &void_sig())?;
        assert_eq!(report.max_depth, 1);
        Ok(())
    }
}
