//! Batch driver: selects, lifts and transforms the methods of a module.
//!
//! Processing runs in three phases:
//!
//! 1. **Selection** - every method of an accepted type is classified by [`eligibility`]
//! 2. **Lifting** - eligible methods are lifted in parallel; the module is only read
//! 3. **Transformation** - lifted methods are transformed one after another
//!
//! A method that fails to lift or transform is reported and left untouched; the batch
//! continues with the next one.

use log::{debug, info, warn};
use rayon::prelude::*;
use strum::Display;

use crate::{
    analysis::{AstCfg, Lifter},
    metadata::{
        module::{CustomAttribute, Module},
        token::Token,
    },
    obfuscation::{
        config::ObfuscatorParameters,
        transformer::{MethodTransformer, TransformSummary},
    },
    Error, Result,
};

/// Why a method was not considered for transformation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SkipReason {
    /// Abstract, extern or runtime provided
    #[strum(serialize = "no body")]
    NoBody,
    /// `.ctor` or `.cctor`
    #[strum(serialize = "constructor")]
    Constructor,
    /// A parameter or the return value is passed by reference
    #[strum(serialize = "by-reference parameter")]
    ByRefParameter,
    /// The receiver is a managed pointer into a value type
    #[strum(serialize = "instance method of a value type")]
    ValueTypeInstance,
    /// Generated by an earlier transformation or a compiler
    #[strum(serialize = "compiler generated")]
    CompilerGenerated,
}

/// Decides whether `method` is a candidate, returning the reason if it is not
///
/// # Errors
/// Returns an error if `method` or its declaring type can not be resolved
pub fn eligibility(module: &Module, method: Token) -> Result<Option<SkipReason>> {
    let def = module.method(method)?;
    let owner = module.type_def(def.declaring_type)?;

    let reason = if def.body.is_none() {
        Some(SkipReason::NoBody)
    } else if def.is_constructor() {
        Some(SkipReason::Constructor)
    } else if def.signature.return_type.is_by_ref()
        || def.signature.params.iter().any(|p| p.is_by_ref())
    {
        Some(SkipReason::ByRefParameter)
    } else if def.signature.has_this && owner.is_value_type() {
        Some(SkipReason::ValueTypeInstance)
    } else if def.has_attribute(CustomAttribute::CompilerGenerated)
        || owner
            .custom_attributes
            .contains(&CustomAttribute::CompilerGenerated)
    {
        Some(SkipReason::CompilerGenerated)
    } else {
        None
    };
    Ok(reason)
}

/// The result of processing one method
#[derive(Debug)]
pub enum MethodOutcome {
    /// The method now starts a state machine
    Transformed(TransformSummary),
    /// Lifting or transformation failed; the method is unchanged
    Failed(Error),
    /// The method was not a candidate
    Skipped(SkipReason),
}

/// Outcome of one method, with its name for reporting
#[derive(Debug)]
pub struct MethodReport {
    /// The method
    pub method: Token,
    /// `Type::Method`
    pub name: String,
    /// What happened
    pub outcome: MethodOutcome,
}

/// Outcome of a batch run, in method token order
#[derive(Debug, Default)]
pub struct ObfuscationReport {
    /// One entry per selected method
    pub methods: Vec<MethodReport>,
}

impl ObfuscationReport {
    /// Number of transformed methods
    #[must_use]
    pub fn transformed(&self) -> usize {
        self.count(|outcome| matches!(outcome, MethodOutcome::Transformed(_)))
    }

    /// Number of methods that failed
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, MethodOutcome::Failed(_)))
    }

    /// Number of skipped methods
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, MethodOutcome::Skipped(_)))
    }

    /// The report entry of `method`
    #[must_use]
    pub fn get(&self, method: Token) -> Option<&MethodReport> {
        self.methods.iter().find(|report| report.method == method)
    }

    fn count(&self, predicate: impl Fn(&MethodOutcome) -> bool) -> usize {
        self.methods
            .iter()
            .filter(|report| predicate(&report.outcome))
            .count()
    }
}

/// Transforms every eligible method of a module.
///
/// # Examples
///
/// ```rust
/// use awaitscope::{
///     analysis::StackLifter,
///     assembly::InstructionAssembler,
///     metadata::{
///         method::MethodDef,
///         module::{Module, TypeDef},
///         signatures::{MethodSignature, TypeSignature},
///     },
///     obfuscation::{Obfuscator, ObfuscatorParameters},
/// };
///
/// let mut module = Module::new("App.dll");
/// let program = module.add_type(TypeDef::new("App", "Program"));
/// let mut asm = InstructionAssembler::new();
/// asm.ldarg(0)?.ldarg(1)?.add()?.ret()?;
/// module.add_method(
///     program,
///     MethodDef::new(
///         "Add",
///         MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4; 2]),
///     )
///     .with_body(asm.into_body(vec![])?),
/// )?;
///
/// let report = Obfuscator::new(ObfuscatorParameters::default()).process(&mut module, &StackLifter);
/// assert_eq!(report.transformed(), 1);
/// # Ok::<(), awaitscope::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Obfuscator {
    parameters: ObfuscatorParameters,
}

impl Obfuscator {
    /// Creates an engine with the given configuration
    #[must_use]
    pub fn new(parameters: ObfuscatorParameters) -> Self {
        Obfuscator { parameters }
    }

    /// The configuration in use
    #[must_use]
    pub fn parameters(&self) -> &ObfuscatorParameters {
        &self.parameters
    }

    /// Processes all methods of the accepted types of `module`
    pub fn process(&self, module: &mut Module, lifter: &dyn Lifter) -> ObfuscationReport {
        let mut reports = Vec::new();
        let mut candidates = Vec::new();

        // snapshot first, transformation appends types and methods
        let selected: Vec<(Token, String)> = module
            .types()
            .filter(|ty| {
                module
                    .full_name(ty.token)
                    .is_ok_and(|name| self.parameters.accepts_type(&name))
            })
            .flat_map(|ty| ty.methods.iter().copied())
            .map(|method| (method, module.method_full_name(method)))
            .collect();

        for (method, name) in selected {
            match eligibility(module, method) {
                Ok(None) => candidates.push((method, name)),
                Ok(Some(reason)) => {
                    debug!("Skipping {name}: {reason}");
                    reports.push(MethodReport {
                        method,
                        name,
                        outcome: MethodOutcome::Skipped(reason),
                    });
                }
                Err(err) => reports.push(MethodReport {
                    method,
                    name,
                    outcome: MethodOutcome::Failed(err),
                }),
            }
        }

        let shared: &Module = module;
        let lifted: Vec<(Token, String, Result<AstCfg>)> = candidates
            .into_par_iter()
            .map(|(method, name)| {
                let cfg = lifter.lift(shared, method);
                (method, name, cfg)
            })
            .collect();

        for (method, name, cfg) in lifted {
            let outcome = match cfg.and_then(|cfg| {
                MethodTransformer::apply(module, method, &cfg, &self.parameters)
            }) {
                Ok(summary) => {
                    debug!(
                        "Transformed {name} ({} suspension points)",
                        summary.awaiters.len()
                    );
                    MethodOutcome::Transformed(summary)
                }
                Err(err) => {
                    let err = match err {
                        Error::Transform { .. } => err,
                        other => Error::Transform {
                            method: name.clone(),
                            source: Box::new(other),
                        },
                    };
                    warn!("{}", err.chain());
                    MethodOutcome::Failed(err)
                }
            };
            reports.push(MethodReport {
                method,
                name,
                outcome,
            });
        }

        reports.sort_by_key(|report| report.method);
        let report = ObfuscationReport { methods: reports };
        info!(
            "{}: {} transformed, {} failed, {} skipped",
            module.name,
            report.transformed(),
            report.failed(),
            report.skipped()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::StackLifter,
        assembly::InstructionAssembler,
        metadata::{
            method::MethodDef,
            module::{BaseType, TypeDef},
            signatures::{MethodSignature, TypeSignature},
        },
    };

    fn returning(asm: &mut InstructionAssembler) -> Result<crate::metadata::method::MethodBody> {
        asm.ret()?;
        std::mem::take(asm).into_body(vec![])
    }

    #[test]
    fn skip_reasons() -> Result<()> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));
        let point = module.add_type(TypeDef::new("App", "Point").with_base(BaseType::ValueType));
        let mut asm = InstructionAssembler::new();
        let void = || MethodSignature::new_static(TypeSignature::Void, vec![]);

        let abstract_method = module.add_method(program, MethodDef::new("NoBody", void()))?;
        let ctor = module.add_method(
            program,
            MethodDef::new_constructor(vec![]).with_body(returning(&mut asm)?),
        )?;
        let by_ref = module.add_method(
            program,
            MethodDef::new(
                "Swap",
                MethodSignature::new_static(
                    TypeSignature::Void,
                    vec![TypeSignature::I4.by_ref()],
                ),
            )
            .with_body(returning(&mut asm)?),
        )?;
        let value_instance = module.add_method(
            point,
            MethodDef::new(
                "Reset",
                MethodSignature::new_instance(TypeSignature::Void, vec![]),
            )
            .with_body(returning(&mut asm)?),
        )?;
        let generated = module.add_method(
            program,
            MethodDef::new("Helper", void())
                .with_attribute(CustomAttribute::CompilerGenerated)
                .with_body(returning(&mut asm)?),
        )?;
        let eligible = module.add_method(
            program,
            MethodDef::new("Main", void()).with_body(returning(&mut asm)?),
        )?;

        assert_eq!(eligibility(&module, abstract_method)?, Some(SkipReason::NoBody));
        assert_eq!(eligibility(&module, ctor)?, Some(SkipReason::Constructor));
        assert_eq!(eligibility(&module, by_ref)?, Some(SkipReason::ByRefParameter));
        assert_eq!(
            eligibility(&module, value_instance)?,
            Some(SkipReason::ValueTypeInstance)
        );
        assert_eq!(
            eligibility(&module, generated)?,
            Some(SkipReason::CompilerGenerated)
        );
        assert_eq!(eligibility(&module, eligible)?, None);
        assert_eq!(SkipReason::ByRefParameter.to_string(), "by-reference parameter");
        Ok(())
    }

    #[test]
    fn batch_continues_after_failures() -> Result<()> {
        let mut module = Module::new("test.dll");
        let program = module.add_type(TypeDef::new("App", "Program"));

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.dup()?.add()?.ret()?;
        let doubled = module.add_method(
            program,
            MethodDef::new(
                "Double",
                MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4]),
            )
            .with_body(asm.into_body(vec![])?),
        )?;

        let mut asm = InstructionAssembler::new();
        asm.ldarg(0)?.ldc_i4(1)?.add()?.ret()?;
        let next = module.add_method(
            program,
            MethodDef::new(
                "Next",
                MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4]),
            )
            .with_body(asm.into_body(vec![])?),
        )?;

        let report = Obfuscator::default().process(&mut module, &StackLifter);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.transformed(), 1);
        assert_eq!(report.skipped(), 0);

        match report.get(doubled).map(|r| &r.outcome) {
            Some(MethodOutcome::Failed(err)) => {
                assert!(err.is_recoverable());
                assert!(err.chain().contains("App.Program::Double"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            report.get(next).map(|r| &r.outcome),
            Some(MethodOutcome::Transformed(_))
        ));
        Ok(())
    }

    #[test]
    fn type_filter_limits_selection() -> Result<()> {
        let mut module = Module::new("test.dll");
        let a = module.add_type(TypeDef::new("App", "A"));
        let b = module.add_type(TypeDef::new("App", "B"));
        for owner in [a, b] {
            let mut asm = InstructionAssembler::new();
            asm.ret()?;
            module.add_method(
                owner,
                MethodDef::new("Run", MethodSignature::new_static(TypeSignature::Void, vec![]))
                    .with_body(asm.into_body(vec![])?),
            )?;
        }

        let obfuscator = Obfuscator::new(ObfuscatorParameters::new().with_type_filter("App.B"));
        let report = obfuscator.process(&mut module, &StackLifter);
        assert_eq!(report.methods.len(), 1);
        assert_eq!(report.methods[0].name, "App.B::Run");
        assert_eq!(report.transformed(), 1);
        Ok(())
    }
}
