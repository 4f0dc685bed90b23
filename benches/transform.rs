//! Benchmarks for the state machine transformation.
//!
//! Measures the stages a batch goes through:
//! - Lifting method bodies into statement trees
//! - Transforming a whole module
//! - Emulating a method before and after the transformation

extern crate awaitscope;

use awaitscope::prelude::*;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::hint::black_box;

/// `static int Clamp(int x) { if (x < 0) return 0; int y = x * 3 + 1; return y; }`
fn clamp_body() -> Result<MethodBody> {
    let mut asm = InstructionAssembler::new();
    asm.ldarg(0)?
        .ldc_i4(0)?
        .bge("positive")?
        .ldc_i4(0)?
        .ret()?
        .label("positive")?
        .ldarg(0)?
        .ldc_i4(3)?
        .mul()?
        .ldc_i4(1)?
        .add()?
        .stloc(0)?
        .ldloc(0)?
        .ret()?;
    asm.into_body(vec![TypeSignature::I4])
}

/// Builds a module with `count` copies of `Clamp`
fn build_module(count: usize) -> (Module, Vec<Token>) {
    let mut module = Module::new("Bench.dll");
    let program = module.add_type(TypeDef::new("Bench", "Program"));
    let methods = (0..count)
        .map(|i| {
            module
                .add_method(
                    program,
                    MethodDef::new(
                        &format!("Clamp{i}"),
                        MethodSignature::new_static(TypeSignature::I4, vec![TypeSignature::I4]),
                    )
                    .with_body(clamp_body().unwrap()),
                )
                .unwrap()
        })
        .collect();
    (module, methods)
}

/// Benchmark lifting a single body.
fn bench_lift(c: &mut Criterion) {
    let (module, methods) = build_module(1);

    c.bench_function("lift_clamp", |b| {
        b.iter(|| {
            let cfg = StackLifter.lift(black_box(&module), methods[0]).unwrap();
            black_box(cfg)
        });
    });
}

/// Benchmark transforming modules of 10 and 100 methods.
fn bench_process(c: &mut Criterion) {
    for count in [10, 100] {
        let (module, _) = build_module(count);

        c.bench_function(&format!("process_{count}_methods"), |b| {
            b.iter_batched(
                || module.clone(),
                |mut module| {
                    let report = Obfuscator::default().process(&mut module, &StackLifter);
                    black_box(report)
                },
                BatchSize::SmallInput,
            );
        });
    }
}

/// Benchmark the emulator on the original and on the transformed method.
fn bench_emulate(c: &mut Criterion) {
    let (original, methods) = build_module(1);
    let mut transformed = original.clone();
    Obfuscator::default().process(&mut transformed, &StackLifter);

    for (name, module) in [("original", &original), ("transformed", &transformed)] {
        c.bench_function(&format!("emulate_clamp_{name}"), |b| {
            b.iter(|| {
                let outcome = Emulator::new(module)
                    .call(methods[0], vec![EmValue::I32(black_box(14))])
                    .unwrap();
                black_box(outcome)
            });
        });
    }
}

criterion_group!(benches, bench_lift, bench_process, bench_emulate);
criterion_main!(benches);
