//! Compile and call latency benchmarks
//!
//! Cold compiles bypass the cache with a fresh engine per iteration; warm
//! compiles measure the cache lookup path.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sysvm::{
    ArtifactCache, ContractHost, Engine, EngineConfig, HostIntrinsicTable, Value,
    register_contract_api,
};

const SUM: &str = r#"
(module
  (memory 1)
  (func (export "sum") (param $n i32) (result i64)
    (local $acc i64)
    (block $done
      (loop $next
        local.get $n
        i32.eqz
        br_if $done
        local.get $acc
        local.get $n
        i64.extend_i32_u
        i64.add
        local.set $acc
        local.get $n
        i32.const 1
        i32.sub
        local.set $n
        br $next))
    local.get $acc)
  (func (export "noop")))
"#;

fn engine() -> Engine<ContractHost> {
    let config = EngineConfig::default();
    let intrinsics = HostIntrinsicTable::new();
    register_contract_api(&intrinsics);
    Engine::new(
        config,
        Arc::new(ArtifactCache::new(config.cache)),
        Arc::new(intrinsics),
    )
    .unwrap()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let bytecode = wat::parse_str(SUM).unwrap();

    group.bench_function("cold", |b| {
        b.iter(|| engine().compile(black_box(&bytecode)).unwrap());
    });

    let warm = engine();
    warm.compile(&bytecode).unwrap();
    group.bench_function("cached", |b| {
        b.iter(|| warm.compile(black_box(&bytecode)).unwrap());
    });

    group.finish();
}

fn bench_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");
    let engine = engine();
    let artifact = engine.compile(&wat::parse_str(SUM).unwrap()).unwrap();

    group.bench_function("instantiate", |b| {
        b.iter(|| {
            engine
                .instantiate(black_box(artifact.clone()), ContractHost::default(), u64::MAX)
                .unwrap()
        });
    });

    let mut context = engine
        .instantiate(artifact.clone(), ContractHost::default(), u64::MAX)
        .unwrap();
    group.bench_function("noop", |b| {
        b.iter(|| context.call_export("noop", &[]).unwrap());
    });

    group.bench_function("sum_10000", |b| {
        b.iter(|| {
            context
                .call_export("sum", black_box(&[Value::I32(10_000)]))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_call);
criterion_main!(benches);
