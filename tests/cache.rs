//! Artifact cache behaviour as seen through the engine.

mod common;

use std::sync::Arc;

use common::{PLENTY, compile, engine, engine_with, wasm};
use sysvm::{
    ArtifactCache, CacheConfig, CacheStats, ContractHost, Engine, EngineConfig,
    ExecutionOutcome, HostIntrinsicTable, Value, register_contract_api,
};

const ADD: &str = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

const SUB: &str = r#"
(module
  (func (export "sub") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.sub))
"#;

fn engine_sharing(config: EngineConfig, cache: Arc<ArtifactCache>) -> Engine<ContractHost> {
    let intrinsics = HostIntrinsicTable::new();
    register_contract_api(&intrinsics);
    Engine::new(config, cache, Arc::new(intrinsics)).unwrap()
}

#[test]
fn test_second_compile_is_a_hit() {
    let engine = engine();
    let first = compile(&engine, ADD);
    let second = compile(&engine, ADD);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        engine.cache().stats(),
        CacheStats {
            hits: 1,
            misses: 1,
            evictions: 0
        }
    );
    assert_eq!(engine.cache().len(), 1);
    assert_eq!(engine.cache().total_bytes(), first.size_bytes());
}

#[test]
fn test_engines_share_an_injected_cache() {
    let config = EngineConfig::default();
    let cache = Arc::new(ArtifactCache::new(config.cache));
    let a = engine_sharing(config, cache.clone());
    let b = engine_sharing(config, cache.clone());

    let first = compile(&a, ADD);
    let second = compile(&b, ADD);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn test_cost_schedule_is_part_of_the_key() {
    let config = EngineConfig::default();
    let mut cheaper = config;
    cheaper.codegen.cost.function_entry = 1;
    let cache = Arc::new(ArtifactCache::new(config.cache));
    let a = engine_sharing(config, cache.clone());
    let b = engine_sharing(cheaper, cache.clone());

    assert_ne!(a.cache_key(&wasm(ADD)), b.cache_key(&wasm(ADD)));
    let first = compile(&a, ADD);
    let second = compile(&b, ADD);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().misses, 2);
}

#[test]
fn test_failed_compile_is_not_cached() {
    let engine = engine();
    assert!(engine.compile(b"\0asm\x01\0\0\0\x7f").is_err());
    assert!(engine.compile(b"not wasm").is_err());
    assert!(engine.cache().is_empty());
    assert_eq!(engine.cache().stats().hits, 0);
}

#[test]
fn test_eviction_does_not_disturb_running_contexts() {
    let mut config = EngineConfig::default();
    config.cache = CacheConfig {
        max_entries: 1,
        ..CacheConfig::default()
    };
    let engine = engine_with(config);

    let add = compile(&engine, ADD);
    let add_key = engine.cache_key(&wasm(ADD));
    let mut context = engine
        .instantiate(add.clone(), ContractHost::default(), PLENTY)
        .unwrap();
    drop(add);

    compile(&engine, SUB);
    assert!(!engine.cache().contains(&add_key));
    assert_eq!(engine.cache().stats().evictions, 1);

    let report = context
        .call_export("add", &[Value::I32(40), Value::I32(2)])
        .unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Completed(vec![Value::I32(42)]));
}

#[test]
fn test_concurrent_compiles_converge_on_one_artifact() {
    let engine = engine();
    let bytecode = wasm(ADD);

    let artifacts: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| engine.compile(&bytecode).unwrap()))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    assert_eq!(engine.cache().len(), 1);
}
