//! Common test utilities for engine integration tests.

use std::sync::Arc;

use sysvm::{
    ArtifactCache, CallReport, ContractHost, CostSchedule, Engine, EngineConfig,
    HostIntrinsicTable, LoadedArtifact, Value, register_contract_api,
};

/// Budget large enough for any test workload that terminates on its own
#[allow(dead_code)]
pub const PLENTY: u64 = 100_000_000;

/// Engine with the demo contract API and a private cache
#[allow(dead_code)]
pub fn engine() -> Engine<ContractHost> {
    engine_with(EngineConfig::default())
}

#[allow(dead_code)]
pub fn engine_with(config: EngineConfig) -> Engine<ContractHost> {
    let intrinsics = HostIntrinsicTable::new();
    register_contract_api(&intrinsics);
    Engine::new(
        config,
        Arc::new(ArtifactCache::new(config.cache)),
        Arc::new(intrinsics),
    )
    .expect("engine for host target")
}

/// Engine charging only `loop_iteration` per loop header
#[allow(dead_code)]
pub fn loop_metered_engine(loop_iteration: u64) -> Engine<ContractHost> {
    let mut config = EngineConfig::default();
    config.codegen.cost = CostSchedule {
        function_entry: 0,
        loop_iteration,
        per_instruction: 0,
        memory_grow_page: 0,
    };
    engine_with(config)
}

#[allow(dead_code)]
pub fn wasm(text: &str) -> Vec<u8> {
    wat::parse_str(text).expect("valid wat")
}

#[allow(dead_code)]
pub fn compile(engine: &Engine<ContractHost>, text: &str) -> Arc<LoadedArtifact> {
    engine.compile(&wasm(text)).expect("module compiles")
}

/// Compile, instantiate and call `name` in a fresh context
#[allow(dead_code)]
pub fn run(
    engine: &Engine<ContractHost>,
    text: &str,
    name: &str,
    args: &[Value],
    budget: u64,
) -> CallReport {
    let artifact = compile(engine, text);
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), budget)
        .expect("instantiation succeeds");
    context.call_export(name, args).expect("call is well-formed")
}
