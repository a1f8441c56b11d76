//! End-to-end scenarios: memory bounds, unresolved imports, budget exhaustion
//! and concurrent contexts sharing one artifact.

mod common;

use std::sync::Arc;

use common::{PLENTY, compile, engine, loop_metered_engine, run};
use sysvm::{
    ContractHost, EngineError, ExecutionOutcome, ExecutionState, InstantiationError, TrapCode,
    Value,
};

const LAST_BYTE: &str = r#"
(module
  (memory 1 1)
  (func (export "write_last") i32.const 65535 i32.const 7 i32.store8)
  (func (export "write_past") i32.const 65536 i32.const 7 i32.store8))
"#;

#[test]
fn test_write_to_last_byte_completes() {
    let engine = engine();
    let artifact = compile(&engine, LAST_BYTE);
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), PLENTY)
        .unwrap();

    let report = context.call_export("write_last", &[]).unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Completed(vec![]));
    assert_eq!(context.memory()[65_535], 7);
}

#[test]
fn test_write_past_last_byte_traps() {
    let engine = engine();
    let artifact = compile(&engine, LAST_BYTE);
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), PLENTY)
        .unwrap();

    let report = context.call_export("write_past", &[]).unwrap();
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Trapped(TrapCode::HeapOutOfBounds)
    );
    assert_eq!(context.state(), ExecutionState::Trapped);
    assert!(context.memory().iter().all(|&b| b == 0));
}

#[test]
fn test_unregistered_import_fails_before_running() {
    let engine = engine();
    let artifact = compile(
        &engine,
        r#"
        (module
          (import "env" "printi" (func $printi (param i64)))
          (import "env" "send_inline" (func $send (param i32 i32)))
          (func $init i64.const 1 call $printi)
          (start $init)
          (func (export "apply") i32.const 0 i32.const 0 call $send))
        "#,
    );

    let err = engine
        .instantiate(artifact, ContractHost::default(), PLENTY)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        EngineError::Instantiation(InstantiationError::UnresolvedImport { .. })
    ));
    insta::assert_snapshot!(err.to_string(), @"unresolved import env.send_inline: no host intrinsic is registered");
}

#[test]
fn test_unbounded_loop_exhausts_budget() {
    let engine = loop_metered_engine(10);
    let artifact = compile(
        &engine,
        r#"
        (module
          (global $iterations (mut i32) (i32.const 0))
          (func (export "spin")
            (loop $forever
              global.get $iterations
              i32.const 1
              i32.add
              global.set $iterations
              br $forever)))
        "#,
    );
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), 1_000)
        .unwrap();

    let report = context.call_export("spin", &[]).unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::BudgetExhausted);
    assert_eq!(report.consumed, 1_000);
    assert_eq!(context.state(), ExecutionState::BudgetExhausted);
    assert_eq!(context.global(0), Some(Value::I32(100)));
    assert_eq!(context.remaining_budget(), 0);
}

const WORKER: &str = r#"
(module
  (import "env" "printi" (func $printi (param i64)))
  (memory 1)
  (func (export "work") (param $seed i32) (result i64)
    (local $i i32)
    (local $acc i64)
    (loop $fill
      local.get $i
      local.get $seed
      local.get $i
      i32.mul
      i32.store8
      local.get $i
      i32.const 1
      i32.add
      local.tee $i
      i32.const 4096
      i32.lt_u
      br_if $fill)
    i32.const 0
    local.set $i
    (loop $sum
      local.get $acc
      local.get $i
      i32.load8_u
      i64.extend_i32_u
      i64.add
      local.set $acc
      local.get $i
      i32.const 1
      i32.add
      local.tee $i
      i32.const 4096
      i32.lt_u
      br_if $sum)
    local.get $acc
    call $printi
    local.get $acc))
"#;

/// Result, console output, memory prefix and consumed budget of one run
type Observation = (ExecutionOutcome, String, Vec<u8>, u64);

fn observe(engine: &sysvm::Engine<ContractHost>, artifact: Arc<sysvm::LoadedArtifact>, seed: i32) -> Observation {
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), PLENTY)
        .unwrap();
    let report = context.call_export("work", &[Value::I32(seed)]).unwrap();
    let memory = context.memory()[..4096].to_vec();
    let console = context.into_data().console;
    (report.outcome, console, memory, report.consumed)
}

#[test]
fn test_concurrent_contexts_do_not_interfere() {
    let engine = engine();
    let artifact = compile(&engine, WORKER);
    let seeds = [3, 7, 11, 250];

    let sequential: Vec<Observation> = seeds
        .iter()
        .map(|&seed| observe(&engine, artifact.clone(), seed))
        .collect();

    let concurrent: Vec<Observation> = std::thread::scope(|scope| {
        let handles: Vec<_> = seeds
            .iter()
            .map(|&seed| {
                let engine = &engine;
                let artifact = artifact.clone();
                scope.spawn(move || observe(engine, artifact, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(sequential, concurrent);
    assert_ne!(sequential[0].2, sequential[1].2);
    assert!(matches!(sequential[0].0, ExecutionOutcome::Completed(_)));
}

#[test]
fn test_contract_api_assert_and_print() {
    let engine = engine();
    let module = r#"
        (module
          (import "env" "sysio_assert" (func $assert (param i32 i32 i32)))
          (import "env" "prints_l" (func $prints_l (param i32 i32)))
          (memory 1)
          (data (i32.const 0) "hi there")
          (data (i32.const 16) "balance too low")
          (func (export "apply") (param i32)
            i32.const 0
            i32.const 8
            call $prints_l
            local.get 0
            i32.const 16
            i32.const 15
            call $assert))
    "#;

    let report = run(&engine, module, "apply", &[Value::I32(1)], PLENTY);
    assert_eq!(report.outcome, ExecutionOutcome::Completed(vec![]));

    let report = run(&engine, module, "apply", &[Value::I32(0)], PLENTY);
    let ExecutionOutcome::HostAborted(reason) = report.outcome else {
        panic!("expected host abort, got {:?}", report.outcome);
    };
    insta::assert_snapshot!(reason.to_string(), @"assertion failure with message: balance too low (code 1)");
}

#[test]
fn test_sysio_exit_reports_code() {
    let report = run(
        &engine(),
        r#"
        (module
          (import "env" "sysio_exit" (func $exit (param i32)))
          (func (export "apply") i32.const 42 call $exit unreachable))
        "#,
        "apply",
        &[],
        PLENTY,
    );
    let ExecutionOutcome::HostAborted(reason) = report.outcome else {
        panic!("expected host abort, got {:?}", report.outcome);
    };
    assert_eq!(reason.code, 42);
}

/// Recursive `f(n)` keeping `locals` loaded values live across its own call
fn wide_frames(locals: usize) -> String {
    let mut text = String::from("(module\n  (memory 1)\n  (func $f (export \"f\") (param $n i32) (result i64)\n");
    for i in 0..locals {
        text += &format!("    (local $l{i} i64)\n");
    }
    for i in 0..locals {
        text += &format!("    i32.const 0 i64.load offset={} local.set $l{i}\n", i * 8);
    }
    text += "    local.get $n i32.eqz\n    if (result i64) i64.const 0\n";
    text += "    else local.get $n i32.const 1 i32.sub call $f end\n";
    for i in 0..locals {
        text += &format!("    local.get $l{i} i64.add\n");
    }
    text += "))\n";
    text
}

#[test]
fn test_deep_recursion_on_a_small_thread_stack_traps() {
    let engine = engine();
    let artifact = compile(&engine, &wide_frames(400));

    let outcomes = std::thread::scope(|scope| {
        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn_scoped(scope, || {
                [10, 240].map(|depth| {
                    let mut context = engine
                        .instantiate(artifact.clone(), ContractHost::default(), PLENTY)
                        .unwrap();
                    context.call_export("f", &[Value::I32(depth)]).unwrap().outcome
                })
            })
            .unwrap()
            .join()
            .unwrap()
    });

    assert_eq!(outcomes[0], ExecutionOutcome::Completed(vec![Value::I64(0)]));
    assert_eq!(
        outcomes[1],
        ExecutionOutcome::Trapped(TrapCode::CallStackExhausted)
    );
}
