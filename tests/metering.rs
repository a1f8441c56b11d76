//! Budget accounting through generated code and host intrinsics.

mod common;

use common::{PLENTY, compile, engine, run};
use sysvm::{ContractHost, ExecutionOutcome, ExecutionState, Value};

const ADD: &str = r#"
(module
  (func (export "add") (result i32) i32.const 1 i32.const 2 i32.add))
"#;

const COUNTDOWN: &str = r#"
(module
  (func (export "countdown") (param $n i32)
    (loop $again
      local.get $n
      i32.const 1
      i32.sub
      local.tee $n
      br_if $again)))
"#;

const WORKLOADS: &[(&str, &str, &[Value])] = &[
    (ADD, "add", &[]),
    (COUNTDOWN, "countdown", &[Value::I32(17)]),
    (
        r#"
        (module
          (func $fib (export "fib") (param i32) (result i32)
            local.get 0
            i32.const 2
            i32.lt_u
            if (result i32)
              local.get 0
            else
              local.get 0
              i32.const 1
              i32.sub
              call $fib
              local.get 0
              i32.const 2
              i32.sub
              call $fib
              i32.add
            end))
        "#,
        "fib",
        &[Value::I32(10)],
    ),
    (
        r#"
        (module
          (import "env" "printi" (func $printi (param i64)))
          (memory 1 4)
          (func (export "grow_and_print") (result i32)
            i64.const 7
            call $printi
            i32.const 2
            memory.grow))
        "#,
        "grow_and_print",
        &[],
    ),
];

#[test]
fn test_default_schedule_charges() {
    // entry 10 + three instructions + end
    let report = run(&engine(), ADD, "add", &[], PLENTY);
    assert_eq!(report.outcome, ExecutionOutcome::Completed(vec![Value::I32(3)]));
    assert_eq!(report.consumed, 14);

    // entry 10 + {loop, end}, then 10 + six instructions per iteration
    let report = run(&engine(), COUNTDOWN, "countdown", &[Value::I32(3)], PLENTY);
    assert_eq!(report.outcome, ExecutionOutcome::Completed(vec![]));
    assert_eq!(report.consumed, 12 + 3 * 16);
}

#[test]
fn test_exact_budget_completes_and_one_less_exhausts() {
    let engine = engine();
    for &(module, name, args) in WORKLOADS {
        let needed = run(&engine, module, name, args, PLENTY).consumed;
        assert!(needed > 0, "{name} consumed nothing");

        let report = run(&engine, module, name, args, needed);
        assert!(
            matches!(report.outcome, ExecutionOutcome::Completed(_)),
            "{name} with budget {needed}: {:?}",
            report.outcome
        );
        assert_eq!(report.consumed, needed);

        let report = run(&engine, module, name, args, needed - 1);
        assert_eq!(
            report.outcome,
            ExecutionOutcome::BudgetExhausted,
            "{name} with budget {}",
            needed - 1
        );
        assert_eq!(report.consumed, needed - 1);
    }
}

#[test]
fn test_zero_budget_exhausts_immediately() {
    let report = run(&engine(), ADD, "add", &[], 0);
    assert_eq!(report.outcome, ExecutionOutcome::BudgetExhausted);
    assert_eq!(report.consumed, 0);
}

#[test]
fn test_budget_spans_calls_on_one_context() {
    let engine = engine();
    let artifact = compile(&engine, ADD);
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), 30)
        .unwrap();

    assert_eq!(context.call_export("add", &[]).unwrap().consumed, 14);
    assert_eq!(context.call_export("add", &[]).unwrap().consumed, 14);
    assert_eq!(context.remaining_budget(), 2);
    assert_eq!(context.consumed(), 28);

    let report = context.call_export("add", &[]).unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::BudgetExhausted);
    assert_eq!(report.consumed, 2);
    assert_eq!(context.state(), ExecutionState::BudgetExhausted);
}

#[test]
fn test_embedder_charge_reduces_budget() {
    let engine = engine();
    let artifact = compile(&engine, ADD);
    let mut context = engine
        .instantiate(artifact, ContractHost::default(), 20)
        .unwrap();

    assert!(context.charge(6));
    assert_eq!(context.remaining_budget(), 14);
    let report = context.call_export("add", &[]).unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Completed(_)));
    assert_eq!(context.remaining_budget(), 0);

    assert!(!context.charge(1));
}

#[test]
fn test_refused_grow_is_not_charged() {
    let module = r#"
        (module
          (memory 1 1)
          (func (export "grow") (param i32) (result i32) local.get 0 memory.grow))
    "#;
    // entry 10 + {local.get, memory.grow, end}, nothing for the refused pages
    let report = run(&engine(), module, "grow", &[Value::I32(3)], PLENTY);
    assert_eq!(report.results(), Some(&[Value::I32(-1)][..]));
    assert_eq!(report.consumed, 13);
}

#[test]
fn test_oversized_grow_requests_fail_softly_on_a_small_budget() {
    let module = r#"
        (module
          (memory 1 2)
          (func (export "grow") (param i32) (result i32) local.get 0 memory.grow))
    "#;
    for delta in [100_000, -1] {
        let report = run(&engine(), module, "grow", &[Value::I32(delta)], 1_000);
        assert_eq!(
            report.outcome,
            ExecutionOutcome::Completed(vec![Value::I32(-1)]),
            "grow by {delta}"
        );
        assert_eq!(report.consumed, 13);
    }

    // A grant is still charged per page
    let report = run(&engine(), module, "grow", &[Value::I32(1)], PLENTY);
    assert_eq!(report.results(), Some(&[Value::I32(1)][..]));
    assert_eq!(report.consumed, 13 + 1_000);
}
