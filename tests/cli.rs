//! Tests for the `sysvm` command-line tool.

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn module_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".wat").expect("Failed to create temp file");
    file.write_all(text.as_bytes()).expect("Failed to write module");
    file
}

fn sysvm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sysvm"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute sysvm")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

const ADD: &str = r#"
(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

#[test]
fn test_run_prints_results() {
    let module = module_file(ADD);
    let path = module.path().to_str().unwrap();
    let output = sysvm(&["run", path, "--invoke", "add", "--arg", "50", "--arg", "-8"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = stdout(&output);
    assert!(stdout.contains("completed: [42:i32]"), "{stdout}");
    assert!(stdout.contains("consumed: "), "{stdout}");
}

#[test]
fn test_budget_exhaustion_exits_with_contract_failure() {
    let module = module_file(
        r#"(module (func (export "spin") (loop $l br $l)))"#,
    );
    let path = module.path().to_str().unwrap();
    let output = sysvm(&["run", path, "--invoke", "spin", "--budget", "1000"]);

    assert_eq!(output.status.code(), Some(2));
    let stdout = stdout(&output);
    assert!(stdout.contains("budget exhausted"), "{stdout}");
    assert!(stdout.contains("consumed: 1000"), "{stdout}");
}

#[test]
fn test_config_file_changes_cost_schedule() {
    let module = module_file(ADD);
    let mut config = NamedTempFile::with_suffix(".json").expect("Failed to create temp file");
    config
        .write_all(
            br#"{"codegen": {"cost": {"function_entry": 0, "loop_iteration": 0, "per_instruction": 0}}}"#,
        )
        .expect("Failed to write config");

    let output = sysvm(&[
        "--config",
        config.path().to_str().unwrap(),
        "run",
        module.path().to_str().unwrap(),
        "--invoke",
        "add",
        "--arg",
        "1",
        "--arg",
        "2",
    ]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("consumed: 0"));
}

#[test]
fn test_compile_prints_summary() {
    let module = module_file(
        r#"
        (module
          (import "env" "printi" (func $printi (param i64)))
          (func (export "apply") i64.const 1 call $printi))
        "#,
    );
    let output = sysvm(&["compile", module.path().to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = stdout(&output);
    assert!(stdout.contains("cache key: "), "{stdout}");
    assert!(stdout.contains("artifact digest: "), "{stdout}");
    assert!(stdout.contains("apply"), "{stdout}");
    assert!(stdout.contains("dispatch slots: 2 (1 imports)"), "{stdout}");
    assert!(stdout.contains("import env.printi"), "{stdout}");
}

#[test]
fn test_unresolved_import_is_an_error() {
    let module = module_file(
        r#"
        (module
          (import "env" "send_inline" (func (param i32 i32)))
          (func (export "apply")))
        "#,
    );
    let output = sysvm(&["run", module.path().to_str().unwrap(), "--invoke", "apply"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unresolved import env.send_inline"), "{stderr}");
}

#[test]
fn test_invalid_module_is_an_error() {
    let module = module_file("(module (func (export \"f\") i32.add))");
    let output = sysvm(&["run", module.path().to_str().unwrap(), "--invoke", "f"]);
    assert_eq!(output.status.code(), Some(1));
}
