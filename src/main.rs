//! sysvm CLI entry point.

mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use sha2::{Digest, Sha256};
use sysvm::{
    ArtifactCache, ContractHost, Engine, EngineConfig, EngineError, ExecutionOutcome,
    HostIntrinsicTable, ValType, Value, register_contract_api,
};
use tracing_subscriber::EnvFilter;

/// Exit status of a run whose contract did not complete
const CONTRACT_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let intrinsics = HostIntrinsicTable::new();
    register_contract_api(&intrinsics);
    let engine = Engine::new(
        config,
        Arc::new(ArtifactCache::new(config.cache)),
        Arc::new(intrinsics),
    )?;

    match cli.command {
        Command::Run {
            module,
            invoke,
            args,
            budget,
        } => run_export(&engine, &module, &invoke, &args, budget),
        Command::Compile { module } => {
            compile_summary(&engine, &module)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_module(path: &Path) -> Result<Vec<u8>, EngineError> {
    let module_error = |reason: String| EngineError::Module {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| module_error(e.to_string()))?;
    // Binary modules pass through unchanged
    let wasm = wat::parse_bytes(&bytes).map_err(|e| module_error(e.to_string()))?;
    Ok(wasm.into_owned())
}

fn parse_value(ty: ValType, text: &str) -> Option<Value> {
    Some(match ty {
        ValType::I32 => Value::I32(text.parse().ok()?),
        ValType::I64 => Value::I64(text.parse().ok()?),
        ValType::F32 => Value::from_f32(text.parse().ok()?),
        ValType::F64 => Value::from_f64(text.parse().ok()?),
    })
}

fn run_export(
    engine: &Engine<ContractHost>,
    module: &Path,
    name: &str,
    args: &[String],
    budget: u64,
) -> Result<ExitCode, EngineError> {
    let artifact = engine.compile(&read_module(module)?)?;
    let Some(ty) = artifact
        .export(name)
        .and_then(|index| artifact.function_type(index))
    else {
        eprintln!("error: module has no exported function {name:?}");
        return Ok(ExitCode::FAILURE);
    };
    if args.len() != ty.params.len() {
        eprintln!("error: {name} expects {} arguments, got {}", ty.params.len(), args.len());
        return Ok(ExitCode::FAILURE);
    }
    let mut values = Vec::with_capacity(args.len());
    for (text, &param) in args.iter().zip(&ty.params) {
        let Some(value) = parse_value(param, text) else {
            eprintln!("error: cannot parse {text:?} as {param}");
            return Ok(ExitCode::FAILURE);
        };
        values.push(value);
    }

    let mut context = engine.instantiate(artifact.clone(), ContractHost::default(), budget)?;
    let report = context.call_export(name, &values)?;
    let console = context.into_data().console;
    if !console.is_empty() {
        println!("{console}");
    }

    let status = match &report.outcome {
        ExecutionOutcome::Completed(values) => {
            let values: Vec<String> = values.iter().map(Value::to_string).collect();
            println!("completed: [{}]", values.join(", "));
            ExitCode::SUCCESS
        }
        ExecutionOutcome::Trapped(code) => {
            println!("trapped: {code}");
            ExitCode::from(CONTRACT_FAILURE)
        }
        ExecutionOutcome::BudgetExhausted => {
            println!("budget exhausted");
            ExitCode::from(CONTRACT_FAILURE)
        }
        ExecutionOutcome::HostAborted(reason) => {
            println!("host aborted: {reason}");
            ExitCode::from(CONTRACT_FAILURE)
        }
    };
    println!("consumed: {}", report.consumed);
    Ok(status)
}

fn compile_summary(engine: &Engine<ContractHost>, module: &Path) -> Result<(), EngineError> {
    let bytecode = read_module(module)?;
    let key = engine.cache_key(&bytecode);
    let artifact = engine.compile(&bytecode)?;

    let digest: String = Sha256::digest(&artifact.code)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    println!("cache key: {key}");
    println!("artifact digest: {digest}");
    println!("code size: {} bytes", artifact.code.len());
    println!("functions:");
    let imported = artifact.num_imported_functions();
    for (i, offset) in artifact.function_offsets.iter().enumerate() {
        let index = imported + i as u32;
        let ty = artifact
            .function_type(index)
            .map(ToString::to_string)
            .unwrap_or_default();
        let exports: Vec<&str> = artifact
            .exports
            .iter()
            .filter(|&(_, &export)| export == index)
            .map(|(name, _)| name.as_str())
            .collect();
        println!("  {index:>4} @ {offset:#08x} {ty} {}", exports.join(" "));
    }
    println!(
        "dispatch slots: {} ({} imports)",
        artifact.dispatch.len(),
        imported
    );
    for import in &artifact.imports {
        println!("  import {}.{}", import.module, import.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_by_type() {
        assert_eq!(parse_value(ValType::I32, "-5"), Some(Value::I32(-5)));
        assert_eq!(parse_value(ValType::I64, "9000000000"), Some(Value::I64(9_000_000_000)));
        assert_eq!(parse_value(ValType::F64, "2.5"), Some(Value::from_f64(2.5)));
        assert_eq!(parse_value(ValType::I32, "9000000000"), None);
        assert_eq!(parse_value(ValType::F32, "x"), None);
    }
}
