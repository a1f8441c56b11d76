//! Demo contract API
//!
//! A handful of intrinsics modelled on the node's contract interface, enough
//! to run simple contracts from the command line and in tests.

use sysvm_core::{FuncType, ValType, Value};
use sysvm_runtime::{AbortReason, Caller, HostError, HostIntrinsicTable};

/// Host data of a contract execution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractHost {
    /// Everything printed by the contract
    pub console: String,
}

/// Abort code reported for a failed `sysio_assert`
pub const ASSERTION_FAILURE_CODE: u64 = 1;

fn i32_arg(args: &[Value], index: usize) -> u32 {
    args.get(index).and_then(Value::as_i32).unwrap_or_default() as u32
}

fn read_string(caller: &Caller<'_, ContractHost>, ptr: u32, len: u32) -> Result<String, HostError> {
    Ok(String::from_utf8_lossy(caller.read(ptr, len)?).into_owned())
}

/// Register `env.sysio_assert`, `env.prints_l`, `env.printi` and `env.sysio_exit`
pub fn register_contract_api(table: &HostIntrinsicTable<ContractHost>) {
    use ValType::*;

    table.register(
        "env",
        "sysio_assert",
        FuncType::new([I32, I32, I32], []),
        |caller, args| {
            if i32_arg(args, 0) != 0 {
                return Ok(vec![]);
            }
            let message = read_string(caller, i32_arg(args, 1), i32_arg(args, 2))?;
            Err(AbortReason::new(
                ASSERTION_FAILURE_CODE,
                format!("assertion failure with message: {message}"),
            )
            .into())
        },
    );

    table.register(
        "env",
        "prints_l",
        FuncType::new([I32, I32], []),
        |caller, args| {
            let text = read_string(caller, i32_arg(args, 0), i32_arg(args, 1))?;
            caller.data_mut().console.push_str(&text);
            Ok(vec![])
        },
    );

    table.register("env", "printi", FuncType::new([I64], []), |caller, args| {
        let value = args.first().and_then(Value::as_i64).unwrap_or_default();
        caller.data_mut().console.push_str(&value.to_string());
        Ok(vec![])
    });

    table.register("env", "sysio_exit", FuncType::new([I32], []), |_, args| {
        let code = i32_arg(args, 0);
        Err(AbortReason::new(u64::from(code), "sysio_exit").into())
    });
}
