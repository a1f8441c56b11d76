//! Engine facade errors

use std::path::PathBuf;

use derive_more::{Display, Error, From};
use sysvm_core::DecodeError;
use sysvm_cranelift::CodegenError;
use sysvm_runtime::{EngineResourceError, ExecutionError, InstantiationError};

use crate::config::ConfigError;

#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    #[display("{_0}")]
    Config(ConfigError),

    #[display("cannot load module {}: {reason}", path.display())]
    #[from(ignore)]
    Module { path: PathBuf, reason: String },

    #[display("{_0}")]
    Decode(DecodeError),

    #[display("{_0}")]
    Codegen(CodegenError),

    #[display("{_0}")]
    Instantiation(InstantiationError),

    #[display("{_0}")]
    Execution(ExecutionError),

    #[display("{_0}")]
    EngineResource(EngineResourceError),
}
