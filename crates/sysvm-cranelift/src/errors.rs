//! Error types for native code generation

use derive_more::{Display, From};

pub type CodegenResult<T> = Result<T, CodegenError>;

/// A module could not be translated into a native artifact.
#[derive(Display, Debug, From)]
#[display("{kind}")]
pub struct CodegenError {
    #[from]
    kind: Box<CodegenErrorKind>,
}

impl<E> From<E> for CodegenError
where
    CodegenErrorKind: From<E>,
{
    fn from(error: E) -> Self {
        CodegenError {
            kind: Box::new(CodegenErrorKind::from(error)),
        }
    }
}

impl CodegenError {
    pub fn kind(&self) -> &CodegenErrorKind {
        &self.kind
    }

    pub(crate) fn unsupported(feature: impl std::fmt::Display) -> Self {
        CodegenErrorKind::Unsupported(feature.to_string()).into()
    }

    pub(crate) fn limit_exceeded(what: &'static str, limit: u64) -> Self {
        CodegenErrorKind::LimitExceeded { what, limit }.into()
    }

    pub(crate) fn invalid_module(msg: impl std::fmt::Display) -> Self {
        CodegenErrorKind::InvalidModule(msg.to_string()).into()
    }

    pub(crate) fn target(msg: impl std::fmt::Display) -> Self {
        CodegenErrorKind::Target(msg.to_string()).into()
    }
}

#[derive(Display, Debug)]
pub enum CodegenErrorKind {
    #[display("Unsupported construct: {_0}")]
    Unsupported(String),

    #[display("Limit exceeded: more than {limit} {what}")]
    LimitExceeded { what: &'static str, limit: u64 },

    #[display("Invalid module: {_0}")]
    InvalidModule(String),

    #[display("Cranelift error: {_0}")]
    Cranelift(String),

    #[display("Invalid target: {_0}")]
    Target(String),

    #[display("Generated code requires relocation: {_0}")]
    Relocation(String),
}

impl From<cranelift_codegen::settings::SetError> for CodegenErrorKind {
    fn from(error: cranelift_codegen::settings::SetError) -> Self {
        CodegenErrorKind::Cranelift(error.to_string())
    }
}

impl From<cranelift_codegen::isa::LookupError> for CodegenErrorKind {
    fn from(error: cranelift_codegen::isa::LookupError) -> Self {
        CodegenErrorKind::Target(error.to_string())
    }
}

impl From<cranelift_codegen::CodegenError> for CodegenErrorKind {
    fn from(error: cranelift_codegen::CodegenError) -> Self {
        CodegenErrorKind::Cranelift(error.to_string())
    }
}

impl std::error::Error for CodegenError {}
