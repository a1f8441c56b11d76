//! Error types for module decoding

use derive_more::{Display, Error, From};

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Display, Error, From)]
pub enum DecodeError {
    #[display("malformed module: {_0}")]
    Malformed(wasmparser::BinaryReaderError),

    #[display("unsupported module feature: {_0}")]
    #[from(ignore)]
    Unsupported(#[error(not(source))] String),
}

impl DecodeError {
    pub(crate) fn unsupported(feature: impl std::fmt::Display) -> Self {
        DecodeError::Unsupported(feature.to_string())
    }
}
