use fragstream_format::FormatError;

use crate::job::Stage;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    /// Malformed or unsupported exchange input. `line` is 1-based, 0 when the
    /// problem is not tied to a line.
    #[error("{stage}: line {line}: {message}")]
    Parse {
        stage: Stage,
        line: usize,
        message: String,
    },

    #[error("schema runtime: {0}")]
    Runtime(String),

    #[error("serialization: {0}")]
    Encode(String),
}

impl From<FormatError> for ConversionError {
    fn from(e: FormatError) -> Self {
        Self::Encode(e.to_string())
    }
}
