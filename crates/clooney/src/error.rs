//! Error types for the clooney pipeline.

/// Errors surfaced by the library.
///
/// Oracle and probe failures never appear here: the former is caught at the
/// call site and the latter is recorded as data in [`crate::probe::ProbeResponse`].
#[derive(thiserror::Error, Debug)]
pub enum ClooneyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed capture: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generator '{generator}' failed: {message}")]
    Generation { generator: String, message: String },

    #[error("Invalid endpoint key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, ClooneyError>;

/// Failures of the optional inference oracle.
#[derive(thiserror::Error, Debug)]
pub enum OracleError {
    #[error("oracle is disabled")]
    Disabled,

    #[error("oracle transport failure: {0}")]
    Transport(String),

    #[error("oracle returned malformed output: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        OracleError::Transport(err.to_string())
    }
}
