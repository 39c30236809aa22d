//! Core Error Types
//!
//! Error types shared by the protocol and data-model layer. Kept free of any
//! runtime dependency (only thiserror + serde_json) so the tools crate and the
//! application crate can both depend on it cheaply.
//!
//! The application crate wraps these in its own `AppError` alongside the
//! transport and storage variants.

use thiserror::Error;

/// Core error type for the Agent Chat workspace.
#[derive(Error, Debug)]
pub enum CoreError {
    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A wire frame could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

impl From<CoreError> for String {
    fn from(err: CoreError) -> String {
        err.to_string()
    }
}
