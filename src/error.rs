use thiserror::Error;

use crate::diagnostics::Location;

/// Fatal errors. Everything else degrades into a [`crate::Diagnostic`].
#[derive(Error, Debug)]
pub enum DeobError {
    #[error("Parse error at {location}: {message}")]
    Parse { location: Location, message: String },
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to deserialize configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid key pattern: {0}")]
    KeyPattern(#[from] regex::Error),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    #[error("No candidate matches the {pattern} pattern")]
    PatternNotFound { pattern: &'static str },
    #[error("{count} candidates match the {pattern} pattern, expected exactly one")]
    AmbiguousPattern { pattern: &'static str, count: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Extracted unit threw during evaluation: {0}")]
    ExtractionFailure(String),
    #[error("Extracted unit did not finish within {timeout_ms}ms")]
    ExtractionTimeout { timeout_ms: u64 },
    #[error("Exported decoder `{0}` is not callable")]
    NotCallable(String),
    #[error("Decoder threw: {0}")]
    CallFailed(String),
    #[error("Decoder call did not finish within {timeout_ms}ms")]
    CallTimeout { timeout_ms: u64 },
    #[error("Sandbox worker is gone")]
    Closed,
}
