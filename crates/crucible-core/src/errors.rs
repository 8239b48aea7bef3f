//! Error types for the execution pipeline
//!
//! The taxonomy mirrors how failures are resolved: input and authorization
//! errors are settled at the boundary and never reach the queue; program
//! failures (compile error, non-zero exit, timeout) are encoded in the
//! execution result and are not errors at all; only infrastructure failures
//! drive the retry and dead-letter machinery. `SandboxError` is reserved for
//! the last category so callers can always distinguish "your code failed"
//! from "the sandbox itself failed".

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrucibleError {
    #[error("unsupported language '{requested}', supported: {}", supported.join(", "))]
    UnsupportedLanguage {
        requested: String,
        supported: Vec<String>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("queue error: {0}")]
    QueueError(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("pending-job tracker is full (capacity {0})")]
    TrackerFull(usize),
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for CrucibleError {
    fn from(err: std::io::Error) -> Self {
        CrucibleError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CrucibleError {
    fn from(err: serde_json::Error) -> Self {
        CrucibleError::SerializationError(err.to_string())
    }
}

/// Infrastructure-level sandbox failures.
///
/// Routine outcomes of running untrusted code (compile error, non-zero
/// exit, timeout) are never represented here; they live in
/// [`crate::core_types::ExecutionResult`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not allocate working area: {0}")]
    Workspace(String),
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("container wait stream ended unexpectedly for {0}")]
    WaitInterrupted(String),
}
