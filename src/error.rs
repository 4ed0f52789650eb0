//! Custom error types for shq.
//!
//! Every fallible queue operation returns one of these explicit variants.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed,
//! and expected "no items" outcomes are `Ok(None)`, never errors.

use thiserror::Error;

/// Top-level error type for the shared queue engine.
///
/// The variants mirror the status taxonomy of the wire-level engine:
/// argument, capacity, access, existence, state, path, support, and
/// system failures. `DepthLimitReached` and timeouts are expected,
/// recoverable outcomes; `System`, `OutOfMemory`, and `InvalidState`
/// indicate the segment may be unusable and should propagate.
#[derive(Debug, Error)]
pub enum ShqError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("depth limit reached (max {max_depth})")]
    DepthLimitReached { max_depth: u64 },

    #[error("not enough shared memory to satisfy request: {reason}")]
    OutOfMemory { reason: String },

    #[error("permission error on queue '{name}': {reason}")]
    AccessDenied { name: String, reason: String },

    #[error("queue '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("queue '{name}' does not exist")]
    NotFound { name: String },

    #[error("invalid queue state: {reason}")]
    InvalidState { reason: String },

    #[error("problem with queue name '{name}': {reason}")]
    InvalidPath { name: String, reason: String },

    #[error("required operation not supported: {reason}")]
    Unsupported { reason: String },

    #[error("system error during {op}: {source}")]
    System {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("payload checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ShqError {
    /// Build a `System` variant from the current `errno`.
    pub(crate) fn last_os(op: &'static str) -> Self {
        ShqError::System {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Errors from the YAML queue-definition loader.
///
/// Any invalid field fails the whole file - partially applied queue
/// definitions are never produced.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: std::path::PathBuf },

    #[error("YAML parse error: {message}")]
    Parse { message: String },

    #[error("invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("duplicate queue name: {name}")]
    DuplicateQueueName { name: String },

    #[error("io error reading configuration: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using ShqError.
pub type ShqResult<T> = Result<T, ShqError>;
