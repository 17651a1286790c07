//! Error types for the reverse debugger.

use thiserror::Error;

/// Errors that can end a single debugger operation.
///
/// None of these abort a session: the orchestrator reports them upward and
/// stays in a consistent mode.
#[derive(Debug, Error)]
pub enum DebugError {
    /// A register line did not contain a required field
    #[error("malformed snapshot: missing {field} in '{line}'")]
    MalformedSnapshot { field: &'static str, line: String },

    /// Fetching an older trace entry from the target failed
    #[error("instruction history unavailable: {0}")]
    HistoryUnavailable(String),

    /// The target reported an error for a live command
    #[error("target error: {0}")]
    Target(String),

    /// The target cannot perform the requested operation
    #[error("not supported by this target: {0}")]
    Unsupported(&'static str),

    /// I/O failure on the transport
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid launch configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Launch configuration was not valid JSON
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, DebugError>;
