//! Error types for the tandem IPC runtime.
//!
//! Errors fall into three groups:
//! - **Call-local**: reported to the one caller that issued the call; the
//!   connection keeps running.
//! - **Connection-fatal**: framing or transport is broken; the reader loop
//!   stops, pending calls are cancelled and the error surfaces from `wait()`.
//! - **Lifecycle**: spawn, accept and exit problems surfaced from
//!   `start()`/`stop()`/`wait()`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the tandem IPC runtime.
#[derive(Debug, Error)]
pub enum IpcError {
    // Call-local errors
    #[error("invalid method: {0}")]
    InvalidMethodName(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("method not found: {endpoint}.{method}")]
    MethodNotFound { endpoint: String, method: String },

    #[error("args count mismatch: expected {expected}, got {got}")]
    ArgumentCountMismatch { expected: usize, got: usize },

    #[error("argument {index}: {message}")]
    ArgumentType { index: usize, message: String },

    #[error("handle call panicked: {0}")]
    HandlerPanicked(String),

    #[error("{0}")]
    Handler(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid value: {0}")]
    Value(String),

    // Correlation errors
    #[error("ipc is stopping")]
    IpcStopping,

    #[error("call cancelled due to ipc termination")]
    CallCancelled,

    #[error("received response for unknown call id: {0}")]
    UnknownCallId(i64),

    // Connection-fatal errors
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Lifecycle errors
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("ipc socket path is missing: expected `{flag} <path>` in arguments")]
    MissingSocketArg { flag: String },

    #[error("failed to spawn {program:?}: {message}")]
    SpawnFailed { program: PathBuf, message: String },

    #[error("accept timeout after {0:?}")]
    AcceptTimeout(Duration),

    #[error("child exited before connecting: {status}")]
    ChildExitedEarly { status: String },

    #[error("child process exited abnormally: {status}")]
    ChildExited { status: String },

    #[error("failed to signal child {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("there are calls pending ({0})")]
    CallsPending(usize),

    #[error("there are calls processing ({0})")]
    CallsProcessing(usize),

    #[error("ipc is not started")]
    NotStarted,

    #[error("{}", join_errors(.0))]
    Multiple(Vec<IpcError>),
}

/// Result type alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

fn join_errors(errors: &[IpcError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IpcError {
    /// Create an IO error with a context prefix.
    pub fn io_context(context: &str, err: std::io::Error) -> Self {
        IpcError::Io {
            message: format!("{}: {}", context, err),
            source: Some(err),
        }
    }

    /// Create a malformed frame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        IpcError::MalformedFrame {
            message: message.into(),
        }
    }

    /// Errors that only fail the call that produced them.
    pub fn is_call_local(&self) -> bool {
        matches!(
            self,
            IpcError::InvalidMethodName(_)
                | IpcError::EndpointNotFound(_)
                | IpcError::MethodNotFound { .. }
                | IpcError::ArgumentCountMismatch { .. }
                | IpcError::ArgumentType { .. }
                | IpcError::HandlerPanicked(_)
                | IpcError::Handler(_)
                | IpcError::Remote(_)
                | IpcError::Value(_)
        )
    }

    /// Errors that end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::MalformedFrame { .. }
                | IpcError::FrameTooLarge { .. }
                | IpcError::Io { .. }
                | IpcError::UnknownCallId(_)
        )
    }

    /// Merge errors into one, dropping nothing.
    ///
    /// `None` when the list is empty; a single error is returned as-is and
    /// nested `Multiple` values are flattened.
    pub fn merge(errors: impl IntoIterator<Item = IpcError>) -> Option<IpcError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                IpcError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(IpcError::Multiple(flat)),
        }
    }
}
