//! Error types for tempo-core.

use thiserror::Error;

use crate::validate::ValidationErrors;

/// Result type for tempo-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to turn a location into a compiled module.
///
/// Cloneable because a single in-flight load is shared by every caller
/// waiting on the same location.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The location was empty.
    #[error("artifact location is empty")]
    EmptyLocation,

    /// The transfer completed with a non-success status.
    #[error("HTTP {status}: {message}")]
    Transfer { status: u16, message: String },

    /// The transfer could not be performed at all.
    #[error("failed to fetch {location}: {message}")]
    Io { location: String, message: String },

    /// The payload was fetched but could not be turned into callables.
    #[error("failed to evaluate module from {location}: {message}")]
    Eval { location: String, message: String },
}

impl LoadError {
    /// HTTP status of a failed transfer, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transfer { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors that can occur in tempo-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Loading a compiled module failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A declared output has no callable in the bound module.
    #[error("Output '{0}' not found in compiled module")]
    OutputNotFound(String),

    /// An output callable raised a fault.
    #[error("Execution failed for '{output}': {cause}")]
    ExecutionFailed { output: String, cause: String },

    /// Input did not pass the pre-execution validator.
    #[error("{0}")]
    Validation(ValidationErrors),

    /// IPC communication error with the worker.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The compiler service rejected the schema.
    #[error("compile error: {0}")]
    Compile(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
