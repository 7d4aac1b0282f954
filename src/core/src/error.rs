use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Build context archive could not be written
    #[error("Archive encoding failed: {0}")]
    EncodingError(String),

    /// A line of the build response stream is not a valid message
    #[error("Malformed build message at line {line}: {reason}")]
    DecodeError { line: usize, reason: String },

    /// The engine reported an error for the build.
    ///
    /// `partial_log` holds every progress fragment received before the error.
    #[error("Build failed: {message}")]
    BuildFailed {
        message: String,
        partial_log: String,
    },

    /// The engine rejected the request
    #[error("Engine error: {status} - {message}")]
    EngineError { status: u16, message: String },

    /// Engine connection could not be established or was lost
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A build log was fed after it had already failed
    #[error("Build log already terminated")]
    InterpreterClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl KilnError {
    /// The log accumulated before a build failure, if this is one.
    pub fn partial_log(&self) -> Option<&str> {
        match self {
            KilnError::BuildFailed { partial_log, .. } => Some(partial_log),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
