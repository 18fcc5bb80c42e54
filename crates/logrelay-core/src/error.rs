use thiserror::Error;

/// Core error types for logrelay
#[derive(Debug, Error)]
pub enum LogRelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by sinks and the alert delivery path
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Stdout write error: {0}")]
    Stdout(String),

    #[error("File write error: {0}")]
    File(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport '{transport}' rejected message: {message}")]
    Transport { transport: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Sink not available: {0}")]
    Unavailable(String),

    #[error("Dispatch queue closed")]
    QueueClosed,
}

/// Result type alias for logrelay operations
pub type Result<T> = std::result::Result<T, LogRelayError>;
