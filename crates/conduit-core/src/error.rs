//! Error types for Conduit

use thiserror::Error;

/// Core error type for Conduit operations
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Driver error: {0}")]
    Driver(String),

    /// A required connection parameter is missing or malformed.
    ///
    /// The message is shown to users verbatim, so it carries no prefix.
    #[error("{0}")]
    Configuration(String),

    /// A client library needed by the requested connection is not available.
    #[error("{message}. {hint}")]
    MissingDependency { message: String, hint: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Conduit operations
pub type Result<T> = std::result::Result<T, ConduitError>;
