//! Error types for TwinEngine

use thiserror::Error;

/// Main error type for TwinEngine operations
#[derive(Error, Debug)]
pub enum TwinError {
    /// Engine was misconfigured (e.g. no model or identity assigned)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Twin payload was malformed or unparsable
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure (connect, report, provision)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Component key was already registered
    #[error("Component already registered: {0}")]
    DuplicateComponent(String),

    /// Component key was not found in the registry
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// A user-supplied change handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using TwinError
pub type TwinResult<T> = Result<T, TwinError>;
