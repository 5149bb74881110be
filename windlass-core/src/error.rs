//! Error types for windlass operations

/// Result type for windlass operations
pub type Result<T> = std::result::Result<T, WindlassError>;

/// Error types for the context window manager and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum WindlassError {
    /// LLM provider failed or returned unusable output
    #[error("Provider error: {0}")]
    Provider(String),

    /// Snapshot persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Caller supplied an invalid payload or value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Strategy name is not registered
    #[error("Unknown compression strategy: {0}")]
    UnknownStrategy(String),

    /// Field encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl WindlassError {
    /// Whether this error came from a collaborator that may recover on retry
    /// (provider or storage), as opposed to a caller or programming error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WindlassError::Provider(_) | WindlassError::Storage(_) | WindlassError::Io(_)
        )
    }
}

impl From<String> for WindlassError {
    fn from(s: String) -> Self {
        WindlassError::Other(s)
    }
}

impl From<&str> for WindlassError {
    fn from(s: &str) -> Self {
        WindlassError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for WindlassError {
    fn from(err: anyhow::Error) -> Self {
        WindlassError::Other(err.to_string())
    }
}

impl From<figment::Error> for WindlassError {
    fn from(err: figment::Error) -> Self {
        WindlassError::Configuration(err.to_string())
    }
}
