use thiserror::Error;

/// Common error type for FieldSync components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid node path: {0}")]
    NodePath(String),
}

/// Result type alias using FieldSync's common Error.
pub type Result<T> = std::result::Result<T, Error>;
