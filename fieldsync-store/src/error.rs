use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by node-store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// External write to a path that does not exist.
    #[error("No such node: {path}")]
    NotFound { path: String },

    /// External write to a path without write access.
    #[error("Node is not writable: {path}")]
    NotWritable { path: String },

    /// Backend-specific failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
