use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors rejected synchronously by the engine API.
///
/// Runtime failures (transport, decode) are never surfaced here; they
/// are recorded as last-error codes on the affected entity.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Name cannot be empty")]
    EmptyName,

    #[error("Name '{0}' already exists")]
    DuplicateName(String),

    #[error("No such client: {0}")]
    ClientNotFound(String),

    #[error("No such block: {0}")]
    BlockNotFound(String),

    #[error("No such value: {0}")]
    ValueNotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
