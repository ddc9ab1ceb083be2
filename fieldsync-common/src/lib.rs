//! FieldSync Common Library
//!
//! Shared types and utilities for the FieldSync synchronization engine:
//!
//! - [`types`] - Register kinds, client states, and error codes
//! - [`codec`] - Pure codec between raw register arrays and typed scalars
//! - [`config`] - Configuration loading (JSON5 format) and logging setup
//! - [`nodepath`] - Node-path builders and parsers for the synchronized tree
//! - [`error`] - Error types

pub mod codec;
pub mod config;
pub mod error;
pub mod nodepath;
pub mod types;

// Re-export commonly used types at the crate root
pub use codec::{CodecError, ScalarValue, ValueType, decode, encode};
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use nodepath::{NodePathBuilder, PATH_PREFIX, ParsedNodePath, parse_node_path};
pub use types::{ClientState, ModbusErrorCode, RegisterKind};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
