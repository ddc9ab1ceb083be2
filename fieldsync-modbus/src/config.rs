//! Bridge configuration.
//!
//! The client → block → value record tree below is both the runtime
//! configuration (JSON5) and the persisted shape the engine exports
//! itself back into.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use fieldsync_common::codec::ValueType;
use fieldsync_common::config::LoggingConfig;
use fieldsync_common::nodepath::PATH_PREFIX;
use fieldsync_common::types::RegisterKind;

use crate::block::{DEFAULT_SAMPLING_MS, MIN_SAMPLING_MS};
use crate::transport::{BusTransport, RtuTransport, SimBank, SimTransport, TcpTransport, TransportError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Node-store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Clients to create, with their blocks and values.
    pub clients: Vec<ClientRecord>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Node-path prefix all entities are mirrored under.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    PATH_PREFIX.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

/// Persisted shape of one client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client name (used in node paths).
    pub name: String,

    /// Connection type and address.
    pub connection: ConnectionRecord,

    /// Modbus unit/slave ID (1-247).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Reconnect automatically after connection loss.
    #[serde(default)]
    pub keep_connecting: bool,

    /// Data blocks to poll.
    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
}

fn default_unit_id() -> u8 {
    1
}

/// Connection configuration (TCP, RTU, or simulated).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionRecord {
    /// Modbus TCP connection.
    Tcp {
        /// Host address (IP or hostname).
        host: String,
        /// TCP port (default: 502).
        #[serde(default = "default_modbus_port")]
        port: u16,
        /// Connection timeout in milliseconds.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Modbus RTU (serial) connection.
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1").
        port: String,
        /// Baud rate (default: 9600).
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8).
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none").
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1).
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// In-memory simulated device, for tests and hardware-free runs.
    Sim,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Persisted shape of one data block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block name (used in node paths).
    pub name: String,

    /// Register kind; defaults to invalid (unconfigured).
    #[serde(default)]
    pub kind: RegisterKind,

    /// Start address (-1 = unset).
    #[serde(default = "default_address")]
    pub address: i32,

    /// Element count (0 = unset).
    #[serde(default)]
    pub count: u32,

    /// Sampling period in milliseconds.
    #[serde(default = "default_sampling_ms")]
    pub sampling_ms: u32,

    /// Values decoded from this block.
    #[serde(default)]
    pub values: Vec<ValueRecord>,
}

fn default_address() -> i32 {
    -1
}

fn default_sampling_ms() -> u32 {
    DEFAULT_SAMPLING_MS
}

/// Persisted shape of one value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRecord {
    /// Value name (used in node paths).
    pub name: String,

    /// Scalar type.
    #[serde(rename = "type")]
    pub value_type: ValueType,

    /// Element offset into the block (-1 = unset).
    #[serde(default = "default_offset")]
    pub offset: i32,
}

fn default_offset() -> i32 {
    -1
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::Validation(
                "At least one client must be configured".to_string(),
            ));
        }

        let mut client_names = std::collections::HashSet::new();
        for client in &self.clients {
            if client.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Client name cannot be empty".to_string(),
                ));
            }
            if !client_names.insert(client.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate client name '{}'",
                    client.name
                )));
            }
            if client.unit_id == 0 {
                return Err(ConfigError::Validation(format!(
                    "Client '{}': unit_id must be 1-247",
                    client.name
                )));
            }

            if let ConnectionRecord::Rtu { parity, .. } = &client.connection {
                match parity.to_lowercase().as_str() {
                    "none" | "even" | "odd" => {}
                    _ => {
                        return Err(ConfigError::Validation(format!(
                            "Client '{}': invalid parity '{}' (use none, even, or odd)",
                            client.name, parity
                        )));
                    }
                }
            }

            let mut block_names = std::collections::HashSet::new();
            for block in &client.blocks {
                if block.name.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Client '{}': block name cannot be empty",
                        client.name
                    )));
                }
                if !block_names.insert(block.name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Client '{}': duplicate block name '{}'",
                        client.name, block.name
                    )));
                }
                if block.sampling_ms < MIN_SAMPLING_MS {
                    tracing::warn!(
                        client = %client.name,
                        block = %block.name,
                        sampling_ms = block.sampling_ms,
                        "Sampling period below minimum; will be clamped to {} ms",
                        MIN_SAMPLING_MS
                    );
                }

                let mut value_names = std::collections::HashSet::new();
                for value in &block.values {
                    if value.name.trim().is_empty() {
                        return Err(ConfigError::Validation(format!(
                            "Block '{}': value name cannot be empty",
                            block.name
                        )));
                    }
                    if !value_names.insert(value.name.as_str()) {
                        return Err(ConfigError::Validation(format!(
                            "Block '{}': duplicate value name '{}'",
                            block.name, value.name
                        )));
                    }
                    // Bit types on bit blocks, word types on word blocks.
                    if block.kind != RegisterKind::Invalid
                        && !value.value_type.fits_kind(block.kind)
                    {
                        return Err(ConfigError::Validation(format!(
                            "Block '{}' ({}): value '{}' has type {} which does not fit",
                            block.name,
                            block.kind,
                            value.name,
                            value.value_type
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Build a transport backend for a connection record.
pub fn build_transport(
    connection: &ConnectionRecord,
) -> Result<Box<dyn BusTransport>, TransportError> {
    match connection {
        ConnectionRecord::Tcp {
            host,
            port,
            timeout_ms,
        } => Ok(Box::new(TcpTransport::new(
            host,
            *port,
            Duration::from_millis(*timeout_ms),
        )?)),
        ConnectionRecord::Rtu {
            port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => Ok(Box::new(RtuTransport::new(
            port, *baud_rate, *data_bits, parity, *stop_bits,
        ))),
        ConnectionRecord::Sim => Ok(Box::new(SimTransport::new(SimBank::new()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{
            clients: [
                {
                    name: "plc01",
                    connection: { type: "tcp", host: "192.168.1.10" },
                    blocks: [
                        {
                            name: "meters",
                            kind: "holding",
                            address: 0,
                            count: 10,
                            values: [
                                { name: "voltage", type: "f32", offset: 0 }
                            ]
                        }
                    ]
                }
            ]
        }"#;

        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        let client = &config.clients[0];
        assert_eq!(client.name, "plc01");
        assert_eq!(client.unit_id, 1);
        assert!(!client.keep_connecting);

        let ConnectionRecord::Tcp { host, port, .. } = &client.connection else {
            panic!("Expected TCP connection");
        };
        assert_eq!(host, "192.168.1.10");
        assert_eq!(*port, 502);

        let block = &client.blocks[0];
        assert_eq!(block.kind, RegisterKind::HoldingRegisters);
        assert_eq!(block.sampling_ms, DEFAULT_SAMPLING_MS);
        assert_eq!(block.values[0].value_type, ValueType::Float32);
    }

    #[test]
    fn test_parse_rtu_config() {
        let json = r#"{
            clients: [
                {
                    name: "sensor01",
                    unit_id: 5,
                    connection: {
                        type: "rtu",
                        port: "/dev/ttyUSB0",
                        baud_rate: 19200,
                        parity: "even"
                    }
                }
            ]
        }"#;

        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        let client = &config.clients[0];
        assert_eq!(client.unit_id, 5);
        let ConnectionRecord::Rtu {
            port,
            baud_rate,
            parity,
            ..
        } = &client.connection
        else {
            panic!("Expected RTU connection");
        };
        assert_eq!(port, "/dev/ttyUSB0");
        assert_eq!(*baud_rate, 19200);
        assert_eq!(parity, "even");
    }

    #[test]
    fn test_unconfigured_block_defaults() {
        let json = r#"{
            clients: [
                {
                    name: "plc01",
                    connection: { type: "sim" },
                    blocks: [ { name: "later" } ]
                }
            ]
        }"#;

        let config: BridgeConfig = json5::from_str(json).unwrap();
        config.validate().unwrap();

        let block = &config.clients[0].blocks[0];
        assert_eq!(block.kind, RegisterKind::Invalid);
        assert_eq!(block.address, -1);
        assert_eq!(block.count, 0);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let json = r#"{
            clients: [
                { name: "a", connection: { type: "sim" } },
                { name: "a", connection: { type: "sim" } }
            ]
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());

        let json = r#"{
            clients: [
                {
                    name: "a",
                    connection: { type: "sim" },
                    blocks: [
                        {
                            name: "b",
                            values: [
                                { name: "v", type: "u16" },
                                { name: "v", type: "u16" }
                            ]
                        }
                    ]
                }
            ]
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_type_kind_mismatch() {
        let json = r#"{
            clients: [
                {
                    name: "a",
                    connection: { type: "sim" },
                    blocks: [
                        {
                            name: "flags",
                            kind: "coils",
                            address: 0,
                            count: 8,
                            values: [ { name: "speed", type: "f32", offset: 0 } ]
                        }
                    ]
                }
            ]
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_and_zero_unit() {
        let config: BridgeConfig = json5::from_str(r#"{ clients: [] }"#).unwrap();
        assert!(config.validate().is_err());

        let json = r#"{
            clients: [ { name: "a", unit_id: 0, connection: { type: "sim" } } ]
        }"#;
        let config: BridgeConfig = json5::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
