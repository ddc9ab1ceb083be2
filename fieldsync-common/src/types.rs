use serde::{Deserialize, Serialize};

/// Modbus register table a data block polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Discrete output coils (read/write, 1-bit).
    Coils,
    /// Discrete input contacts (read-only, 1-bit).
    #[serde(rename = "discrete")]
    DiscreteInputs,
    /// Input registers (read-only, 16-bit).
    #[serde(rename = "input")]
    InputRegisters,
    /// Holding registers (read/write, 16-bit).
    #[serde(rename = "holding")]
    HoldingRegisters,
    /// Not yet configured; blocks with this kind are never polled.
    #[default]
    Invalid,
}

impl RegisterKind {
    /// String name used in configuration and node paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Coils => "coils",
            RegisterKind::DiscreteInputs => "discrete",
            RegisterKind::InputRegisters => "input",
            RegisterKind::HoldingRegisters => "holding",
            RegisterKind::Invalid => "invalid",
        }
    }

    /// Whether the Modbus protocol allows writing to this table.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coils | RegisterKind::HoldingRegisters)
    }

    /// Whether elements of this table are single bits rather than 16-bit words.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coils | RegisterKind::DiscreteInputs)
    }
}

impl std::str::FromStr for RegisterKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coils" => Ok(RegisterKind::Coils),
            "discrete" => Ok(RegisterKind::DiscreteInputs),
            "input" => Ok(RegisterKind::InputRegisters),
            "holding" => Ok(RegisterKind::HoldingRegisters),
            "invalid" => Ok(RegisterKind::Invalid),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connectivity of a client's transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Error,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Closing => "closing",
            ClientState::Error => "error",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last-error code recorded on clients, blocks, and values.
///
/// A non-`None` code never stops a poll loop; it is an observable state
/// cleared by the next successful operation on the same entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusErrorCode {
    /// No error.
    #[default]
    None,
    /// Transport could not be reached or dropped the connection.
    Connection,
    /// Request timed out (reported by the transport library).
    Timeout,
    /// Protocol-level failure (exception response, framing).
    Protocol,
    /// Read request failed.
    Read,
    /// Write request failed or was rejected.
    Write,
    /// Decode target lies outside the block's current raw data.
    Unreadable,
    /// Anything the transport could not classify.
    Unknown,
}

impl ModbusErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModbusErrorCode::None => "none",
            ModbusErrorCode::Connection => "connection",
            ModbusErrorCode::Timeout => "timeout",
            ModbusErrorCode::Protocol => "protocol",
            ModbusErrorCode::Read => "read",
            ModbusErrorCode::Write => "write",
            ModbusErrorCode::Unreadable => "unreadable",
            ModbusErrorCode::Unknown => "unknown",
        }
    }

    /// Whether this code indicates the connection itself is gone.
    pub fn is_connection(&self) -> bool {
        matches!(self, ModbusErrorCode::Connection)
    }
}

impl std::fmt::Display for ModbusErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
