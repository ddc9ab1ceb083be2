//! Change notifications the engine exposes to the projection layer.

use serde::Serialize;

use fieldsync_common::codec::{ScalarValue, ValueType};
use fieldsync_common::types::{ClientState, ModbusErrorCode, RegisterKind};

/// A single engine-side change, addressed to a client, block, or value.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    /// Owning client name.
    pub client: String,
    /// Block name, when the event concerns a block or one of its values.
    pub block: Option<String>,
    /// Value name, when the event concerns a value.
    pub value: Option<String>,
    /// What changed.
    pub change: Change,
}

/// The changed attribute and its new state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    /// Entity created.
    Added,
    /// Entity destroyed.
    Removed,
    /// Client connection state.
    State(ClientState),
    /// Client unit (server) address.
    Unit(u8),
    /// Block register kind.
    Kind(RegisterKind),
    /// Block start address.
    Address(i32),
    /// Block element count.
    Count(u32),
    /// Block effective sampling period in milliseconds.
    SamplingMs(u32),
    /// Block raw data replaced after a successful read.
    Data(Vec<u16>),
    /// Value scalar type.
    Type(ValueType),
    /// Value element offset.
    Offset(i32),
    /// Value decoded from fresh raw data.
    Scalar(ScalarValue),
    /// Last-error code of the addressed entity.
    Error(ModbusErrorCode),
}

impl EngineEvent {
    /// Event addressed to a client.
    pub fn client(client: impl Into<String>, change: Change) -> Self {
        Self {
            client: client.into(),
            block: None,
            value: None,
            change,
        }
    }

    /// Event addressed to a block.
    pub fn block(client: impl Into<String>, block: impl Into<String>, change: Change) -> Self {
        Self {
            client: client.into(),
            block: Some(block.into()),
            value: None,
            change,
        }
    }

    /// Event addressed to a value.
    pub fn value(
        client: impl Into<String>,
        block: impl Into<String>,
        value: impl Into<String>,
        change: Change,
    ) -> Self {
        Self {
            client: client.into(),
            block: Some(block.into()),
            value: Some(value.into()),
            change,
        }
    }
}
