//! FieldSync Modbus engine.
//!
//! Polls Modbus devices (TCP, RTU/serial, or simulated) on per-block
//! schedules and synchronizes the decoded values into a hierarchical
//! node store.
//!
//! # Node paths
//!
//! ```text
//! fieldsync/<client>/@/<attr>
//! fieldsync/<client>/<block>/@/<attr>
//! fieldsync/<client>/<block>/<value>/@/<attr>
//! ```
//!
//! # Architecture
//!
//! One [`executor::BusExecutor`] per client serializes every operation
//! that touches that connection; one transport task owns the wire. Each
//! [`block::DataBlock`] registers a periodic loop on its client's
//! executor and keeps at most one read in flight; [`value::BlockValue`]s
//! re-decode from the block's raw data whenever it changes.

pub mod block;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod projection;
pub mod transport;
pub mod value;

pub use block::{DEFAULT_SAMPLING_MS, DataBlock, MIN_SAMPLING_MS};
pub use client::ModbusClient;
pub use config::{BlockRecord, BridgeConfig, ClientRecord, ConnectionRecord, ValueRecord};
pub use engine::ModbusEngine;
pub use error::EngineError;
pub use executor::{BusExecutor, LoopHandle};
pub use projection::StoreMirror;
pub use transport::{
    BusTransport, PendingReply, RtuTransport, SimBank, SimProbe, SimTransport, TcpTransport,
    TransportError, TransportHandle,
};
pub use value::BlockValue;
