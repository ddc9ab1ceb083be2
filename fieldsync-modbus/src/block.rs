//! Data blocks: configurable register/coil ranges with a periodic poll
//! loop on the owning client's bus executor.
//!
//! A block's poll loop runs for its whole life. Every tick is a no-op
//! unless the client is connected, the configuration is valid, and no
//! request is in flight; those checks make disconnection, half-finished
//! configuration, and slow devices all observable states rather than
//! errors. Raw data is only ever replaced wholesale by a successful
//! read, so readers never see a torn buffer — a failed read leaves the
//! previous (stale but intact) data in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use fieldsync_common::codec::ValueType;
use fieldsync_common::types::{ClientState, ModbusErrorCode, RegisterKind};
use fieldsync_store::{Change, EngineEvent};

use crate::client::ClientCore;
use crate::error::{EngineError, Result};
use crate::executor::LoopHandle;
use crate::transport::TransportError;
use crate::value::{BlockValue, ValueCore};

/// Floor for the sampling period. Requests below it are clamped and the
/// effective value re-announced.
pub const MIN_SAMPLING_MS: u32 = 50;

/// Sampling period a new block starts with.
pub const DEFAULT_SAMPLING_MS: u32 = 1000;

/// Mutable polling configuration of a block.
#[derive(Debug, Clone)]
pub(crate) struct BlockConfig {
    pub kind: RegisterKind,
    /// Start address; -1 means unset.
    pub address: i32,
    /// Element count; 0 means unset.
    pub count: u32,
    pub sampling_ms: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            kind: RegisterKind::Invalid,
            address: -1,
            count: 0,
            sampling_ms: DEFAULT_SAMPLING_MS,
        }
    }
}

impl BlockConfig {
    /// Request parameters, when the configuration is valid for polling.
    pub fn request_params(&self) -> Option<(RegisterKind, u16, u16)> {
        if self.kind == RegisterKind::Invalid {
            return None;
        }
        let address = u16::try_from(self.address).ok()?;
        let count = u16::try_from(self.count).ok()?;
        if count == 0 {
            return None;
        }
        Some((self.kind, address, count))
    }
}

pub(crate) struct BlockCore {
    pub name: String,
    pub client_name: String,
    pub client: Weak<ClientCore>,
    pub events: tokio::sync::broadcast::Sender<EngineEvent>,
    pub config: RwLock<BlockConfig>,
    pub data: RwLock<Vec<u16>>,
    pub last_error: RwLock<ModbusErrorCode>,
    /// At-most-one-outstanding-read latch.
    pub in_flight: AtomicBool,
    /// Cleared on removal so late completions and stale handles no-op.
    pub alive: AtomicBool,
    pub loop_handle: Mutex<Option<LoopHandle>>,
    pub values: RwLock<HashMap<String, BlockValue>>,
}

impl BlockCore {
    pub(crate) fn new(name: String, client: &Arc<ClientCore>) -> Arc<Self> {
        Arc::new(Self {
            name,
            client_name: client.name.clone(),
            client: Arc::downgrade(client),
            events: client.events.clone(),
            config: RwLock::new(BlockConfig::default()),
            data: RwLock::new(Vec::new()),
            last_error: RwLock::new(ModbusErrorCode::None),
            in_flight: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            loop_handle: Mutex::new(None),
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn publish(&self, change: Change) {
        let _ = self
            .events
            .send(EngineEvent::block(&self.client_name, &self.name, change));
    }

    pub async fn set_last_error(&self, code: ModbusErrorCode) {
        let changed = {
            let mut guard = self.last_error.write().await;
            if *guard != code {
                *guard = code;
                true
            } else {
                false
            }
        };
        if changed {
            self.publish(Change::Error(code));
        }
    }

    /// Apply a completed read. Runs as an executor job.
    pub async fn apply_read(&self, outcome: std::result::Result<Vec<u16>, TransportError>) {
        match outcome {
            Ok(words) => {
                {
                    *self.data.write().await = words.clone();
                }
                self.set_last_error(ModbusErrorCode::None).await;
                self.publish(Change::Data(words.clone()));
                self.refresh_values(&words).await;
            }
            Err(e) => {
                debug!(
                    client = %self.client_name,
                    block = %self.name,
                    error = %e,
                    "Read failed"
                );
                let code = e.code();
                self.set_last_error(code).await;
                if code.is_connection() {
                    if let Some(client) = self.client.upgrade() {
                        client.connection_lost(code).await;
                    }
                }
            }
        }
    }

    /// Re-decode every child value against fresh raw data.
    async fn refresh_values(&self, words: &[u16]) {
        let values: Vec<BlockValue> = self.values.read().await.values().cloned().collect();
        for value in values {
            value.refresh(words).await;
        }
    }

    /// Stop any current loop and start one with the configured period.
    pub async fn restart_loop(core: &Arc<Self>, client: &Arc<ClientCore>) {
        let period = Duration::from_millis(core.config.read().await.sampling_ms as u64);
        let mut guard = core.loop_handle.lock().await;
        if let Some(old) = guard.take() {
            client.executor.stop_loop(old);
        }
        let weak = Arc::downgrade(core);
        let handle = client
            .executor
            .start_loop(period, move || poll_tick(weak.clone()));
        *guard = Some(handle);
    }

    /// Stop the loop and mark the block dead. Called on removal.
    pub async fn shutdown(&self, client: &Arc<ClientCore>) {
        self.alive.store(false, Ordering::Release);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            client.executor.stop_loop(handle);
        }
        let values: Vec<BlockValue> = self.values.write().await.drain().map(|(_, v)| v).collect();
        for value in values {
            value.mark_removed();
        }
        self.publish(Change::Removed);
    }
}

/// One poll-loop tick. Runs as an executor job; every early return is
/// the state machine's idle self-transition, not an error.
async fn poll_tick(weak: Weak<BlockCore>) {
    let Some(core) = weak.upgrade() else { return };
    if !core.alive() {
        return;
    }
    let Some(client) = core.client.upgrade() else { return };

    if core.in_flight.load(Ordering::Acquire) {
        return;
    }
    if client.state() != ClientState::Connected {
        return;
    }
    let params = core.config.read().await.request_params();
    let Some((kind, address, count)) = params else { return };

    let unit = client.unit();
    core.in_flight.store(true, Ordering::Release);
    trace!(
        client = %core.client_name,
        block = %core.name,
        kind = %kind,
        address,
        count,
        "Issuing read"
    );

    // The request is not awaited here: the completion re-enters the
    // executor as its own job, so ticks keep flowing (and no-op on the
    // latch) while the device is slow.
    let pending = client.transport.send_read(unit, kind, address, count);
    let executor = client.executor.clone();
    tokio::spawn(async move {
        let outcome = pending.wait().await;
        executor.submit(async move {
            let Some(core) = weak.upgrade() else { return };
            core.in_flight.store(false, Ordering::Release);
            if !core.alive() {
                // Removed while the request was in flight; discard.
                return;
            }
            core.apply_read(outcome).await;
        });
    });
}

/// Handle to a polled register/coil range under a client.
#[derive(Clone)]
pub struct DataBlock {
    pub(crate) core: Arc<BlockCore>,
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl DataBlock {
    /// Block name, unique within the owning client.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub async fn kind(&self) -> RegisterKind {
        self.core.config.read().await.kind
    }

    pub async fn address(&self) -> i32 {
        self.core.config.read().await.address
    }

    pub async fn count(&self) -> u32 {
        self.core.config.read().await.count
    }

    pub async fn sampling_ms(&self) -> u32 {
        self.core.config.read().await.sampling_ms
    }

    /// Snapshot of the most recently fetched raw data.
    pub async fn data(&self) -> Vec<u16> {
        self.core.data.read().await.clone()
    }

    pub async fn last_error(&self) -> ModbusErrorCode {
        *self.core.last_error.read().await
    }

    /// Change the register kind. Marshaled onto the executor; an
    /// in-flight read still completes under the old interpretation.
    pub fn set_kind(&self, kind: RegisterKind) {
        let Some(client) = self.core.client.upgrade() else { return };
        let core = Arc::clone(&self.core);
        client.executor.submit(async move {
            if !core.alive() {
                return;
            }
            let changed = {
                let mut config = core.config.write().await;
                if config.kind != kind {
                    config.kind = kind;
                    true
                } else {
                    false
                }
            };
            if changed {
                core.publish(Change::Kind(kind));
            }
        });
    }

    /// Change the start address (-1 = unset). Marshaled onto the executor.
    pub fn set_address(&self, address: i32) {
        let Some(client) = self.core.client.upgrade() else { return };
        let core = Arc::clone(&self.core);
        client.executor.submit(async move {
            if !core.alive() {
                return;
            }
            let changed = {
                let mut config = core.config.write().await;
                if config.address != address {
                    config.address = address;
                    true
                } else {
                    false
                }
            };
            if changed {
                core.publish(Change::Address(address));
            }
        });
    }

    /// Change the element count (0 = unset). Marshaled onto the executor.
    pub fn set_count(&self, count: u32) {
        let Some(client) = self.core.client.upgrade() else { return };
        let core = Arc::clone(&self.core);
        client.executor.submit(async move {
            if !core.alive() {
                return;
            }
            let changed = {
                let mut config = core.config.write().await;
                if config.count != count {
                    config.count = count;
                    true
                } else {
                    false
                }
            };
            if changed {
                core.publish(Change::Count(count));
            }
        });
    }

    /// Change the sampling period, clamped to [`MIN_SAMPLING_MS`].
    ///
    /// The effective value is always re-announced (observers see the
    /// clamp, never the rejected value) and the poll loop is fully
    /// stopped and restarted — never adjusted in place.
    pub fn set_sampling_ms(&self, requested: u32) {
        let Some(client) = self.core.client.upgrade() else { return };
        let core = Arc::clone(&self.core);
        client.executor.submit(async move {
            if !core.alive() {
                return;
            }
            let effective = requested.max(MIN_SAMPLING_MS);
            if effective != requested {
                warn!(
                    client = %core.client_name,
                    block = %core.name,
                    requested,
                    effective,
                    "Sampling time below minimum, clamped"
                );
            }
            {
                core.config.write().await.sampling_ms = effective;
            }
            core.publish(Change::SamplingMs(effective));
            if let Some(client) = core.client.upgrade() {
                BlockCore::restart_loop(&core, &client).await;
            }
        });
    }

    /// Write raw elements at the block's start address.
    ///
    /// Gated on a writable kind and a configured address; rejected
    /// writes record [`ModbusErrorCode::Write`] without touching the bus.
    pub fn write(&self, words: Vec<u16>) {
        let Some(client) = self.core.client.upgrade() else { return };
        let core = Arc::clone(&self.core);
        client.executor.submit(async move {
            if !core.alive() {
                return;
            }
            let Some(client) = core.client.upgrade() else { return };
            let (kind, address) = {
                let config = core.config.read().await;
                (config.kind, config.address)
            };
            if !kind.is_writable() {
                core.set_last_error(ModbusErrorCode::Write).await;
                return;
            }
            let Ok(address) = u16::try_from(address) else {
                core.set_last_error(ModbusErrorCode::Write).await;
                return;
            };
            let unit = client.unit();
            let outcome = client
                .transport
                .send_write(unit, kind, address, words)
                .wait()
                .await;
            match outcome {
                Ok(()) => core.set_last_error(ModbusErrorCode::None).await,
                Err(e) => {
                    debug!(
                        client = %core.client_name,
                        block = %core.name,
                        error = %e,
                        "Block write failed"
                    );
                    core.set_last_error(e.code()).await;
                }
            }
        });
    }

    /// Create a value decoding part of this block's raw data.
    pub async fn add_value(
        &self,
        name: &str,
        value_type: ValueType,
        offset: i32,
    ) -> Result<BlockValue> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        let mut values = self.core.values.write().await;
        if values.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        let value = BlockValue {
            core: ValueCore::new(name.to_string(), &self.core, value_type, offset),
        };
        values.insert(name.to_string(), value.clone());
        drop(values);

        value.core.publish(Change::Added);
        value.core.publish(Change::Type(value_type));
        value.core.publish(Change::Offset(offset));
        value.core.publish(Change::Error(ModbusErrorCode::None));

        // Decode immediately against whatever data the block already has.
        let snapshot = self.core.data.read().await.clone();
        value.refresh(&snapshot).await;

        Ok(value)
    }

    /// Destroy a value.
    pub async fn remove_value(&self, name: &str) -> Result<()> {
        let removed = self.core.values.write().await.remove(name);
        match removed {
            Some(value) => {
                value.mark_removed();
                Ok(())
            }
            None => Err(EngineError::ValueNotFound(name.to_string())),
        }
    }

    /// Look up a value by name.
    pub async fn value(&self, name: &str) -> Option<BlockValue> {
        self.core.values.read().await.get(name).cloned()
    }

    /// All values under this block.
    pub async fn values(&self) -> Vec<BlockValue> {
        self.core.values.read().await.values().cloned().collect()
    }
}
