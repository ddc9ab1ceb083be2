//! Client connections: one executor, one transport task, and a block
//! collection per Modbus device endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use fieldsync_common::types::{ClientState, ModbusErrorCode, RegisterKind};
use fieldsync_store::{Change, EngineEvent};

use crate::block::{BlockCore, DEFAULT_SAMPLING_MS, DataBlock};
use crate::config::ConnectionRecord;
use crate::error::{EngineError, Result};
use crate::executor::BusExecutor;
use crate::transport::{BusTransport, TransportHandle};

/// Delay before a keep-connecting client retries after a failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub(crate) struct ClientCore {
    pub name: String,
    pub connection: ConnectionRecord,
    pub unit: AtomicU8,
    pub keep_connecting: AtomicBool,
    /// Set by an explicit disconnect so the reconnect supervisor stands
    /// down.
    pub explicit_close: AtomicBool,
    pub state_tx: watch::Sender<ClientState>,
    pub last_error: RwLock<ModbusErrorCode>,
    pub executor: BusExecutor,
    pub transport: TransportHandle,
    pub blocks: RwLock<HashMap<String, DataBlock>>,
    pub events: broadcast::Sender<EngineEvent>,
}

impl ClientCore {
    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    pub fn unit(&self) -> u8 {
        self.unit.load(Ordering::Relaxed)
    }

    pub fn publish(&self, change: Change) {
        let _ = self.events.send(EngineEvent::client(&self.name, change));
    }

    pub fn set_state(&self, state: ClientState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            info!(client = %self.name, state = %state, "Client state changed");
            self.publish(Change::State(state));
        }
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

    /// A request failed because the connection is gone. Ticks no-op
    /// until the state recovers; the loops themselves keep running.
    pub async fn connection_lost(&self, code: ModbusErrorCode) {
        self.set_last_error(code).await;
        self.set_state(ClientState::Error);
    }

    /// Enqueue a connect attempt on the executor.
    fn submit_connect(core: &Arc<Self>) {
        let core = Arc::clone(core);
        let executor = core.executor.clone();
        executor.submit(async move {
            if matches!(
                core.state(),
                ClientState::Connected | ClientState::Connecting
            ) {
                return;
            }
            core.set_state(ClientState::Connecting);
            match core.transport.send_connect().wait().await {
                Ok(()) => {
                    core.set_last_error(ModbusErrorCode::None).await;
                    core.set_state(ClientState::Connected);
                }
                Err(e) => {
                    warn!(client = %core.name, error = %e, "Connect failed");
                    core.set_last_error(e.code()).await;
                    core.set_state(ClientState::Error);
                }
            }
        });
    }
}

/// Watches for error states and retries while keep-connecting is on.
fn spawn_reconnect(core: &Arc<ClientCore>) {
    let mut state_rx = core.state_tx.subscribe();
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            if state != ClientState::Error {
                continue;
            }
            {
                let Some(core) = weak.upgrade() else { break };
                if !core.keep_connecting.load(Ordering::Relaxed)
                    || core.explicit_close.load(Ordering::Relaxed)
                {
                    continue;
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
            let Some(core) = weak.upgrade() else { break };
            if core.explicit_close.load(Ordering::Relaxed) {
                continue;
            }
            debug!(client = %core.name, "Reconnecting after error");
            ClientCore::submit_connect(&core);
        }
    });
}

/// Handle to one Modbus device connection and its polled blocks.
#[derive(Clone)]
pub struct ModbusClient {
    pub(crate) core: Arc<ClientCore>,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl ModbusClient {
    pub(crate) fn new(
        name: String,
        connection: ConnectionRecord,
        unit: u8,
        keep_connecting: bool,
        transport: Box<dyn BusTransport>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let executor = BusExecutor::spawn(name.clone());
        let transport = TransportHandle::spawn(transport);
        let (state_tx, _) = watch::channel(ClientState::Disconnected);

        let core = Arc::new(ClientCore {
            name,
            connection,
            unit: AtomicU8::new(unit),
            keep_connecting: AtomicBool::new(keep_connecting),
            explicit_close: AtomicBool::new(false),
            state_tx,
            last_error: RwLock::new(ModbusErrorCode::None),
            executor,
            transport,
            blocks: RwLock::new(HashMap::new()),
            events,
        });
        spawn_reconnect(&core);

        Self { core }
    }

    /// Client name, unique within the engine.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        self.core.state()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.core.state_tx.subscribe()
    }

    /// Modbus unit (server) address on the shared bus.
    pub fn unit(&self) -> u8 {
        self.core.unit()
    }

    pub fn set_unit(&self, unit: u8) {
        if self.core.unit.swap(unit, Ordering::Relaxed) != unit {
            self.core.publish(Change::Unit(unit));
        }
    }

    pub fn keep_connecting(&self) -> bool {
        self.core.keep_connecting.load(Ordering::Relaxed)
    }

    pub fn set_keep_connecting(&self, keep: bool) {
        self.core.keep_connecting.store(keep, Ordering::Relaxed);
    }

    pub async fn last_error(&self) -> ModbusErrorCode {
        *self.core.last_error.read().await
    }

    /// Start connecting. Polling starts by itself once the state reaches
    /// `Connected`; no loop needs re-registration.
    pub fn connect(&self) {
        self.core.explicit_close.store(false, Ordering::Relaxed);
        ClientCore::submit_connect(&self.core);
    }

    /// Disconnect. Poll loops keep ticking and no-op until reconnected.
    pub fn disconnect(&self) {
        self.core.explicit_close.store(true, Ordering::Relaxed);
        let core = Arc::clone(&self.core);
        self.core.executor.submit(async move {
            if core.state() == ClientState::Disconnected {
                return;
            }
            core.set_state(ClientState::Closing);
            let _ = core.transport.send_disconnect().wait().await;
            core.set_state(ClientState::Disconnected);
        });
    }

    /// Create a data block. Its poll loop starts immediately and no-ops
    /// until the block is configured and the client connected.
    pub async fn add_block(&self, name: &str) -> Result<DataBlock> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        let mut blocks = self.core.blocks.write().await;
        if blocks.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        let core = BlockCore::new(name.to_string(), &self.core);
        let block = DataBlock { core };
        blocks.insert(name.to_string(), block.clone());
        drop(blocks);

        block.core.publish(Change::Added);
        block.core.publish(Change::Kind(RegisterKind::Invalid));
        block.core.publish(Change::Address(-1));
        block.core.publish(Change::Count(0));
        block.core.publish(Change::SamplingMs(DEFAULT_SAMPLING_MS));
        block.core.publish(Change::Error(ModbusErrorCode::None));

        BlockCore::restart_loop(&block.core, &self.core).await;

        debug!(client = %self.core.name, block = %block.name(), "Block added");
        Ok(block)
    }

    /// Destroy a block: its loop is stopped first, and a read still in
    /// flight is discarded when it completes.
    pub async fn remove_block(&self, name: &str) -> Result<()> {
        let removed = self.core.blocks.write().await.remove(name);
        match removed {
            Some(block) => {
                block.core.shutdown(&self.core).await;
                debug!(client = %self.core.name, block = name, "Block removed");
                Ok(())
            }
            None => Err(EngineError::BlockNotFound(name.to_string())),
        }
    }

    /// Look up a block by name.
    pub async fn block(&self, name: &str) -> Option<DataBlock> {
        self.core.blocks.read().await.get(name).cloned()
    }

    /// All blocks under this client.
    pub async fn blocks(&self) -> Vec<DataBlock> {
        self.core.blocks.read().await.values().cloned().collect()
    }

    /// Wait until every engine operation submitted for this client so
    /// far has been applied on its executor.
    pub async fn drain(&self) {
        self.core.executor.drain().await;
    }

    /// Stop all blocks and disconnect. Called on removal and shutdown.
    pub(crate) async fn teardown(&self) {
        let blocks: Vec<DataBlock> = self
            .core
            .blocks
            .write()
            .await
            .drain()
            .map(|(_, block)| block)
            .collect();
        for block in blocks {
            block.core.shutdown(&self.core).await;
        }
        self.disconnect();
        self.core.executor.drain().await;
    }
}
