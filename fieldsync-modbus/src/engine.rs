//! Engine root: the client collection and the outward event stream.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::info;

use fieldsync_common::types::{ClientState, ModbusErrorCode};
use fieldsync_store::{Change, EngineEvent};

use crate::block::DataBlock;
use crate::client::ModbusClient;
use crate::config::{BlockRecord, ClientRecord, ValueRecord, build_transport};
use crate::error::{EngineError, Result};
use crate::transport::BusTransport;

/// The synchronization engine: clients, their polled blocks, and a
/// broadcast stream of every change the projection layer mirrors out.
pub struct ModbusEngine {
    events: broadcast::Sender<EngineEvent>,
    clients: RwLock<HashMap<String, ModbusClient>>,
}

impl ModbusEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            events,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to engine change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Create a client from a configuration record, including its blocks
    /// and values. The client starts disconnected.
    pub async fn add_client(&self, record: &ClientRecord) -> Result<ModbusClient> {
        let transport = build_transport(&record.connection)?;
        let client = self
            .add_client_with_transport(record, transport)
            .await?;
        apply_block_records(&client, &record.blocks).await?;
        Ok(client)
    }

    /// Create a client around an externally built transport backend.
    ///
    /// Block/value records on the passed record are ignored here; use
    /// [`ModbusEngine::add_client`] for full construction.
    pub async fn add_client_with_transport(
        &self,
        record: &ClientRecord,
        transport: Box<dyn BusTransport>,
    ) -> Result<ModbusClient> {
        let name = record.name.trim();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        let mut clients = self.clients.write().await;
        if clients.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        let client = ModbusClient::new(
            name.to_string(),
            record.connection.clone(),
            record.unit_id,
            record.keep_connecting,
            transport,
            self.events.clone(),
        );
        clients.insert(name.to_string(), client.clone());
        drop(clients);

        client.core.publish(Change::Added);
        client.core.publish(Change::State(ClientState::Disconnected));
        client.core.publish(Change::Unit(record.unit_id));
        client.core.publish(Change::Error(ModbusErrorCode::None));

        info!(client = name, "Client added");
        Ok(client)
    }

    /// Destroy a client: every block loop is stopped, in-flight results
    /// are discarded, and the transport disconnects.
    pub async fn remove_client(&self, name: &str) -> Result<()> {
        let removed = self.clients.write().await.remove(name);
        match removed {
            Some(client) => {
                client.teardown().await;
                client.core.publish(Change::Removed);
                info!(client = name, "Client removed");
                Ok(())
            }
            None => Err(EngineError::ClientNotFound(name.to_string())),
        }
    }

    /// Look up a client by name.
    pub async fn client(&self, name: &str) -> Option<ModbusClient> {
        self.clients.read().await.get(name).cloned()
    }

    /// All clients.
    pub async fn clients(&self) -> Vec<ModbusClient> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Import records: existing same-name entities are overwritten,
    /// missing ones created.
    pub async fn apply_records(&self, records: &[ClientRecord]) -> Result<()> {
        for record in records {
            match self.client(record.name.trim()).await {
                Some(client) => {
                    client.set_unit(record.unit_id);
                    client.set_keep_connecting(record.keep_connecting);
                    apply_block_records(&client, &record.blocks).await?;
                }
                None => {
                    self.add_client(record).await?;
                }
            }
        }
        Ok(())
    }

    /// Export the current configuration as a record tree.
    pub async fn export(&self) -> Vec<ClientRecord> {
        let clients = self.clients().await;
        let mut records = Vec::with_capacity(clients.len());
        for client in clients {
            let mut blocks = Vec::new();
            for block in client.blocks().await {
                blocks.push(BlockRecord {
                    name: block.name().to_string(),
                    kind: block.kind().await,
                    address: block.address().await,
                    count: block.count().await,
                    sampling_ms: block.sampling_ms().await,
                    values: export_values(&block).await,
                });
            }
            blocks.sort_by(|a, b| a.name.cmp(&b.name));
            records.push(ClientRecord {
                name: client.name().to_string(),
                connection: client.core.connection.clone(),
                unit_id: client.unit(),
                keep_connecting: client.keep_connecting(),
                blocks,
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Tear every client down without removing it. Used at shutdown.
    pub async fn shutdown(&self) {
        for client in self.clients().await {
            client.teardown().await;
        }
    }
}

impl Default for ModbusEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn export_values(block: &DataBlock) -> Vec<ValueRecord> {
    let mut records = Vec::new();
    for value in block.values().await {
        records.push(ValueRecord {
            name: value.name().to_string(),
            value_type: value.value_type().await,
            offset: value.offset().await,
        });
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}

async fn apply_block_records(client: &ModbusClient, records: &[BlockRecord]) -> Result<()> {
    for record in records {
        let block = match client.block(record.name.trim()).await {
            Some(block) => block,
            None => client.add_block(&record.name).await?,
        };
        block.set_kind(record.kind);
        block.set_address(record.address);
        block.set_count(record.count);
        block.set_sampling_ms(record.sampling_ms);

        for value_record in &record.values {
            match block.value(value_record.name.trim()).await {
                Some(value) => {
                    value.set_type(value_record.value_type);
                    value.set_offset(value_record.offset);
                }
                None => {
                    block
                        .add_value(
                            &value_record.name,
                            value_record.value_type,
                            value_record.offset,
                        )
                        .await?;
                }
            }
        }
    }
    Ok(())
}
