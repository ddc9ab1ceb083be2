//! Mirrors engine state into the node store and feeds external edits
//! back into the engine.
//!
//! Outbound: every [`EngineEvent`] becomes a store write under the
//! configured prefix, with write-access flags set on the editable
//! configuration leaves. Inbound: external store writes are parsed back
//! into engine setter calls; the engine remains authoritative, so an
//! edit the engine clamps or rejects is re-announced with the effective
//! state.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use fieldsync_common::nodepath::{NodePathBuilder, ParsedNodePath, attr, parse_node_path};
use fieldsync_common::types::RegisterKind;
use fieldsync_store::{Change, EngineEvent, NodeStore, NodeValue, Origin};

use crate::engine::ModbusEngine;

/// Running mirror between one engine and one node store.
pub struct StoreMirror {
    tasks: Vec<JoinHandle<()>>,
}

impl StoreMirror {
    /// Spawn the outbound and inbound mirror tasks.
    pub fn spawn(
        engine: Arc<ModbusEngine>,
        store: Arc<dyn NodeStore>,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let mut tasks = Vec::new();

        {
            let store = Arc::clone(&store);
            let paths = NodePathBuilder::with_prefix(prefix.clone());
            let mut events = engine.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => mirror_out(&store, &paths, event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Mirror fell behind engine events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Outbound mirror task exited");
            }));
        }

        {
            let mut changes = store.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            if change.origin != Origin::External {
                                continue;
                            }
                            let Some(parsed) = parse_node_path(&prefix, &change.path) else {
                                continue;
                            };
                            apply_external(&engine, parsed, change.value).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Mirror fell behind store changes");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Inbound mirror task exited");
            }));
        }

        Self { tasks }
    }

    /// Stop both mirror tasks.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Push one engine event into the store.
async fn mirror_out(store: &Arc<dyn NodeStore>, paths: &NodePathBuilder, event: EngineEvent) {
    let client = event.client.as_str();
    let set = |path: String, value: NodeValue| async move {
        if let Err(e) = store.set(&path, value, Origin::Engine).await {
            warn!(path = %path, error = %e, "Store write failed");
        }
    };

    match (&event.block, &event.value, event.change) {
        // Client-level changes
        (None, _, Change::Added) => {
            store
                .set_writable(&paths.client_attr(client, attr::UNIT), true)
                .await;
        }
        (None, _, Change::Removed) => store.remove(&paths.client(client)).await,
        (None, _, Change::State(state)) => {
            set(
                paths.client_attr(client, attr::STATE),
                NodeValue::Text(state.as_str().to_string()),
            )
            .await;
        }
        (None, _, Change::Unit(unit)) => {
            set(
                paths.client_attr(client, attr::UNIT),
                NodeValue::UInt(unit.into()),
            )
            .await;
        }
        (None, _, Change::Error(code)) => {
            set(
                paths.client_attr(client, attr::ERROR),
                NodeValue::Text(code.as_str().to_string()),
            )
            .await;
        }

        // Block-level changes
        (Some(block), None, change) => {
            let block = block.as_str();
            match change {
                Change::Added => {
                    for leaf in [attr::KIND, attr::ADDRESS, attr::COUNT, attr::SAMPLING] {
                        store
                            .set_writable(&paths.block_attr(client, block, leaf), true)
                            .await;
                    }
                }
                Change::Removed => store.remove(&paths.block(client, block)).await,
                Change::Kind(kind) => {
                    set(
                        paths.block_attr(client, block, attr::KIND),
                        NodeValue::Text(kind.as_str().to_string()),
                    )
                    .await;
                    // Whole-block writes only make sense on writable kinds.
                    store
                        .set_writable(
                            &paths.block_attr(client, block, attr::DATA),
                            kind.is_writable(),
                        )
                        .await;
                }
                Change::Address(address) => {
                    set(
                        paths.block_attr(client, block, attr::ADDRESS),
                        NodeValue::Int(address.into()),
                    )
                    .await;
                }
                Change::Count(count) => {
                    set(
                        paths.block_attr(client, block, attr::COUNT),
                        NodeValue::UInt(count.into()),
                    )
                    .await;
                }
                Change::SamplingMs(sampling) => {
                    set(
                        paths.block_attr(client, block, attr::SAMPLING),
                        NodeValue::UInt(sampling.into()),
                    )
                    .await;
                }
                Change::Data(words) => {
                    set(
                        paths.block_attr(client, block, attr::DATA),
                        NodeValue::Words(words),
                    )
                    .await;
                }
                Change::Error(code) => {
                    set(
                        paths.block_attr(client, block, attr::ERROR),
                        NodeValue::Text(code.as_str().to_string()),
                    )
                    .await;
                }
                other => trace!(?other, "Unexpected block-level change"),
            }
        }

        // Value-level changes
        (Some(block), Some(value), change) => {
            let block = block.as_str();
            let value = value.as_str();
            match change {
                Change::Added => {
                    for leaf in [attr::TYPE, attr::OFFSET, attr::VALUE] {
                        store
                            .set_writable(&paths.value_attr(client, block, value, leaf), true)
                            .await;
                    }
                }
                Change::Removed => store.remove(&paths.value(client, block, value)).await,
                Change::Type(ty) => {
                    set(
                        paths.value_attr(client, block, value, attr::TYPE),
                        NodeValue::Text(ty.as_str().to_string()),
                    )
                    .await;
                }
                Change::Offset(offset) => {
                    set(
                        paths.value_attr(client, block, value, attr::OFFSET),
                        NodeValue::Int(offset.into()),
                    )
                    .await;
                }
                Change::Scalar(scalar) => {
                    set(
                        paths.value_attr(client, block, value, attr::VALUE),
                        NodeValue::from(scalar),
                    )
                    .await;
                }
                Change::Error(code) => {
                    set(
                        paths.value_attr(client, block, value, attr::ERROR),
                        NodeValue::Text(code.as_str().to_string()),
                    )
                    .await;
                }
                other => trace!(?other, "Unexpected value-level change"),
            }
        }

        (None, _, other) => trace!(?other, "Unexpected client-level change"),
    }
}

/// Apply one external store edit to the engine.
async fn apply_external(engine: &ModbusEngine, parsed: ParsedNodePath<'_>, value: NodeValue) {
    let Some(leaf) = parsed.attr else { return };
    let Some(client) = engine.client(parsed.client).await else {
        return;
    };

    match (parsed.block, parsed.value) {
        (None, _) => {
            if leaf == attr::UNIT {
                match value.as_int().and_then(|v| u8::try_from(v).ok()) {
                    Some(unit) => client.set_unit(unit),
                    None => warn!(client = parsed.client, ?value, "Rejected unit edit"),
                }
            }
        }
        (Some(block_name), None) => {
            let Some(block) = client.block(block_name).await else {
                return;
            };
            match leaf {
                attr::KIND => {
                    match value.as_text().and_then(|s| s.parse::<RegisterKind>().ok()) {
                        Some(kind) => block.set_kind(kind),
                        None => warn!(block = block_name, ?value, "Rejected kind edit"),
                    }
                }
                attr::ADDRESS => match value.as_int().and_then(|v| i32::try_from(v).ok()) {
                    Some(address) => block.set_address(address),
                    None => warn!(block = block_name, ?value, "Rejected address edit"),
                },
                attr::COUNT => match value.as_int().and_then(|v| u32::try_from(v).ok()) {
                    Some(count) => block.set_count(count),
                    None => warn!(block = block_name, ?value, "Rejected count edit"),
                },
                attr::SAMPLING => match value.as_int().and_then(|v| u32::try_from(v).ok()) {
                    Some(sampling) => block.set_sampling_ms(sampling),
                    None => warn!(block = block_name, ?value, "Rejected sampling edit"),
                },
                attr::DATA => match value.as_words() {
                    Some(words) => block.write(words.to_vec()),
                    None => warn!(block = block_name, ?value, "Rejected data write"),
                },
                _ => trace!(block = block_name, leaf, "Ignored block edit"),
            }
        }
        (Some(block_name), Some(value_name)) => {
            let Some(block) = client.block(block_name).await else {
                return;
            };
            let Some(target) = block.value(value_name).await else {
                return;
            };
            match leaf {
                attr::TYPE => {
                    match value
                        .as_text()
                        .and_then(|s| s.parse::<fieldsync_common::codec::ValueType>().ok())
                    {
                        Some(ty) => target.set_type(ty),
                        None => warn!(value = value_name, "Rejected type edit"),
                    }
                }
                attr::OFFSET => match value.as_int().and_then(|v| i32::try_from(v).ok()) {
                    Some(offset) => target.set_offset(offset),
                    None => warn!(value = value_name, "Rejected offset edit"),
                },
                attr::VALUE => {
                    let ty = target.value_type().await;
                    match value.to_scalar(ty) {
                        Some(scalar) => target.write(scalar),
                        None => {
                            warn!(value = value_name, ?value, ty = %ty, "Rejected value write")
                        }
                    }
                }
                _ => trace!(value = value_name, leaf, "Ignored value edit"),
            }
        }
    }
}
