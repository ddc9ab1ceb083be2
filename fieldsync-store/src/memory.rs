//! In-memory node store used by tests and store-less deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};

use crate::error::{Result, StoreError};
use crate::node::{ChangeEvent, NodeStore, NodeValue, Origin};

#[derive(Debug, Clone)]
struct NodeEntry {
    value: NodeValue,
    writable: bool,
}

/// HashMap-backed [`NodeStore`] implementation.
///
/// Paths are flat keys; subtree removal strips every key under the
/// removed node. Change notifications fan out on a broadcast channel and
/// are dropped silently when nobody subscribes.
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, NodeEntry>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Create a store with the given notification buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            nodes: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Number of leaves currently stored.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether the store holds no leaves.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    fn notify(&self, path: &str, value: NodeValue, origin: Origin) {
        let _ = self.events.send(ChangeEvent {
            path: path.to_string(),
            value,
            origin,
            timestamp: Utc::now(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn set(&self, path: &str, value: NodeValue, origin: Origin) -> Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            match origin {
                Origin::Engine => {
                    let entry = nodes.entry(path.to_string()).or_insert(NodeEntry {
                        value: value.clone(),
                        writable: false,
                    });
                    entry.value = value.clone();
                }
                Origin::External => {
                    let entry = nodes.get_mut(path).ok_or_else(|| StoreError::NotFound {
                        path: path.to_string(),
                    })?;
                    if !entry.writable {
                        return Err(StoreError::NotWritable {
                            path: path.to_string(),
                        });
                    }
                    entry.value = value.clone();
                }
            }
        }
        self.notify(path, value, origin);
        Ok(())
    }

    async fn get(&self, path: &str) -> Option<NodeValue> {
        self.nodes.read().await.get(path).map(|e| e.value.clone())
    }

    async fn set_writable(&self, path: &str, writable: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.get_mut(path) {
            entry.writable = writable;
        } else {
            // Flag set ahead of the first engine write; remember it.
            nodes.insert(
                path.to_string(),
                NodeEntry {
                    value: NodeValue::Text(String::new()),
                    writable,
                },
            );
        }
    }

    async fn writable(&self, path: &str) -> bool {
        self.nodes
            .read()
            .await
            .get(path)
            .map(|e| e.writable)
            .unwrap_or(false)
    }

    async fn remove(&self, path: &str) {
        let prefix = format!("{}/", path);
        let mut nodes = self.nodes.write().await;
        nodes.retain(|key, _| key.as_str() != path && !key.starts_with(&prefix));
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_set_creates_nodes() {
        let store = MemoryStore::default();
        store
            .set("fieldsync/plc01/@/state", NodeValue::Text("connected".into()), Origin::Engine)
            .await
            .unwrap();

        assert_eq!(
            store.get("fieldsync/plc01/@/state").await,
            Some(NodeValue::Text("connected".into()))
        );
    }

    #[tokio::test]
    async fn test_external_write_gated() {
        let store = MemoryStore::default();
        let path = "fieldsync/plc01/blk/@/address";

        // Missing node
        let err = store
            .set(path, NodeValue::Int(3), Origin::External)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        // Present but read-only
        store
            .set(path, NodeValue::Int(-1), Origin::Engine)
            .await
            .unwrap();
        let err = store
            .set(path, NodeValue::Int(3), Origin::External)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotWritable { .. }));

        // Writable
        store.set_writable(path, true).await;
        store
            .set(path, NodeValue::Int(3), Origin::External)
            .await
            .unwrap();
        assert_eq!(store.get(path).await, Some(NodeValue::Int(3)));
    }

    #[tokio::test]
    async fn test_subscribe_sees_origin() {
        let store = MemoryStore::default();
        let mut rx = store.subscribe();

        store
            .set("fieldsync/p/@/unit", NodeValue::UInt(1), Origin::Engine)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, "fieldsync/p/@/unit");
        assert_eq!(event.origin, Origin::Engine);
        assert_eq!(event.value, NodeValue::UInt(1));
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let store = MemoryStore::default();
        for path in [
            "fieldsync/p/blk/@/kind",
            "fieldsync/p/blk/v1/@/value",
            "fieldsync/p/other/@/kind",
        ] {
            store
                .set(path, NodeValue::Int(0), Origin::Engine)
                .await
                .unwrap();
        }

        store.remove("fieldsync/p/blk").await;

        assert!(store.get("fieldsync/p/blk/@/kind").await.is_none());
        assert!(store.get("fieldsync/p/blk/v1/@/value").await.is_none());
        assert!(store.get("fieldsync/p/other/@/kind").await.is_some());
    }
}
