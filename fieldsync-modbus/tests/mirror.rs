//! Engine ↔ node-store mirroring tests.

use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::codec::ValueType;
use fieldsync_common::types::RegisterKind;
use fieldsync_modbus::config::{ClientRecord, ConnectionRecord};
use fieldsync_modbus::engine::ModbusEngine;
use fieldsync_modbus::projection::StoreMirror;
use fieldsync_modbus::transport::{SimBank, SimTransport};
use fieldsync_store::{MemoryStore, NodeStore, NodeValue, Origin};

fn sim_record(name: &str) -> ClientRecord {
    ClientRecord {
        name: name.to_string(),
        connection: ConnectionRecord::Sim,
        unit_id: 1,
        keep_connecting: false,
        blocks: Vec::new(),
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn test_engine_state_mirrors_into_store() {
    let engine = Arc::new(ModbusEngine::new());
    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::default());
    let _mirror = StoreMirror::spawn(Arc::clone(&engine), Arc::clone(&store), "plant");

    let bank = SimBank::new();
    bank.load(RegisterKind::HoldingRegisters, 0, &[0x4049, 0x0FDB]);
    let client = engine
        .add_client_with_transport(&sim_record("plc01"), Box::new(SimTransport::new(bank)))
        .await
        .unwrap();

    client.connect();
    let block = client.add_block("meters").await.unwrap();
    block
        .add_value("pi", ValueType::Float32, 0)
        .await
        .unwrap();
    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(0);
    block.set_count(2);
    block.set_sampling_ms(50);

    // Connection state, configuration, raw data, and the decoded value
    // all land in the store.
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get("plant/plc01/@/state").await
                    == Some(NodeValue::Text("connected".to_string()))
            }
        })
        .await
    );
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get("plant/plc01/meters/@/data").await
                    == Some(NodeValue::Words(vec![0x4049, 0x0FDB]))
            }
        })
        .await
    );
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                match store.get("plant/plc01/meters/pi/@/value").await {
                    Some(NodeValue::Float(v)) => (v - std::f64::consts::PI).abs() < 1e-3,
                    _ => false,
                }
            }
        })
        .await
    );

    assert_eq!(
        store.get("plant/plc01/meters/@/kind").await,
        Some(NodeValue::Text("holding".to_string()))
    );
    assert!(store.writable("plant/plc01/meters/@/address").await);
    assert!(store.writable("plant/plc01/meters/@/data").await);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_external_edit_feeds_back_and_clamp_is_visible() {
    let engine = Arc::new(ModbusEngine::new());
    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::default());
    let _mirror = StoreMirror::spawn(Arc::clone(&engine), Arc::clone(&store), "plant");

    let client = engine
        .add_client_with_transport(
            &sim_record("plc01"),
            Box::new(SimTransport::new(SimBank::new())),
        )
        .await
        .unwrap();
    let block = client.add_block("meters").await.unwrap();

    // Wait for the sampling leaf to exist, then edit it below the
    // minimum from the outside.
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get("plant/plc01/meters/@/sampling").await
                    == Some(NodeValue::UInt(1000))
            }
        })
        .await
    );
    store
        .set(
            "plant/plc01/meters/@/sampling",
            NodeValue::UInt(10),
            Origin::External,
        )
        .await
        .unwrap();

    // The engine clamps and re-announces; the store converges on the
    // effective value, not the rejected one.
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get("plant/plc01/meters/@/sampling").await == Some(NodeValue::UInt(50))
            }
        })
        .await
    );
    assert_eq!(block.sampling_ms().await, 50);

    // Removing the block prunes its subtree from the store.
    client.remove_block("meters").await.unwrap();
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move { store.get("plant/plc01/meters/@/kind").await.is_none() }
        })
        .await
    );

    engine.shutdown().await;
}
