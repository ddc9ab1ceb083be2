//! End-to-end engine tests against the simulated transport.

use std::time::Duration;

use fieldsync_common::codec::{ScalarValue, ValueType};
use fieldsync_common::types::{ClientState, ModbusErrorCode, RegisterKind};
use fieldsync_modbus::config::{ClientRecord, ConnectionRecord};
use fieldsync_modbus::engine::ModbusEngine;
use fieldsync_modbus::transport::{SimBank, SimTransport};
use fieldsync_modbus::{ModbusClient, EngineError};
use fieldsync_store::Change;

fn sim_record(name: &str) -> ClientRecord {
    ClientRecord {
        name: name.to_string(),
        connection: ConnectionRecord::Sim,
        unit_id: 1,
        keep_connecting: false,
        blocks: Vec::new(),
    }
}

struct Rig {
    engine: ModbusEngine,
    client: ModbusClient,
    bank: SimBank,
    probe: fieldsync_modbus::SimProbe,
}

async fn rig(latency: Duration) -> Rig {
    let engine = ModbusEngine::new();
    let bank = SimBank::new();
    let transport = SimTransport::new(bank.clone()).with_latency(latency);
    let probe = transport.probe();
    let client = engine
        .add_client_with_transport(&sim_record("plc01"), Box::new(transport))
        .await
        .unwrap();
    Rig {
        engine,
        client,
        bank,
        probe,
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_fetches_and_decodes() {
    let rig = rig(Duration::ZERO).await;
    rig.bank
        .load(RegisterKind::HoldingRegisters, 10, &[0x0001, 0x0002, 0x0003, 0x0004]);

    rig.client.connect();
    let block = rig.client.add_block("meters").await.unwrap();
    let value = block.add_value("pair", ValueType::Int32, 1).await.unwrap();

    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(10);
    block.set_count(4);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.client.drain().await;

    assert_eq!(rig.client.state(), ClientState::Connected);
    assert_eq!(block.data().await, vec![0x0001, 0x0002, 0x0003, 0x0004]);
    assert_eq!(block.last_error().await, ModbusErrorCode::None);
    // Word order: most-significant word first.
    assert_eq!(value.value().await.unwrap(), ScalarValue::Int32(0x0002_0003));

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_with_slow_device() {
    // Device takes 4x the sampling period to answer; ticks must no-op
    // while the request is in flight instead of piling up requests.
    let rig = rig(Duration::from_millis(200)).await;
    rig.bank.load(RegisterKind::InputRegisters, 0, &[5, 6]);

    rig.client.connect();
    let block = rig.client.add_block("slow").await.unwrap();
    block.set_kind(RegisterKind::InputRegisters);
    block.set_address(0);
    block.set_count(2);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    rig.client.drain().await;

    assert_eq!(rig.probe.max_in_flight(), 1);
    // Roughly one read per 200 ms of device latency, not one per tick.
    let reads = rig.probe.total_reads();
    assert!((3..=7).contains(&reads), "unexpected read count {reads}");
    assert_eq!(block.data().await, vec![5, 6]);

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_pauses_polling_and_reconnect_resumes() {
    let rig = rig(Duration::ZERO).await;
    rig.bank.load(RegisterKind::HoldingRegisters, 0, &[7]);

    rig.client.connect();
    let block = rig.client.add_block("blk").await.unwrap();
    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(0);
    block.set_count(1);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(block.data().await, vec![7]);

    rig.client.disconnect();
    rig.client.drain().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.client.state(), ClientState::Disconnected);

    // Device data changes while we are away; no request must be sent.
    rig.bank.load(RegisterKind::HoldingRegisters, 0, &[9]);
    let reads_while_down = rig.probe.total_reads();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.probe.total_reads(), reads_while_down);
    assert_eq!(block.data().await, vec![7], "raw data must stay stale");

    // Reconnect: polling resumes without re-registering the loop.
    rig.client.connect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(block.data().await, vec![9]);

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remove_block_discards_late_result() {
    let rig = rig(Duration::from_millis(300)).await;
    rig.bank.load(RegisterKind::HoldingRegisters, 0, &[1, 2]);

    rig.client.connect();
    let block = rig.client.add_block("doomed").await.unwrap();
    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(0);
    block.set_count(2);
    block.set_sampling_ms(50);

    // Let the first read get airborne, then destroy the block under it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(rig.probe.max_in_flight(), 1);
    assert_eq!(rig.probe.total_reads(), 0, "read should still be in flight");

    let mut events = rig.engine.subscribe();
    rig.client.remove_block("doomed").await.unwrap();

    // The in-flight request completes eventually; its result must be
    // silently discarded, not applied to the removed block.
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.client.drain().await;

    assert_eq!(rig.probe.total_reads(), 1);
    assert!(block.data().await.is_empty(), "late result must be dropped");
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event.change, Change::Data(_)),
            "no data event may follow removal"
        );
    }

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_while_in_flight() {
    let rig = rig(Duration::from_millis(200)).await;
    rig.bank
        .load(RegisterKind::HoldingRegisters, 0, &[1, 2, 3, 4]);
    rig.bank.load(RegisterKind::HoldingRegisters, 5, &[50, 60]);

    rig.client.connect();
    let block = rig.client.add_block("blk").await.unwrap();
    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(0);
    block.set_count(4);
    block.set_sampling_ms(50);

    // First read departs with (0, 4); reconfigure during its flight.
    tokio::time::sleep(Duration::from_millis(60)).await;
    block.set_address(5);
    block.set_count(2);

    // The in-flight request still completes with its original window.
    tokio::time::sleep(Duration::from_millis(160)).await;
    assert_eq!(block.data().await, vec![1, 2, 3, 4]);

    // The very next tick uses the new configuration.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(block.data().await, vec![50, 60]);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn test_sampling_time_clamped_and_reannounced() {
    let rig = rig(Duration::ZERO).await;
    let block = rig.client.add_block("blk").await.unwrap();

    let mut events = rig.engine.subscribe();
    block.set_sampling_ms(10);
    rig.client.drain().await;

    assert_eq!(block.sampling_ms().await, 50);

    let mut announced = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.block.as_deref() == Some("blk") {
            if let Change::SamplingMs(ms) = event.change {
                announced.push(ms);
            }
        }
    }
    assert_eq!(announced, vec![50], "the clamped value must be announced");

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_keeps_stale_data_and_loop_running() {
    let rig = rig(Duration::ZERO).await;
    rig.bank.load(RegisterKind::InputRegisters, 0, &[11, 12]);

    let engine = &rig.engine;
    let transport_fail = {
        // Re-create the rig transport's failure switch through a second
        // client: the shared bank keeps both devices identical.
        let transport = SimTransport::new(rig.bank.clone());
        let flag = transport.fail_flag();
        engine
            .add_client_with_transport(&sim_record("flaky"), Box::new(transport))
            .await
            .unwrap();
        flag
    };
    let client = engine.client("flaky").await.unwrap();

    client.connect();
    let block = client.add_block("blk").await.unwrap();
    block.set_kind(RegisterKind::InputRegisters);
    block.set_address(0);
    block.set_count(2);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(block.data().await, vec![11, 12]);

    // Reads start failing: last error set, stale data preserved.
    transport_fail.store(true, std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(block.last_error().await, ModbusErrorCode::Read);
    assert_eq!(block.data().await, vec![11, 12]);

    // Recovery clears the error without any re-registration.
    transport_fail.store(false, std::sync::atomic::Ordering::SeqCst);
    rig.bank.load(RegisterKind::InputRegisters, 0, &[13, 14]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(block.last_error().await, ModbusErrorCode::None);
    assert_eq!(block.data().await, vec![13, 14]);

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_value_unreadable_outside_raw_data() {
    let rig = rig(Duration::ZERO).await;
    rig.bank.load(RegisterKind::HoldingRegisters, 0, &[1, 2]);

    rig.client.connect();
    let block = rig.client.add_block("blk").await.unwrap();
    let inside = block.add_value("inside", ValueType::UInt16, 0).await.unwrap();
    let outside = block.add_value("outside", ValueType::UInt32, 1).await.unwrap();

    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(0);
    block.set_count(2);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.client.drain().await;

    assert_eq!(inside.value().await.unwrap(), ScalarValue::UInt16(1));
    assert_eq!(inside.last_error().await, ModbusErrorCode::None);

    // offset 1 + footprint 2 > len 2: unreadable, not destroyed.
    assert!(outside.value().await.is_err());
    assert_eq!(outside.last_error().await, ModbusErrorCode::Unreadable);

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_value_write_round_trips_through_device() {
    let rig = rig(Duration::ZERO).await;

    rig.client.connect();
    let block = rig.client.add_block("blk").await.unwrap();
    let value = block
        .add_value("setpoint", ValueType::UInt32, 2)
        .await
        .unwrap();

    block.set_kind(RegisterKind::HoldingRegisters);
    block.set_address(100);
    block.set_count(4);
    block.set_sampling_ms(50);

    value.write(ScalarValue::UInt32(0x0002_0003));
    rig.client.drain().await;

    // The write landed at block address + offset, big-endian words.
    assert_eq!(rig.bank.get(RegisterKind::HoldingRegisters, 102), 0x0002);
    assert_eq!(rig.bank.get(RegisterKind::HoldingRegisters, 103), 0x0003);
    assert_eq!(value.last_error().await, ModbusErrorCode::None);

    // The next poll decodes what was written.
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.client.drain().await;
    assert_eq!(value.value().await.unwrap(), ScalarValue::UInt32(0x0002_0003));

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn test_write_rejected_on_read_only_kind() {
    // Deliberately never connected: the rejection is local.
    let rig = rig(Duration::ZERO).await;

    let block = rig.client.add_block("blk").await.unwrap();
    let value = block.add_value("ro", ValueType::UInt16, 0).await.unwrap();

    block.set_kind(RegisterKind::InputRegisters);
    block.set_address(0);
    block.set_count(2);

    value.write(ScalarValue::UInt16(1));
    rig.client.drain().await;

    // Rejected locally; the bus was never touched.
    assert_eq!(value.last_error().await, ModbusErrorCode::Write);
    assert_eq!(rig.probe.total_reads(), 0);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_names_rejected() {
    let rig = rig(Duration::ZERO).await;

    let block = rig.client.add_block("blk").await.unwrap();
    let err = rig.client.add_block("blk").await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));
    assert_eq!(rig.client.blocks().await.len(), 1);

    block
        .add_value("v", ValueType::UInt16, 0)
        .await
        .unwrap();
    let err = block
        .add_value("v", ValueType::UInt16, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));
    assert_eq!(block.values().await.len(), 1);

    let err = rig
        .engine
        .add_client(&sim_record("plc01"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(_)));

    let err = rig.client.add_block("  ").await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyName));

    rig.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_coil_block_bit_values() {
    let rig = rig(Duration::ZERO).await;
    rig.bank.load(RegisterKind::Coils, 0, &[0, 1, 0, 1]);

    rig.client.connect();
    let block = rig.client.add_block("flags").await.unwrap();
    let flag = block.add_value("pump", ValueType::Bool, 3).await.unwrap();

    block.set_kind(RegisterKind::Coils);
    block.set_address(0);
    block.set_count(4);
    block.set_sampling_ms(50);

    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.client.drain().await;

    assert_eq!(flag.value().await.unwrap(), ScalarValue::Bool(true));

    // Writing a coil flips exactly its own bit.
    flag.write(ScalarValue::Bool(false));
    rig.client.drain().await;
    assert_eq!(rig.bank.get(RegisterKind::Coils, 3), 0);
    assert_eq!(rig.bank.get(RegisterKind::Coils, 1), 1);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn test_export_round_trips_records() {
    let engine = ModbusEngine::new();
    let mut record = sim_record("plc01");
    record.unit_id = 9;
    record.blocks = vec![fieldsync_modbus::BlockRecord {
        name: "meters".to_string(),
        kind: RegisterKind::HoldingRegisters,
        address: 20,
        count: 6,
        sampling_ms: 500,
        values: vec![fieldsync_modbus::ValueRecord {
            name: "flow".to_string(),
            value_type: ValueType::Float32,
            offset: 4,
        }],
    }];

    let client = engine.add_client(&record).await.unwrap();
    client.drain().await;

    let exported = engine.export().await;
    assert_eq!(exported.len(), 1);
    let client_record = &exported[0];
    assert_eq!(client_record.name, "plc01");
    assert_eq!(client_record.unit_id, 9);
    assert_eq!(client_record.blocks.len(), 1);

    let block_record = &client_record.blocks[0];
    assert_eq!(block_record.kind, RegisterKind::HoldingRegisters);
    assert_eq!(block_record.address, 20);
    assert_eq!(block_record.count, 6);
    assert_eq!(block_record.sampling_ms, 500);
    assert_eq!(block_record.values[0].value_type, ValueType::Float32);
    assert_eq!(block_record.values[0].offset, 4);

    // Importing on top of the same engine overwrites, not duplicates.
    engine.apply_records(&exported).await.unwrap();
    assert_eq!(engine.clients().await.len(), 1);
    assert_eq!(client.blocks().await.len(), 1);

    engine.shutdown().await;
}
