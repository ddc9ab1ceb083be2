//! FieldSync Modbus bridge.
//!
//! Polls Modbus devices and synchronizes decoded values into a node
//! store, applying external edits from the store back onto the bus.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fieldsync_common::config::LoggingConfig;
use fieldsync_modbus::config::BridgeConfig;
use fieldsync_modbus::engine::ModbusEngine;
use fieldsync_modbus::projection::StoreMirror;
use fieldsync_store::{MemoryStore, NodeStore};

/// FieldSync bridge for Modbus devices (TCP/RTU).
#[derive(Parser, Debug)]
#[command(name = "fieldsync-modbus")]
#[command(about = "Polls Modbus devices and synchronizes them into a node store")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "fieldsync.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Print the normalized configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldsync_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldsync-modbus");
    info!("Loaded configuration from {:?}", args.config);

    // Build the engine from the configured record tree.
    let engine = Arc::new(ModbusEngine::new());
    for record in &config.clients {
        engine
            .add_client(record)
            .await
            .with_context(|| format!("Failed to create client '{}'", record.name))?;
    }

    if args.dump_config {
        let records = engine.export().await;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    // Mirror the engine into an in-process node store.
    let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::default());
    let mirror = StoreMirror::spawn(
        Arc::clone(&engine),
        Arc::clone(&store),
        config.store.prefix.clone(),
    );

    // Start connecting; polling begins as each client reaches Connected.
    for client in engine.clients().await {
        info!(client = %client.name(), "Connecting");
        client.connect();
    }

    info!(
        clients = config.clients.len(),
        prefix = %config.store.prefix,
        "Bridge running. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    engine.shutdown().await;
    mirror.shutdown();
    info!("Bridge stopped");

    Ok(())
}
