//! DX2W heat-pump bridge.
//!
//! Polls the heat pump over Modbus TCP, keeps a rolling history of every
//! register and snapshots it to disk.

use anyhow::{Context, Result};
use clap::Parser;
use hydrobridge_dx2w::{
    AnomalyDetector, ConnectionManager, ConnectionOptions, Dx2wBridgeConfig, Dx2wClient,
    GroupScheduler, HistoryStore, SnapshotPersister, TcpConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Modbus TCP telemetry and history engine for DX2W heat pumps.
#[derive(Parser, Debug)]
#[command(name = "hydrobridge-dx2w")]
#[command(about = "Polls a DX2W heat pump over Modbus TCP and keeps a rolling history")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "dx2w.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load and validate configuration; an invalid catalog is fatal
    let config = Dx2wBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    hydrobridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting hydrobridge-dx2w");
    info!("Loaded configuration from {:?}", args.config);

    let catalog = Arc::new(config.catalog());
    let detector = Arc::new(AnomalyDetector::from_catalog(&catalog));
    let store = Arc::new(HistoryStore::new());

    // Restore history before the first poll
    let persister = SnapshotPersister::from_config(&config.history);
    persister.load(&store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let connection = ConnectionManager::new(
        TcpConnector::new(&config.modbus),
        ConnectionOptions {
            shutdown: Some(shutdown_rx.clone()),
            ..Default::default()
        },
    );
    let client = Dx2wClient::new(catalog.clone(), connection.clone());

    let scheduler = GroupScheduler::new(
        Arc::new(client),
        &catalog,
        detector,
        store.clone(),
        |group| config.group_interval(group),
    )
    .with_persister(persister);

    // Connecting blocks until the device answers, so do it inside the
    // scheduler task where shutdown can still interrupt it.
    let startup = connection.clone();
    let scheduler_task = tokio::spawn(async move {
        startup.connect().await;
        scheduler.run(shutdown_rx).await;
    });

    info!(
        "DX2W bridge running with {} register(s) in {} group(s)",
        catalog.len(),
        catalog.groups().len()
    );

    wait_for_signal().await;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }

    connection.close().await;
    info!(
        "DX2W bridge stopped ({} history entries retained)",
        store.total_entries()
    );

    Ok(())
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
