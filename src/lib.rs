//! Probe link library
//! Finds wireless ultrasound scanners over Bluetooth LE, configures their
//! Wi-Fi and power state, and enriches them from the cloud catalog.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use crate::config::{AppConfig, config_dir};
use crate::core::events::event_channel;
use crate::state::AppState;

/// Serial selected automatically once it is seen
pub const SERIAL_ENV: &str = "PROBE_LINK_SERIAL";

const SELECT_POLL: Duration = Duration::from_secs(1);

/// Runs headless: scans, optionally selects `$PROBE_LINK_SERIAL`, refreshes
/// the catalog when a token is stored, and prints every event as a JSON line
/// until Ctrl-C.
pub async fn run() -> Result<()> {
    logging::init(log::LevelFilter::Info);

    let dir = config_dir();
    let config = AppConfig::load_config(&dir).await?;
    let (events, mut receiver) = event_channel();
    let state = Arc::new(AppState::new(config, dir, events).await?);
    state.bluetooth_manager.lock().await.start_scan().await?;

    if let Ok(serial) = std::env::var(SERIAL_ENV) {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            match sessions.select_when_seen(&serial, SELECT_POLL).await {
                Ok(()) => info!("Selected scanner {}", serial),
                Err(e) => error!("Could not select {}: {}", serial, e),
            }
        });
    }

    let refresher = state.clone();
    tokio::spawn(async move {
        match refresher.refresh_catalog().await {
            Ok(Some(count)) => info!("Catalog holds {} records", count),
            Ok(None) => {}
            Err(e) => warn!("Catalog refresh failed: {}", e),
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = receiver.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
                None => break,
            }
        }
    }

    state.shutdown().await
}
