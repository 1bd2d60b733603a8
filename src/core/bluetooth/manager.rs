//! Bluetooth manager for the scanner link
//! This module provides the main interface for bluetooth operations: it owns
//! the adapter-backed scanner and the session actor.

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::info;
use tokio::sync::mpsc;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::session_manager::{SessionHandle, SessionManager};
use crate::core::events::EventSink;

/// Manages Bluetooth operations
pub struct BluetoothManager {
    /// Advertisement scanner
    scanner: BluetoothScanner,
    /// Handle to the session actor
    sessions: SessionHandle,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager once the default adapter is available.
    ///
    /// `sightings` receives every serial the first time a scan reports it.
    pub async fn new(
        config: &BluetoothConfig,
        events: EventSink,
        sightings: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let sessions = SessionManager::spawn(config, events);
        let mut scanner = BluetoothScanner::new(adapter, sessions.clone(), config.min_rssi);
        if let Some(sightings) = sightings {
            scanner = scanner.with_sightings(sightings);
        }
        Ok(Self { scanner, sessions })
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    pub fn sessions(&self) -> SessionHandle {
        self.sessions.clone()
    }

    /// Stops scanning and tears down every session.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.scanner.stop_scan().await?;
        self.sessions.shutdown();
        info!("Bluetooth manager shut down");
        Ok(())
    }
}
