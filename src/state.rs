//! Application state management
//! This module wires the Bluetooth side, the cloud catalog and the
//! configuration together around one event channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};

use crate::config::AppConfig;
use crate::config::token_store::TokenStore;
use crate::core::bluetooth::{BluetoothManager, SessionHandle};
use crate::core::cloud::{CatalogFetcher, ReqwestClient};
use crate::core::events::EventSink;

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    pub config_dir: PathBuf,
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<Mutex<BluetoothManager>>,
    pub sessions: SessionHandle,
    pub catalog: Arc<CatalogFetcher>,
    pub token_store: TokenStore,
}

impl AppState {
    /// Creates a new AppState instance
    pub async fn new(config: AppConfig, config_dir: PathBuf, events: EventSink) -> Result<Self> {
        let (sightings_tx, mut sightings_rx) = mpsc::unbounded_channel::<String>();

        info!("Initializing BluetoothManager...");
        let manager =
            BluetoothManager::new(&config.bluetooth, events.clone(), Some(sightings_tx)).await?;
        let sessions = manager.sessions();

        let http = ReqwestClient::new(Duration::from_secs(config.cloud.request_timeout_secs))?;
        let catalog = Arc::new(CatalogFetcher::new(
            Arc::new(http),
            Arc::new(sessions.clone()),
            events,
            config.cloud.clone(),
            config.cloud.firmware_dir(&config_dir),
        ));

        // Late enrichment: scanners first seen after a refresh get their record now.
        let catalog_for_task = catalog.clone();
        tokio::spawn(async move {
            while let Some(serial) = sightings_rx.recv().await {
                if catalog_for_task.announce(&serial).await {
                    debug!("Announced cached cloud record for {}", serial);
                }
            }
        });

        Ok(Self {
            token_store: TokenStore::new(&config_dir),
            config,
            config_dir,
            bluetooth_manager: Arc::new(Mutex::new(manager)),
            sessions,
            catalog,
        })
    }

    /// Refreshes the catalog with the stored token. Returns `None` without
    /// touching the network when no token is stored.
    pub async fn refresh_catalog(&self) -> Result<Option<usize>> {
        let token = self.token_store.load().await?;
        if token.is_empty() {
            warn!("No cloud token stored, skipping catalog refresh");
            return Ok(None);
        }
        Ok(Some(self.catalog.refresh(&token).await?))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.bluetooth_manager.lock().await.shutdown().await
    }
}
