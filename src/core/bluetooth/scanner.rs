use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::advertisement::{DeviceStatus, decode_advertisement};
use crate::core::bluetooth::session_manager::SessionHandle;
use crate::core::bluetooth::transport::{BluestLink, ProbeLink};

/// Serials seen since the scanner was created, across scan restarts
#[derive(Default)]
struct SightingLog {
    seen: Mutex<HashSet<String>>,
    /// Receives each serial the first time it is seen
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl SightingLog {
    /// Records `serial` and announces it if it is new.
    fn record(&self, serial: &str) -> bool {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial.to_string());
        if first {
            if let Some(tx) = &self.tx {
                let _ = tx.send(serial.to_string());
            }
        }
        first
    }
}

/// Continuous advertisement scan feeding the session actor
pub struct BluetoothScanner {
    adapter: Adapter,
    sessions: SessionHandle,
    min_rssi: Option<i16>,
    sightings: Arc<SightingLog>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<Result<()>>>,
}

impl BluetoothScanner {
    pub fn new(adapter: Adapter, sessions: SessionHandle, min_rssi: Option<i16>) -> Self {
        Self {
            adapter,
            sessions,
            min_rssi,
            sightings: Arc::default(),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn with_sightings(mut self, sightings: mpsc::UnboundedSender<String>) -> Self {
        self.sightings = Arc::new(SightingLog {
            seen: Mutex::default(),
            tx: Some(sightings),
        });
        self
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }

        self.cancel_token = CancellationToken::new();
        let cancel_token_for_task = self.cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let sessions_for_task = self.sessions.clone();
        let sightings_for_task = self.sightings.clone();
        let min_rssi = self.min_rssi;

        let handle = tokio::spawn(async move {
            let result = Self::internal_scan_task(
                adapter_for_task,
                sessions_for_task,
                sightings_for_task,
                cancel_token_for_task,
                min_rssi,
            )
            .await;
            if let Err(e) = &result {
                error!("Bluetooth scan failed: {}", e);
            }
            result
        });

        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    async fn internal_scan_task(
        adapter: Adapter,
        sessions: SessionHandle,
        sightings: Arc<SightingLog>,
        cancel_token: CancellationToken,
        min_rssi: Option<i16>,
    ) -> Result<()> {
        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(advertising) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let Some(status) = Self::decode(&advertising, min_rssi) else {
                        continue;
                    };
                    let serial = status.serial.clone();
                    let link: Arc<dyn ProbeLink> =
                        Arc::new(BluestLink::new(adapter.clone(), advertising.device));
                    if sessions.observe(status, link).is_err() {
                        info!("Session manager stopped, ending scan");
                        break;
                    }
                    if sightings.record(&serial) {
                        debug!("First sighting of {}", serial);
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Filters and decodes one advertisement.
    fn decode(advertising: &AdvertisingDevice, min_rssi: Option<i16>) -> Option<DeviceStatus> {
        let rssi = advertising.rssi.unwrap_or(i16::MIN);
        if min_rssi.is_some_and(|threshold| rssi < threshold) {
            return None;
        }
        let name = match &advertising.adv_data.local_name {
            Some(name) => name.clone(),
            None => advertising.device.name().ok()?,
        };
        let manufacturer = advertising.adv_data.manufacturer_data.as_ref()?;
        let raw = manufacturer_bytes(manufacturer.company_id, &manufacturer.data);
        let status = decode_advertisement(&name, &raw, rssi)?;
        debug!("Advertisement from {}: {:?}", name, status);
        Some(status)
    }

    /// Stops the scan task. Sessions and their links are left alone.
    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Waiting for scan task to finish...");
            match handle.await {
                Ok(Ok(())) => info!("Scan task finished successfully after cancellation."),
                Ok(Err(e)) => error!("Scan task finished with an error: {:?}", e),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled successfully."),
                Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
            }
        } else {
            info!("No active scan task handle found to wait for.");
        }
        Ok(())
    }
}

/// Rebuilds the raw manufacturer specific field: company id (little endian)
/// followed by the payload.
pub fn manufacturer_bytes(company_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(payload.len() + 2);
    raw.extend_from_slice(&company_id.to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}
