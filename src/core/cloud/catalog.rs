//! Cloud catalog fetcher
//! Pages through the device catalog, caches the records, and tells the
//! consumer about records matching scanners this process has already seen.
//! Also resolves firmware versions to downloaded files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::config::cloud_config::CloudConfig;
use crate::core::bluetooth::SessionHandle;
use crate::core::cloud::http::HttpClient;
use crate::core::cloud::models::{CatalogPage, CloudRecord, FirmwareLink};
use crate::core::error::CoreError;
use crate::core::events::{CoreEvent, EventSink};

/// Source of the serials the catalog is matched against
#[async_trait]
pub trait KnownSerials: Send + Sync {
    async fn known_serials(&self) -> Vec<String>;
}

#[async_trait]
impl KnownSerials for SessionHandle {
    async fn known_serials(&self) -> Vec<String> {
        SessionHandle::known_serials(self).await.unwrap_or_default()
    }
}

pub struct CatalogFetcher {
    http: Arc<dyn HttpClient>,
    known: Arc<dyn KnownSerials>,
    events: EventSink,
    config: CloudConfig,
    firmware_dir: PathBuf,
    /// Records of the current refresh cycle, in arrival order
    cache: Mutex<Vec<CloudRecord>>,
    /// Held for the duration of a refresh
    refreshing: Mutex<()>,
}

impl CatalogFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        known: Arc<dyn KnownSerials>,
        events: EventSink,
        config: CloudConfig,
        firmware_dir: PathBuf,
    ) -> Self {
        Self {
            http,
            known,
            events,
            config,
            firmware_dir,
            cache: Mutex::new(Vec::new()),
            refreshing: Mutex::new(()),
        }
    }

    pub fn catalog_url(&self) -> String {
        self.config.catalog_url()
    }

    pub fn firmware_url(&self, version: &str) -> String {
        self.config.firmware_url(version)
    }

    fn authorization(&self, token: &str) -> String {
        format!("{} {}", self.config.auth_scheme, token)
    }

    /// Rebuilds the cache from the catalog and returns the number of records
    /// merged. Failures are also published as error events.
    pub async fn refresh(&self, token: &str) -> Result<usize, CoreError> {
        let result = self.try_refresh(token).await;
        if let Err(err) = &result {
            self.events.report(err);
        }
        result
    }

    async fn try_refresh(&self, token: &str) -> Result<usize, CoreError> {
        if token.is_empty() {
            return Err(CoreError::AuthMissing);
        }
        let _guard = self
            .refreshing
            .try_lock()
            .map_err(|_| CoreError::RefreshInProgress)?;

        self.cache.lock().await.clear();
        let authorization = self.authorization(token);
        let mut url = self.catalog_url();
        let mut merged = 0;
        let mut pages = 0;

        loop {
            if pages == self.config.max_pages {
                return Err(CoreError::PageLimitExceeded(pages));
            }
            info!("Fetching catalog page {} from {}", pages + 1, url);
            let page: CatalogPage = self.fetch_json(&url, Some(&authorization)).await?;
            pages += 1;

            let records: Vec<CloudRecord> =
                page.results.into_iter().map(CloudRecord::from).collect();
            merged += records.len();
            self.cache.lock().await.extend(records.iter().cloned());
            debug!("Catalog page {} merged {} records ({} reported)", pages, records.len(), page.count);
            self.cross_reference(&records).await;

            match page.next {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        info!("Catalog refresh finished: {} records in {} pages", merged, pages);
        Ok(merged)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<T, CoreError> {
        let body = self.http.get(url, authorization).await?;
        serde_json::from_slice(&body)
            .map_err(|e| CoreError::ProtocolDecode(format!("response from {}: {}", url, e)))
    }

    /// Publishes the records of one page that match a known serial.
    async fn cross_reference(&self, records: &[CloudRecord]) {
        for serial in self.known.known_serials().await {
            if let Some(record) = records.iter().find(|record| record.serial == serial) {
                info!("Cloud record available for scanner {}", serial);
                self.events.publish(CoreEvent::CloudRecordAvailable {
                    serial,
                    record: record.clone(),
                });
            }
        }
    }

    /// Publishes the cached record of a newly sighted scanner, if there is one.
    pub async fn announce(&self, serial: &str) -> bool {
        let record = self.record_for(serial).await;
        match record {
            Some(record) => {
                self.events.publish(CoreEvent::CloudRecordAvailable {
                    serial: serial.to_string(),
                    record,
                });
                true
            }
            None => false,
        }
    }

    pub async fn record_for(&self, serial: &str) -> Option<CloudRecord> {
        self.cache
            .lock()
            .await
            .iter()
            .find(|record| record.serial == serial)
            .cloned()
    }

    pub async fn certificate_for(&self, serial: &str) -> Option<String> {
        self.record_for(serial).await.and_then(|record| record.certificate)
    }

    pub async fn records(&self) -> Vec<CloudRecord> {
        self.cache.lock().await.clone()
    }

    /// Looks up the download link of a firmware version and downloads it into
    /// the firmware directory. Failures are also published as error events.
    pub async fn resolve_firmware(&self, token: &str, version: &str) -> Result<PathBuf, CoreError> {
        let result = self.try_resolve_firmware(token, version).await;
        match &result {
            Ok(path) => self.events.publish(CoreEvent::FirmwareReady { path: path.clone() }),
            Err(err) => self.events.report(err),
        }
        result
    }

    async fn try_resolve_firmware(&self, token: &str, version: &str) -> Result<PathBuf, CoreError> {
        if token.is_empty() {
            return Err(CoreError::AuthMissing);
        }
        if version.is_empty() || version.contains('/') {
            return Err(CoreError::InvalidRequest(format!(
                "invalid firmware version {:?}",
                version
            )));
        }

        let link: FirmwareLink = self
            .fetch_json(&self.firmware_url(version), Some(&self.authorization(token)))
            .await?;
        info!("Firmware {} is at {}", version, link.file);

        tokio::fs::create_dir_all(&self.firmware_dir)
            .await
            .map_err(|e| CoreError::Storage(format!("{}: {}", self.firmware_dir.display(), e)))?;
        let dest = self.firmware_dir.join(firmware_file_name(&link.file, version));
        let written = self.http.download(&link.file, &dest).await?;
        info!("Firmware {} saved to {} ({} bytes)", version, dest.display(), written);
        Ok(dest)
    }

    pub fn firmware_dir(&self) -> &Path {
        &self.firmware_dir
    }
}

/// Local name of a firmware download: the last path segment of its URL, or
/// `firmware_v<version>.zip` when the URL has none.
pub fn firmware_file_name(url: &str, version: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| {
            warn!("No file name in {}, using the version", url);
            format!("firmware_v{}.zip", version)
        })
}
