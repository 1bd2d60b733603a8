//! Wire models of the cloud catalog and firmware endpoints

use serde::{Deserialize, Serialize};

/// One page of the device catalog
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    #[serde(default)]
    pub count: u64,
    /// Absolute URL of the following page; absent on the last page
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub crt: Option<String>,
    pub device: DeviceEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub serial: String,
    pub model: String,
}

/// Catalog record of one scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRecord {
    pub serial: String,
    pub model: String,
    pub certificate: Option<String>,
}

impl From<CatalogEntry> for CloudRecord {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            serial: entry.device.serial,
            model: entry.device.model,
            certificate: entry.crt,
        }
    }
}

/// Response of the firmware endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct FirmwareLink {
    pub file: String,
}
