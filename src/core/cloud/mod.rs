//! Cloud catalog access
//! Fetches the device catalog and firmware artifacts over HTTPS.

mod catalog;
mod http;
mod models;

pub use catalog::{CatalogFetcher, KnownSerials, firmware_file_name};
pub use http::{HttpClient, ReqwestClient};
pub use models::{CatalogEntry, CatalogPage, CloudRecord, DeviceEntry, FirmwareLink};
