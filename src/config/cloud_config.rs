use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://cloud.clarius.com/api/public/v0";
pub const DEFAULT_AUTH_SCHEME: &str = "OEM-API-Key";
pub const DEFAULT_CATALOG_PATH: &str = "/devices?format=json";
/// `{version}` is replaced by the requested firmware version.
pub const DEFAULT_FIRMWARE_PATH: &str = "/devices/firmware/{version}/";
pub const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Root of the public API, without a trailing slash
    pub base_url: String,

    /// Scheme name sent before the token in the `Authorization` header
    pub auth_scheme: String,

    /// First catalog page, relative to `base_url`. OEM accounts use
    /// `/devices/oem/?format=json`.
    pub catalog_path: String,

    /// Firmware metadata, relative to `base_url`. OEM accounts use
    /// `/devices/oem/firmware/{version}/`.
    pub firmware_path: String,

    /// Most catalog pages fetched by one refresh
    pub max_pages: usize,

    pub request_timeout_secs: u64,

    /// Where firmware downloads go; defaults to `firmware/` in the config directory
    pub firmware_dir: Option<PathBuf>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            catalog_path: DEFAULT_CATALOG_PATH.to_string(),
            firmware_path: DEFAULT_FIRMWARE_PATH.to_string(),
            max_pages: 64,
            request_timeout_secs: 30,
            firmware_dir: None,
        }
    }
}

impl CloudConfig {
    pub fn catalog_url(&self) -> String {
        self.endpoint(&self.catalog_path)
    }

    pub fn firmware_url(&self, version: &str) -> String {
        self.endpoint(&self.firmware_path.replace(VERSION_PLACEHOLDER, version))
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn firmware_dir(&self, config_dir: &Path) -> PathBuf {
        self.firmware_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("firmware"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoints() {
        let config = CloudConfig {
            base_url: "https://cloud.test/api/".to_string(),
            ..CloudConfig::default()
        };
        assert_eq!(config.catalog_url(), "https://cloud.test/api/devices?format=json");
        assert_eq!(config.firmware_url("11.2.0"), "https://cloud.test/api/devices/firmware/11.2.0/");
    }

    #[test]
    fn oem_endpoints_are_configurable() {
        let config: CloudConfig = serde_json::from_str(
            r#"{"base_url": "https://cloud.test/api",
                "catalog_path": "/devices/oem/?format=json",
                "firmware_path": "devices/oem/firmware/{version}/"}"#,
        )
        .unwrap();
        assert_eq!(config.catalog_url(), "https://cloud.test/api/devices/oem/?format=json");
        assert_eq!(
            config.firmware_url("9.0"),
            "https://cloud.test/api/devices/oem/firmware/9.0/"
        );
        assert_eq!(config.max_pages, 64);
    }
}
