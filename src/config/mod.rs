pub mod bluetooth_config;
pub mod cloud_config;
pub mod token_store;

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::config::cloud_config::CloudConfig;
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "probe_link_config.json";

/// Overrides the configuration directory
pub const CONFIG_DIR_ENV: &str = "PROBE_LINK_CONFIG_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bluetooth: BluetoothConfig,
    pub cloud: CloudConfig,
}

/// `$PROBE_LINK_CONFIG_DIR`, else `~/.probe-link`, else `.probe-link` in the
/// working directory.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".probe-link")
}

impl AppConfig {
    /// Loads the config from `config_dir`, or the defaults when there is no file.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        if !fs::try_exists(&file_path).await.unwrap_or(false) {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config into `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Config saved to {:?}.", file_path);
        Ok(())
    }
}
