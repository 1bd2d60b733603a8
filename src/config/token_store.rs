//! Persistence of the cloud API token

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::utils::ensure_directory_exists;

const TOKEN_FILE_NAME: &str = "token.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredToken {
    token: String,
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(TOKEN_FILE_NAME),
        }
    }

    /// The stored token, or an empty string when none was saved.
    pub async fn load(&self) -> Result<String> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            warn!("No cloud token stored at {:?}", self.path);
            return Ok(String::new());
        }
        let json = fs::read_to_string(&self.path).await?;
        let stored: StoredToken = serde_json::from_str(&json)?;
        Ok(stored.token)
    }

    pub async fn save(&self, token: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            ensure_directory_exists(dir).await?;
        }
        let stored = StoredToken { token: token.to_string() };
        fs::write(&self.path, serde_json::to_string(&stored)?).await?;
        info!("Cloud token saved to {:?}", self.path);
        Ok(())
    }
}
