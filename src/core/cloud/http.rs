//! HTTP access for the catalog
//! `HttpClient` is the seam the fetcher talks to; `ReqwestClient` is the real
//! implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;

use crate::core::error::CoreError;

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GETs `url` and returns the body of a 2xx response.
    async fn get(&self, url: &str, authorization: Option<&str>) -> Result<Vec<u8>, CoreError>;

    /// Streams the body of `url` into `dest` and returns the number of bytes
    /// written. A partially written file is removed on failure.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, CoreError>;
}

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<reqwest::Response, CoreError> {
        let mut request = self.client.get(url);
        if let Some(value) = authorization {
            request = request.header(reqwest::header::AUTHORIZATION, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("GET {} returned {}", url, status);
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    async fn stream_to(
        &self,
        mut response: reqwest::Response,
        dest: &Path,
    ) -> Result<u64, CoreError> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CoreError::Storage(format!("{}: {}", dest.display(), e)))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| CoreError::Storage(format!("{}: {}", dest.display(), e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| CoreError::Storage(format!("{}: {}", dest.display(), e)))?;
        Ok(written)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, authorization: Option<&str>) -> Result<Vec<u8>, CoreError> {
        debug!("GET {}", url);
        let response = self.send(url, authorization).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| CoreError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, CoreError> {
        info!("Downloading {} to {}", url, dest.display());
        let response = self.send(url, None).await?;
        match self.stream_to(response, dest).await {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    debug!("Could not remove partial file {}: {}", dest.display(), e);
                }
                Err(err)
            }
        }
    }
}
