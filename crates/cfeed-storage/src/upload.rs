//! Durable copies of raw artifacts. Callers treat upload failures as
//! non-fatal; these types only report them.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::info;

use crate::ArtifactStore;

#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Push the file at `local_path` and return its remote location.
    async fn save(&self, site: &str, local_path: &Path) -> Result<String>;
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
}

/// Uploads into a content-addressed [`ArtifactStore`] directory (a mounted
/// volume or synced bucket).
#[derive(Debug, Clone)]
pub struct StoreUploader {
    store: ArtifactStore,
}

impl StoreUploader {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArtifactUploader for StoreUploader {
    async fn save(&self, site: &str, local_path: &Path) -> Result<String> {
        let bytes = fs::read(local_path)
            .await
            .with_context(|| format!("reading artifact {}", local_path.display()))?;
        let stored = self
            .store
            .put_bytes(Utc::now(), site, extension_of(local_path), &bytes)
            .await?;
        info!(
            site,
            path = %stored.relative_path.display(),
            bytes = stored.byte_size,
            deduplicated = stored.deduplicated,
            "artifact stored"
        );
        Ok(format!("file://{}", stored.absolute_path.display()))
    }
}

/// PUTs the artifact to `{base_url}/{site}/{file_name}`.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building upload client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn target_url(&self, site: &str, local_path: &Path) -> Result<String> {
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("artifact {} has no file name", local_path.display()))?;
        Ok(format!("{}/{}/{}", self.base_url, site, file_name))
    }
}

#[async_trait]
impl ArtifactUploader for HttpUploader {
    async fn save(&self, site: &str, local_path: &Path) -> Result<String> {
        let url = self.target_url(site, local_path)?;
        let bytes = fs::read(local_path)
            .await
            .with_context(|| format!("reading artifact {}", local_path.display()))?;
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("uploading to {url}"))?
            .error_for_status()
            .with_context(|| format!("upload rejected by {url}"))?;
        info!(site, %url, "artifact uploaded");
        Ok(url)
    }
}
