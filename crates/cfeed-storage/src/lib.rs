//! Storage-side plumbing for the classifieds feed: paced HTTP fetching, the
//! raw listing artifact (CSV sink), blob uploads and the listing repository.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod fetch;
pub mod repository;
pub mod sink;
pub mod upload;

pub use fetch::{
    BackoffPolicy, FailureKind, FetchError, HttpClientConfig, HttpFetcher, PacingPolicy,
    PageFetcher, Pacer,
};
pub use repository::{
    ListingRepository, MemoryListingRepository, PgListingRepository, RepositoryError,
};
pub use sink::{
    file_gate, read_listing_artifact, FileGate, ListingSink, SinkError, ARTIFACT_HEADER,
};
pub use upload::{ArtifactUploader, HttpUploader, StoreUploader};

pub const CRATE_NAME: &str = "cfeed-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed blob store on the local filesystem. Blobs are immutable:
/// storing identical bytes twice for the same day and site is a no-op.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `yyyy/mm/dd/<site>/<hash>.<ext>`
    pub fn blob_relative_path(
        &self,
        stored_at: DateTime<Utc>,
        site: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stored_at.format("%Y/%m/%d").to_string())
            .join(site)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn put_bytes(
        &self,
        stored_at: DateTime<Utc>,
        site: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.blob_relative_path(stored_at, site, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking blob path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let fresh = write_atomically(&absolute_path, bytes).await?;
        Ok(stored(!fresh))
    }
}

/// Write through a temp file in the destination directory and rename into
/// place. Returns `false` when another writer won the rename race.
async fn write_atomically(dest: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = dest
        .parent()
        .with_context(|| format!("blob path {} has no parent", dest.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating blob directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp blob {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp blob {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp blob {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, dest).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming temp blob {} -> {}", temp_path.display(), dest.display())
            })
        }
    }
}
