//! Raw listing artifact: one CSV file per site run.
//!
//! Writers from many item workers append to the same file. Each destination
//! file gets its own [`FileGate`], owned by whoever opens the sink, and a line
//! is written with a single `write_all` while the gate is held.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cfeed_core::{iso_date, ClassifiedRecord};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const ARTIFACT_HEADER: [&str; 10] = [
    "captured_at_utc",
    "url",
    "title",
    "ref_id",
    "location",
    "when",
    "post_date",
    "phone",
    "state",
    "description",
];

pub type FileGate = Arc<Mutex<()>>;

pub fn file_gate() -> FileGate {
    Arc::new(Mutex::new(()))
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact csv: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactRow {
    captured_at_utc: String,
    url: String,
    title: String,
    ref_id: Option<String>,
    location: Option<String>,
    when: Option<String>,
    post_date: Option<String>,
    phone: Option<String>,
    state: Option<String>,
    description: String,
}

impl From<&ClassifiedRecord> for ArtifactRow {
    fn from(record: &ClassifiedRecord) -> Self {
        Self {
            captured_at_utc: record
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            url: record.url.clone(),
            title: record.title.clone(),
            ref_id: record.ref_id.clone(),
            location: record.location.clone(),
            when: record.when.clone(),
            post_date: record.post_date.map(iso_date),
            phone: record.phone.clone(),
            state: record.state.clone(),
            description: record.description.clone(),
        }
    }
}

impl ArtifactRow {
    fn into_record(self) -> Result<ClassifiedRecord, String> {
        let captured_at = DateTime::parse_from_rfc3339(&self.captured_at_utc)
            .map_err(|e| format!("captured_at_utc {:?}: {e}", self.captured_at_utc))?
            .with_timezone(&Utc);
        let post_date = match self.post_date.as_deref() {
            None => None,
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| format!("post_date {raw:?}: {e}"))?,
            ),
        };
        Ok(ClassifiedRecord {
            captured_at,
            url: self.url,
            title: self.title,
            ref_id: self.ref_id,
            location: self.location,
            when: self.when,
            post_date,
            phone: self.phone,
            state: self.state,
            description: self.description,
            duplicate: false,
        })
    }
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, SinkError> {
    let bytes = writer.into_inner().map_err(|e| SinkError::Io(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// One artifact line, newline-terminated. Fields containing a comma, quote or
/// newline are quoted, with embedded quotes doubled.
pub fn encode_line(record: &ClassifiedRecord) -> Result<String, SinkError> {
    let mut writer = csv_writer();
    writer.serialize(ArtifactRow::from(record))?;
    finish(writer)
}

pub fn header_line() -> Result<String, SinkError> {
    let mut writer = csv_writer();
    writer.write_record(ARTIFACT_HEADER)?;
    finish(writer)
}

#[derive(Debug, Clone)]
pub struct ListingSink {
    path: PathBuf,
    gate: FileGate,
}

impl ListingSink {
    /// Start a fresh artifact at `path` (truncating any previous run) and write
    /// the header row.
    pub async fn create(path: impl Into<PathBuf>, gate: FileGate) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        {
            let _held = gate.lock().await;
            fs::write(&path, header_line()?).await?;
        }
        Ok(Self { path, gate })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &ClassifiedRecord) -> Result<(), SinkError> {
        let line = encode_line(record)?;
        let _held = self.gate.lock().await;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Load an artifact back into records. Rows that do not parse are logged and
/// skipped.
pub async fn read_listing_artifact(path: &Path) -> Result<Vec<ClassifiedRecord>, SinkError> {
    let bytes = fs::read(path).await?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes.as_slice());

    let mut records = Vec::new();
    for (index, row) in reader.deserialize::<ArtifactRow>().enumerate() {
        let parsed = row
            .map_err(|e| e.to_string())
            .and_then(ArtifactRow::into_record);
        match parsed {
            Ok(record) => records.push(record),
            Err(message) => {
                warn!(path = %path.display(), row = index + 1, %message, "skipping artifact row")
            }
        }
    }
    Ok(records)
}
