//! Core domain model for the classifieds feed: listing records, run summaries
//! and the normalization rules every dedup key is built from.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{clean_text, normalize_key, strip_diacritics};

pub const CRATE_NAME: &str = "cfeed-core";

/// One classified listing as observed by a site adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedRecord {
    pub captured_at: DateTime<Utc>,
    pub url: String,
    pub title: String,
    pub ref_id: Option<String>,
    pub location: Option<String>,
    /// Listing-age text as shown by the site ("3 days ago", "há 2 dias").
    pub when: Option<String>,
    pub post_date: Option<NaiveDate>,
    pub phone: Option<String>,
    pub state: Option<String>,
    pub description: String,
    #[serde(default)]
    pub duplicate: bool,
}

impl ClassifiedRecord {
    pub fn new(
        captured_at: DateTime<Utc>,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            captured_at,
            url: url.into(),
            title: title.into(),
            ref_id: None,
            location: None,
            when: None,
            post_date: None,
            phone: None,
            state: None,
            description: String::new(),
            duplicate: false,
        }
    }

    pub fn with_post_date(mut self, post_date: NaiveDate) -> Self {
        self.post_date = Some(post_date);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Which fields identify "the same listing" for a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Normalized title plus resolved post-date.
    #[default]
    TitleDate,
    /// Normalized title, normalized description and capture timestamp, for
    /// sources whose post-date signal cannot be trusted.
    TitleDescriptionCapture,
}

pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn title_date_key(title: &str, post_date: Option<NaiveDate>) -> String {
    let date = post_date.map(iso_date).unwrap_or_default();
    format!("{}|{}", normalize_key(title), date)
}

pub fn dedup_key(record: &ClassifiedRecord, policy: DedupPolicy) -> String {
    match policy {
        DedupPolicy::TitleDate => title_date_key(&record.title, record.post_date),
        DedupPolicy::TitleDescriptionCapture => format!(
            "{}|{}|{}",
            normalize_key(&record.title),
            normalize_key(&record.description),
            record
                .captured_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    }
}

/// Listing-page hint for one item, collected before the item page is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingEntry {
    pub url: String,
    pub ref_id: Option<String>,
    pub when: Option<String>,
    pub location: Option<String>,
}

impl ListingEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Per-run facts every parser needs to resolve relative dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub today: NaiveDate,
}

impl ScrapeContext {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(captured_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            captured_at,
            today: captured_at.date_naive(),
        }
    }
}

/// Outcome of one site adapter run for one target date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub site: String,
    pub date: NaiveDate,
    pub pages: usize,
    pub total_items: usize,
    pub artifact_path: PathBuf,
    pub log_path: PathBuf,
}
