//! Read/write contract the crawl core needs from persistent storage.

use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use cfeed_core::{dedup_key, normalize_key, ClassifiedRecord, DedupPolicy};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("duplicate listing {title:?} posted {post_date}")]
    DuplicateKey { post_date: NaiveDate, title: String },
    #[error("listing {url} has no post date")]
    MissingPostDate { url: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Key scheme this backend treats as its uniqueness rule.
    fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::TitleDate
    }

    async fn get_by_day(&self, date: NaiveDate) -> Result<Vec<ClassifiedRecord>, RepositoryError>;

    async fn insert(&self, record: &ClassifiedRecord) -> Result<(), RepositoryError>;
}

/// In-process repository enforcing the same uniqueness rule as the database.
#[derive(Debug, Default)]
pub struct MemoryListingRepository {
    policy: DedupPolicy,
    rows: Mutex<Vec<ClassifiedRecord>>,
}

impl MemoryListingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DedupPolicy) -> Self {
        Self {
            policy,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn seeded(rows: Vec<ClassifiedRecord>) -> Self {
        Self {
            policy: DedupPolicy::default(),
            rows: Mutex::new(rows),
        }
    }

    pub fn snapshot(&self) -> Vec<ClassifiedRecord> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Backend(anyhow::anyhow!("memory repository lock poisoned"))
}

#[async_trait]
impl ListingRepository for MemoryListingRepository {
    fn dedup_policy(&self) -> DedupPolicy {
        self.policy
    }

    async fn get_by_day(&self, date: NaiveDate) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        Ok(rows
            .iter()
            .filter(|r| r.post_date == Some(date))
            .cloned()
            .collect())
    }

    async fn insert(&self, record: &ClassifiedRecord) -> Result<(), RepositoryError> {
        let Some(post_date) = record.post_date else {
            return Err(RepositoryError::MissingPostDate {
                url: record.url.clone(),
            });
        };
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let key = dedup_key(record, self.policy);
        if rows.iter().any(|r| dedup_key(r, self.policy) == key) {
            return Err(RepositoryError::DuplicateKey {
                post_date,
                title: record.title.clone(),
            });
        }
        rows.push(record.clone());
        Ok(())
    }
}

/// Postgres-backed repository. Uniqueness is the `(post_date, title_key)`
/// constraint from `migrations/`.
#[derive(Debug, Clone)]
pub struct PgListingRepository {
    pool: PgPool,
}

impl PgListingRepository {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn record_from_row(row: &PgRow) -> Result<ClassifiedRecord, sqlx::Error> {
    Ok(ClassifiedRecord {
        captured_at: row.try_get::<DateTime<Utc>, _>("captured_at")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        ref_id: row.try_get("ref_id")?,
        location: row.try_get("location")?,
        when: row.try_get("listing_age")?,
        post_date: Some(row.try_get::<NaiveDate, _>("post_date")?),
        phone: row.try_get("phone")?,
        state: row.try_get("state")?,
        description: row.try_get("description")?,
        duplicate: row.try_get("duplicate")?,
    })
}

#[async_trait]
impl ListingRepository for PgListingRepository {
    async fn get_by_day(&self, date: NaiveDate) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT captured_at, url, title, ref_id, location, listing_age, post_date, phone, \
             state, description, duplicate \
             FROM classifieds WHERE post_date = $1 ORDER BY id",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .context("loading classifieds by day")?;

        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("decoding classifieds row")
            .map_err(RepositoryError::from)
    }

    async fn insert(&self, record: &ClassifiedRecord) -> Result<(), RepositoryError> {
        let Some(post_date) = record.post_date else {
            return Err(RepositoryError::MissingPostDate {
                url: record.url.clone(),
            });
        };
        let result = sqlx::query(
            "INSERT INTO classifieds \
             (captured_at, url, title, title_key, ref_id, location, listing_age, post_date, \
             phone, state, description, duplicate) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.captured_at)
        .bind(&record.url)
        .bind(&record.title)
        .bind(normalize_key(&record.title))
        .bind(&record.ref_id)
        .bind(&record.location)
        .bind(&record.when)
        .bind(post_date)
        .bind(&record.phone)
        .bind(&record.state)
        .bind(&record.description)
        .bind(record.duplicate)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(RepositoryError::DuplicateKey {
                    post_date,
                    title: record.title.clone(),
                })
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context("inserting classified")
                .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(title: &str, date: (i32, u32, u32)) -> ClassifiedRecord {
        let at = Utc.with_ymd_and_hms(2025, 8, 21, 9, 0, 0).single().unwrap();
        ClassifiedRecord::new(at, format!("https://x.test/{title}"), title)
            .with_post_date(NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap())
    }

    #[tokio::test]
    async fn memory_repository_rejects_same_title_and_day() {
        let repo = MemoryListingRepository::new();
        repo.insert(&rec("Apto 2Q Boca", (2025, 8, 20))).await.unwrap();

        let err = repo
            .insert(&rec("apto  2q BOCA", (2025, 8, 20)))
            .await
            .unwrap_err();
        match err {
            RepositoryError::DuplicateKey { post_date, title } => {
                assert_eq!(post_date, NaiveDate::from_ymd_opt(2025, 8, 20).unwrap());
                assert_eq!(title, "apto  2q BOCA");
            }
            other => panic!("unexpected error {other:?}"),
        }

        repo.insert(&rec("Apto 2Q Boca", (2025, 8, 21))).await.unwrap();
        assert_eq!(repo.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn memory_repository_filters_by_day() {
        let repo = MemoryListingRepository::seeded(vec![
            rec("Casa", (2025, 8, 20)),
            rec("Quarto", (2025, 8, 21)),
        ]);
        let day = repo
            .get_by_day(NaiveDate::from_ymd_opt(2025, 8, 21).unwrap())
            .await
            .unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].title, "Quarto");
    }

    #[tokio::test]
    async fn records_without_post_date_are_refused() {
        let repo = MemoryListingRepository::new();
        let mut record = rec("Sem data", (2025, 8, 20));
        record.post_date = None;
        assert!(matches!(
            repo.insert(&record).await,
            Err(RepositoryError::MissingPostDate { .. })
        ));
    }
}
