//! Batch and against-storage deduplication, then one-by-one persistence.

use std::collections::HashSet;

use cfeed_core::{clean_text, dedup_key, ClassifiedRecord, DedupPolicy};
use cfeed_storage::{ListingRepository, RepositoryError};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupFilter {
    policy: DedupPolicy,
}

impl DedupFilter {
    pub fn new(policy: DedupPolicy) -> Self {
        Self { policy }
    }

    /// Records of `scraped` whose key is neither in `existing` nor taken by an
    /// earlier record of the same batch. Order is preserved.
    pub fn filter(
        &self,
        scraped: Vec<ClassifiedRecord>,
        existing: &[ClassifiedRecord],
    ) -> Vec<ClassifiedRecord> {
        let stored: HashSet<String> = existing
            .iter()
            .map(|r| dedup_key(r, self.policy))
            .collect();
        let mut batch = HashSet::new();
        scraped
            .into_iter()
            .filter(|record| {
                let key = dedup_key(record, self.policy);
                !stored.contains(&key) && batch.insert(key)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub survivors: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Loads what is already stored for `date`, filters `scraped` against it and
/// inserts each survivor with its title cleaned. A duplicate-key rejection
/// skips that record only.
pub async fn dedup_and_persist(
    repository: &dyn ListingRepository,
    date: NaiveDate,
    scraped: Vec<ClassifiedRecord>,
) -> Result<PersistOutcome, RepositoryError> {
    let existing = repository.get_by_day(date).await?;
    let filter = DedupFilter::new(repository.dedup_policy());
    let survivors = filter.filter(scraped, &existing);

    let mut outcome = PersistOutcome {
        survivors: survivors.len(),
        ..Default::default()
    };
    for mut record in survivors {
        record.title = clean_text(&record.title);
        match repository.insert(&record).await {
            Ok(()) => outcome.inserted += 1,
            Err(RepositoryError::DuplicateKey { post_date, title }) => {
                warn!(%post_date, title = %title, "listing already stored, skipping");
                outcome.duplicates += 1;
            }
            Err(err) => {
                warn!(url = %record.url, error = %err, "insert failed, skipping");
                outcome.failed += 1;
            }
        }
    }
    info!(
        %date,
        existing = existing.len(),
        survivors = outcome.survivors,
        inserted = outcome.inserted,
        "persisted listings"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfeed_storage::MemoryListingRepository;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn rec(title: &str, d: u32) -> ClassifiedRecord {
        let at = Utc.with_ymd_and_hms(2025, 8, 21, 12, 0, 0).single().unwrap();
        ClassifiedRecord::new(at, format!("https://example.test/{}/{d}", title.len()), title)
            .with_post_date(day(d))
    }

    fn titles(records: &[ClassifiedRecord]) -> Vec<(String, NaiveDate)> {
        records
            .iter()
            .map(|r| (r.title.clone(), r.post_date.unwrap()))
            .collect()
    }

    #[test]
    fn filter_is_idempotent() {
        let filter = DedupFilter::default();
        let existing = vec![rec("Apto 2Q", 20)];
        let scraped = vec![rec("Apto 2Q", 20), rec("Casa", 20), rec("Casa", 20), rec("Sala", 21)];

        let once = filter.filter(scraped, &existing);
        let twice = filter.filter(once.clone(), &existing);
        assert_eq!(once, twice);
    }

    #[test]
    fn keys_ignore_case_and_whitespace() {
        let filter = DedupFilter::default();
        let existing = vec![rec("Apto Luxo", 20)];
        let out = filter.filter(vec![rec("  apto   LUXO ", 20)], &existing);
        assert!(out.is_empty());
    }

    #[test]
    fn same_title_on_another_day_survives() {
        let filter = DedupFilter::default();
        let existing = vec![rec("Casa 3Q", 20)];
        let out = filter.filter(vec![rec("Casa 3Q", 21)], &existing);
        assert_eq!(titles(&out), vec![("Casa 3Q".to_string(), day(21))]);
    }

    #[test]
    fn first_occurrence_in_batch_wins() {
        let filter = DedupFilter::default();
        let mut first = rec("Quarto", 20);
        first.url = "https://example.test/first".to_string();
        let mut second = rec("QUARTO", 20);
        second.url = "https://example.test/second".to_string();

        let out = filter.filter(vec![first, second, rec("Garagem", 20)], &[]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, "https://example.test/first");
        assert_eq!(out[1].title, "Garagem");
    }

    #[test]
    fn capture_policy_keeps_same_title_with_other_description() {
        let filter = DedupFilter::new(DedupPolicy::TitleDescriptionCapture);
        let a = rec("Quarto", 20).with_description("Perto do metro");
        let b = rec("Quarto", 20).with_description("Com garagem");
        assert_eq!(filter.filter(vec![a.clone(), b, a], &[]).len(), 2);
    }

    #[tokio::test]
    async fn scenario_inserts_only_new_listings() {
        let repository = MemoryListingRepository::seeded(vec![rec("Apto 2Q Boca", 20)]);
        let scraped = vec![rec("Apto 2Q Boca", 20), rec("Casa 3Q", 20), rec("Apto 2Q Boca", 21)];

        let outcome = dedup_and_persist(&repository, day(20), scraped).await.unwrap();
        assert_eq!(outcome.survivors, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 0);

        let stored = titles(&repository.snapshot());
        assert_eq!(
            stored,
            vec![
                ("Apto 2Q Boca".to_string(), day(20)),
                ("Casa 3Q".to_string(), day(20)),
                ("Apto 2Q Boca".to_string(), day(21)),
            ]
        );
    }

    #[tokio::test]
    async fn persist_follows_the_repository_key_policy() {
        let repository = MemoryListingRepository::with_policy(DedupPolicy::TitleDescriptionCapture);
        repository
            .insert(&rec("Quarto", 20).with_description("Perto do metro"))
            .await
            .unwrap();
        let scraped = vec![
            rec("Quarto", 20).with_description("Perto do metro"),
            rec("Quarto", 20).with_description("Com garagem"),
        ];

        let outcome = dedup_and_persist(&repository, day(20), scraped).await.unwrap();
        assert_eq!(outcome.survivors, 1);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(repository.snapshot()[1].description, "Com garagem");
    }

    #[tokio::test]
    async fn titles_are_cleaned_before_insert() {
        let repository = MemoryListingRepository::new();
        let outcome = dedup_and_persist(&repository, day(20), vec![rec("  Casa \n 3Q  ", 20)])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(repository.snapshot()[0].title, "Casa 3Q");
    }

    #[tokio::test]
    async fn duplicate_rejection_skips_only_that_record() {
        let repository = MemoryListingRepository::seeded(vec![rec("Apto", 21)]);
        // Existing rows are loaded for the 20th only, so the 21st collides at insert.
        let scraped = vec![rec("apto", 21), rec("Loja", 20)];

        let outcome = dedup_and_persist(&repository, day(20), scraped).await.unwrap();
        assert_eq!(outcome.survivors, 2);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.inserted, 1);
    }
}
