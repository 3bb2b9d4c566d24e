//! Generic crawl driver shared by every site adapter.
//!
//! Listing pages of a category are walked sequentially until two consecutive
//! pages contribute no unseen entries (or `max_pages` is reached). Each new
//! entry is handed to a bounded pool of item workers; only records whose
//! post-date equals the target date reach the listing sink.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cfeed_core::{iso_date, ListingEntry, ScrapeContext, ScrapeResult};
use cfeed_storage::{file_gate, ListingSink, PageFetcher, SinkError};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AdapterError, SiteAdapter};

const EMPTY_PAGES_BEFORE_STOP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSettings {
    pub max_pages: usize,
    pub item_concurrency: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_pages: 40,
            item_concurrency: 6,
        }
    }
}

/// URLs and reference ids already dispatched during one site run.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: Mutex<HashSet<String>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the entry and reports whether it is new, i.e. neither its URL
    /// nor its reference id has been seen before.
    pub fn insert_entry(&self, entry: &ListingEntry) -> bool {
        let Ok(mut keys) = self.keys.lock() else {
            return false;
        };
        let url_key = format!("url:{}", entry.url);
        let ref_key = entry.ref_id.as_ref().map(|r| format!("ref:{r}"));
        let seen = keys.contains(&url_key) || ref_key.as_ref().is_some_and(|k| keys.contains(k));
        if seen {
            return false;
        }
        keys.insert(url_key);
        if let Some(ref_key) = ref_key {
            keys.insert(ref_key);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain-text run log written beside the artifact.
#[derive(Debug, Default)]
pub struct RunLog {
    lines: Mutex<Vec<String>>,
}

impl RunLog {
    pub fn note(&self, line: impl Into<String>) {
        let stamped = format!("{} {}", Utc::now().format("%H:%M:%S"), line.into());
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(stamped);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    async fn write_to(&self, path: &Path) -> Result<(), SinkError> {
        let mut text = self.lines().join("\n");
        text.push('\n');
        fs::write(path, text).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub pages: usize,
    pub discovered: usize,
    pub kept: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for CategoryStats {
    fn add_assign(&mut self, other: Self) {
        self.pages += other.pages;
        self.discovered += other.discovered;
        self.kept += other.kept;
        self.failed += other.failed;
    }
}

/// State shared by every category and item worker of one site run.
#[derive(Clone)]
pub struct SiteRun {
    pub adapter: Arc<dyn SiteAdapter>,
    pub target: NaiveDate,
    pub sink: ListingSink,
    pub seen: Arc<SeenSet>,
    pub log: Arc<RunLog>,
    pub ctx: ScrapeContext,
    pub cancel: CancellationToken,
}

impl SiteRun {
    pub fn new(
        adapter: Arc<dyn SiteAdapter>,
        target: NaiveDate,
        sink: ListingSink,
        ctx: ScrapeContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            target,
            sink,
            seen: Arc::new(SeenSet::new()),
            log: Arc::new(RunLog::default()),
            ctx,
            cancel,
        }
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Kept,
    OtherDate,
    Failed,
    Cancelled,
}

pub fn artifact_path(output_dir: &Path, site: &str, date: NaiveDate) -> PathBuf {
    output_dir.join(format!("{site}_{}.csv", iso_date(date)))
}

pub fn log_path(output_dir: &Path, site: &str, date: NaiveDate) -> PathBuf {
    output_dir.join(format!("{site}_{}.log", iso_date(date)))
}

#[derive(Clone)]
pub struct CrawlDriver {
    http: Arc<dyn PageFetcher>,
    settings: CrawlSettings,
}

impl CrawlDriver {
    pub fn new(http: Arc<dyn PageFetcher>, settings: CrawlSettings) -> Self {
        Self { http, settings }
    }

    /// Crawl every category of one site for `target`, writing
    /// `<site>_<date>.csv` and `<site>_<date>.log` under `output_dir`.
    pub async fn run_site(
        &self,
        adapter: Arc<dyn SiteAdapter>,
        category_urls: &[String],
        target: NaiveDate,
        output_dir: &Path,
        ctx: &ScrapeContext,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult, AdapterError> {
        let site = adapter.site();
        let span = info_span!("crawl_site", site, date = %target, run_id = %ctx.run_id);
        async move {
            let artifact = artifact_path(output_dir, site, target);
            let log_file = log_path(output_dir, site, target);
            let sink = ListingSink::create(&artifact, file_gate()).await?;
            let run = SiteRun::new(adapter, target, sink, ctx.clone(), cancel.clone());
            run.log.note(format!("site {site} target {}", iso_date(target)));

            let mut totals = CategoryStats::default();
            for category_url in category_urls {
                if cancel.is_cancelled() {
                    run.log.note("cancelled before next category");
                    break;
                }
                let stats = self.run_category(&run, category_url).await;
                run.log.note(format!(
                    "category {category_url}: pages={} new={} kept={} failed={}",
                    stats.pages, stats.discovered, stats.kept, stats.failed
                ));
                totals += stats;
            }

            run.log.note(format!("done: pages={} kept={}", totals.pages, totals.kept));
            run.log.write_to(&log_file).await?;
            info!(
                pages = totals.pages,
                discovered = totals.discovered,
                kept = totals.kept,
                failed = totals.failed,
                "site crawl finished"
            );

            Ok(ScrapeResult {
                site: site.to_string(),
                date: target,
                pages: totals.pages,
                total_items: totals.kept,
                artifact_path: artifact,
                log_path: log_file,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn run_category(&self, run: &SiteRun, category_url: &str) -> CategoryStats {
        let mut stats = CategoryStats::default();
        let semaphore = Arc::new(Semaphore::new(self.settings.item_concurrency.max(1)));
        let mut workers: JoinSet<ItemOutcome> = JoinSet::new();
        let mut empty_streak = 0usize;

        'pages: for page in 1..=self.settings.max_pages {
            if run.cancel.is_cancelled() {
                break;
            }
            let fetched = tokio::select! {
                _ = run.cancel.cancelled() => break,
                fetched = run
                    .adapter
                    .fetch_category_links(self.http.as_ref(), category_url, page) => fetched,
            };
            stats.pages += 1;

            let entries = match fetched {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(category_url, page, error = %err, "listing page failed");
                    run.log.note(format!("page {page} failed: {err}"));
                    Vec::new()
                }
            };
            let listed = entries.len();
            let fresh: Vec<ListingEntry> = entries
                .into_iter()
                .filter(|entry| run.seen.insert_entry(entry))
                .collect();
            debug!(category_url, page, listed, new = fresh.len(), "listing page parsed");
            run.log.note(format!("page {page}: listed={listed} new={}", fresh.len()));

            if fresh.is_empty() {
                empty_streak += 1;
                if empty_streak >= EMPTY_PAGES_BEFORE_STOP {
                    break;
                }
                continue;
            }
            empty_streak = 0;
            stats.discovered += fresh.len();

            for entry in fresh {
                let permit = tokio::select! {
                    _ = run.cancel.cancelled() => break 'pages,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'pages,
                    },
                };
                let http = Arc::clone(&self.http);
                let run = run.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = run.cancel.cancelled() => ItemOutcome::Cancelled,
                        outcome = process_item(http.as_ref(), &run, &entry) => outcome,
                    }
                });
            }
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(ItemOutcome::Kept) => stats.kept += 1,
                Ok(ItemOutcome::Failed) => stats.failed += 1,
                Ok(ItemOutcome::OtherDate | ItemOutcome::Cancelled) => {}
                Err(err) => {
                    warn!(error = %err, "item worker aborted");
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

async fn process_item(http: &dyn PageFetcher, run: &SiteRun, entry: &ListingEntry) -> ItemOutcome {
    let site = run.adapter.site();
    let html = match http.fetch_text(site, &entry.url).await {
        Ok(html) => html,
        Err(err) => {
            warn!(url = %entry.url, error = %err, "item fetch failed");
            run.log.note(format!("item {} fetch failed: {err}", entry.url));
            return ItemOutcome::Failed;
        }
    };

    let record = match run.adapter.parse_item_page(&html, entry, &run.ctx) {
        Ok(record) => record,
        Err(err) => {
            warn!(url = %entry.url, error = %err, "item parse failed");
            run.log.note(format!("item {} parse failed: {err}", entry.url));
            return ItemOutcome::Failed;
        }
    };

    if record.post_date != Some(run.target) {
        debug!(url = %entry.url, post_date = ?record.post_date, "item outside target date");
        return ItemOutcome::OtherDate;
    }

    match run.sink.append(&record).await {
        Ok(()) => {
            run.log.note(format!("kept {} {:?}", entry.url, record.title));
            ItemOutcome::Kept
        }
        Err(err) => {
            warn!(url = %entry.url, error = %err, "artifact append failed");
            run.log.note(format!("item {} append failed: {err}", entry.url));
            ItemOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FixtureFetcher;
    use crate::sites::AcheiUsaAdapter;
    use cfeed_storage::read_listing_artifact;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use cfeed_storage::FetchError;
    use tempfile::tempdir;

    const CATEGORY: &str = "https://www.acheiusa.com/classificados/imoveis";

    fn page_url(page: usize) -> String {
        format!("{CATEGORY}?page={page}")
    }

    fn listing(ids: &[u32]) -> String {
        let cards: String = ids
            .iter()
            .map(|id| {
                format!(
                    "<div class=\"classified-item\" data-ref=\"{id}\">\
                     <a href=\"/anuncio/{id}\">Anuncio {id}</a></div>"
                )
            })
            .collect();
        format!("<html><body>{cards}</body></html>")
    }

    fn item(id: u32, date: &str) -> String {
        format!(
            "<html><head><title>Casa {id} - AcheiUSA</title></head>\
             <body><p>Data: {date}</p><p>Ref: {id}</p></body></html>"
        )
    }

    fn item_url(id: u32) -> String {
        format!("https://www.acheiusa.com/anuncio/{id}")
    }

    fn target() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 20).unwrap()
    }

    fn ctx() -> ScrapeContext {
        ScrapeContext::at(Utc.with_ymd_and_hms(2025, 8, 21, 14, 0, 0).single().unwrap())
    }

    fn site_run(sink: ListingSink) -> SiteRun {
        SiteRun::new(Arc::new(AcheiUsaAdapter), target(), sink, ctx(), CancellationToken::new())
    }

    fn driver(fetcher: &Arc<FixtureFetcher>) -> CrawlDriver {
        let http: Arc<dyn PageFetcher> = fetcher.clone();
        CrawlDriver::new(http, CrawlSettings::default())
    }

    #[test]
    fn seen_set_rejects_repeated_url_or_ref() {
        let seen = SeenSet::new();
        let mut a = ListingEntry::new("https://x.test/1");
        a.ref_id = Some("77".to_string());
        assert!(seen.insert_entry(&a));
        assert!(!seen.insert_entry(&ListingEntry::new("https://x.test/1")));

        let mut same_ref = ListingEntry::new("https://x.test/1?utm=feed");
        same_ref.ref_id = Some("77".to_string());
        assert!(!seen.insert_entry(&same_ref));
        assert!(seen.insert_entry(&ListingEntry::new("https://x.test/2")));
    }

    #[tokio::test]
    async fn pager_stops_after_two_empty_pages() {
        let fetcher = Arc::new(
            FixtureFetcher::new()
                .with_page(page_url(1), listing(&[1, 2]))
                .with_page(page_url(2), listing(&[3, 4]))
                .with_page(page_url(3), listing(&[]))
                .with_page(page_url(4), listing(&[]))
                .with_page(page_url(5), listing(&[5, 6]))
                .with_page(item_url(1), item(1, "20/08/2025"))
                .with_page(item_url(2), item(2, "20/08/2025"))
                .with_page(item_url(3), item(3, "20/08/2025"))
                .with_page(item_url(4), item(4, "20/08/2025")),
        );
        let dir = tempdir().unwrap();
        let result = driver(&fetcher)
            .run_site(
                Arc::new(AcheiUsaAdapter),
                &[CATEGORY.to_string()],
                target(),
                dir.path(),
                &ctx(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.pages, 4);
        assert_eq!(result.total_items, 4);
        assert!(!fetcher.requests().contains(&page_url(5)));
        assert_eq!(result.artifact_path, dir.path().join("acheiusa_2025-08-20.csv"));

        let records = read_listing_artifact(&result.artifact_path).await.unwrap();
        let mut titles: Vec<_> = records.iter().map(|r| r.title.clone()).collect();
        titles.sort();
        assert_eq!(titles, vec!["Casa 1", "Casa 2", "Casa 3", "Casa 4"]);

        let log = std::fs::read_to_string(&result.log_path).unwrap();
        assert!(log.contains("page 3: listed=0 new=0"), "log was {log}");
    }

    #[tokio::test]
    async fn repeated_entries_count_as_empty_pages() {
        let fetcher = Arc::new(
            FixtureFetcher::new()
                .with_page(page_url(1), listing(&[1]))
                .with_page(page_url(2), listing(&[1]))
                .with_page(page_url(3), listing(&[1]))
                .with_page(page_url(4), listing(&[9]))
                .with_page(item_url(1), item(1, "20/08/2025")),
        );
        let dir = tempdir().unwrap();
        let sink = ListingSink::create(dir.path().join("a.csv"), file_gate()).await.unwrap();
        let run = site_run(sink);

        let stats = driver(&fetcher).run_category(&run, CATEGORY).await;
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.discovered, 1);
        assert_eq!(stats.kept, 1);
        assert_eq!(fetcher.requests().iter().filter(|u| *u == &item_url(1)).count(), 1);
    }

    #[tokio::test]
    async fn item_failures_and_other_dates_are_isolated() {
        let fetcher = Arc::new(
            FixtureFetcher::new()
                .with_page(page_url(1), listing(&[1, 2, 3]))
                .with_page(item_url(1), item(1, "20/08/2025"))
                .with_page(item_url(2), item(2, "19/08/2025")),
        );
        let dir = tempdir().unwrap();
        let sink = ListingSink::create(dir.path().join("a.csv"), file_gate()).await.unwrap();
        let run = site_run(sink.clone());

        let stats = driver(&fetcher).run_category(&run, CATEGORY).await;
        assert_eq!(
            stats,
            CategoryStats {
                pages: 3,
                discovered: 3,
                kept: 1,
                failed: 1
            }
        );
        let records = read_listing_artifact(sink.path()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ref_id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn max_pages_caps_pagination() {
        let mut fetcher = FixtureFetcher::new();
        for page in 1..=5u32 {
            fetcher.insert(page_url(page as usize), listing(&[page * 10, page * 10 + 1]));
        }
        let fetcher = Arc::new(fetcher);
        let http: Arc<dyn PageFetcher> = fetcher.clone();
        let driver = CrawlDriver::new(
            http,
            CrawlSettings {
                max_pages: 2,
                item_concurrency: 1,
            },
        );
        let dir = tempdir().unwrap();
        let sink = ListingSink::create(dir.path().join("a.csv"), file_gate()).await.unwrap();
        let run = site_run(sink);

        let stats = driver.run_category(&run, CATEGORY).await;
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.discovered, 4);
        assert!(!fetcher.requests().contains(&page_url(3)));
    }

    #[tokio::test]
    async fn cancelled_run_fetches_nothing() {
        let fetcher = Arc::new(FixtureFetcher::new().with_page(page_url(1), listing(&[1])));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dir = tempdir().unwrap();

        let result = driver(&fetcher)
            .run_site(
                Arc::new(AcheiUsaAdapter),
                &[CATEGORY.to_string()],
                target(),
                dir.path(),
                &ctx(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(result.pages, 0);
        assert_eq!(result.total_items, 0);
        assert!(fetcher.requests().is_empty());
        assert!(read_listing_artifact(&result.artifact_path).await.unwrap().is_empty());
    }

    /// Serves pages from memory and records how many item fetches overlap.
    struct OverlapFetcher {
        pages: HashMap<String, String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for OverlapFetcher {
        async fn fetch_text(&self, _site: &str, url: &str) -> Result<String, FetchError> {
            let page = self.pages.get(url).cloned().ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })?;
            if url.contains("/anuncio/") {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(page)
        }
    }

    #[tokio::test]
    async fn item_workers_never_exceed_concurrency_limit() {
        let ids = [1, 2, 3, 4, 5, 6];
        let mut pages = HashMap::from([(page_url(1), listing(&ids))]);
        for id in ids {
            pages.insert(item_url(id), item(id, "20/08/2025"));
        }
        let fetcher = Arc::new(OverlapFetcher {
            pages,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let http: Arc<dyn PageFetcher> = fetcher.clone();
        let driver = CrawlDriver::new(
            http,
            CrawlSettings {
                max_pages: 40,
                item_concurrency: 2,
            },
        );
        let dir = tempdir().unwrap();
        let sink = ListingSink::create(dir.path().join("a.csv"), file_gate()).await.unwrap();

        let stats = driver.run_category(&site_run(sink), CATEGORY).await;
        assert_eq!(stats.kept, 6);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak in-flight item fetches was {peak}");
        assert!(peak >= 1);
    }
}
