//! Sync pipeline orchestration: crawl every enabled site for a date, upload the
//! raw artifacts, then reconcile the scraped listings with storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cfeed_adapters::{adapter_for_site, CrawlDriver, CrawlSettings};
use cfeed_core::{ScrapeContext, ScrapeResult};
use cfeed_storage::{
    read_listing_artifact, ArtifactStore, ArtifactUploader, HttpClientConfig, HttpFetcher,
    HttpUploader, ListingRepository, MemoryListingRepository, PacingPolicy, Pacer, PageFetcher,
    PgListingRepository, StoreUploader,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod dedup;

pub use dedup::{dedup_and_persist, DedupFilter, PersistOutcome};

pub const CRATE_NAME: &str = "cfeed-sync";
pub const SITES_FILE: &str = "sites.yaml";

fn default_enabled() -> bool {
    true
}

fn default_max_pages() -> usize {
    CrawlSettings::default().max_pages
}

fn default_item_concurrency() -> usize {
    CrawlSettings::default().item_concurrency
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub category_urls: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
}

impl SiteConfig {
    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            max_pages: self.max_pages,
            item_concurrency: self.item_concurrency,
        }
    }
}

impl SiteRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(yaml).context("parsing site registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.enabled)
    }

    /// Every enabled site must have a registered adapter, at least one
    /// category and a non-zero page and worker budget.
    pub fn validate(&self) -> Result<()> {
        for site in self.enabled() {
            if adapter_for_site(&site.site_id).is_none() {
                bail!("no adapter registered for site {:?}", site.site_id);
            }
            if site.category_urls.is_empty() {
                bail!("site {:?} has no category_urls", site.site_id);
            }
            if site.max_pages == 0 || site.item_concurrency == 0 {
                bail!("site {:?} needs max_pages and item_concurrency above zero", site.site_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryTarget {
    Memory,
    Postgres(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Http(String),
    Store(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub output_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub upload_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pace_min_ms: u64,
    pub pace_jitter_ms: u64,
    pub schedule_cron: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let pacing = PacingPolicy::default();
        Self {
            database_url: var("DATABASE_URL"),
            output_dir: var("CFEED_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            artifacts_dir: var("ARTIFACTS_DIR").map(PathBuf::from),
            upload_url: var("CFEED_UPLOAD_URL"),
            user_agent: var("CFEED_USER_AGENT").unwrap_or_else(|| "cfeed-bot/0.1".to_string()),
            http_timeout_secs: number("CFEED_HTTP_TIMEOUT_SECS", 20),
            pace_min_ms: number("CFEED_PACE_MIN_MS", pacing.min_delay.as_millis() as u64),
            pace_jitter_ms: number("CFEED_PACE_JITTER_MS", pacing.jitter.as_millis() as u64),
            schedule_cron: var("CFEED_SCHEDULE_CRON").unwrap_or_else(|| "0 0 7 * * *".to_string()),
            workspace_root: var("CFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn sites_path(&self) -> PathBuf {
        self.workspace_root.join(SITES_FILE)
    }

    pub fn repository_target(&self) -> RepositoryTarget {
        match self.database_url.as_deref() {
            None => RepositoryTarget::Memory,
            Some(url) if url.starts_with("memory:") => RepositoryTarget::Memory,
            Some(url) => RepositoryTarget::Postgres(url.to_string()),
        }
    }

    /// `CFEED_UPLOAD_URL` wins over `ARTIFACTS_DIR`.
    pub fn upload_target(&self) -> Option<UploadTarget> {
        if let Some(url) = &self.upload_url {
            return Some(UploadTarget::Http(url.clone()));
        }
        self.artifacts_dir.clone().map(UploadTarget::Store)
    }

    pub fn pacing(&self) -> PacingPolicy {
        PacingPolicy {
            min_delay: Duration::from_millis(self.pace_min_ms),
            jitter: Duration::from_millis(self.pace_jitter_ms),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            pacing: self.pacing(),
            ..Default::default()
        }
    }

    pub fn validate(&self, do_upload: bool) -> Result<()> {
        if do_upload && self.upload_target().is_none() {
            bail!("upload requested but neither CFEED_UPLOAD_URL nor ARTIFACTS_DIR is set");
        }
        if let Some(url) = &self.upload_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("CFEED_UPLOAD_URL must be an http(s) URL, got {url:?}");
            }
        }
        if self.http_timeout_secs == 0 {
            bail!("CFEED_HTTP_TIMEOUT_SECS must be above zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scrapes: Vec<ScrapeResult>,
    pub uploaded: Vec<String>,
    pub scraped: usize,
    pub survivors: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct Orchestrator {
    registry: SiteRegistry,
    http: Arc<dyn PageFetcher>,
    repository: Arc<dyn ListingRepository>,
    uploader: Option<Arc<dyn ArtifactUploader>>,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        registry: SiteRegistry,
        http: Arc<dyn PageFetcher>,
        repository: Arc<dyn ListingRepository>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            http,
            repository,
            uploader: None,
            output_dir: output_dir.into(),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Run each enabled site once for `date`, one after another. A site that
    /// cannot start (artifact not writable) is logged and skipped.
    pub async fn scrape_sites(
        &self,
        date: NaiveDate,
        ctx: &ScrapeContext,
        cancel: &CancellationToken,
    ) -> Vec<ScrapeResult> {
        let mut results = Vec::new();
        for site in self.registry.enabled() {
            if cancel.is_cancelled() {
                warn!(site = %site.site_id, "cancelled, skipping remaining sites");
                break;
            }
            let Some(adapter) = adapter_for_site(&site.site_id) else {
                warn!(site = %site.site_id, "no adapter registered");
                continue;
            };
            let driver = CrawlDriver::new(Arc::clone(&self.http), site.crawl_settings());
            match driver
                .run_site(adapter, &site.category_urls, date, &self.output_dir, ctx, cancel)
                .await
            {
                Ok(result) => results.push(result),
                Err(err) => error!(site = %site.site_id, error = %err, "site run failed"),
            }
        }
        results
    }

    async fn upload_artifacts(&self, scrapes: &[ScrapeResult]) -> Vec<String> {
        let Some(uploader) = &self.uploader else {
            return Vec::new();
        };
        let mut uris = Vec::new();
        for scrape in scrapes {
            match uploader.save(&scrape.site, &scrape.artifact_path).await {
                Ok(uri) => {
                    info!(site = %scrape.site, %uri, "artifact uploaded");
                    uris.push(uri);
                }
                Err(err) => warn!(
                    site = %scrape.site,
                    path = %scrape.artifact_path.display(),
                    error = ?err,
                    "artifact upload failed"
                ),
            }
        }
        uris
    }

    pub async fn run_for_date(
        &self,
        date: NaiveDate,
        do_upload: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary> {
        if do_upload && self.uploader.is_none() {
            bail!("upload requested but no uploader is configured");
        }
        let started_at = Utc::now();
        let ctx = ScrapeContext::at(started_at);
        info!(run_id = %ctx.run_id, %date, do_upload, "sync run starting");

        let scrapes = self.scrape_sites(date, &ctx, cancel).await;
        let uploaded = if do_upload {
            self.upload_artifacts(&scrapes).await
        } else {
            Vec::new()
        };

        let mut scraped = Vec::new();
        for scrape in &scrapes {
            let records = read_listing_artifact(&scrape.artifact_path)
                .await
                .with_context(|| format!("reading artifact {}", scrape.artifact_path.display()))?;
            scraped.extend(records);
        }
        let scraped_count = scraped.len();
        scraped.retain(|r| r.post_date.is_some());

        let outcome = dedup_and_persist(self.repository.as_ref(), date, scraped)
            .await
            .with_context(|| format!("reconciling listings for {date}"))?;

        let summary = SyncRunSummary {
            run_id: ctx.run_id,
            date,
            started_at,
            finished_at: Utc::now(),
            scrapes,
            uploaded,
            scraped: scraped_count,
            survivors: outcome.survivors,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
        };
        info!(
            run_id = %summary.run_id,
            %date,
            scraped = summary.scraped,
            inserted = summary.inserted,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Re-run the pipeline for `start` and the `days - 1` days before it,
    /// newest first. Stored rows are never deleted.
    pub async fn run_backfill(
        &self,
        start: NaiveDate,
        days: u32,
        do_upload: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncRunSummary>> {
        let mut summaries = Vec::new();
        for offset in 0..days {
            if cancel.is_cancelled() {
                warn!(completed = summaries.len(), "backfill cancelled");
                break;
            }
            let date = start
                .checked_sub_days(Days::new(u64::from(offset)))
                .with_context(|| format!("{start} minus {offset} days is out of range"))?;
            summaries.push(self.run_for_date(date, do_upload, cancel).await?);
        }
        Ok(summaries)
    }
}

pub async fn build_repository(config: &SyncConfig) -> Result<Arc<dyn ListingRepository>> {
    match config.repository_target() {
        RepositoryTarget::Memory => {
            warn!("DATABASE_URL not set, listings are kept in memory for this process only");
            Ok(Arc::new(MemoryListingRepository::new()))
        }
        RepositoryTarget::Postgres(url) => Ok(Arc::new(PgListingRepository::connect(&url).await?)),
    }
}

pub fn build_uploader(config: &SyncConfig) -> Result<Option<Arc<dyn ArtifactUploader>>> {
    let uploader: Arc<dyn ArtifactUploader> = match config.upload_target() {
        None => return Ok(None),
        Some(UploadTarget::Http(url)) => Arc::new(HttpUploader::new(
            url,
            Duration::from_secs(config.http_timeout_secs),
        )?),
        Some(UploadTarget::Store(dir)) => Arc::new(StoreUploader::new(ArtifactStore::new(dir))),
    };
    Ok(Some(uploader))
}

/// Wire the production pipeline: one shared pacer behind the HTTP fetcher,
/// the configured repository and the configured uploader.
pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<Orchestrator> {
    let registry = SiteRegistry::load(&config.sites_path()).await?;
    let pacer = Arc::new(Pacer::new());
    let http = HttpFetcher::new(config.http_client_config(), pacer)?;
    let repository = build_repository(config).await?;
    let orchestrator = Orchestrator::new(registry, Arc::new(http), repository, &config.output_dir);
    Ok(match build_uploader(config)? {
        Some(uploader) => orchestrator.with_uploader(uploader),
        None => orchestrator,
    })
}

/// Cron job running today's sync on every tick. The scheduler is returned
/// unstarted.
pub async fn build_scheduler(
    orchestrator: Arc<Orchestrator>,
    cron: &str,
    do_upload: bool,
    cancel: CancellationToken,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        let cancel = cancel.clone();
        Box::pin(async move {
            let today = Utc::now().date_naive();
            match orchestrator.run_for_date(today, do_upload, &cancel).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    "scheduled sync complete"
                ),
                Err(err) => error!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
