//! Site adapter contract, the per-site implementations and the shared crawl
//! driver that paginates and dispatches item fetches for every site.

use std::sync::Arc;

use async_trait::async_trait;
use cfeed_core::{ClassifiedRecord, ListingEntry, ScrapeContext};
use cfeed_storage::{FetchError, PageFetcher, SinkError};
use chrono::NaiveDate;
use thiserror::Error;

pub mod dates;
pub mod driver;
pub mod extract;
pub mod fixture;
pub mod sites;

pub use driver::{CategoryStats, CrawlDriver, CrawlSettings, RunLog, SeenSet, SiteRun};
pub use fixture::FixtureFetcher;
pub use sites::{AcheiUsaAdapter, BrazilianVoiceAdapter};

pub const CRATE_NAME: &str = "cfeed-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("unusable item page {url}: {reason}")]
    Parse { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Everything the crawl driver needs to know about one classifieds site.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn site(&self) -> &'static str;

    /// URL of listing page `page` (1-based) for a category.
    fn listing_page_url(&self, category_url: &str, page: usize) -> String;

    /// Item links plus whatever hints the listing card exposes.
    fn parse_listing_entries(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<ListingEntry>, AdapterError>;

    fn parse_item_page(
        &self,
        html: &str,
        entry: &ListingEntry,
        ctx: &ScrapeContext,
    ) -> Result<ClassifiedRecord, AdapterError>;

    /// Explicit date field wins. The listing hint is tried next, first as a
    /// calendar date and then as an age phrase applied to the crawl's today.
    fn resolve_post_date(
        &self,
        explicit: Option<&str>,
        hint: Option<&str>,
        ctx: &ScrapeContext,
    ) -> Option<NaiveDate> {
        explicit.and_then(dates::parse_explicit_date).or_else(|| {
            hint.and_then(|text| {
                dates::parse_explicit_date(text)
                    .or_else(|| dates::parse_relative_date(text, ctx.captured_at))
            })
        })
    }

    async fn fetch_category_links(
        &self,
        http: &dyn PageFetcher,
        category_url: &str,
        page: usize,
    ) -> Result<Vec<ListingEntry>, AdapterError> {
        let url = self.listing_page_url(category_url, page);
        let html = http.fetch_text(self.site(), &url).await?;
        self.parse_listing_entries(&html, &url)
    }
}

pub const KNOWN_SITES: [&str; 2] = [sites::acheiusa::SITE, sites::brazilianvoice::SITE];

pub fn adapter_for_site(site_id: &str) -> Option<Arc<dyn SiteAdapter>> {
    match site_id {
        sites::acheiusa::SITE => Some(Arc::new(AcheiUsaAdapter)),
        sites::brazilianvoice::SITE => Some(Arc::new(BrazilianVoiceAdapter)),
        _ => None,
    }
}
