use std::path::Path;
use std::sync::Arc;

use cfeed_adapters::{adapter_for_site, CrawlDriver, CrawlSettings, FixtureFetcher, KNOWN_SITES};
use cfeed_core::ScrapeContext;
use cfeed_storage::{read_listing_artifact, PageFetcher};
use chrono::{NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

fn fixture(site: &str, name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(site)
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

async fn crawl(
    site: &str,
    category: &str,
    item_url: &str,
    captured: (i32, u32, u32),
) -> (cfeed_core::ScrapeResult, Arc<FixtureFetcher>, tempfile::TempDir) {
    let adapter = adapter_for_site(site).expect("registered adapter");
    let fetcher = Arc::new(
        FixtureFetcher::new()
            .with_page(adapter.listing_page_url(category, 1), fixture(site, "listing.html"))
            .with_page(item_url, fixture(site, "item.html")),
    );
    let http: Arc<dyn PageFetcher> = fetcher.clone();
    let driver = CrawlDriver::new(http, CrawlSettings::default());
    let ctx = ScrapeContext::at(
        Utc.with_ymd_and_hms(captured.0, captured.1, captured.2, 15, 0, 0)
            .single()
            .unwrap(),
    );
    let dir = tempfile::tempdir().unwrap();
    let result = driver
        .run_site(
            adapter,
            &[category.to_string()],
            NaiveDate::from_ymd_opt(2025, 8, 20).unwrap(),
            dir.path(),
            &ctx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    (result, fetcher, dir)
}

#[test]
fn fixtures_exist_for_every_known_site() {
    for site in KNOWN_SITES {
        assert!(!fixture(site, "listing.html").is_empty());
        assert!(!fixture(site, "item.html").is_empty());
    }
}

#[tokio::test]
async fn acheiusa_fixture_crawl_keeps_only_target_day() {
    let (result, fetcher, _dir) = crawl(
        "acheiusa",
        "https://www.acheiusa.com/classificados/imoveis",
        "https://www.acheiusa.com/anuncio/48213/apto-2q-boca",
        (2025, 8, 21),
    )
    .await;

    assert_eq!(result.site, "acheiusa");
    assert_eq!(result.pages, 3);
    assert_eq!(result.total_items, 1);
    assert!(fetcher
        .requests()
        .contains(&"https://www.acheiusa.com/anuncio/48190/casa-3q".to_string()));

    let records = read_listing_artifact(&result.artifact_path).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].title, "Apto 2Q Boca");
    assert_eq!(records[0].phone.as_deref(), Some("(561) 555-0100"));
    assert!(result.log_path.exists());
}

#[tokio::test]
async fn brazilianvoice_fixture_crawl_resolves_relative_age() {
    let (result, _fetcher, _dir) = crawl(
        "brazilianvoice",
        "https://www.brazilianvoice.com/classificados/aluguel",
        "https://www.brazilianvoice.com/classificados/anuncio/77031-quarto-em-newark/",
        (2025, 8, 22),
    )
    .await;

    assert_eq!(result.total_items, 1);
    let records = read_listing_artifact(&result.artifact_path).await.unwrap();
    assert_eq!(records[0].title, "Quarto em Newark");
    assert_eq!(records[0].post_date, NaiveDate::from_ymd_opt(2025, 8, 20));
    assert_eq!(records[0].state.as_deref(), Some("NJ"));
}
