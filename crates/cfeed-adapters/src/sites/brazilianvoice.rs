//! Brazilian Voice: classifieds board that only shows listing age
//! ("há 3 dias", "2 days ago"), with the ad id embedded in the URL.

use std::sync::OnceLock;

use async_trait::async_trait;
use cfeed_core::{clean_text, ClassifiedRecord, ListingEntry, ScrapeContext};
use regex::Regex;
use scraper::Html;

use crate::extract::{
    absolute_url, child_text, extract_phone, extract_title, labeled_value, parse_selector,
    select_first_attr, select_first_text, state_from_location, text_or_none, visible_lines,
};
use crate::{AdapterError, SiteAdapter};

pub const SITE: &str = "brazilianvoice";

const SITE_NAMES: [&str; 3] = [
    "Brazilian Voice",
    "BrazilianVoice",
    "Classificados Brazilian Voice",
];
const CARD_SELECTOR: &str = ".classified, li.ad, .ad-item";

static RE_AD_ID: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default)]
pub struct BrazilianVoiceAdapter;

/// `/classificados/anuncio/77031-quarto-em-newark/` -> `77031`
fn ad_id_from_url(url: &str) -> Option<String> {
    let pattern = RE_AD_ID.get_or_init(|| {
        Regex::new(r"(?:/|[?&]id=)(\d{3,})(?:[-/?&#]|$)").expect("valid ad id regex")
    });
    pattern.captures(url).map(|caps| caps[1].to_string())
}

#[async_trait]
impl SiteAdapter for BrazilianVoiceAdapter {
    fn site(&self) -> &'static str {
        SITE
    }

    fn listing_page_url(&self, category_url: &str, page: usize) -> String {
        let base = category_url.trim_end_matches('/');
        if page <= 1 {
            format!("{base}/")
        } else {
            format!("{base}/page/{page}/")
        }
    }

    fn parse_listing_entries(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<ListingEntry>, AdapterError> {
        let document = Html::parse_document(html);
        let cards = parse_selector(CARD_SELECTOR)?;
        let link = parse_selector("a[href]")?;
        let age_sel = parse_selector(".time, .ago, time")?;
        let location_sel = parse_selector(".city, .location")?;

        let mut entries = Vec::new();
        for card in document.select(&cards) {
            let Some(url) = card
                .select(&link)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|href| absolute_url(page_url, href))
            else {
                continue;
            };
            let ref_id = card
                .value()
                .attr("data-id")
                .and_then(text_or_none)
                .or_else(|| ad_id_from_url(&url));
            entries.push(ListingEntry {
                ref_id,
                when: child_text(card, &age_sel),
                location: child_text(card, &location_sel),
                url,
            });
        }
        Ok(entries)
    }

    fn parse_item_page(
        &self,
        html: &str,
        entry: &ListingEntry,
        ctx: &ScrapeContext,
    ) -> Result<ClassifiedRecord, AdapterError> {
        let document = Html::parse_document(html);
        let title = extract_title(&document, &SITE_NAMES)?.ok_or_else(|| AdapterError::Parse {
            url: entry.url.clone(),
            reason: "no title candidate".to_string(),
        })?;
        let lines = visible_lines(&document);

        // The item page's own age label is fresher than the listing card's.
        let when =
            select_first_text(&document, ".posted, .ago, .time")?.or_else(|| entry.when.clone());
        let explicit_date = select_first_attr(&document, "time[datetime]", "datetime")?;
        let location = select_first_text(&document, ".ad-location, .city")?
            .or_else(|| labeled_value(&lines, &["Cidade", "Location", "Local"]))
            .or_else(|| entry.location.clone());
        let description_selector = ".ad-description, .entry-content, article .content";
        let description = select_first_text(&document, description_selector)?.unwrap_or_default();

        let post_date = self.resolve_post_date(explicit_date.as_deref(), when.as_deref(), ctx);
        Ok(ClassifiedRecord {
            captured_at: ctx.captured_at,
            url: entry.url.clone(),
            title: clean_text(&title),
            ref_id: entry.ref_id.clone().or_else(|| ad_id_from_url(&entry.url)),
            state: location.as_deref().and_then(state_from_location),
            location,
            when,
            post_date,
            phone: extract_phone(&document, &lines)?,
            description: clean_text(&description),
            duplicate: false,
        })
    }
}
