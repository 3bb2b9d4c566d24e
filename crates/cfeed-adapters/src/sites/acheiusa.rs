//! AcheiUSA: Portuguese-language classifieds with an explicit
//! `Data: dd/mm/yyyy` field and a `Ref:` identifier on every ad.

use async_trait::async_trait;
use cfeed_core::{clean_text, ClassifiedRecord, ListingEntry, ScrapeContext};
use scraper::Html;
use url::Url;

use crate::extract::{
    absolute_url, child_text, extract_phone, extract_title, labeled_value, parse_selector,
    select_first_attr, select_first_text, state_from_location, text_or_none, visible_lines,
};
use crate::{AdapterError, SiteAdapter};

pub const SITE: &str = "acheiusa";

const SITE_NAMES: [&str; 2] = ["AcheiUSA", "Achei USA"];
const CARD_SELECTOR: &str = ".classified-item, .anuncio, article.listing";
const REF_LABELS: [&str; 3] = ["Referência", "Ref", "Código"];

#[derive(Debug, Clone, Copy, Default)]
pub struct AcheiUsaAdapter;

/// "Ref: 48213" -> "48213"
fn strip_ref_label(text: &str) -> Option<String> {
    let mut value = text.trim();
    for label in REF_LABELS {
        if let Some(rest) = value.strip_prefix(label) {
            value = rest.trim_start().trim_start_matches([':', '#', '.']).trim();
            break;
        }
    }
    text_or_none(value)
}

#[async_trait]
impl SiteAdapter for AcheiUsaAdapter {
    fn site(&self) -> &'static str {
        SITE
    }

    fn listing_page_url(&self, category_url: &str, page: usize) -> String {
        let Ok(mut url) = Url::parse(category_url) else {
            return format!("{category_url}?page={page}");
        };
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("page", &page.to_string());
        url.to_string()
    }

    fn parse_listing_entries(
        &self,
        html: &str,
        page_url: &str,
    ) -> Result<Vec<ListingEntry>, AdapterError> {
        let document = Html::parse_document(html);
        let cards = parse_selector(CARD_SELECTOR)?;
        let link = parse_selector("a[href]")?;
        let ref_sel = parse_selector(".ref, .codigo")?;
        let date_sel = parse_selector(".date, .data")?;
        let location_sel = parse_selector(".location, .local")?;

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
                .attr("data-ref")
                .and_then(text_or_none)
                .or_else(|| child_text(card, &ref_sel).and_then(|t| strip_ref_label(&t)));
            entries.push(ListingEntry {
                url,
                ref_id,
                when: child_text(card, &date_sel),
                location: child_text(card, &location_sel),
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
        let explicit_date = labeled_value(&lines, &["Data", "Publicado em", "Date"]);
        let ref_id = labeled_value(&lines, &REF_LABELS).or_else(|| entry.ref_id.clone());
        let location = labeled_value(&lines, &["Localização", "Local", "Cidade"])
            .or_else(|| entry.location.clone());
        let description_selector = ".description, .anuncio-descricao, #descricao";
        let description = match select_first_text(&document, description_selector)? {
            Some(text) => text,
            None => select_first_attr(&document, r#"meta[name="description"]"#, "content")?
                .unwrap_or_default(),
        };

        let post_date =
            self.resolve_post_date(explicit_date.as_deref(), entry.when.as_deref(), ctx);
        Ok(ClassifiedRecord {
            captured_at: ctx.captured_at,
            url: entry.url.clone(),
            title: clean_text(&title),
            ref_id,
            state: location.as_deref().and_then(state_from_location),
            location,
            when: entry.when.clone(),
            post_date,
            phone: extract_phone(&document, &lines)?,
            description: clean_text(&description),
            duplicate: false,
        })
    }
}
