//! HTML heuristics shared by the site adapters.

use std::sync::OnceLock;

use cfeed_core::clean_text;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::AdapterError;

static RE_PHONE: OnceLock<Regex> = OnceLock::new();
static RE_STATE: OnceLock<Regex> = OnceLock::new();

const US_STATES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM",
    "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA",
    "WV", "WI", "WY",
];

pub fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

pub fn text_or_none(value: &str) -> Option<String> {
    let cleaned = clean_text(value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

pub fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).find_map(element_text))
}

pub fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(text_or_none))
}

pub fn child_text(card: ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector).find_map(element_text)
}

/// Visible text chunks under `<body>` in document order, one per text node,
/// skipping script and style content.
pub fn visible_lines(document: &Html) -> Vec<String> {
    let body = Selector::parse("body").ok();
    let root = body
        .as_ref()
        .and_then(|sel| document.select(sel).next())
        .unwrap_or_else(|| document.root_element());

    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent()?;
            let parent_name = parent.value().as_element()?.name();
            if matches!(parent_name, "script" | "style" | "noscript" | "template") {
                return None;
            }
            text_or_none(text)
        })
        .collect()
}

/// Value of a `Label: value` line. When the label sits alone in its own
/// element the value is taken from the next line.
pub fn labeled_value(lines: &[String], labels: &[&str]) -> Option<String> {
    for (index, line) in lines.iter().enumerate() {
        for label in labels {
            let Some(prefix) = line.get(..label.len()) else {
                continue;
            };
            if !prefix.eq_ignore_ascii_case(label) {
                continue;
            }
            let rest = line[label.len()..].trim_start();
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            if let Some(value) = text_or_none(rest) {
                return Some(value);
            }
            return lines.get(index + 1).cloned();
        }
    }
    None
}

/// Drop a trailing `- Site Name` / `| Site Name` from a page title.
pub fn strip_site_suffix(title: &str, site_names: &[&str]) -> String {
    let cleaned = clean_text(title);
    let lower = cleaned.to_lowercase();
    for name in site_names {
        let name = name.to_lowercase();
        for sep in [" - ", " | ", " – ", " — ", " :: ", " · "] {
            let suffix = format!("{sep}{name}");
            if !lower.ends_with(&suffix) {
                continue;
            }
            if let Some(head) = cleaned.get(..cleaned.len().saturating_sub(suffix.len())) {
                return head.trim().to_string();
            }
        }
    }
    cleaned
}

/// First non-empty of: social metadata title, `<title>` without the site
/// suffix, `h1`/`h2`, first visible body line.
pub fn extract_title(document: &Html, site_names: &[&str]) -> Result<Option<String>, AdapterError> {
    let from_meta = select_first_attr(
        document,
        r#"meta[property="og:title"], meta[name="twitter:title"]"#,
        "content",
    )?;
    if let Some(title) = from_meta.map(|t| strip_site_suffix(&t, site_names)) {
        if !title.is_empty() {
            return Ok(Some(title));
        }
    }

    if let Some(title) = select_first_text(document, "head > title")? {
        let title = strip_site_suffix(&title, site_names);
        let is_only_site_name = site_names.iter().any(|n| n.eq_ignore_ascii_case(&title));
        if !title.is_empty() && !is_only_site_name {
            return Ok(Some(title));
        }
    }

    for heading in ["h1", "h2"] {
        if let Some(title) = select_first_text(document, heading)? {
            return Ok(Some(title));
        }
    }

    Ok(visible_lines(document).into_iter().next())
}

/// `(xxx) xxx-xxxx` when exactly ten North-American digits remain (an
/// optional leading country code 1 is dropped); otherwise the cleaned input.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let national = match digits.len() {
        11 if digits.starts_with('1') => &digits[1..],
        _ => digits.as_str(),
    };
    if national.len() == 10 {
        format!("({}) {}-{}", &national[..3], &national[3..6], &national[6..])
    } else {
        clean_text(raw)
    }
}

/// Phone from `tel:` links first, then the first inline number pattern.
pub fn extract_phone(document: &Html, lines: &[String]) -> Result<Option<String>, AdapterError> {
    if let Some(href) = select_first_attr(document, r#"a[href^="tel:"]"#, "href")? {
        let raw = href.trim_start_matches("tel:");
        if let Some(raw) = text_or_none(raw) {
            return Ok(Some(normalize_phone(&raw)));
        }
    }

    let pattern = RE_PHONE.get_or_init(|| {
        Regex::new(r"(?:\+?1[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}")
            .expect("valid phone regex")
    });
    Ok(lines
        .iter()
        .find_map(|line| pattern.find(line))
        .map(|m| normalize_phone(m.as_str())))
}

/// Two-letter US state code from a location such as `Boca Raton, FL 33431`.
pub fn state_from_location(location: &str) -> Option<String> {
    let pattern = RE_STATE.get_or_init(|| {
        Regex::new(r"(?:,|\s-)\s*([A-Za-z]{2})\b(?:\s+\d{5})?\s*$").expect("valid state regex")
    });
    let code = pattern.captures(location.trim())?[1].to_uppercase();
    US_STATES.contains(&code.as_str()).then_some(code)
}

pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(base).ok()?;
    let mut joined = base.join(href).ok()?;
    joined.set_fragment(None);
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}
