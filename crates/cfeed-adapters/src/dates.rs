//! Post-date resolution: explicit `dd/mm/yyyy` fields and relative age
//! phrases in English or Portuguese.

use std::sync::OnceLock;

use cfeed_core::strip_diacritics;
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use regex::Regex;

static RE_DMY: OnceLock<Regex> = OnceLock::new();
static RE_ISO: OnceLock<Regex> = OnceLock::new();
static RE_RELATIVE: OnceLock<Regex> = OnceLock::new();

/// `20/08/2025`, `Data: 20/08/2025` or an ISO `2025-08-20` prefix.
pub fn parse_explicit_date(text: &str) -> Option<NaiveDate> {
    let dmy = RE_DMY.get_or_init(|| {
        Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid dd/mm/yyyy regex")
    });
    if let Some(caps) = dmy.captures(text) {
        let day = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let year = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    let iso = RE_ISO
        .get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})").expect("valid iso date regex"));
    let caps = iso.captures(text)?;
    NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgeUnit {
    Instant,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

fn unit_for(token: &str) -> Option<AgeUnit> {
    let unit = match token {
        "segundo" | "segundos" | "second" | "seconds" | "sec" | "secs" | "minuto" | "minutos"
        | "minute" | "minutes" | "min" | "mins" => AgeUnit::Instant,
        "hora" | "horas" | "hour" | "hours" | "hr" | "hrs" | "h" => AgeUnit::Hours,
        "dia" | "dias" | "day" | "days" | "d" => AgeUnit::Days,
        "semana" | "semanas" | "week" | "weeks" | "wk" | "wks" | "w" => AgeUnit::Weeks,
        "mes" | "meses" | "month" | "months" => AgeUnit::Months,
        "ano" | "anos" | "year" | "years" | "yr" | "yrs" => AgeUnit::Years,
        _ => return None,
    };
    Some(unit)
}

/// "3 days ago", "há 2 semanas", "an hour ago", "ontem". Hours are taken off
/// the capture instant, larger units off the capture date.
pub fn parse_relative_date(text: &str, captured_at: DateTime<Utc>) -> Option<NaiveDate> {
    let today = captured_at.date_naive();
    let lower = strip_diacritics(&text.to_lowercase());

    if lower.contains("yesterday") || lower.contains("ontem") {
        return today.pred_opt();
    }
    if ["today", "hoje", "just now", "agora"]
        .iter()
        .any(|word| lower.contains(word))
    {
        return Some(today);
    }

    // A numeric count may touch its unit ("3h"); a word count needs a space,
    // otherwise words like "ad" or "ah" read as "a d" and "a h".
    let relative = RE_RELATIVE.get_or_init(|| {
        Regex::new(r"\b(\d+)\s*([a-z]+)\b|\b(an?|uma?)\s+([a-z]+)\b")
            .expect("valid relative age regex")
    });
    for caps in relative.captures_iter(&lower) {
        let (count, unit) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
            (Some(digits), Some(unit), _, _) => (Some(digits.as_str()), unit.as_str()),
            (_, _, Some(_), Some(unit)) => (None, unit.as_str()),
            _ => continue,
        };
        let Some(unit) = unit_for(unit) else {
            continue;
        };
        let count: u32 = match count {
            Some(digits) => digits.parse().ok()?,
            None => 1,
        };
        return match unit {
            AgeUnit::Instant => Some(today),
            AgeUnit::Hours => captured_at
                .checked_sub_signed(Duration::try_hours(i64::from(count))?)
                .map(|at| at.date_naive()),
            AgeUnit::Days => today.checked_sub_signed(Duration::try_days(i64::from(count))?),
            AgeUnit::Weeks => today.checked_sub_signed(Duration::try_weeks(i64::from(count))?),
            AgeUnit::Months => today.checked_sub_months(Months::new(count)),
            AgeUnit::Years => today.checked_sub_months(Months::new(count.checked_mul(12)?)),
        };
    }
    None
}
