//! Source-marker parsing.
//!
//! Upstream text carries tagged prefixes such as
//! `[SOURCE:EMAIL|SYMBOL:NVDA|DATE:2024-04-15|CONFIDENCE:0.92]`.
//! Markers are treated as opaque key/value text: `SOURCE` and `SYMBOL` are
//! required, `DATE` and `CONFIDENCE` are optional, and any other keys are
//! kept verbatim in [`SourceMarker::extra`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

static MARKER_RE: OnceLock<Regex> = OnceLock::new();

fn marker_re() -> &'static Regex {
    MARKER_RE.get_or_init(|| Regex::new(r"\[SOURCE:[^\]\n]*\]").expect("static regex is valid"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMarker {
    pub source: String,
    pub symbol: String,
    pub date: Option<DateTime<Utc>>,
    pub confidence: Option<f64>,
    pub extra: BTreeMap<String, String>,
}

/// Parses every well-formed marker in `text`, in order of appearance.
///
/// Markers missing `SOURCE` or `SYMBOL` are skipped. An unparseable
/// `DATE` or `CONFIDENCE` leaves that field unset.
pub fn parse_markers(text: &str) -> Vec<SourceMarker> {
    marker_re()
        .find_iter(text)
        .filter_map(|m| {
            let inner = &m.as_str()[1..m.as_str().len() - 1];
            parse_marker_body(inner)
        })
        .collect()
}

/// The first marker's date, if any marker carries one.
pub fn first_marker_date(text: &str) -> Option<DateTime<Utc>> {
    parse_markers(text).into_iter().find_map(|m| m.date)
}

fn parse_marker_body(body: &str) -> Option<SourceMarker> {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    for pair in body.split('|') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        fields.entry(key).or_insert_with(|| value.to_string());
    }

    let source = fields.remove("SOURCE")?;
    let symbol = fields.remove("SYMBOL")?.to_ascii_uppercase();
    let date = fields
        .remove("DATE")
        .and_then(|raw| parse_marker_date(&raw));
    let confidence = fields
        .remove("CONFIDENCE")
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|c| (0.0..=1.0).contains(c));

    Some(SourceMarker {
        source,
        symbol,
        date,
        confidence,
        extra: fields,
    })
}

/// Accepts RFC 3339, naive ISO 8601 (assumed UTC) and bare dates.
pub fn parse_marker_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}
