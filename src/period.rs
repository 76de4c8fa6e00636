//! Reporting-period extraction from free text.
//!
//! Recognized forms (case-insensitive):
//!
//! | Form | Example |
//! |------|---------|
//! | quarter then year | `Q2 2024`, `Q2-2024`, `Q2 FY2024`, `Q2 FY 2024` |
//! | quarter, two-digit year | `Q2'24`, `Q2 '24` |
//! | year then quarter | `2024Q2`, `2024 Q2`, `2024-Q2`, `FY2024 Q2` |
//! | spelled out | `second quarter 2024`, `2nd quarter of 2024`, `second-quarter 2024`, `fiscal second quarter 2024`, `fourth quarter of fiscal 2023` |
//!
//! When several forms occur, the leftmost occurrence wins. Text with no
//! recognizable period yields `None`; this is never an error.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::models::{Quarter, ReportingPeriod};

static QUARTER_YEAR_RE: OnceLock<Regex> = OnceLock::new();
static QUARTER_SHORT_YEAR_RE: OnceLock<Regex> = OnceLock::new();
static YEAR_QUARTER_RE: OnceLock<Regex> = OnceLock::new();
static SPELLED_RE: OnceLock<Regex> = OnceLock::new();

fn quarter_year_re() -> &'static Regex {
    QUARTER_YEAR_RE.get_or_init(|| {
        Regex::new(r"(?i)\bQ([1-4])[\s\-/]*(?:(?:FY|CY)\s*)?(\d{4})\b")
            .expect("static regex is valid")
    })
}

fn quarter_short_year_re() -> &'static Regex {
    QUARTER_SHORT_YEAR_RE.get_or_init(|| {
        Regex::new(r"(?i)\bQ([1-4])\s*['’](\d{2})\b").expect("static regex is valid")
    })
}

fn year_quarter_re() -> &'static Regex {
    YEAR_QUARTER_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:(?:FY|CY)\s*)?(\d{4})[\s\-]*Q([1-4])\b")
            .expect("static regex is valid")
    })
}

fn spelled_re() -> &'static Regex {
    SPELLED_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:fiscal\s+)?(first|second|third|fourth|1st|2nd|3rd|4th)[\s\-]+quarter(?:\s+of)?(?:\s+(?:fiscal|FY))?(?:\s+year)?\s*(\d{4})\b",
        )
        .expect("static regex is valid")
    })
}

fn ordinal_quarter(word: &str) -> Option<u32> {
    match word.to_ascii_lowercase().as_str() {
        "first" | "1st" => Some(1),
        "second" | "2nd" => Some(2),
        "third" | "3rd" => Some(3),
        "fourth" | "4th" => Some(4),
        _ => None,
    }
}

fn build(quarter: u32, year: i32) -> Option<ReportingPeriod> {
    if !(1900..=2100).contains(&year) {
        return None;
    }
    Quarter::from_number(quarter).map(|q| ReportingPeriod::new(q, year))
}

type Interpreter = fn(&Captures) -> Option<ReportingPeriod>;

fn interpret_quarter_year(caps: &Captures) -> Option<ReportingPeriod> {
    build(caps[1].parse().ok()?, caps[2].parse().ok()?)
}

fn interpret_short_year(caps: &Captures) -> Option<ReportingPeriod> {
    let yy: i32 = caps[2].parse().ok()?;
    build(caps[1].parse().ok()?, 2000 + yy)
}

fn interpret_year_quarter(caps: &Captures) -> Option<ReportingPeriod> {
    build(caps[2].parse().ok()?, caps[1].parse().ok()?)
}

fn interpret_spelled(caps: &Captures) -> Option<ReportingPeriod> {
    build(ordinal_quarter(&caps[1])?, caps[2].parse().ok()?)
}

/// Extracts the leftmost reporting period mentioned in `text`.
pub fn parse_reporting_period(text: &str) -> Option<ReportingPeriod> {
    let patterns: [(&Regex, Interpreter); 4] = [
        (quarter_year_re(), interpret_quarter_year),
        (quarter_short_year_re(), interpret_short_year),
        (year_quarter_re(), interpret_year_quarter),
        (spelled_re(), interpret_spelled),
    ];

    let mut best: Option<(usize, ReportingPeriod)> = None;
    for (re, interpret) in patterns {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if best.as_ref().is_some_and(|(start, _)| *start <= whole.start()) {
                break;
            }
            if let Some(period) = interpret(&caps) {
                best = Some((whole.start(), period));
                break;
            }
        }
    }
    best.map(|(_, period)| period)
}
