//! Core data models used throughout the ingestion core.
//!
//! These types represent the raw documents, manifest records, portfolio
//! snapshots, and graph entities/edges that flow through the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::temporal::freshness_score;

/// Channel a document arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Email,
    Api,
    Filing,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Email => "email",
            SourceType::Api => "api",
            SourceType::Filing => "filing",
            SourceType::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(SourceType::Email),
            "api" => Ok(SourceType::Api),
            "filing" => Ok(SourceType::Filing),
            "other" => Ok(SourceType::Other),
            other => Err(format!("unknown source type: '{}'", other)),
        }
    }
}

/// Raw document handed to the pipeline by an upstream connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub document_id: String,
    pub source_type: SourceType,
    pub content: String,
    #[serde(default)]
    pub source_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RawDocument {
    pub fn new(
        document_id: impl Into<String>,
        source_type: SourceType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            source_type,
            content: content.into(),
            source_date: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_source_date(mut self, date: DateTime<Utc>) -> Self {
        self.source_date = Some(date);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// SHA-256 digest of normalized document content, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Structural check used when validating a persisted manifest.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ingested document as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub content_hash: ContentHash,
    pub ingested_at: DateTime<Utc>,
    pub source_type: SourceType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Portfolio holdings as of a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub holdings: BTreeSet<String>,
}

/// Set difference between two consecutive portfolio snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioDelta {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub kept: BTreeSet<String>,
}

impl PortfolioDelta {
    pub fn between(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Self {
        Self {
            added: new.difference(old).cloned().collect(),
            removed: old.difference(new).cloned().collect(),
            kept: new.intersection(old).cloned().collect(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Normalizes a ticker symbol for holdings comparison.
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

// ─── Temporal metadata ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalType {
    PointInTime,
    Interval,
    Recurring,
}

impl FromStr for TemporalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "point_in_time" => Ok(TemporalType::PointInTime),
            "interval" => Ok(TemporalType::Interval),
            "recurring" => Ok(TemporalType::Recurring),
            other => Err(format!("unknown temporal type: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub fn from_number(n: u32) -> Option<Self> {
        match n {
            1 => Some(Quarter::Q1),
            2 => Some(Quarter::Q2),
            3 => Some(Quarter::Q3),
            4 => Some(Quarter::Q4),
            _ => None,
        }
    }

    pub fn number(&self) -> u32 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }
}

/// Fiscal quarter tag extracted from free text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub quarter: Quarter,
    pub year: i32,
    /// Canonical form, e.g. `"Q2 2024"`.
    pub period_string: String,
}

impl ReportingPeriod {
    pub fn new(quarter: Quarter, year: i32) -> Self {
        Self {
            quarter,
            year,
            period_string: format!("Q{} {}", quarter.number(), year),
        }
    }
}

/// Lifecycle of an entity's temporal validity.
///
/// `Superseded` and `Ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityState {
    Pending,
    Current,
    Superseded,
    Ended,
}

impl ValidityState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ValidityState::Superseded | ValidityState::Ended)
    }
}

/// Temporal annotation attached to an entity or edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalMetadata {
    pub valid_from: DateTime<Utc>,
    /// `None` means still valid.
    pub valid_to: Option<DateTime<Utc>>,
    pub temporal_type: TemporalType,
    pub freshness_score: f64,
    /// Instant `freshness_score` was computed against.
    pub freshness_as_of: DateTime<Utc>,
    pub reporting_period: Option<ReportingPeriod>,
    pub state: ValidityState,
}

impl TemporalMetadata {
    pub fn new(
        valid_from: DateTime<Utc>,
        temporal_type: TemporalType,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            valid_from,
            valid_to: None,
            temporal_type,
            freshness_score: freshness_score(age_days(valid_from, as_of)),
            freshness_as_of: as_of,
            reporting_period: None,
            state: ValidityState::Pending,
        }
    }

    /// Freshness recomputed against `now` rather than the stored `as_of`.
    pub fn freshness_at(&self, now: DateTime<Utc>) -> f64 {
        freshness_score(age_days(self.valid_from, now))
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether `instant` lies inside `[valid_from, valid_to]`.
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.valid_from && self.valid_to.map_or(true, |end| instant <= end)
    }

    /// Whether the two windows share at least one instant.
    pub fn overlaps(&self, other: &TemporalMetadata) -> bool {
        let start = self.valid_from.max(other.valid_from);
        self.covers(start) && other.covers(start)
    }

    /// Pending → current once the graph store has accepted the write.
    pub fn activate(&mut self) {
        if self.state == ValidityState::Pending {
            self.state = ValidityState::Current;
        }
    }

    /// Closes the window because a newer observation of the same metric
    /// arrived. Returns `false` when the state is already terminal or
    /// `at` precedes `valid_from`.
    pub fn supersede(&mut self, at: DateTime<Utc>) -> bool {
        self.close(at, ValidityState::Superseded)
    }

    /// Pulls the end of an already superseded window back to `at`, for an
    /// observation that arrived late and sits between this one and its
    /// former successor. The state stays `Superseded`. Returns `false`
    /// unless `at` falls strictly inside the current window.
    pub fn narrow_supersession(&mut self, at: DateTime<Utc>) -> bool {
        let inside = self.state == ValidityState::Superseded
            && at >= self.valid_from
            && self.valid_to.is_some_and(|end| at < end);
        if inside {
            self.valid_to = Some(at);
        }
        inside
    }

    /// Explicit end event for a standing relationship.
    pub fn end(&mut self, at: DateTime<Utc>) -> bool {
        self.close(at, ValidityState::Ended)
    }

    fn close(&mut self, at: DateTime<Utc>, terminal: ValidityState) -> bool {
        if self.state.is_terminal() || at < self.valid_from {
            return false;
        }
        self.valid_to = Some(at);
        self.state = terminal;
        true
    }
}

/// Age in fractional days between `from` and `now`, clamped at zero.
pub fn age_days(from: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - from).num_milliseconds() as f64 / 1000.0;
    (secs / 86_400.0).max(0.0)
}

// ─── Graph entities and edges ───────────────────────────────────────

/// Proximity of an entity to current portfolio holdings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceScore {
    Primary,
    Ecosystem,
    Peripheral,
}

impl RelevanceScore {
    pub fn value(&self) -> f64 {
        match self {
            RelevanceScore::Primary => 1.0,
            RelevanceScore::Ecosystem => 0.7,
            RelevanceScore::Peripheral => 0.3,
        }
    }
}

/// A graph node as handed to the external graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable upsert key.
    pub id: String,
    pub entity_type: String,
    /// Identity within `entity_type` (e.g. `"NVDA margin"`).
    pub name: String,
    pub ticker: Option<String>,
    /// `document_id` of the document this observation came from.
    pub source_document: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub temporal: Option<TemporalMetadata>,
    pub relevance: Option<RelevanceScore>,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            ticker: None,
            source_document: None,
            properties: BTreeMap::new(),
            temporal: None,
            relevance: None,
        }
    }

    /// Grouping key for observations of the same metric or entity.
    pub fn identity(&self) -> (&str, &str) {
        (&self.entity_type, &self.name)
    }
}

/// A graph relationship as handed to the external graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub edge_type: String,
    pub source_id: String,
    pub target_id: String,
    pub source_document: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub temporal: Option<TemporalMetadata>,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        edge_type: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            edge_type: edge_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            source_document: None,
            properties: BTreeMap::new(),
            temporal: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_delta_between_snapshots() {
        let delta = PortfolioDelta::between(&set(&["NVDA", "AMD"]), &set(&["NVDA", "GOOGL"]));
        assert_eq!(delta.added, set(&["GOOGL"]));
        assert_eq!(delta.removed, set(&["AMD"]));
        assert_eq!(delta.kept, set(&["NVDA"]));
    }

    #[test]
    fn test_source_type_parse() {
        assert_eq!("Email".parse::<SourceType>().unwrap(), SourceType::Email);
        assert_eq!(" api ".parse::<SourceType>().unwrap(), SourceType::Api);
        assert!("fax".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_supersede_is_terminal() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
        let mut meta = TemporalMetadata::new(t0, TemporalType::PointInTime, t0);
        assert_eq!(meta.state, ValidityState::Pending);
        meta.activate();
        assert_eq!(meta.state, ValidityState::Current);
        assert!(meta.supersede(t1));
        assert_eq!(meta.valid_to, Some(t1));
        assert!(!meta.supersede(t2));
        assert_eq!(meta.valid_to, Some(t1));
        assert!(!meta.end(t2));
        assert_eq!(meta.state, ValidityState::Superseded);
    }

    #[test]
    fn test_narrow_supersession_only_inside_window() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let apr = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
        let jul = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
        let mut meta = TemporalMetadata::new(jan, TemporalType::PointInTime, jan);

        // Not superseded yet.
        assert!(!meta.narrow_supersession(apr));

        meta.supersede(jul);
        assert!(!meta.narrow_supersession(jul));
        assert!(meta.narrow_supersession(apr));
        assert_eq!(meta.valid_to, Some(apr));
        assert_eq!(meta.state, ValidityState::Superseded);
        assert!(!meta.narrow_supersession(jul));
    }

    #[test]
    fn test_close_before_valid_from_rejected() {
        let t0 = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let mut meta = TemporalMetadata::new(t0, TemporalType::Interval, t0);
        assert!(!meta.end(earlier));
        assert!(meta.is_open());
    }

    #[test]
    fn test_overlap_open_and_closed_windows() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let mut closed = TemporalMetadata::new(jan, TemporalType::PointInTime, jan);
        closed.supersede(feb);
        let open_later = TemporalMetadata::new(mar, TemporalType::Interval, mar);
        let open_same = TemporalMetadata::new(feb, TemporalType::Interval, feb);

        assert!(!closed.overlaps(&open_later));
        assert!(!open_later.overlaps(&closed));
        assert!(closed.overlaps(&open_same));
    }

    #[test]
    fn test_freshness_recomputed_on_read() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let meta = TemporalMetadata::new(t0, TemporalType::PointInTime, t0);
        assert_eq!(meta.freshness_score, 1.0);
        let later = t0 + chrono::Duration::days(30);
        assert_eq!(meta.freshness_at(later), 0.5);
    }
}
