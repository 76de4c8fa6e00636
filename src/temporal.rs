//! Temporal enhancement of graph entities and edges.
//!
//! Attaches [`TemporalMetadata`] (validity window, freshness, reporting
//! period) and synthesizes two kinds of temporal edges:
//!
//! - `METRIC_EVOLVED` chains consecutive point-in-time observations of the
//!   same `(entity_type, name)` from oldest to newest. The older
//!   observation is superseded at the newer one's `valid_from`. An
//!   observation that arrives after a newer one is spliced in between its
//!   neighbours and the edge that skipped it is retired.
//! - `TEMPORALLY_CORRELATED` links distinct entities whose validity windows
//!   overlap and that share a time bucket (see [`TimeBucket`]).
//!
//! Correlation is quadratic in the size of each bucket, never in the size
//! of the whole input.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;

use crate::hasher::stable_id;
use crate::marker::first_marker_date;
use crate::models::{age_days, Edge, Entity, TemporalMetadata, TemporalType, ValidityState};
use crate::period::parse_reporting_period;

pub const METRIC_EVOLVED: &str = "METRIC_EVOLVED";
pub const TEMPORALLY_CORRELATED: &str = "TEMPORALLY_CORRELATED";

/// Half-life of the freshness decay, in days.
pub const HALF_LIFE_DAYS: f64 = 30.0;

/// `0.5 ^ (age_days / 30)`. Negative or NaN ages count as zero.
pub fn freshness_score(age_days: f64) -> f64 {
    let age = if age_days.is_nan() { 0.0 } else { age_days.max(0.0) };
    0.5_f64.powf(age / HALF_LIFE_DAYS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessCategory {
    /// Score ≥ 0.75 (age ≤ ~12.4 days).
    VeryFresh,
    /// Score ≥ 0.5 (age ≤ 30 days).
    Fresh,
    /// Score ≥ 0.25 (age ≤ 60 days).
    Moderate,
    Stale,
}

impl FreshnessCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.75 {
            FreshnessCategory::VeryFresh
        } else if score >= 0.5 {
            FreshnessCategory::Fresh
        } else if score >= 0.25 {
            FreshnessCategory::Moderate
        } else {
            FreshnessCategory::Stale
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessCategory::VeryFresh => "very_fresh",
            FreshnessCategory::Fresh => "fresh",
            FreshnessCategory::Moderate => "moderate",
            FreshnessCategory::Stale => "stale",
        }
    }
}

/// Granularity inside which `TEMPORALLY_CORRELATED` edges are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    /// Same source document.
    Document,
    /// Same ISO week of `valid_from`.
    Week,
    /// Same reporting quarter (or calendar quarter of `valid_from`).
    Quarter,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketKey {
    Document(String),
    Week { year: i32, week: u32 },
    Quarter { year: i32, quarter: u32 },
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::Document(id) => write!(f, "document:{}", id),
            BucketKey::Week { year, week } => write!(f, "week:{}-W{:02}", year, week),
            BucketKey::Quarter { year, quarter } => write!(f, "quarter:{}-Q{}", year, quarter),
        }
    }
}

/// Per-document input to enhancement.
#[derive(Debug, Clone, Copy)]
pub struct EnhanceContext<'a> {
    /// Full document text, used for marker dates and reporting periods.
    pub text: &'a str,
    /// Ingestion time; the fallback `valid_from`.
    pub now: DateTime<Utc>,
}

impl<'a> EnhanceContext<'a> {
    pub fn new(text: &'a str, now: DateTime<Utc>) -> Self {
        Self { text, now }
    }
}

const METRIC_ENTITY_TYPES: &[&str] = &[
    "metric", "financial", "kpi", "price", "rating", "estimate", "earnings", "guidance",
];

const STANDING_ENTITY_TYPES: &[&str] = &[
    "company", "organization", "person", "sector", "industry", "product", "fund", "ticker",
];

const STANDING_EDGE_TYPES: &[&str] = &[
    "COMPETES_WITH",
    "COMPETITOR_OF",
    "SUPPLIES",
    "SUPPLIER_OF",
    "CUSTOMER_OF",
    "PARTNERS_WITH",
    "PARTNER_OF",
    "OWNS",
    "HOLDS",
    "SUBSIDIARY_OF",
    "WORKS_AT",
    "EMPLOYED_BY",
    "CEO_OF",
    "MEMBER_OF",
    "IN_SECTOR",
];

const RECURRING_KEYWORDS: &[&str] = &[
    "recurring",
    "every quarter",
    "each quarter",
    "quarterly dividend",
    "annual dividend",
    "annually",
    "monthly",
    "weekly",
];

/// Output of [`TemporalEnhancer::plan_temporal_edges`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalEdges {
    pub created: Vec<Edge>,
    /// Ids of `METRIC_EVOLVED` edges that now skip an observation.
    pub retired: Vec<String>,
}

/// Attaches temporal metadata and synthesizes temporal edges.
#[derive(Debug, Clone)]
pub struct TemporalEnhancer {
    bucket: TimeBucket,
}

impl Default for TemporalEnhancer {
    fn default() -> Self {
        Self::new(TimeBucket::Document)
    }
}

impl TemporalEnhancer {
    pub fn new(bucket: TimeBucket) -> Self {
        Self { bucket }
    }

    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    /// Attaches temporal metadata to an entity.
    ///
    /// Entities that already carry metadata only get their freshness
    /// refreshed against `ctx.now`.
    pub fn enhance_entity(
        &self,
        mut entity: Entity,
        source_date: Option<DateTime<Utc>>,
        ctx: &EnhanceContext<'_>,
    ) -> Entity {
        if let Some(temporal) = entity.temporal.as_mut() {
            refresh_freshness(temporal, ctx.now);
            return entity;
        }

        let local = local_text(&entity.name, &entity.properties);
        let local_period = parse_reporting_period(&local);
        let explicit = explicit_type(&entity.properties);
        let entity_type = entity.entity_type.to_ascii_lowercase();
        let metric_like = METRIC_ENTITY_TYPES.contains(&entity_type.as_str());

        let temporal_type = explicit.unwrap_or_else(|| {
            if has_recurring_keyword(&local) {
                TemporalType::Recurring
            } else if metric_like || local_period.is_some() {
                TemporalType::PointInTime
            } else if STANDING_ENTITY_TYPES.contains(&entity_type.as_str()) {
                TemporalType::Interval
            } else {
                TemporalType::PointInTime
            }
        });

        let reporting_period = match temporal_type {
            TemporalType::Interval => local_period,
            _ if metric_like => local_period.or_else(|| parse_reporting_period(ctx.text)),
            _ => local_period,
        };

        let mut temporal =
            TemporalMetadata::new(resolve_valid_from(source_date, ctx), temporal_type, ctx.now);
        temporal.reporting_period = reporting_period;
        entity.temporal = Some(temporal);
        entity
    }

    /// Attaches temporal metadata to an edge.
    ///
    /// When `endpoints` are given and the two endpoint windows never cover
    /// a common instant, a point-in-time edge is downgraded to an interval
    /// spanning both endpoints.
    pub fn enhance_edge(
        &self,
        mut edge: Edge,
        source_date: Option<DateTime<Utc>>,
        ctx: &EnhanceContext<'_>,
        endpoints: Option<(&TemporalMetadata, &TemporalMetadata)>,
    ) -> Edge {
        if let Some(temporal) = edge.temporal.as_mut() {
            refresh_freshness(temporal, ctx.now);
            return edge;
        }

        let local = local_text(&edge.edge_type, &edge.properties);
        let local_period = parse_reporting_period(&local);
        let edge_type = edge.edge_type.to_ascii_uppercase();

        let temporal_type = explicit_type(&edge.properties).unwrap_or_else(|| {
            if has_recurring_keyword(&local) {
                TemporalType::Recurring
            } else if STANDING_EDGE_TYPES.contains(&edge_type.as_str()) {
                TemporalType::Interval
            } else {
                TemporalType::PointInTime
            }
        });

        let mut temporal =
            TemporalMetadata::new(resolve_valid_from(source_date, ctx), temporal_type, ctx.now);
        temporal.reporting_period = local_period;

        if let Some((a, b)) = endpoints {
            if temporal.temporal_type != TemporalType::Interval && !a.overlaps(b) {
                let start = temporal.valid_from.min(a.valid_from).min(b.valid_from);
                temporal.temporal_type = TemporalType::Interval;
                temporal.valid_from = start;
                temporal.valid_to = match (a.valid_to, b.valid_to) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    _ => None,
                };
                refresh_freshness(&mut temporal, ctx.now);
            }
        }

        edge.temporal = Some(temporal);
        edge
    }

    /// Explicit end event for a standing relationship.
    pub fn end_relationship(&self, edge: &mut Edge, at: DateTime<Utc>) -> bool {
        edge.temporal.as_mut().is_some_and(|t| t.end(at))
    }

    pub fn bucket_key(&self, entity: &Entity) -> Option<BucketKey> {
        let temporal = entity.temporal.as_ref()?;
        match self.bucket {
            TimeBucket::Document => entity.source_document.clone().map(BucketKey::Document),
            TimeBucket::Week => {
                let week = temporal.valid_from.iso_week();
                Some(BucketKey::Week {
                    year: week.year(),
                    week: week.week(),
                })
            }
            TimeBucket::Quarter => Some(match &temporal.reporting_period {
                Some(period) => BucketKey::Quarter {
                    year: period.year,
                    quarter: period.quarter.number(),
                },
                None => BucketKey::Quarter {
                    year: temporal.valid_from.year(),
                    quarter: (temporal.valid_from.month() - 1) / 3 + 1,
                },
            }),
        }
    }

    /// Groups entity indices by bucket. Entities without temporal metadata
    /// (or without a source document in `document` mode) are left out.
    pub fn bucket_entities(&self, entities: &[Entity]) -> BTreeMap<BucketKey, Vec<usize>> {
        let mut buckets: BTreeMap<BucketKey, Vec<usize>> = BTreeMap::new();
        for (idx, entity) in entities.iter().enumerate() {
            if let Some(key) = self.bucket_key(entity) {
                buckets.entry(key).or_default().push(idx);
            }
        }
        buckets
    }

    /// Synthesizes temporal edges over `entities`, superseding older
    /// point-in-time observations in place.
    ///
    /// Edge ids are derived from `(type, from, to)`, so repeated calls over
    /// the same entities yield the same edges; ids already present in
    /// `existing` are not emitted again.
    pub fn create_temporal_edges(&self, entities: &mut [Entity], existing: &[Edge]) -> Vec<Edge> {
        self.plan_temporal_edges(entities, existing).created
    }

    /// Like [`create_temporal_edges`](Self::create_temporal_edges), but
    /// also reports `METRIC_EVOLVED` edges made obsolete by an observation
    /// that landed between two already chained ones.
    ///
    /// `entities` should hold the full history of every identity involved,
    /// superseded observations included, so a late arrival finds both of
    /// its neighbours.
    pub fn plan_temporal_edges(&self, entities: &mut [Entity], existing: &[Edge]) -> TemporalEdges {
        let mut seen: HashSet<String> = existing.iter().map(|e| e.id.clone()).collect();
        let mut plan = TemporalEdges::default();

        self.chain_metric_evolution(entities, &mut seen, &mut plan);
        self.correlate_within_buckets(entities, &mut seen, &mut plan.created);

        plan
    }

    fn chain_metric_evolution(
        &self,
        entities: &mut [Entity],
        seen: &mut HashSet<String>,
        plan: &mut TemporalEdges,
    ) {
        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (idx, entity) in entities.iter().enumerate() {
            let point_in_time = entity
                .temporal
                .as_ref()
                .is_some_and(|t| t.temporal_type == TemporalType::PointInTime);
            if point_in_time {
                let (kind, name) = entity.identity();
                groups
                    .entry((kind.to_string(), name.to_string()))
                    .or_default()
                    .push(idx);
            }
        }

        for indices in groups.into_values() {
            // (valid_from, indices observed at that instant), oldest first.
            let mut time_points: BTreeMap<DateTime<Utc>, Vec<usize>> = BTreeMap::new();
            for idx in indices {
                if let Some(t) = entities[idx].temporal.as_ref() {
                    time_points.entry(t.valid_from).or_default().push(idx);
                }
            }
            if time_points.len() < 2 {
                continue;
            }
            for group in time_points.values_mut() {
                group.sort_by(|a, b| entities[*a].id.cmp(&entities[*b].id));
            }

            let ordered: Vec<(DateTime<Utc>, Vec<usize>)> = time_points.into_iter().collect();
            for pair in ordered.windows(2) {
                let (_, older) = &pair[0];
                let (newer_at, newer) = &pair[1];

                // An older observation already closed at a later instant was
                // chained past this one; its old successor is the stale target.
                let former_end = entities[older[0]]
                    .temporal
                    .as_ref()
                    .filter(|t| t.state == ValidityState::Superseded)
                    .and_then(|t| t.valid_to)
                    .filter(|end| end > newer_at);

                for idx in older {
                    if let Some(t) = entities[*idx].temporal.as_mut() {
                        if !t.supersede(*newer_at) {
                            t.narrow_supersession(*newer_at);
                        }
                    }
                }

                if let Some(end) = former_end {
                    if let Some((_, skipped_to)) = ordered.iter().find(|(at, _)| *at == end) {
                        let stale = stable_id(&[
                            METRIC_EVOLVED,
                            &entities[older[0]].id,
                            &entities[skipped_to[0]].id,
                        ]);
                        plan.retired.push(stale);
                    }
                }

                let from = &entities[older[0]];
                let to = &entities[newer[0]];
                let id = stable_id(&[METRIC_EVOLVED, &from.id, &to.id]);
                if !seen.insert(id.clone()) {
                    continue;
                }
                plan.created.push(evolution_edge(id, from, to));
            }
        }
    }

    fn correlate_within_buckets(
        &self,
        entities: &[Entity],
        seen: &mut HashSet<String>,
        out: &mut Vec<Edge>,
    ) {
        for (key, members) in self.bucket_entities(entities) {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    let (a, b) = (&entities[i], &entities[j]);
                    if a.identity() == b.identity() || a.id == b.id {
                        continue;
                    }
                    let (Some(ta), Some(tb)) = (a.temporal.as_ref(), b.temporal.as_ref()) else {
                        continue;
                    };
                    if !ta.overlaps(tb) {
                        continue;
                    }
                    let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
                    let id = stable_id(&[TEMPORALLY_CORRELATED, &first.id, &second.id]);
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    out.push(correlation_edge(id, first, second, &key));
                }
            }
        }
    }
}

fn evolution_edge(id: String, from: &Entity, to: &Entity) -> Edge {
    let mut edge = Edge::new(id, METRIC_EVOLVED, from.id.clone(), to.id.clone());
    edge.source_document = to.source_document.clone();
    edge.properties.insert("metric".to_string(), to.name.clone());
    if let Some(to_t) = to.temporal.as_ref() {
        if let Some(period) = from.temporal.as_ref().and_then(|t| t.reporting_period.as_ref()) {
            edge.properties
                .insert("from_period".to_string(), period.period_string.clone());
        }
        if let Some(period) = to_t.reporting_period.as_ref() {
            edge.properties
                .insert("to_period".to_string(), period.period_string.clone());
        }
        edge.temporal = Some(TemporalMetadata::new(
            to_t.valid_from,
            TemporalType::PointInTime,
            to_t.freshness_as_of,
        ));
    }
    for (key, label) in [("value", "value"), ("unit", "unit")] {
        if let Some(v) = from.properties.get(key) {
            edge.properties.insert(format!("from_{}", label), v.clone());
        }
        if let Some(v) = to.properties.get(key) {
            edge.properties.insert(format!("to_{}", label), v.clone());
        }
    }
    edge
}

fn correlation_edge(id: String, a: &Entity, b: &Entity, bucket: &BucketKey) -> Edge {
    let mut edge = Edge::new(id, TEMPORALLY_CORRELATED, a.id.clone(), b.id.clone());
    edge.properties.insert("bucket".to_string(), bucket.to_string());
    if a.source_document.is_some() && a.source_document == b.source_document {
        edge.source_document = a.source_document.clone();
    }
    if let (Some(ta), Some(tb)) = (a.temporal.as_ref(), b.temporal.as_ref()) {
        let mut temporal = TemporalMetadata::new(
            ta.valid_from.max(tb.valid_from),
            TemporalType::Interval,
            ta.freshness_as_of.max(tb.freshness_as_of),
        );
        temporal.valid_to = match (ta.valid_to, tb.valid_to) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (end, None) | (None, end) => end,
        };
        edge.temporal = Some(temporal);
    }
    edge
}

fn refresh_freshness(temporal: &mut TemporalMetadata, now: DateTime<Utc>) {
    temporal.freshness_score = freshness_score(age_days(temporal.valid_from, now));
    temporal.freshness_as_of = now;
}

fn resolve_valid_from(source_date: Option<DateTime<Utc>>, ctx: &EnhanceContext<'_>) -> DateTime<Utc> {
    source_date
        .or_else(|| first_marker_date(ctx.text))
        .unwrap_or(ctx.now)
}

fn local_text(label: &str, properties: &BTreeMap<String, String>) -> String {
    let mut text = label.to_string();
    for value in properties.values() {
        text.push(' ');
        text.push_str(value);
    }
    text
}

fn explicit_type(properties: &BTreeMap<String, String>) -> Option<TemporalType> {
    properties.get("temporal_type").and_then(|v| v.parse().ok())
}

fn has_recurring_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    RECURRING_KEYWORDS.iter().any(|k| lower.contains(k))
}
