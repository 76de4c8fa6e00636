//! Entity and relationship extraction.
//!
//! Extraction is pluggable through the [`Extractor`] trait. Implementations
//! may call out to language models or third-party APIs; the orchestrator
//! runs them on a bounded worker pool and treats any error as a
//! per-document failure.
//!
//! [`MarkerExtractor`] is the built-in, deterministic implementation:
//!
//! | Input | Output |
//! |-------|--------|
//! | source marker carrying `SYMBOL:X` | one `Company` entity per distinct symbol |
//! | `metric.<name>` metadata key | one `Metric` observation named `"<TICKER> <name>"` |
//! | two or more symbols | `CO_MENTIONED` edges between every pair |

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::hasher::stable_id;
use crate::marker::parse_markers;
use crate::models::{normalize_ticker, Edge, Entity, RawDocument};

pub const CO_MENTIONED: &str = "CO_MENTIONED";

/// Entities and edges pulled from one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub edges: Vec<Edge>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.edges.is_empty()
    }
}

/// Turns a raw document into graph entities and edges.
///
/// Entity and edge ids must be stable for identical input so that a
/// document re-processed after a failed run converges on the same graph
/// nodes.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, doc: &RawDocument) -> Result<Extraction>;
}

/// Extracts companies from source markers and metrics from metadata.
#[derive(Debug, Clone, Default)]
pub struct MarkerExtractor;

impl MarkerExtractor {
    pub fn new() -> Self {
        Self
    }

    fn tickers(doc: &RawDocument) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        let from_metadata = doc.metadata.get("ticker").map(|t| normalize_ticker(t));
        let from_markers = parse_markers(&doc.content).into_iter().map(|m| m.symbol);
        for ticker in from_metadata.into_iter().chain(from_markers) {
            if !ticker.is_empty() && seen.insert(ticker.clone()) {
                ordered.push(ticker);
            }
        }
        ordered
    }

    fn company(ticker: &str, doc: &RawDocument) -> Entity {
        let mut entity = Entity::new(stable_id(&["Company", ticker]), "Company", ticker);
        entity.ticker = Some(ticker.to_string());
        entity.source_document = Some(doc.document_id.clone());
        entity
    }

    fn metrics(primary: Option<&str>, doc: &RawDocument) -> Vec<Entity> {
        let mut values: BTreeMap<&str, &str> = BTreeMap::new();
        let mut units: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, value) in &doc.metadata {
            let Some(rest) = key.strip_prefix("metric.") else {
                continue;
            };
            match rest.strip_suffix(".unit") {
                Some(metric) => {
                    units.insert(metric, value);
                }
                None => {
                    values.insert(rest, value);
                }
            }
        }

        values
            .into_iter()
            .filter(|(metric, _)| !metric.is_empty())
            .map(|(metric, value)| {
                let label = metric.replace('_', " ");
                let name = match primary {
                    Some(ticker) => format!("{} {}", ticker, label),
                    None => label,
                };
                let mut entity = Entity::new(
                    stable_id(&["Metric", &name, &doc.document_id]),
                    "Metric",
                    name,
                );
                entity.ticker = primary.map(str::to_string);
                entity.source_document = Some(doc.document_id.clone());
                entity.properties.insert("value".to_string(), value.to_string());
                if let Some(unit) = units.get(metric) {
                    entity.properties.insert("unit".to_string(), unit.to_string());
                }
                if let Some(period) = doc.metadata.get("period") {
                    entity.properties.insert("period".to_string(), period.clone());
                }
                entity
            })
            .collect()
    }
}

#[async_trait]
impl Extractor for MarkerExtractor {
    fn name(&self) -> &str {
        "marker"
    }

    async fn extract(&self, doc: &RawDocument) -> Result<Extraction> {
        let tickers = Self::tickers(doc);
        let companies: Vec<Entity> = tickers.iter().map(|t| Self::company(t, doc)).collect();

        let mut edges = Vec::new();
        for (pos, a) in companies.iter().enumerate() {
            for b in &companies[pos + 1..] {
                let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
                let mut edge = Edge::new(
                    stable_id(&[CO_MENTIONED, &first.id, &second.id, &doc.document_id]),
                    CO_MENTIONED,
                    first.id.clone(),
                    second.id.clone(),
                );
                edge.source_document = Some(doc.document_id.clone());
                edges.push(edge);
            }
        }

        let mut entities = companies;
        entities.extend(Self::metrics(tickers.first().map(String::as_str), doc));
        Ok(Extraction { entities, edges })
    }
}
