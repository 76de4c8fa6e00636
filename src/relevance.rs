//! Portfolio relevance scoring.
//!
//! | Score | Value | Rule |
//! |-------|-------|------|
//! | primary | 1.0 | the entity's ticker is a current holding |
//! | ecosystem | 0.7 | listed under a holding in the ecosystem map, or linked by an edge to a primary entity of the same document |
//! | peripheral | 0.3 | everything else |
//!
//! Scores are assigned once, at ingestion time. Entities that already carry
//! a score are left untouched; re-scoring history is an explicit caller pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::models::{normalize_ticker, Edge, Entity, RelevanceScore};

#[derive(Debug, Clone, Default)]
pub struct RelevanceScorer {
    holdings: BTreeSet<String>,
    /// holding → related tickers (suppliers, competitors, customers).
    ecosystem: BTreeMap<String, BTreeSet<String>>,
}

impl RelevanceScorer {
    pub fn new<I, S>(holdings: I, ecosystem: &BTreeMap<String, Vec<String>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ecosystem = ecosystem
            .iter()
            .map(|(holding, related)| {
                (
                    normalize_ticker(holding),
                    related.iter().map(|t| normalize_ticker(t)).collect(),
                )
            })
            .collect();
        Self {
            holdings: holdings
                .into_iter()
                .map(|h| normalize_ticker(h.as_ref()))
                .collect(),
            ecosystem,
        }
    }

    /// Same ecosystem map, different holdings (e.g. this run's portfolio).
    pub fn with_holdings<I, S>(&self, holdings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            holdings: holdings
                .into_iter()
                .map(|h| normalize_ticker(h.as_ref()))
                .collect(),
            ecosystem: self.ecosystem.clone(),
        }
    }

    pub fn holdings(&self) -> &BTreeSet<String> {
        &self.holdings
    }

    fn ticker_of(entity: &Entity) -> String {
        match entity.ticker.as_deref() {
            Some(ticker) => normalize_ticker(ticker),
            None => normalize_ticker(&entity.name),
        }
    }

    fn in_ecosystem(&self, ticker: &str) -> bool {
        self.holdings.iter().any(|holding| {
            self.ecosystem
                .get(holding)
                .is_some_and(|related| related.contains(ticker))
        })
    }

    /// Score from the entity alone, ignoring edges.
    pub fn score_entity(&self, entity: &Entity) -> RelevanceScore {
        let ticker = Self::ticker_of(entity);
        if self.holdings.contains(&ticker) {
            RelevanceScore::Primary
        } else if self.in_ecosystem(&ticker) {
            RelevanceScore::Ecosystem
        } else {
            RelevanceScore::Peripheral
        }
    }

    /// Scores one document's entities, using its edges to lift peripheral
    /// entities adjacent to a primary one. Returns how many were scored.
    pub fn score_document(&self, entities: &mut [Entity], edges: &[Edge]) -> usize {
        let primary_ids: HashSet<&str> = entities
            .iter()
            .filter(|e| self.score_entity(e) == RelevanceScore::Primary)
            .map(|e| e.id.as_str())
            .collect();

        let adjacent: HashSet<String> = edges
            .iter()
            .filter_map(|edge| {
                if primary_ids.contains(edge.source_id.as_str()) {
                    Some(edge.target_id.clone())
                } else if primary_ids.contains(edge.target_id.as_str()) {
                    Some(edge.source_id.clone())
                } else {
                    None
                }
            })
            .collect();

        let mut scored = 0;
        for entity in entities.iter_mut().filter(|e| e.relevance.is_none()) {
            let mut score = self.score_entity(entity);
            if score == RelevanceScore::Peripheral && adjacent.contains(&entity.id) {
                score = RelevanceScore::Ecosystem;
            }
            entity.relevance = Some(score);
            scored += 1;
        }
        scored
    }
}
