//! The ingestion manifest: dedup ledger, portfolio history and API coverage.
//!
//! Dedup is two-layered. The `(source_type, document_id)` index is a cheap
//! first filter; agreement on the normalized content hash is what counts
//! as "already processed". A candidate is new only when neither index
//! matches.
//!
//! The portfolio history is an append-only snapshot log. Deltas are
//! computed from consecutive snapshots on read and never stored.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DuplicateReason, IceError, Result};
use crate::hasher::ContentHasher;
use crate::models::{
    normalize_ticker, ContentHash, DocumentRecord, PortfolioDelta, PortfolioSnapshot,
    RawDocument, SourceType,
};
use crate::storage::{ManifestStore, RecoveryEvent};

/// One API fetch already performed for a ticker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiCoverage {
    pub api_name: String,
    pub as_of_date: NaiveDate,
}

/// Persisted manifest state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Primary dedup index.
    pub documents: BTreeMap<ContentHash, DocumentRecord>,
    /// Secondary dedup index, keyed by source type name.
    pub document_ids_seen: BTreeMap<String, BTreeSet<String>>,
    pub portfolio_history: Vec<PortfolioSnapshot>,
    pub api_coverage: BTreeMap<String, BTreeSet<ApiCoverage>>,
}

impl Manifest {
    /// Structural validation applied on load.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (hash, record) in &self.documents {
            if !hash.is_well_formed() {
                return Err(format!("malformed content hash '{}'", hash));
            }
            if &record.content_hash != hash {
                return Err(format!(
                    "document '{}' indexed under foreign hash {}",
                    record.document_id, hash
                ));
            }
            let seen = self
                .document_ids_seen
                .get(record.source_type.as_str())
                .is_some_and(|ids| ids.contains(&record.document_id));
            if !seen {
                return Err(format!(
                    "document '{}' missing from the {} id index",
                    record.document_id, record.source_type
                ));
            }
        }
        for key in self.document_ids_seen.keys() {
            key.parse::<SourceType>()?;
        }
        for pair in self.portfolio_history.windows(2) {
            if pair[1].timestamp < pair[0].timestamp {
                return Err("portfolio history is not ordered by timestamp".to_string());
            }
        }
        Ok(())
    }
}

/// Per-candidate dedup verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    New(ContentHash),
    DuplicateId,
    DuplicateContent,
}

impl Screening {
    pub fn is_new(&self) -> bool {
        matches!(self, Screening::New(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub documents: usize,
    pub documents_by_source: BTreeMap<String, usize>,
    pub snapshots: usize,
    pub current_holdings: BTreeSet<String>,
    pub covered_tickers: usize,
    pub coverage_entries: usize,
}

/// Manifest state bound to its durable store.
#[derive(Debug)]
pub struct IngestionManifest {
    state: Manifest,
    store: ManifestStore,
    hasher: ContentHasher,
}

impl IngestionManifest {
    /// Loads from `store`, reporting a recovery event when a backup was used.
    pub fn open(store: ManifestStore, hasher: ContentHasher) -> Result<(Self, Option<RecoveryEvent>)> {
        let loaded = store.load()?;
        Ok((
            Self {
                state: loaded.manifest,
                store,
                hasher,
            },
            loaded.recovery,
        ))
    }

    /// Empty state bound to `store`, ignoring whatever is on disk.
    pub fn fresh(store: ManifestStore, hasher: ContentHasher) -> Self {
        Self {
            state: Manifest::default(),
            store,
            hasher,
        }
    }

    /// Reloads state from storage, discarding unsaved changes.
    pub fn load(&mut self) -> Result<Option<RecoveryEvent>> {
        let loaded = self.store.load()?;
        self.state = loaded.manifest;
        Ok(loaded.recovery)
    }

    pub fn save(&self) -> Result<()> {
        self.store.save(&self.state)?;
        Ok(())
    }

    /// Explicit reset: clears all state and persists the empty manifest.
    /// Existing backups are rotated as usual.
    pub fn reset(&mut self) -> Result<()> {
        warn!(path = %self.store.path().display(), "resetting manifest");
        self.state = Manifest::default();
        self.save()
    }

    pub fn state(&self) -> &Manifest {
        &self.state
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    // ─── Dedup ───────────────────────────────────────────────────────

    pub fn is_document_ingested(&self, document_id: &str, source_type: SourceType) -> bool {
        self.state
            .document_ids_seen
            .get(source_type.as_str())
            .is_some_and(|ids| ids.contains(document_id))
    }

    pub fn is_content_duplicate(&self, content: &str) -> Result<bool> {
        let hash = self.hasher.hash(content)?;
        Ok(self.is_hash_known(&hash))
    }

    pub fn is_hash_known(&self, hash: &ContentHash) -> bool {
        self.state.documents.contains_key(hash)
    }

    pub fn record(&self, hash: &ContentHash) -> Option<&DocumentRecord> {
        self.state.documents.get(hash)
    }

    /// Dedup verdict for one candidate. The id check runs first since it
    /// needs no hashing.
    pub fn screen(&self, doc: &RawDocument) -> Result<Screening> {
        if self.is_document_ingested(&doc.document_id, doc.source_type) {
            return Ok(Screening::DuplicateId);
        }
        let hash = self.hasher.hash(&doc.content)?;
        if self.is_hash_known(&hash) {
            return Ok(Screening::DuplicateContent);
        }
        Ok(Screening::New(hash))
    }

    /// Candidates that match neither index, in input order. A candidate
    /// repeating an earlier candidate's id or content is dropped as well.
    pub fn get_new_documents<'a>(&self, candidates: &'a [RawDocument]) -> Vec<&'a RawDocument> {
        let mut batch_hashes: HashSet<ContentHash> = HashSet::new();
        let mut batch_ids: HashSet<(SourceType, &str)> = HashSet::new();
        let mut fresh = Vec::new();

        for doc in candidates {
            match self.screen(doc) {
                Ok(Screening::New(hash)) => {
                    let id_key = (doc.source_type, doc.document_id.as_str());
                    if batch_ids.contains(&id_key) || batch_hashes.contains(&hash) {
                        debug!(document_id = %doc.document_id, "duplicate within batch");
                        continue;
                    }
                    batch_ids.insert(id_key);
                    batch_hashes.insert(hash);
                    fresh.push(doc);
                }
                Ok(_) => {
                    debug!(document_id = %doc.document_id, "already ingested");
                }
                Err(e) => {
                    warn!(document_id = %doc.document_id, error = %e, "skipping unhashable document");
                }
            }
        }
        fresh
    }

    /// Records a document in both indices.
    ///
    /// Fails with [`IceError::Duplicate`] when either index already matches,
    /// unless `overwrite` is set. Records are never removed: overwriting an
    /// edited document adds its new content hash alongside the old one.
    pub fn add_document(
        &mut self,
        document_id: &str,
        source_type: SourceType,
        content: &str,
        metadata: BTreeMap<String, String>,
        overwrite: bool,
    ) -> Result<DocumentRecord> {
        let hash = self.hasher.hash(content)?;
        self.add_hashed(document_id, source_type, hash, metadata, overwrite)
    }

    /// [`add_document`](Self::add_document) for callers that already hashed
    /// the content.
    pub fn add_hashed(
        &mut self,
        document_id: &str,
        source_type: SourceType,
        hash: ContentHash,
        metadata: BTreeMap<String, String>,
        overwrite: bool,
    ) -> Result<DocumentRecord> {
        if !overwrite {
            let reason = if self.is_hash_known(&hash) {
                Some(DuplicateReason::Content)
            } else if self.is_document_ingested(document_id, source_type) {
                Some(DuplicateReason::DocumentId)
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(IceError::Duplicate {
                    document_id: document_id.to_string(),
                    source_type,
                    reason,
                });
            }
        }

        let record = DocumentRecord {
            document_id: document_id.to_string(),
            content_hash: hash.clone(),
            ingested_at: Utc::now(),
            source_type,
            metadata,
        };
        self.state.documents.insert(hash, record.clone());
        self.state
            .document_ids_seen
            .entry(source_type.as_str().to_string())
            .or_default()
            .insert(document_id.to_string());
        Ok(record)
    }

    // ─── Portfolio history ───────────────────────────────────────────

    /// Appends a snapshot of `current_holdings` and diffs it against the
    /// previous one (an empty set on first call).
    pub fn get_portfolio_delta<I, S>(&mut self, current_holdings: I) -> PortfolioDelta
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.append_snapshot(current_holdings, Utc::now())
    }

    /// As [`get_portfolio_delta`](Self::get_portfolio_delta) with an explicit
    /// timestamp. Timestamps earlier than the latest snapshot are clamped so
    /// the log stays ordered.
    pub fn append_snapshot<I, S>(&mut self, holdings: I, timestamp: DateTime<Utc>) -> PortfolioDelta
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let holdings: BTreeSet<String> = holdings
            .into_iter()
            .map(|h| normalize_ticker(h.as_ref()))
            .filter(|h| !h.is_empty())
            .collect();
        let (previous, timestamp) = match self.state.portfolio_history.last() {
            Some(last) => (last.holdings.clone(), timestamp.max(last.timestamp)),
            None => (BTreeSet::new(), timestamp),
        };
        let delta = PortfolioDelta::between(&previous, &holdings);
        self.state
            .portfolio_history
            .push(PortfolioSnapshot { timestamp, holdings });
        delta
    }

    pub fn current_holdings(&self) -> Option<&BTreeSet<String>> {
        self.state.portfolio_history.last().map(|s| &s.holdings)
    }

    pub fn portfolio_history(&self) -> &[PortfolioSnapshot] {
        &self.state.portfolio_history
    }

    /// Deltas between every consecutive pair of snapshots, the first one
    /// measured against the empty portfolio.
    pub fn portfolio_deltas(&self) -> Vec<PortfolioDelta> {
        let empty = BTreeSet::new();
        let mut previous = &empty;
        self.state
            .portfolio_history
            .iter()
            .map(|snapshot| {
                let delta = PortfolioDelta::between(previous, &snapshot.holdings);
                previous = &snapshot.holdings;
                delta
            })
            .collect()
    }

    // ─── API coverage ────────────────────────────────────────────────

    /// Idempotent insert; returns whether the entry was new.
    pub fn record_api_coverage(&mut self, ticker: &str, api_name: &str, as_of_date: NaiveDate) -> bool {
        self.state
            .api_coverage
            .entry(normalize_ticker(ticker))
            .or_default()
            .insert(ApiCoverage {
                api_name: api_name.to_string(),
                as_of_date,
            })
    }

    pub fn has_api_coverage(&self, ticker: &str, api_name: &str, as_of_date: NaiveDate) -> bool {
        self.state
            .api_coverage
            .get(&normalize_ticker(ticker))
            .is_some_and(|set| {
                set.contains(&ApiCoverage {
                    api_name: api_name.to_string(),
                    as_of_date,
                })
            })
    }

    pub fn stats(&self) -> ManifestStats {
        let mut documents_by_source: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.state.documents.values() {
            *documents_by_source
                .entry(record.source_type.to_string())
                .or_default() += 1;
        }
        ManifestStats {
            documents: self.state.documents.len(),
            documents_by_source,
            snapshots: self.state.portfolio_history.len(),
            current_holdings: self.current_holdings().cloned().unwrap_or_default(),
            covered_tickers: self.state.api_coverage.len(),
            coverage_entries: self.state.api_coverage.values().map(BTreeSet::len).sum(),
        }
    }
}
