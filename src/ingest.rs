//! Batch ingestion orchestration.
//!
//! Coordinates the full flow for one batch of candidate documents:
//! lock → load manifest → portfolio delta → dedup screening →
//! extraction and temporal enhancement (parallel) → relevance scoring and
//! graph upserts (serial) → temporal edges → one manifest save.
//!
//! A document is recorded in the manifest only after its graph writes
//! succeeded. Documents that fail extraction or graph writes stay
//! unrecorded and are picked up again by the next run; graph upserts are
//! keyed by stable ids so re-processing converges.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{IceError, Result};
use crate::extract::{Extraction, Extractor};
use crate::graph::GraphStore;
use crate::hasher::ContentHasher;
use crate::manifest::{IngestionManifest, Screening};
use crate::models::{
    normalize_ticker, ContentHash, Edge, Entity, PortfolioDelta, RawDocument, SourceType,
    TemporalMetadata, TemporalType,
};
use crate::relevance::RelevanceScorer;
use crate::storage::ManifestStore;
use crate::temporal::{EnhanceContext, TemporalEnhancer};

/// Everything a batch run needs, passed explicitly.
#[derive(Clone)]
pub struct IngestContext {
    pub store: ManifestStore,
    pub hasher: ContentHasher,
    /// `None` disables temporal enhancement and temporal edges.
    pub enhancer: Option<TemporalEnhancer>,
    pub scorer: RelevanceScorer,
    pub extractor: Arc<dyn Extractor>,
    pub graph: Arc<dyn GraphStore>,
    pub workers: usize,
}

impl IngestContext {
    pub fn from_config(
        config: &Config,
        extractor: Arc<dyn Extractor>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            store: config.manifest_store(),
            hasher: config.hasher(),
            enhancer: config.enhancer(),
            scorer: config.scorer(),
            extractor,
            graph,
            workers: config.ingest.workers.max(1),
        }
    }
}

/// Stops new extraction submissions. In-flight work still completes and
/// the batch is saved as usual.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub batch_id: String,
    pub candidates: usize,
    pub processed: usize,
    pub skipped_duplicate: usize,
    pub failed_extraction: usize,
    pub failed_other: usize,
    /// Not submitted because shutdown was requested.
    pub deferred: usize,
    pub entities_written: usize,
    pub edges_written: usize,
    pub temporal_edges_created: usize,
    pub portfolio_delta: Option<PortfolioDelta>,
    pub recovered_from_backup: Option<PathBuf>,
}

impl BatchSummary {
    pub fn failed(&self) -> usize {
        self.failed_extraction + self.failed_other
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "batch {}", self.batch_id)?;
        writeln!(f, "  candidates: {}", self.candidates)?;
        writeln!(f, "  processed: {}", self.processed)?;
        writeln!(f, "  skipped (duplicate): {}", self.skipped_duplicate)?;
        writeln!(f, "  failed (extraction): {}", self.failed_extraction)?;
        writeln!(f, "  failed (other): {}", self.failed_other)?;
        if self.deferred > 0 {
            writeln!(f, "  deferred: {}", self.deferred)?;
        }
        writeln!(f, "  entities written: {}", self.entities_written)?;
        writeln!(f, "  edges written: {}", self.edges_written)?;
        writeln!(f, "  temporal edges: {}", self.temporal_edges_created)?;
        if let Some(delta) = &self.portfolio_delta {
            writeln!(
                f,
                "  portfolio: +{} -{} ={}",
                join(&delta.added),
                join(&delta.removed),
                join(&delta.kept)
            )?;
        }
        if let Some(backup) = &self.recovered_from_backup {
            writeln!(f, "  recovered from backup: {}", backup.display())?;
        }
        Ok(())
    }
}

fn join(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "-".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

struct Candidate {
    doc: RawDocument,
    hash: ContentHash,
}

/// Runs ingestion batches against one manifest and one graph store.
pub struct GraphIngestionOrchestrator {
    ctx: IngestContext,
    shutdown: ShutdownHandle,
}

impl GraphIngestionOrchestrator {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            ctx,
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Processes one batch.
    ///
    /// `holdings`, when given, is the current portfolio; a snapshot is
    /// appended when it differs from the latest one. Returns an error only
    /// for batch-level failures (lock contention, unrecoverable manifest,
    /// temporal edge writes, manifest save).
    pub async fn run_batch(
        &self,
        docs: Vec<RawDocument>,
        holdings: Option<BTreeSet<String>>,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary {
            batch_id: Uuid::new_v4().to_string(),
            candidates: docs.len(),
            ..Default::default()
        };
        let now = Utc::now();

        let _lock = self.ctx.store.lock()?;
        let (mut manifest, recovery) =
            IngestionManifest::open(self.ctx.store.clone(), self.ctx.hasher.clone())?;
        if let Some(event) = recovery {
            warn!(
                batch = %summary.batch_id,
                backup = %event.backup.display(),
                reason = %event.reason,
                "manifest restored from backup"
            );
            summary.recovered_from_backup = Some(event.backup);
        }

        let scorer = match holdings {
            Some(holdings) => {
                let holdings: BTreeSet<String> = holdings
                    .iter()
                    .map(|h| normalize_ticker(h))
                    .filter(|h| !h.is_empty())
                    .collect();
                if manifest.current_holdings() != Some(&holdings) {
                    let delta = manifest.get_portfolio_delta(&holdings);
                    info!(
                        added = delta.added.len(),
                        removed = delta.removed.len(),
                        "portfolio changed"
                    );
                    summary.portfolio_delta = Some(delta);
                }
                self.ctx.scorer.with_holdings(&holdings)
            }
            None => match manifest.current_holdings() {
                Some(latest) => self.ctx.scorer.with_holdings(latest),
                None => self.ctx.scorer.clone(),
            },
        };

        let candidates = self.screen(&manifest, docs, &mut summary);
        info!(
            batch = %summary.batch_id,
            new = candidates.len(),
            duplicates = summary.skipped_duplicate,
            "screened candidates"
        );

        let extracted = self.extract_all(candidates, now, &mut summary).await;

        let mut batch_entities: Vec<Entity> = Vec::new();
        for (candidate, extraction) in extracted {
            match self
                .commit_document(&mut manifest, &scorer, candidate, extraction, &mut summary)
                .await
            {
                Ok(entities) => batch_entities.extend(entities),
                Err(e) => {
                    warn!(batch = %summary.batch_id, error = %e, "document not recorded");
                    summary.failed_other += 1;
                }
            }
        }

        if let Some(enhancer) = &self.ctx.enhancer {
            summary.temporal_edges_created = self
                .write_temporal_edges(enhancer, batch_entities)
                .await?;
        }

        manifest.save()?;
        info!(
            batch = %summary.batch_id,
            processed = summary.processed,
            skipped = summary.skipped_duplicate,
            failed = summary.failed(),
            "batch complete"
        );
        Ok(summary)
    }

    fn screen(
        &self,
        manifest: &IngestionManifest,
        docs: Vec<RawDocument>,
        summary: &mut BatchSummary,
    ) -> Vec<Candidate> {
        let mut batch_hashes: HashSet<ContentHash> = HashSet::new();
        let mut batch_ids: HashSet<(SourceType, String)> = HashSet::new();
        let mut out = Vec::new();

        for doc in docs {
            match manifest.screen(&doc) {
                Ok(Screening::New(hash)) => {
                    let id_key = (doc.source_type, doc.document_id.clone());
                    if batch_ids.contains(&id_key) || batch_hashes.contains(&hash) {
                        debug!(document_id = %doc.document_id, "duplicate within batch");
                        summary.skipped_duplicate += 1;
                        continue;
                    }
                    batch_ids.insert(id_key);
                    batch_hashes.insert(hash.clone());
                    out.push(Candidate { doc, hash });
                }
                Ok(verdict) => {
                    debug!(document_id = %doc.document_id, ?verdict, "already ingested");
                    summary.skipped_duplicate += 1;
                }
                Err(e) => {
                    warn!(document_id = %doc.document_id, error = %e, "skipping document");
                    summary.failed_other += 1;
                }
            }
        }
        out
    }

    /// Extracts and enhances every candidate on the worker pool, returning
    /// successes in input order.
    async fn extract_all(
        &self,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
        summary: &mut BatchSummary,
    ) -> Vec<(Candidate, Extraction)> {
        let permits = Arc::new(Semaphore::new(self.ctx.workers.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        let total = candidates.len();
        for (submitted, candidate) in candidates.into_iter().enumerate() {
            if self.shutdown.is_requested() {
                summary.deferred = total - submitted;
                warn!(deferred = summary.deferred, "shutdown requested, deferring remaining documents");
                break;
            }
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let extractor = Arc::clone(&self.ctx.extractor);
            let enhancer = self.ctx.enhancer.clone();
            let document_id = candidate.doc.document_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = extract_one(extractor.as_ref(), enhancer.as_ref(), &candidate.doc, now).await;
                (candidate, result)
            });
            handles.push((document_id, handle));
        }

        let mut out = Vec::with_capacity(handles.len());
        for (document_id, handle) in handles {
            match handle.await {
                Ok((candidate, Ok(extraction))) => out.push((candidate, extraction)),
                Ok((_, Err(e))) => {
                    warn!(document_id = %document_id, error = %e, "extraction failed");
                    summary.failed_extraction += 1;
                }
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "extraction task aborted");
                    summary.failed_extraction += 1;
                }
            }
        }
        out
    }

    /// Scores, writes and records one document. Returns its entities for
    /// temporal edge creation.
    async fn commit_document(
        &self,
        manifest: &mut IngestionManifest,
        scorer: &RelevanceScorer,
        candidate: Candidate,
        extraction: Extraction,
        summary: &mut BatchSummary,
    ) -> Result<Vec<Entity>> {
        let Candidate { doc, hash } = candidate;
        let Extraction {
            mut entities,
            mut edges,
        } = extraction;

        scorer.score_document(&mut entities, &edges);

        // Activated ahead of the single write; a rejected write drops the
        // document and these values with it.
        for temporal in entities.iter_mut().filter_map(|e| e.temporal.as_mut()) {
            temporal.activate();
        }
        for temporal in edges.iter_mut().filter_map(|e| e.temporal.as_mut()) {
            temporal.activate();
        }
        self.ctx
            .graph
            .upsert_entities(&entities)
            .await
            .map_err(|e| IceError::GraphStore(format!("{}: {:#}", doc.document_id, e)))?;
        self.ctx
            .graph
            .upsert_edges(&edges)
            .await
            .map_err(|e| IceError::GraphStore(format!("{}: {:#}", doc.document_id, e)))?;

        manifest.add_hashed(
            &doc.document_id,
            doc.source_type,
            hash,
            doc.metadata.clone(),
            false,
        )?;
        if doc.source_type == SourceType::Api {
            record_coverage(manifest, &doc);
        }

        debug!(
            document_id = %doc.document_id,
            entities = entities.len(),
            edges = edges.len(),
            "document recorded"
        );
        summary.processed += 1;
        summary.entities_written += entities.len();
        summary.edges_written += edges.len();
        Ok(entities)
    }

    /// Chains this batch's observations into the stored history of their
    /// identities and writes the resulting temporal edges, the entities
    /// whose windows moved, and the removal of edges a late observation
    /// split.
    ///
    /// Only edges touching an entity of this batch are written; the rest of
    /// the history was chained by earlier batches.
    async fn write_temporal_edges(
        &self,
        enhancer: &TemporalEnhancer,
        batch_entities: Vec<Entity>,
    ) -> Result<usize> {
        let mut identities: BTreeSet<(String, String)> = BTreeSet::new();
        for entity in &batch_entities {
            if is_point_in_time(entity.temporal.as_ref()) {
                let (kind, name) = entity.identity();
                identities.insert((kind.to_string(), name.to_string()));
            }
        }

        let batch_ids: HashSet<String> = batch_entities.iter().map(|e| e.id.clone()).collect();
        let mut entities = batch_entities;
        for (kind, name) in &identities {
            let history = self
                .ctx
                .graph
                .observations(kind, name)
                .await
                .map_err(|e| IceError::GraphStore(format!("{:#}", e)))?;
            entities.extend(history.into_iter().filter(|e| !batch_ids.contains(&e.id)));
        }

        let before: HashMap<String, Option<TemporalMetadata>> = entities
            .iter()
            .map(|e| (e.id.clone(), e.temporal.clone()))
            .collect();
        let plan = enhancer.plan_temporal_edges(&mut entities, &[]);
        let changed: Vec<Entity> = entities
            .into_iter()
            .filter(|e| before.get(&e.id).is_some_and(|t| *t != e.temporal))
            .collect();
        let edges: Vec<Edge> = plan
            .created
            .into_iter()
            .filter(|e| batch_ids.contains(&e.source_id) || batch_ids.contains(&e.target_id))
            .collect();

        if !changed.is_empty() {
            self.ctx
                .graph
                .upsert_entities(&changed)
                .await
                .map_err(|e| IceError::GraphStore(format!("{:#}", e)))?;
        }
        if !edges.is_empty() {
            self.ctx
                .graph
                .upsert_edges(&edges)
                .await
                .map_err(|e| IceError::GraphStore(format!("{:#}", e)))?;
        }
        if !plan.retired.is_empty() {
            info!(edges = plan.retired.len(), "retiring evolution edges split by a late observation");
            self.ctx
                .graph
                .remove_edges(&plan.retired)
                .await
                .map_err(|e| IceError::GraphStore(format!("{:#}", e)))?;
        }
        debug!(changed = changed.len(), edges = edges.len(), "temporal edges written");
        Ok(edges.len())
    }
}

async fn extract_one(
    extractor: &dyn Extractor,
    enhancer: Option<&TemporalEnhancer>,
    doc: &RawDocument,
    now: DateTime<Utc>,
) -> Result<Extraction> {
    let extraction = extractor
        .extract(doc)
        .await
        .map_err(|e| IceError::Extraction {
            document_id: doc.document_id.clone(),
            reason: format!("{:#}", e),
        })?;

    let Some(enhancer) = enhancer else {
        return Ok(extraction);
    };

    let ctx = EnhanceContext::new(&doc.content, now);
    let entities: Vec<Entity> = extraction
        .entities
        .into_iter()
        .map(|e| enhancer.enhance_entity(e, doc.source_date, &ctx))
        .collect();

    let edges = {
        let temporal_by_id: HashMap<&str, &TemporalMetadata> = entities
            .iter()
            .filter_map(|e| e.temporal.as_ref().map(|t| (e.id.as_str(), t)))
            .collect();
        extraction
            .edges
            .into_iter()
            .map(|edge| {
                let endpoints = match (
                    temporal_by_id.get(edge.source_id.as_str()),
                    temporal_by_id.get(edge.target_id.as_str()),
                ) {
                    (Some(a), Some(b)) => Some((*a, *b)),
                    _ => None,
                };
                enhancer.enhance_edge(edge, doc.source_date, &ctx, endpoints)
            })
            .collect()
    };

    Ok(Extraction { entities, edges })
}

fn is_point_in_time(temporal: Option<&TemporalMetadata>) -> bool {
    temporal.is_some_and(|t| t.temporal_type == TemporalType::PointInTime)
}

fn record_coverage(manifest: &mut IngestionManifest, doc: &RawDocument) {
    let (Some(ticker), Some(api_name), Some(as_of)) = (
        doc.metadata.get("ticker"),
        doc.metadata.get("api_name"),
        doc.metadata.get("as_of_date"),
    ) else {
        return;
    };
    match NaiveDate::parse_from_str(as_of.trim(), "%Y-%m-%d") {
        Ok(day) => {
            manifest.record_api_coverage(ticker, api_name, day);
        }
        Err(_) => {
            warn!(document_id = %doc.document_id, as_of_date = %as_of, "unparseable as_of_date, coverage not recorded");
        }
    }
}
