use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Result as AnyResult};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use ice_engine::extract::{Extraction, Extractor, MarkerExtractor};
use ice_engine::graph::{GraphStore, InMemoryGraphStore};
use ice_engine::hasher::{stable_id, ContentHasher};
use ice_engine::ingest::{GraphIngestionOrchestrator, IngestContext};
use ice_engine::manifest::IngestionManifest;
use ice_engine::models::{Edge, Entity, RawDocument, SourceType, ValidityState};
use ice_engine::relevance::RelevanceScorer;
use ice_engine::storage::ManifestStore;
use ice_engine::temporal::{TemporalEnhancer, TimeBucket, METRIC_EVOLVED, TEMPORALLY_CORRELATED};
use ice_engine::IceError;

fn store(tmp: &TempDir) -> ManifestStore {
    ManifestStore::new(
        tmp.path().join("manifest.json"),
        tmp.path().join("backups"),
        10,
    )
}

fn context(
    tmp: &TempDir,
    extractor: Arc<dyn Extractor>,
    graph: Arc<dyn GraphStore>,
) -> IngestContext {
    IngestContext {
        store: store(tmp),
        hasher: ContentHasher::default(),
        enhancer: Some(TemporalEnhancer::new(TimeBucket::Document)),
        scorer: RelevanceScorer::default(),
        extractor,
        graph,
        workers: 3,
    }
}

fn orchestrator(tmp: &TempDir, graph: Arc<InMemoryGraphStore>) -> GraphIngestionOrchestrator {
    GraphIngestionOrchestrator::new(context(tmp, Arc::new(MarkerExtractor::new()), graph))
}

fn manifest(tmp: &TempDir) -> IngestionManifest {
    IngestionManifest::open(store(tmp), ContentHasher::default())
        .unwrap()
        .0
}

fn holdings(tickers: &[&str]) -> BTreeSet<String> {
    tickers.iter().map(|t| t.to_string()).collect()
}

fn email(id: &str, body: &str) -> RawDocument {
    RawDocument::new(id, SourceType::Email, body)
}

fn margin_report(id: &str, period: &str, value: &str, day: (i32, u32, u32)) -> RawDocument {
    RawDocument::new(
        id,
        SourceType::Filing,
        format!("[SOURCE:FILING|SYMBOL:NVDA] NVIDIA {} results.", period),
    )
    .with_source_date(Utc.with_ymd_and_hms(day.0, day.1, day.2, 0, 0, 0).unwrap())
    .with_metadata("ticker", "NVDA")
    .with_metadata("metric.gross_margin", value)
    .with_metadata("metric.gross_margin.unit", "%")
    .with_metadata("period", period)
}

// ─── Dedup ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reingest_same_batch_is_all_duplicates() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    let batch = || {
        vec![
            email("e1", "[SOURCE:EMAIL|SYMBOL:NVDA] Upgrade to buy."),
            email("e2", "[SOURCE:EMAIL|SYMBOL:AMD] Downgrade to hold."),
        ]
    };

    let first = orch.run_batch(batch(), None).await.unwrap();
    assert_eq!(first.processed, 2);
    assert_eq!(first.skipped_duplicate, 0);
    let entities_after_first = graph.entity_count();

    let second = orch.run_batch(batch(), None).await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped_duplicate, 2);
    assert_eq!(graph.entity_count(), entities_after_first);
}

#[tokio::test]
async fn test_same_content_new_id_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    orch.run_batch(vec![email("fwd-1", "<p>NVDA beat</p>")], None)
        .await
        .unwrap();
    let summary = orch
        .run_batch(vec![email("fwd-2", "NVDA   beat")], None)
        .await
        .unwrap();
    assert_eq!(summary.skipped_duplicate, 1);
    assert!(!manifest(&tmp).is_document_ingested("fwd-2", SourceType::Email));
}

// ─── Portfolio ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_portfolio_delta_across_batches() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    let first = orch
        .run_batch(vec![], Some(holdings(&["NVDA", "AMD"])))
        .await
        .unwrap();
    let delta = first.portfolio_delta.unwrap();
    assert_eq!(delta.added, holdings(&["AMD", "NVDA"]));

    let second = orch
        .run_batch(vec![], Some(holdings(&["nvda", "GOOGL"])))
        .await
        .unwrap();
    let delta = second.portfolio_delta.unwrap();
    assert_eq!(delta.added, holdings(&["GOOGL"]));
    assert_eq!(delta.removed, holdings(&["AMD"]));
    assert_eq!(delta.kept, holdings(&["NVDA"]));

    let third = orch
        .run_batch(vec![], Some(holdings(&["GOOGL", "NVDA"])))
        .await
        .unwrap();
    assert!(third.portfolio_delta.is_none());
    assert_eq!(manifest(&tmp).portfolio_history().len(), 2);
}

#[tokio::test]
async fn test_holdings_drive_relevance() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    orch.run_batch(
        vec![email("e1", "[SOURCE:EMAIL|SYMBOL:NVDA] [SOURCE:EMAIL|SYMBOL:KO]")],
        Some(holdings(&["NVDA"])),
    )
    .await
    .unwrap();

    let nvda = graph.entity(&stable_id(&["Company", "NVDA"])).unwrap();
    let ko = graph.entity(&stable_id(&["Company", "KO"])).unwrap();
    assert_eq!(nvda.relevance.unwrap().value(), 1.0);
    // Co-mentioned with a holding in the same document.
    assert_eq!(ko.relevance.unwrap().value(), 0.7);
}

// ─── Temporal ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_quarterly_metric_evolution_across_batches() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    orch.run_batch(vec![margin_report("nvda-q1", "Q1 2024", "78.4", (2024, 5, 22))], None)
        .await
        .unwrap();
    let summary = orch
        .run_batch(vec![margin_report("nvda-q2", "Q2 2024", "75.1", (2024, 8, 28))], None)
        .await
        .unwrap();
    assert!(summary.temporal_edges_created >= 1);

    let q1_id = stable_id(&["Metric", "NVDA gross margin", "nvda-q1"]);
    let q2_id = stable_id(&["Metric", "NVDA gross margin", "nvda-q2"]);

    let q1 = graph.entity(&q1_id).unwrap();
    let q2 = graph.entity(&q2_id).unwrap();
    let q1_t = q1.temporal.unwrap();
    let q2_t = q2.temporal.unwrap();
    assert_eq!(q1_t.state, ValidityState::Superseded);
    assert_eq!(q1_t.valid_to, Some(q2_t.valid_from));
    assert_eq!(q2_t.state, ValidityState::Current);
    assert!(q2_t.valid_to.is_none());
    assert_eq!(q2_t.reporting_period.unwrap().period_string, "Q2 2024");

    let evolved = graph.edges_of_type(METRIC_EVOLVED);
    assert_eq!(evolved.len(), 1);
    let edge = &evolved[0];
    assert_eq!(edge.id, stable_id(&[METRIC_EVOLVED, &q1_id, &q2_id]));
    assert_eq!(edge.source_id, q1_id);
    assert_eq!(edge.target_id, q2_id);
    assert_eq!(edge.properties["from_value"], "78.4");
    assert_eq!(edge.properties["to_value"], "75.1");
}

#[tokio::test]
async fn test_late_quarter_is_chained_between_neighbours() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    for doc in [
        margin_report("nvda-q1", "Q1 2024", "78.4", (2024, 1, 15)),
        margin_report("nvda-q3", "Q3 2024", "75.0", (2024, 7, 15)),
        margin_report("nvda-q2", "Q2 2024", "75.1", (2024, 4, 15)),
    ] {
        orch.run_batch(vec![doc], None).await.unwrap();
    }

    let id = |doc: &str| stable_id(&["Metric", "NVDA gross margin", doc]);
    let (q1, q2, q3) = (id("nvda-q1"), id("nvda-q2"), id("nvda-q3"));

    let mut pairs: Vec<(String, String)> = graph
        .edges_of_type(METRIC_EVOLVED)
        .into_iter()
        .map(|e| (e.source_id, e.target_id))
        .collect();
    pairs.sort();
    let mut expected = vec![(q1.clone(), q2.clone()), (q2.clone(), q3.clone())];
    expected.sort();
    assert_eq!(pairs, expected);
    assert!(graph.edge(&stable_id(&[METRIC_EVOLVED, &q1, &q3])).is_none());

    let window = |id: &str| graph.entity(id).unwrap().temporal.unwrap();
    let apr = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
    let jul = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();
    assert_eq!(window(&q1).valid_to, Some(apr));
    assert_eq!(window(&q1).state, ValidityState::Superseded);
    assert_eq!(window(&q2).valid_to, Some(jul));
    assert_eq!(window(&q2).state, ValidityState::Superseded);
    assert_eq!(window(&q3).state, ValidityState::Current);
    assert!(window(&q3).valid_to.is_none());
}

#[tokio::test]
async fn test_correlation_within_document() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    let summary = orch
        .run_batch(vec![margin_report("nvda-q1", "Q1 2024", "78.4", (2024, 5, 22))], None)
        .await
        .unwrap();
    assert!(summary.temporal_edges_created >= 1);
    assert!(!graph.edges_of_type(TEMPORALLY_CORRELATED).is_empty());
}

#[tokio::test]
async fn test_enhancer_disabled_leaves_entities_plain() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let mut ctx = context(&tmp, Arc::new(MarkerExtractor::new()), graph.clone());
    ctx.enhancer = None;
    let orch = GraphIngestionOrchestrator::new(ctx);

    let summary = orch
        .run_batch(vec![margin_report("nvda-q1", "Q1 2024", "78.4", (2024, 5, 22))], None)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.temporal_edges_created, 0);
    let metric = graph
        .entity(&stable_id(&["Metric", "NVDA gross margin", "nvda-q1"]))
        .unwrap();
    assert!(metric.temporal.is_none());
}

// ─── Failure isolation ───────────────────────────────────────────────

/// Fails for any document whose id starts with `bad`.
struct PickyExtractor;

#[async_trait]
impl Extractor for PickyExtractor {
    fn name(&self) -> &str {
        "picky"
    }

    async fn extract(&self, doc: &RawDocument) -> AnyResult<Extraction> {
        if doc.document_id.starts_with("bad") {
            bail!("model refused {}", doc.document_id);
        }
        MarkerExtractor::new().extract(doc).await
    }
}

#[tokio::test]
async fn test_extraction_failure_is_retried_next_run() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = GraphIngestionOrchestrator::new(context(
        &tmp,
        Arc::new(PickyExtractor),
        graph.clone(),
    ));

    let docs = vec![
        email("good-1", "[SOURCE:EMAIL|SYMBOL:NVDA] fine"),
        email("bad-1", "[SOURCE:EMAIL|SYMBOL:AMD] broken"),
        email("good-2", "[SOURCE:EMAIL|SYMBOL:TSM] fine too"),
    ];
    let summary = orch.run_batch(docs, None).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed_extraction, 1);

    let m = manifest(&tmp);
    assert!(m.is_document_ingested("good-1", SourceType::Email));
    assert!(!m.is_document_ingested("bad-1", SourceType::Email));
    assert!(!m.is_content_duplicate("[SOURCE:EMAIL|SYMBOL:AMD] broken").unwrap());

    let retry = orchestrator(&tmp, graph);
    let summary = retry
        .run_batch(vec![email("bad-1", "[SOURCE:EMAIL|SYMBOL:AMD] broken")], None)
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
}

/// Rejects writes for entities sourced from document `boom`.
#[derive(Default)]
struct FlakyGraph {
    inner: InMemoryGraphStore,
}

#[async_trait]
impl GraphStore for FlakyGraph {
    async fn upsert_entities(&self, entities: &[Entity]) -> AnyResult<()> {
        if entities
            .iter()
            .any(|e| e.source_document.as_deref() == Some("boom"))
        {
            bail!("graph write rejected");
        }
        self.inner.upsert_entities(entities).await
    }

    async fn upsert_edges(&self, edges: &[Edge]) -> AnyResult<()> {
        self.inner.upsert_edges(edges).await
    }

    async fn remove_edges(&self, ids: &[String]) -> AnyResult<()> {
        self.inner.remove_edges(ids).await
    }

    async fn observations(&self, entity_type: &str, name: &str) -> AnyResult<Vec<Entity>> {
        self.inner.observations(entity_type, name).await
    }
}

#[tokio::test]
async fn test_graph_failure_leaves_document_unrecorded() {
    let tmp = TempDir::new().unwrap();
    let orch = GraphIngestionOrchestrator::new(context(
        &tmp,
        Arc::new(MarkerExtractor::new()),
        Arc::new(FlakyGraph::default()),
    ));

    let docs = vec![
        email("boom", "[SOURCE:EMAIL|SYMBOL:NVDA] one"),
        email("calm", "[SOURCE:EMAIL|SYMBOL:AMD] two"),
    ];
    let summary = orch.run_batch(docs, None).await.unwrap();
    assert_eq!(summary.failed_other, 1);
    assert_eq!(summary.processed, 1);

    let m = manifest(&tmp);
    assert!(!m.is_document_ingested("boom", SourceType::Email));
    assert!(m.is_document_ingested("calm", SourceType::Email));
}

#[tokio::test]
async fn test_oversized_document_is_counted_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut ctx = context(
        &tmp,
        Arc::new(MarkerExtractor::new()),
        Arc::new(InMemoryGraphStore::new()),
    );
    ctx.hasher = ContentHasher::new(16);
    let orch = GraphIngestionOrchestrator::new(ctx);

    let docs = vec![email("big", &"x".repeat(64)), email("small", "tiny")];
    let summary = orch.run_batch(docs, None).await.unwrap();
    assert_eq!(summary.failed_other, 1);
    assert_eq!(summary.processed, 1);
}

// ─── Persistence ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_manifest_saved_once_per_batch() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    let batch = |prefix: &str| {
        (0..4)
            .map(|i| email(&format!("{}-{}", prefix, i), &format!("{} body {}", prefix, i)))
            .collect::<Vec<_>>()
    };

    orch.run_batch(batch("a"), None).await.unwrap();
    assert!(store(&tmp).list_backups().unwrap().is_empty());

    orch.run_batch(batch("b"), None).await.unwrap();
    assert_eq!(store(&tmp).list_backups().unwrap().len(), 1);
    assert_eq!(manifest(&tmp).stats().documents, 8);
}

#[tokio::test]
async fn test_recovers_from_corrupted_primary() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    orch.run_batch(vec![email("a", "alpha")], None).await.unwrap();
    orch.run_batch(vec![email("b", "beta")], None).await.unwrap();

    fs::write(tmp.path().join("manifest.json"), b"{\"format_version\": 1, \"trunc").unwrap();

    let summary = orch
        .run_batch(
            vec![email("a", "alpha"), email("b", "beta"), email("c", "gamma")],
            None,
        )
        .await
        .unwrap();
    assert!(summary.recovered_from_backup.is_some());
    // The backup predates "b", so it is processed again.
    assert_eq!(summary.skipped_duplicate, 1);
    assert_eq!(summary.processed, 2);

    let m = manifest(&tmp);
    for id in ["a", "b", "c"] {
        assert!(m.is_document_ingested(id, SourceType::Email), "{} missing", id);
    }
}

#[tokio::test]
async fn test_save_failure_fails_batch_and_keeps_previous_state() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(InMemoryGraphStore::new());
    let orch = orchestrator(&tmp, graph.clone());

    orch.run_batch(vec![email("a", "alpha")], None).await.unwrap();
    let primary = tmp.path().join("manifest.json");
    let before = fs::read(&primary).unwrap();

    // A directory squatting on the staging path makes the save fail.
    let staging = tmp.path().join("manifest.json.tmp");
    fs::create_dir(&staging).unwrap();
    let batch = || vec![email("b", "[SOURCE:EMAIL|SYMBOL:NVDA] beta")];

    let err = orch.run_batch(batch(), None).await.unwrap_err();
    assert!(matches!(err, IceError::Io(_)));
    assert_eq!(fs::read(&primary).unwrap(), before);
    assert!(!manifest(&tmp).is_document_ingested("b", SourceType::Email));
    let entities_after_failure = graph.entity_count();

    fs::remove_dir(&staging).unwrap();
    let summary = orch.run_batch(batch(), None).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped_duplicate, 0);
    assert!(manifest(&tmp).is_document_ingested("b", SourceType::Email));
    // Re-processing upserts the same ids.
    assert_eq!(graph.entity_count(), entities_after_failure);
}

#[tokio::test]
async fn test_corrupted_without_backup_is_fatal() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("manifest.json"), b"garbage").unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    let err = orch
        .run_batch(vec![email("a", "alpha")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, IceError::UnrecoverableManifest { .. }));
    assert_eq!(fs::read(tmp.path().join("manifest.json")).unwrap(), b"garbage");
}

#[tokio::test]
async fn test_concurrent_batch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&tmp, Arc::new(InMemoryGraphStore::new()));

    let held = store(&tmp).lock().unwrap();
    let err = orch
        .run_batch(vec![email("a", "alpha")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, IceError::ManifestLocked { .. }));

    drop(held);
    let summary = orch.run_batch(vec![email("a", "alpha")], None).await.unwrap();
    assert_eq!(summary.processed, 1);
}
