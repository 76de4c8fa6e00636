//! # Investment Context Engine CLI (`ice`)
//!
//! Operator interface for the ingestion core: run a batch over a drop
//! directory, inspect or verify the manifest, record a portfolio change,
//! or reset state.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ice ingest [--export FILE]` | Scan `ingest.root`, run one batch, optionally export the graph output |
//! | `ice status` | Print manifest statistics |
//! | `ice verify` | Validate the primary manifest file without loading backups |
//! | `ice delta <TICKERS>` | Record a holdings snapshot and print the delta |
//! | `ice reset --yes` | Clear all manifest state |
//!
//! Logs go to stderr (`RUST_LOG` controls the level); summaries go to
//! stdout.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ice_engine::config::{self, Config};
use ice_engine::connector_fs;
use ice_engine::error::IceError;
use ice_engine::export::write_graph_export;
use ice_engine::extract::MarkerExtractor;
use ice_engine::graph::InMemoryGraphStore;
use ice_engine::ingest::{GraphIngestionOrchestrator, IngestContext};
use ice_engine::manifest::IngestionManifest;
use ice_engine::models::normalize_ticker;

/// Investment Context Engine: deduplicated, temporally aware ingestion of
/// financial documents into a knowledge graph.
#[derive(Parser)]
#[command(name = "ice", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ice.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the ingest root and process one batch.
    ///
    /// Documents already recorded in the manifest (by id or by content)
    /// are skipped. Ctrl-C stops new submissions; in-flight documents
    /// finish and the manifest is saved.
    ///
    /// Entities and edges are written to an in-memory graph that lives
    /// only for this run. Pass `--export` to keep them: the manifest
    /// records the documents either way, so a later run will not produce
    /// them again.
    Ingest {
        /// Current holdings, comma separated. Falls back to
        /// `portfolio.holdings` from the config.
        #[arg(long, value_delimiter = ',')]
        holdings: Option<Vec<String>>,

        /// Write the batch's entities and edges to this JSON file.
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Show manifest statistics.
    Status,

    /// Validate the primary manifest file.
    Verify,

    /// Record a holdings snapshot and print the change since the last one.
    Delta {
        /// Holdings, comma separated (e.g. `NVDA,AMD`).
        #[arg(value_delimiter = ',', required = true)]
        tickers: Vec<String>,
    },

    /// Clear all manifest state. Backups of the previous state are kept.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ice_engine=info,ice=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest { holdings, export } => run_ingest(&cfg, holdings, export).await,
        Commands::Status => run_status(&cfg),
        Commands::Verify => run_verify(&cfg),
        Commands::Delta { tickers } => run_delta(&cfg, &tickers),
        Commands::Reset { yes } => run_reset(&cfg, yes),
    }
}

async fn run_ingest(
    cfg: &Config,
    holdings: Option<Vec<String>>,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    let docs = connector_fs::scan_filesystem(cfg)?;
    info!(candidates = docs.len(), "scanned ingest root");

    let holdings: Option<BTreeSet<String>> = match holdings {
        Some(list) => Some(list.iter().map(|t| normalize_ticker(t)).collect()),
        None if !cfg.portfolio.holdings.is_empty() => Some(
            cfg.portfolio
                .holdings
                .iter()
                .map(|t| normalize_ticker(t))
                .collect(),
        ),
        None => None,
    };

    let graph = Arc::new(InMemoryGraphStore::new());
    let ctx = IngestContext::from_config(cfg, Arc::new(MarkerExtractor::new()), graph.clone());
    let orchestrator = GraphIngestionOrchestrator::new(ctx);

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight documents");
            shutdown.request();
        }
    });

    let summary = orchestrator.run_batch(docs, holdings).await?;
    print!("{}", summary);
    match export {
        Some(path) => {
            let (entities, edges) = write_graph_export(&graph, &summary.batch_id, &path)?;
            println!(
                "  exported: {} entities, {} edges to {}",
                entities,
                edges,
                path.display()
            );
        }
        None if summary.processed > 0 => {
            warn!("graph output not exported; pass --export to keep it");
        }
        None => {}
    }
    println!("ok");
    Ok(())
}

fn run_status(cfg: &Config) -> anyhow::Result<()> {
    let (manifest, recovery) = IngestionManifest::open(cfg.manifest_store(), cfg.hasher())?;
    let stats = manifest.stats();

    println!("manifest {}", cfg.manifest.path.display());
    if let Some(event) = recovery {
        println!("  loaded from backup: {} ({})", event.backup.display(), event.reason);
    }
    println!("  documents: {}", stats.documents);
    for (source, count) in &stats.documents_by_source {
        println!("    {}: {}", source, count);
    }
    println!("  snapshots: {}", stats.snapshots);
    let holdings: Vec<&str> = stats.current_holdings.iter().map(String::as_str).collect();
    println!("  holdings: {}", holdings.join(","));
    println!(
        "  api coverage: {} tickers, {} entries",
        stats.covered_tickers, stats.coverage_entries
    );
    Ok(())
}

fn run_verify(cfg: &Config) -> anyhow::Result<()> {
    let store = cfg.manifest_store();
    match store.verify() {
        Ok(manifest) => {
            println!(
                "{}: ok ({} documents)",
                store.path().display(),
                manifest.documents.len()
            );
            Ok(())
        }
        Err(reason) => bail!("{}: {}", store.path().display(), reason),
    }
}

fn run_delta(cfg: &Config, tickers: &[String]) -> anyhow::Result<()> {
    let store = cfg.manifest_store();
    let _lock = store.lock()?;
    let (mut manifest, _) = IngestionManifest::open(store, cfg.hasher())?;

    let delta = manifest.get_portfolio_delta(tickers);
    manifest.save().context("saving manifest")?;

    let fmt = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
    println!("added: {}", fmt(&delta.added));
    println!("removed: {}", fmt(&delta.removed));
    println!("kept: {}", fmt(&delta.kept));
    Ok(())
}

fn run_reset(cfg: &Config, yes: bool) -> anyhow::Result<()> {
    if !yes {
        bail!("refusing to reset without --yes");
    }
    let store = cfg.manifest_store();
    let _lock = store.lock()?;

    let mut manifest = match IngestionManifest::open(store.clone(), cfg.hasher()) {
        Ok((manifest, _)) => manifest,
        Err(e @ IceError::UnrecoverableManifest { .. }) => {
            warn!(error = %e, "manifest unreadable, resetting from scratch");
            IngestionManifest::fresh(store, cfg.hasher())
        }
        Err(e) => return Err(e.into()),
    };
    manifest.reset()?;
    println!("reset {}", cfg.manifest.path.display());
    Ok(())
}
