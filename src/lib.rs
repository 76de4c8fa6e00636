//! # Investment Context Engine: ingestion core
//!
//! Turns a stream of financial documents (broker emails, market-data API
//! payloads, filings) into deduplicated, temporally annotated entities and
//! relationships for a knowledge graph.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐   ┌─────────────┐
//! │  Documents  │──▶│   Manifest   │──▶│  Extractor +  │──▶│ Graph store │
//! │ email/api/… │   │ dedup/deltas │   │   temporal    │   │  (upserts)  │
//! └─────────────┘   └──────┬───────┘   └───────────────┘   └─────────────┘
//!                          │ save once per batch
//!                          ▼
//!                  manifest.json + backups/
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`hasher`] | Content normalization and fingerprints |
//! | [`manifest`] | Dedup ledger, portfolio history, API coverage |
//! | [`storage`] | Atomic manifest persistence and backup recovery |
//! | [`lock`] | Single-writer batch lock |
//! | [`period`] | Reporting-period parsing |
//! | [`marker`] | Source-marker parsing |
//! | [`temporal`] | Freshness, validity windows, temporal edges |
//! | [`relevance`] | Portfolio relevance scoring |
//! | [`extract`] | Extractor seam and the marker extractor |
//! | [`graph`] | Graph store seam and in-memory store |
//! | [`export`] | JSON export of graph output |
//! | [`ingest`] | Batch orchestration |
//! | [`connector_fs`] | Filesystem scanner |

pub mod config;
pub mod connector_fs;
pub mod error;
pub mod export;
pub mod extract;
pub mod graph;
pub mod hasher;
pub mod ingest;
pub mod lock;
pub mod manifest;
pub mod marker;
pub mod models;
pub mod period;
pub mod relevance;
pub mod storage;
pub mod temporal;

pub use error::{IceError, Result};
pub use ingest::{BatchSummary, GraphIngestionOrchestrator, IngestContext};
pub use manifest::IngestionManifest;
