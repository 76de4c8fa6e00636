//! Export of a batch's graph output as JSON.
//!
//! `ice ingest` runs against an in-memory graph store; without an export
//! its entities and edges are gone when the process exits, even though the
//! manifest records the documents as ingested. The export file is what a
//! downstream loader picks up.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::graph::InMemoryGraphStore;
use crate::models::{Edge, Entity};

#[derive(Serialize)]
struct GraphExport<'a> {
    batch_id: &'a str,
    entities: Vec<Entity>,
    edges: Vec<Edge>,
}

/// Writes every entity and edge in `graph` to `output` as pretty JSON.
/// Returns `(entities, edges)` written.
pub fn write_graph_export(
    graph: &InMemoryGraphStore,
    batch_id: &str,
    output: &Path,
) -> Result<(usize, usize)> {
    let data = GraphExport {
        batch_id,
        entities: graph.entities(),
        edges: graph.edges(),
    };
    let counts = (data.entities.len(), data.edges.len());
    let json = serde_json::to_string_pretty(&data)?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write export: {}", output.display()))?;
    Ok(counts)
}
