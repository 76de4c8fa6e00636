//! Graph store seam.
//!
//! The knowledge graph itself lives outside this crate. The orchestrator
//! only needs idempotent upserts keyed by stable id, removal of temporal
//! edges that a late observation made obsolete, and a way to fetch every
//! observation of an identity so temporal edges can chain across batches.
//!
//! [`InMemoryGraphStore`] backs the CLI and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Edge, Entity, TemporalType};

/// Abstract graph backend.
///
/// Upserts must be idempotent: writing the same id twice leaves one node
/// (or relationship) holding the last written value.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entities(&self, entities: &[Entity]) -> Result<()>;

    async fn upsert_edges(&self, edges: &[Edge]) -> Result<()>;

    /// Deletes edges by id. Unknown ids are ignored.
    async fn remove_edges(&self, ids: &[String]) -> Result<()>;

    /// Every point-in-time observation of `(entity_type, name)`, whatever
    /// its validity state.
    async fn observations(&self, entity_type: &str, name: &str) -> Result<Vec<Entity>>;
}

/// Graph store held in process memory.
#[derive(Default)]
pub struct InMemoryGraphStore {
    entities: RwLock<HashMap<String, Entity>>,
    edges: RwLock<HashMap<String, Edge>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.read().ok()?.get(id).cloned()
    }

    pub fn edge(&self, id: &str) -> Option<Edge> {
        self.edges.read().ok()?.get(id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Every stored entity, ordered by id.
    pub fn entities(&self) -> Vec<Entity> {
        let mut out: Vec<Entity> = match self.entities.read() {
            Ok(entities) => entities.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every stored edge, ordered by id.
    pub fn edges(&self) -> Vec<Edge> {
        let mut out: Vec<Edge> = match self.edges.read() {
            Ok(edges) => edges.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// All edges of `edge_type`, ordered by id.
    pub fn edges_of_type(&self, edge_type: &str) -> Vec<Edge> {
        let mut out: Vec<Edge> = match self.edges.read() {
            Ok(edges) => edges
                .values()
                .filter(|e| e.edge_type == edge_type)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_entities(&self, entities: &[Entity]) -> Result<()> {
        let mut stored = self
            .entities
            .write()
            .map_err(|_| anyhow!("entity map lock poisoned"))?;
        for entity in entities {
            stored.insert(entity.id.clone(), entity.clone());
        }
        Ok(())
    }

    async fn upsert_edges(&self, edges: &[Edge]) -> Result<()> {
        let mut stored = self
            .edges
            .write()
            .map_err(|_| anyhow!("edge map lock poisoned"))?;
        for edge in edges {
            stored.insert(edge.id.clone(), edge.clone());
        }
        Ok(())
    }

    async fn remove_edges(&self, ids: &[String]) -> Result<()> {
        let mut stored = self
            .edges
            .write()
            .map_err(|_| anyhow!("edge map lock poisoned"))?;
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn observations(&self, entity_type: &str, name: &str) -> Result<Vec<Entity>> {
        let stored = self
            .entities
            .read()
            .map_err(|_| anyhow!("entity map lock poisoned"))?;
        let mut out: Vec<Entity> = stored
            .values()
            .filter(|e| e.identity() == (entity_type, name))
            .filter(|e| {
                e.temporal
                    .as_ref()
                    .is_some_and(|t| t.temporal_type == TemporalType::PointInTime)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
