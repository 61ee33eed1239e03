/// In-memory graph store
///
/// Backs tests and ephemeral deployments. Same ranking pipeline shape as the
/// PostgreSQL store: keyword and vector legs fused with RRF, optional
/// center-node distance reranking. State lives behind a std RwLock — no lock
/// is ever held across an await point.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::errors::GraphError;
use crate::graph::{
    DeleteOutcome, EntityEdge, EntityNode, Episode, EpisodicEdge, ExtractionResult,
    GroupDeleteStats,
};
use crate::search::{cosine_similarity, rerank_by_node_distance, rrf_fuse, RRF_K};
use crate::store::{EdgeQuery, GraphStore, NodeQuery};

#[derive(Default)]
struct Inner {
    episodes: HashMap<String, Episode>,
    nodes: HashMap<String, EntityNode>,
    edges: HashMap<String, EntityEdge>,
    episodic_edges: HashMap<String, EpisodicEdge>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    inner: RwLock<Inner>,
}

/// Record counts, exposed for assertions and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub episodes: usize,
    pub nodes: usize,
    pub edges: usize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        MemoryGraphStore::default()
    }

    pub fn counts(&self) -> StoreCounts {
        let inner = self.inner.read().expect("store lock poisoned");
        StoreCounts {
            episodes: inner.episodes.len(),
            nodes: inner.nodes.len(),
            edges: inner.edges.len(),
        }
    }

    pub fn get_node(&self, uuid: &str) -> Option<EntityNode> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .nodes
            .get(uuid)
            .cloned()
    }

    pub fn nodes_snapshot(&self) -> Vec<(String, EntityNode)> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .nodes
            .iter()
            .map(|(uuid, node)| (uuid.clone(), node.clone()))
            .collect()
    }
}

fn in_groups(group_id: &str, group_ids: &[String]) -> bool {
    group_ids.is_empty() || group_ids.iter().any(|g| g == group_id)
}

/// 1-based keyword ranks: records scored by query-term overlap, zero-overlap
/// records excluded.
fn keyword_ranks(query: &str, candidates: &[(String, String)]) -> Vec<(String, i64)> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(String::from)
        .collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(String, usize)> = candidates
        .iter()
        .filter_map(|(uuid, text)| {
            let haystack = text.to_lowercase();
            let overlap = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
            (overlap > 0).then(|| (uuid.clone(), overlap))
        })
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (uuid, _))| (uuid, i as i64 + 1))
        .collect()
}

/// 1-based vector ranks by cosine similarity; records without embeddings are excluded.
fn vector_ranks(embedding: &[f32], candidates: &[(String, Option<Vec<f32>>)]) -> Vec<(String, i64)> {
    let mut scored: Vec<(String, f32)> = candidates
        .iter()
        .filter_map(|(uuid, vec)| {
            vec.as_ref()
                .map(|v| (uuid.clone(), cosine_similarity(embedding, v)))
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (uuid, _))| (uuid, i as i64 + 1))
        .collect()
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn persist(&self, snapshot: &ExtractionResult) -> Result<(), GraphError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;

        inner
            .episodes
            .insert(snapshot.episode.uuid.clone(), snapshot.episode.clone());
        for node in &snapshot.nodes {
            inner.nodes.insert(node.uuid.clone(), node.clone());
        }
        for edge in &snapshot.edges {
            inner.edges.insert(edge.uuid.clone(), edge.clone());
        }
        for edge in &snapshot.episodic_edges {
            inner.episodic_edges.insert(edge.uuid.clone(), edge.clone());
        }
        Ok(())
    }

    async fn search_edges(&self, query: &EdgeQuery) -> Result<Vec<EntityEdge>, GraphError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;

        let candidates: Vec<&EntityEdge> = inner
            .edges
            .values()
            .filter(|e| in_groups(&e.group_id, &query.group_ids))
            .collect();

        let texts: Vec<(String, String)> = candidates
            .iter()
            .map(|e| (e.uuid.clone(), e.fact.clone()))
            .collect();
        let vectors: Vec<(String, Option<Vec<f32>>)> = candidates
            .iter()
            .map(|e| (e.uuid.clone(), e.fact_embedding.clone()))
            .collect();

        let fused = rrf_fuse(
            &keyword_ranks(&query.text, &texts),
            &vector_ranks(&query.embedding, &vectors),
            RRF_K,
        );

        let by_uuid: HashMap<&str, &EntityEdge> =
            candidates.iter().map(|e| (e.uuid.as_str(), *e)).collect();
        let mut ranked: Vec<EntityEdge> = fused
            .iter()
            .filter_map(|(uuid, _)| by_uuid.get(uuid.as_str()).map(|e| (*e).clone()))
            .collect();

        if let Some(center) = &query.center_node_uuid {
            let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
            for edge in inner
                .edges
                .values()
                .filter(|e| in_groups(&e.group_id, &query.group_ids))
            {
                adjacency
                    .entry(edge.source_node_uuid.clone())
                    .or_default()
                    .push(edge.target_node_uuid.clone());
                adjacency
                    .entry(edge.target_node_uuid.clone())
                    .or_default()
                    .push(edge.source_node_uuid.clone());
            }
            ranked = rerank_by_node_distance(ranked, &adjacency, center);
        }

        ranked.truncate(query.limit);
        Ok(ranked)
    }

    async fn search_nodes(&self, query: &NodeQuery) -> Result<Vec<EntityNode>, GraphError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;

        let candidates: Vec<&EntityNode> = inner
            .nodes
            .values()
            .filter(|n| in_groups(&n.group_id, &query.group_ids))
            .collect();

        let texts: Vec<(String, String)> = candidates
            .iter()
            .map(|n| (n.uuid.clone(), format!("{} {}", n.name, n.summary)))
            .collect();
        let vectors: Vec<(String, Option<Vec<f32>>)> = candidates
            .iter()
            .map(|n| (n.uuid.clone(), n.name_embedding.clone()))
            .collect();

        let fused = rrf_fuse(
            &keyword_ranks(&query.text, &texts),
            &vector_ranks(&query.embedding, &vectors),
            RRF_K,
        );

        let by_uuid: HashMap<&str, &EntityNode> =
            candidates.iter().map(|n| (n.uuid.as_str(), *n)).collect();
        let mut ranked: Vec<EntityNode> = fused
            .iter()
            .filter_map(|(uuid, _)| by_uuid.get(uuid.as_str()).map(|n| (*n).clone()))
            .collect();

        ranked.truncate(query.limit);
        Ok(ranked)
    }

    async fn get_edge(&self, uuid: &str) -> Result<Option<EntityEdge>, GraphError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;
        Ok(inner.edges.get(uuid).cloned())
    }

    async fn recent_episodes(
        &self,
        group_id: &str,
        last_n: usize,
    ) -> Result<Vec<Episode>, GraphError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;

        let mut episodes: Vec<Episode> = inner
            .episodes
            .values()
            .filter(|e| e.group_id == group_id)
            .cloned()
            .collect();
        episodes.sort_by(|a, b| b.reference_time.cmp(&a.reference_time));
        episodes.truncate(last_n);
        Ok(episodes)
    }

    async fn delete_edge(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;
        Ok(match inner.edges.remove(uuid) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn delete_episode(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;
        if inner.episodes.remove(uuid).is_none() {
            return Ok(DeleteOutcome::NotFound);
        }
        inner.episodic_edges.retain(|_, e| e.episode_uuid != uuid);
        Ok(DeleteOutcome::Deleted)
    }

    async fn delete_group(&self, group_id: &str) -> Result<GroupDeleteStats, GraphError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;

        let mut stats = GroupDeleteStats::default();
        let before_nodes = inner.nodes.len();
        inner.nodes.retain(|_, n| n.group_id != group_id);
        stats.nodes = (before_nodes - inner.nodes.len()) as u64;

        let before_edges = inner.edges.len();
        inner.edges.retain(|_, e| e.group_id != group_id);
        stats.edges = (before_edges - inner.edges.len()) as u64;

        let before_episodes = inner.episodes.len();
        inner.episodes.retain(|_, e| e.group_id != group_id);
        stats.episodes = (before_episodes - inner.episodes.len()) as u64;

        inner.episodic_edges.retain(|_, e| e.group_id != group_id);
        Ok(stats)
    }

    async fn clear(&self) -> Result<(), GraphError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| GraphError::Storage(format!("store lock poisoned: {}", e)))?;
        inner.episodes.clear();
        inner.nodes.clear();
        inner.edges.clear();
        inner.episodic_edges.clear();
        Ok(())
    }

    async fn build_indices(&self) -> Result<(), GraphError> {
        // Hash maps are their own index.
        Ok(())
    }
}
