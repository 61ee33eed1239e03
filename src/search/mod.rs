/// Search routing and ranking primitives
///
/// The router selects which store(s) a query hits. Single-store modes return
/// the adapter's results as-is (the adapter's hybrid-search pipeline already
/// ranks them); dual mode fans out to both stores concurrently and merges with
/// quality results first, then fast, truncated to the requested limit. No
/// cross-store deduplication is performed — a deliberate simplification, the
/// same logical entity may appear once per store.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::GraphError;
use crate::graph::{EntityEdge, FactResult, NodeResult};
use crate::store::StoreAdapter;

/// Which store(s) a search targets. Parsed once at the server boundary —
/// everything below this point branches on the enum, never on strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fast,
    Quality,
    Dual,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Fast => write!(f, "fast"),
            SearchMode::Quality => write!(f, "quality"),
            SearchMode::Dual => write!(f, "dual"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(SearchMode::Fast),
            "quality" | "default" => Ok(SearchMode::Quality),
            "dual" => Ok(SearchMode::Dual),
            other => Err(format!("Unknown search mode: {}", other)),
        }
    }
}

/// A single search request. Read-only for its lifecycle.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub group_ids: Vec<String>,
    pub limit: usize,
    pub center_node_uuid: Option<String>,
    pub mode: SearchMode,
}

/// RRF smoothing constant from the literature; reduces top-1 dominance.
pub const RRF_K: f64 = 60.0;

/// Fuse two ranked lists via Reciprocal Rank Fusion (RRF).
///
/// RRF score for each record = sum of 1/(k + rank_i) over each retrieval leg i.
/// Records appearing in both legs score higher than single-leg results.
///
/// # Arguments
/// - `keyword_ranks`: (uuid, rank) pairs from the keyword leg — rank is 1-based
/// - `vector_ranks`: (uuid, rank) pairs from the similarity leg — rank is 1-based
/// - `k`: smoothing constant (60.0 from the RRF literature; reduces top-1 dominance)
///
/// # Returns
/// Vec of (uuid, rrf_score) sorted by rrf_score descending.
pub fn rrf_fuse(
    keyword_ranks: &[(String, i64)],
    vector_ranks: &[(String, i64)],
    k: f64,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();

    for (uuid, rank) in keyword_ranks {
        *scores.entry(uuid.clone()).or_default() += 1.0 / (k + *rank as f64);
    }
    for (uuid, rank) in vector_ranks {
        *scores.entry(uuid.clone()).or_default() += 1.0 / (k + *rank as f64);
    }

    let mut result: Vec<(String, f64)> = scores.into_iter().collect();
    // Descending score; uuid tiebreak keeps ordering deterministic
    result.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    result
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rerank edges by graph distance from a center node.
///
/// BFS over the undirected adjacency map yields each node's hop distance from
/// the center; an edge's distance is the lesser of its endpoints'. The sort is
/// stable, so the incoming (relevance) order breaks distance ties. Edges
/// unreachable from the center sink to the end.
pub fn rerank_by_node_distance(
    mut edges: Vec<EntityEdge>,
    adjacency: &HashMap<String, Vec<String>>,
    center_node_uuid: &str,
) -> Vec<EntityEdge> {
    let mut distance: HashMap<String, usize> = HashMap::new();
    distance.insert(center_node_uuid.to_string(), 0);

    let mut frontier = VecDeque::new();
    frontier.push_back(center_node_uuid.to_string());
    while let Some(node) = frontier.pop_front() {
        let next_hop = distance[&node] + 1;
        if let Some(neighbors) = adjacency.get(&node) {
            for neighbor in neighbors {
                if !distance.contains_key(neighbor) {
                    distance.insert(neighbor.clone(), next_hop);
                    frontier.push_back(neighbor.clone());
                }
            }
        }
    }

    let edge_distance = |edge: &EntityEdge| -> usize {
        let source = distance.get(&edge.source_node_uuid).copied().unwrap_or(usize::MAX);
        let target = distance.get(&edge.target_node_uuid).copied().unwrap_or(usize::MAX);
        source.min(target)
    };

    edges.sort_by_key(edge_distance);
    edges
}

/// Merge dual-mode results: quality first, fast appended, truncated to limit.
fn merge_dual<T>(quality: Vec<T>, fast: Vec<T>, limit: usize) -> Vec<T> {
    quality
        .into_iter()
        .chain(fast.into_iter())
        .take(limit)
        .collect()
}

/// Routes search requests to one or both store adapters.
///
/// Error policy: in dual mode any adapter failure fails the whole request —
/// a caller cannot distinguish a partial result from a complete one, so no
/// partial results are ever returned.
pub struct SearchRouter {
    fast: Arc<StoreAdapter>,
    quality: Arc<StoreAdapter>,
}

impl SearchRouter {
    pub fn new(fast: Arc<StoreAdapter>, quality: Arc<StoreAdapter>) -> Self {
        SearchRouter { fast, quality }
    }

    /// Search entity edges (facts).
    pub async fn search_facts(&self, request: &SearchRequest) -> Result<Vec<FactResult>, GraphError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let facts = match request.mode {
            SearchMode::Fast => self.fast.search_facts(request).await?,
            SearchMode::Quality => self.quality.search_facts(request).await?,
            SearchMode::Dual => {
                tracing::debug!(query = %request.query, "Dual fact search fan-out");
                let (quality, fast) = tokio::try_join!(
                    self.quality.search_facts(request),
                    self.fast.search_facts(request),
                )?;
                merge_dual(quality, fast, request.limit)
            }
        };

        Ok(facts)
    }

    /// Search entity nodes.
    pub async fn search_nodes(&self, request: &SearchRequest) -> Result<Vec<NodeResult>, GraphError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let nodes = match request.mode {
            SearchMode::Fast => self.fast.search_nodes(request).await?,
            SearchMode::Quality => self.quality.search_nodes(request).await?,
            SearchMode::Dual => {
                tracing::debug!(query = %request.query, "Dual node search fan-out");
                let (quality, fast) = tokio::try_join!(
                    self.quality.search_nodes(request),
                    self.fast.search_nodes(request),
                )?;
                merge_dual(quality, fast, request.limit)
            }
        };

        Ok(nodes)
    }
}
