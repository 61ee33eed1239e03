/// Graph store abstraction layer
///
/// Provides the GraphStore trait over the external graph engine — persistence,
/// ranked hybrid search, deletes, and maintenance — plus the StoreAdapter that
/// glues one store to its embedder and the shared extractor. Backends:
/// PostgreSQL (production) and in-memory (tests, ephemeral deployments).

use async_trait::async_trait;

use crate::errors::GraphError;
use crate::graph::{
    DeleteOutcome, EntityEdge, EntityNode, Episode, ExtractionResult, GroupDeleteStats,
};

pub mod adapter;
pub mod memory;
pub mod postgres;

pub use adapter::{PersistReceipt, StoreAdapter};

/// A ranked edge search: hybrid keyword + vector retrieval fused with RRF,
/// optionally reranked by graph distance from a center node. The query
/// embedding is computed by the owning adapter's embedder, so it always
/// matches the vectors persisted in this store.
#[derive(Debug, Clone)]
pub struct EdgeQuery {
    pub text: String,
    pub embedding: Vec<f32>,
    pub group_ids: Vec<String>,
    pub limit: usize,
    pub center_node_uuid: Option<String>,
}

/// A ranked node search over entity names and summaries.
#[derive(Debug, Clone)]
pub struct NodeQuery {
    pub text: String,
    pub embedding: Vec<f32>,
    pub group_ids: Vec<String>,
    pub limit: usize,
}

/// Core abstraction for one graph store.
///
/// All implementations must be Send + Sync to support concurrent access. The
/// store owns its own persistent state; callers never mutate graph state
/// except through these operations. Persist operations are idempotent per
/// UUID so replication into the same underlying store is safe.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert an extraction snapshot: the episode plus its nodes, edges, and
    /// episodic edges, keyed by UUID.
    async fn persist(&self, snapshot: &ExtractionResult) -> Result<(), GraphError>;

    /// Hybrid edge search, ranked. Returns at most `query.limit` edges.
    async fn search_edges(&self, query: &EdgeQuery) -> Result<Vec<EntityEdge>, GraphError>;

    /// Hybrid node search, ranked. Returns at most `query.limit` nodes.
    async fn search_nodes(&self, query: &NodeQuery) -> Result<Vec<EntityNode>, GraphError>;

    /// Fetch a single entity edge by UUID.
    async fn get_edge(&self, uuid: &str) -> Result<Option<EntityEdge>, GraphError>;

    /// The most recent episodes for a group, newest first by reference time.
    async fn recent_episodes(&self, group_id: &str, last_n: usize)
        -> Result<Vec<Episode>, GraphError>;

    /// Delete one entity edge. Absence is reported, not an error.
    async fn delete_edge(&self, uuid: &str) -> Result<DeleteOutcome, GraphError>;

    /// Delete one episode and its episodic edges. Absence is reported, not an error.
    async fn delete_episode(&self, uuid: &str) -> Result<DeleteOutcome, GraphError>;

    /// Delete every node, edge, and episode in a group.
    async fn delete_group(&self, group_id: &str) -> Result<GroupDeleteStats, GraphError>;

    /// Remove all data from the store. Idempotent.
    async fn clear(&self) -> Result<(), GraphError>;

    /// Create indices and constraints. Idempotent.
    async fn build_indices(&self) -> Result<(), GraphError>;
}
