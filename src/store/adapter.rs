/// Store adapter: one graph store plus its embedder and the shared extractor
///
/// The adapter is where raw extraction output becomes graph records. Ingest
/// runs the expensive LLM extraction and embeds with this store's embedder;
/// replication skips extraction entirely and only re-embeds an existing
/// snapshot. Adapters are long-lived singletons constructed at startup and
/// shared by reference across all ingestion jobs and search requests; their
/// configuration never changes after initialization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::embedding::{node_embedding_text, EmbeddingProvider};
use crate::errors::GraphError;
use crate::extraction::ExtractionProvider;
use crate::graph::{
    new_uuid, DeleteOutcome, EntityEdge, EntityNode, Episode, EpisodicEdge, ExtractionResult,
    FactResult, GroupDeleteStats, NodeResult,
};
use crate::search::SearchRequest;
use crate::store::{EdgeQuery, GraphStore, NodeQuery};

/// What a persist leg wrote, for logging and acknowledgments.
#[derive(Debug, Clone, Copy)]
pub struct PersistReceipt {
    pub nodes: usize,
    pub edges: usize,
}

pub struct StoreAdapter {
    name: &'static str,
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn ExtractionProvider>,
}

impl StoreAdapter {
    pub fn new(
        name: &'static str,
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn ExtractionProvider>,
    ) -> Self {
        StoreAdapter {
            name,
            store,
            embedder,
            extractor,
        }
    }

    /// Store label for logging ("fast" or "quality").
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn embedder_model(&self) -> &str {
        self.embedder.model_name()
    }

    /// Extract, embed, and persist one episode into this store.
    ///
    /// This is the single extraction pass of the dual-save protocol: the
    /// returned snapshot carries this store's embeddings and is what the
    /// quality leg later replicates from. Any failure here is fatal for the
    /// whole ingestion — extraction and persist are one operation, so no
    /// partial extracted-but-unpersisted state escapes.
    pub async fn ingest(&self, episode: &Episode) -> Result<ExtractionResult, GraphError> {
        let body = episode.body();
        let raw = self.extractor.extract(&body).await?;

        let now = Utc::now();
        let mut nodes: Vec<EntityNode> = Vec::new();
        let mut name_index: HashMap<String, String> = HashMap::new();

        // Dedup extracted entities by case-insensitive name within this pass;
        // cross-episode identity is the store's concern, keyed by UUID.
        for entity in raw.entities {
            let key = entity.name.trim().to_lowercase();
            if key.is_empty() || name_index.contains_key(&key) {
                continue;
            }
            let mut node = EntityNode {
                uuid: new_uuid(),
                group_id: episode.group_id.clone(),
                name: entity.name.trim().to_string(),
                summary: entity.summary,
                labels: entity.labels,
                name_embedding: None,
                attributes: serde_json::json!({}),
                created_at: now,
            };
            node.name_embedding = Some(self.embedder.embed(&node_embedding_text(&node)).await?);
            name_index.insert(key, node.uuid.clone());
            nodes.push(node);
        }

        let mut edges: Vec<EntityEdge> = Vec::new();
        for relation in raw.relations {
            let source = name_index.get(&relation.source.trim().to_lowercase());
            let target = name_index.get(&relation.target.trim().to_lowercase());
            let (source, target) = match (source, target) {
                (Some(s), Some(t)) => (s.clone(), t.clone()),
                _ => {
                    tracing::warn!(
                        store = self.name,
                        source = %relation.source,
                        target = %relation.target,
                        "Relation references unextracted entity — skipping"
                    );
                    continue;
                }
            };

            let fact_embedding = Some(self.embedder.embed(&relation.fact).await?);
            edges.push(EntityEdge {
                uuid: new_uuid(),
                group_id: episode.group_id.clone(),
                source_node_uuid: source,
                target_node_uuid: target,
                name: relation.name,
                fact: relation.fact,
                fact_embedding,
                valid_at: Some(episode.reference_time),
                invalid_at: None,
                created_at: now,
                expired_at: None,
            });
        }

        let episodic_edges: Vec<EpisodicEdge> = nodes
            .iter()
            .map(|node| EpisodicEdge {
                uuid: new_uuid(),
                group_id: episode.group_id.clone(),
                episode_uuid: episode.uuid.clone(),
                node_uuid: node.uuid.clone(),
                created_at: now,
            })
            .collect();

        let snapshot = ExtractionResult {
            episode: episode.clone(),
            nodes,
            edges,
            episodic_edges,
        };

        self.store.persist(&snapshot).await?;

        tracing::info!(
            store = self.name,
            episode = %episode.uuid,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "Episode ingested"
        );

        Ok(snapshot)
    }

    /// Persist a snapshot produced by another store's ingest, re-embedded.
    ///
    /// The incoming vectors belong to the source store's embedder and are
    /// invalid here, so they are cleared and regenerated before persisting.
    /// UUIDs and group_id are preserved — the same logical records exist in
    /// both stores under the same keys. Safe to run against the same
    /// underlying store as the source (persist is an idempotent upsert).
    pub async fn replicate_from(
        &self,
        snapshot: &ExtractionResult,
    ) -> Result<PersistReceipt, GraphError> {
        let mut replica = snapshot.clone();
        replica.clear_embeddings();

        for node in &mut replica.nodes {
            node.name_embedding = Some(self.embedder.embed(&node_embedding_text(node)).await?);
        }
        for edge in &mut replica.edges {
            edge.fact_embedding = Some(self.embedder.embed(&edge.fact).await?);
        }

        self.store.persist(&replica).await?;

        tracing::debug!(
            store = self.name,
            episode = %replica.episode.uuid,
            "Replication persisted"
        );

        Ok(PersistReceipt {
            nodes: replica.nodes.len(),
            edges: replica.edges.len(),
        })
    }

    /// Ranked fact search against this store.
    pub async fn search_facts(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<FactResult>, GraphError> {
        let embedding = self.embedder.embed(&request.query).await?;
        let edges = self
            .store
            .search_edges(&EdgeQuery {
                text: request.query.clone(),
                embedding,
                group_ids: request.group_ids.clone(),
                limit: request.limit,
                center_node_uuid: request.center_node_uuid.clone(),
            })
            .await?;
        Ok(edges.iter().map(FactResult::from).collect())
    }

    /// Ranked node search against this store.
    pub async fn search_nodes(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<NodeResult>, GraphError> {
        let embedding = self.embedder.embed(&request.query).await?;
        let nodes = self
            .store
            .search_nodes(&NodeQuery {
                text: request.query.clone(),
                embedding,
                group_ids: request.group_ids.clone(),
                limit: request.limit,
            })
            .await?;
        Ok(nodes.iter().map(NodeResult::from).collect())
    }

    pub async fn get_entity_edge(&self, uuid: &str) -> Result<Option<EntityEdge>, GraphError> {
        self.store.get_edge(uuid).await
    }

    pub async fn recent_episodes(
        &self,
        group_id: &str,
        last_n: usize,
    ) -> Result<Vec<Episode>, GraphError> {
        self.store.recent_episodes(group_id, last_n).await
    }

    pub async fn delete_edge(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        self.store.delete_edge(uuid).await
    }

    pub async fn delete_episode(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        self.store.delete_episode(uuid).await
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<GroupDeleteStats, GraphError> {
        self.store.delete_group(group_id).await
    }

    pub async fn clear(&self) -> Result<(), GraphError> {
        self.store.clear().await
    }

    pub async fn build_indices(&self) -> Result<(), GraphError> {
        self.store.build_indices().await
    }
}
