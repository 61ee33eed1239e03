//! End-to-end pipeline tests over the in-memory backend: worker -> coordinator
//! -> both stores, plus the search router on top of the ingested graph.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use epigraph::embedding::{EmbeddingError, EmbeddingProvider};
use epigraph::errors::GraphError;
use epigraph::extraction::{
    ExtractedEntity, ExtractedRelation, ExtractionError, ExtractionProvider, RawExtraction,
};
use epigraph::graph::{new_uuid, Episode, EpisodeType};
use epigraph::ingest::{IngestJob, IngestMode, IngestWorker};
use epigraph::search::{SearchMode, SearchRequest, SearchRouter};
use epigraph::store::memory::MemoryGraphStore;
use epigraph::store::{GraphStore, StoreAdapter};
use epigraph::sync::DualSaveCoordinator;

/// Deterministic embedder: a fixed base vector perturbed by text length, so
/// different texts get different but stable vectors.
struct HashEmbedder {
    base: f32,
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let len = (text.len() % 7) as f32;
        Ok(vec![self.base, len, 1.0])
    }

    fn model_name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        3
    }
}

/// Extracts one entity per whitespace-separated word starting with an
/// uppercase letter, and one relation between the first two such words.
struct NaiveExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl ExtractionProvider for NaiveExtractor {
    async fn extract(&self, content: &str) -> Result<RawExtraction, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let names: Vec<&str> = content
            .split_whitespace()
            .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
            .collect();
        let entities = names
            .iter()
            .map(|name| ExtractedEntity {
                name: name.to_string(),
                summary: String::new(),
                labels: vec![],
            })
            .collect();
        let relations = if names.len() >= 2 {
            vec![ExtractedRelation {
                source: names[0].to_string(),
                target: names[1].to_string(),
                name: "RELATES_TO".to_string(),
                fact: content.to_string(),
            }]
        } else {
            vec![]
        };
        Ok(RawExtraction {
            entities,
            relations,
        })
    }

    fn model_name(&self) -> &str {
        "naive"
    }
}

struct Harness {
    coordinator: Arc<DualSaveCoordinator>,
    fast_store: Arc<MemoryGraphStore>,
    quality_store: Arc<MemoryGraphStore>,
    extractor: Arc<NaiveExtractor>,
    router: SearchRouter,
}

fn harness() -> Harness {
    let fast_store = Arc::new(MemoryGraphStore::new());
    let quality_store = Arc::new(MemoryGraphStore::new());
    let extractor = Arc::new(NaiveExtractor {
        calls: AtomicUsize::new(0),
    });

    let fast = Arc::new(StoreAdapter::new(
        "fast",
        Arc::clone(&fast_store) as Arc<dyn GraphStore>,
        Arc::new(HashEmbedder { base: 0.25 }),
        Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
    ));
    let quality = Arc::new(StoreAdapter::new(
        "quality",
        Arc::clone(&quality_store) as Arc<dyn GraphStore>,
        Arc::new(HashEmbedder { base: 0.75 }),
        Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
    ));

    let router = SearchRouter::new(Arc::clone(&fast), Arc::clone(&quality));
    let coordinator = Arc::new(DualSaveCoordinator::new(fast, quality, false));

    Harness {
        coordinator,
        fast_store,
        quality_store,
        extractor,
        router,
    }
}

fn episode(group: &str, content: &str) -> Episode {
    Episode {
        uuid: new_uuid(),
        group_id: group.to_string(),
        name: content.chars().take(20).collect(),
        content: content.to_string(),
        episode_type: EpisodeType::Text,
        reference_time: Utc::now(),
        source_description: None,
        role: None,
        role_type: None,
        created_at: Utc::now(),
    }
}

async fn wait_for_episodes(store: &MemoryGraphStore, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.counts().episodes < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} episodes",
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn queued_dual_saves_reach_both_stores_with_one_extraction_each() {
    let h = harness();
    let worker = IngestWorker::start(Arc::clone(&h.coordinator));

    worker
        .enqueue(IngestJob {
            episode: episode("team", "Alice joined Acme in March"),
            mode: IngestMode::Dual,
        })
        .unwrap();
    worker
        .enqueue(IngestJob {
            episode: episode("team", "Bob reports to Alice"),
            mode: IngestMode::Dual,
        })
        .unwrap();

    wait_for_episodes(&h.fast_store, 2).await;
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);
    wait_for_episodes(&h.quality_store, 2).await;

    // Extraction ran once per episode, shared across stores
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 2);

    // Same records under the same keys, different vectors per store
    for (uuid, fast_node) in h.fast_store.nodes_snapshot() {
        let quality_node = h
            .quality_store
            .get_node(&uuid)
            .expect("node missing from quality store");
        assert_eq!(fast_node.name, quality_node.name);
        assert_eq!(fast_node.group_id, quality_node.group_id);
        assert_ne!(fast_node.name_embedding, quality_node.name_embedding);
    }

    worker.stop().await;
}

#[tokio::test]
async fn dual_search_lists_quality_results_before_fast() {
    let h = harness();

    // Populate both stores via the coordinator, then search dual
    h.coordinator
        .synchronize(&episode("team", "Alice joined Acme in March"))
        .await
        .unwrap();
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);

    let request = SearchRequest {
        query: "Alice Acme".to_string(),
        group_ids: vec!["team".to_string()],
        limit: 10,
        center_node_uuid: None,
        mode: SearchMode::Dual,
    };
    let facts = h.router.search_facts(&request).await.unwrap();

    // Both stores hold the same fact under the same uuid; dual mode does not
    // deduplicate, so it appears twice with the quality copy first
    assert_eq!(facts.len(), 2);
    assert_eq!(facts[0].uuid, facts[1].uuid);
}

#[tokio::test]
async fn dual_search_truncates_to_limit_without_starving_fast() {
    let h = harness();
    for content in [
        "Alice joined Acme",
        "Bob joined Acme",
        "Carol joined Acme",
    ] {
        h.coordinator
            .synchronize(&episode("team", content))
            .await
            .unwrap();
    }
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);

    let request = SearchRequest {
        query: "joined Acme".to_string(),
        group_ids: vec!["team".to_string()],
        limit: 4,
        center_node_uuid: None,
        mode: SearchMode::Dual,
    };
    let facts = h.router.search_facts(&request).await.unwrap();

    // 3 quality results, then the fast leg fills the remaining slot
    assert_eq!(facts.len(), 4);
}

#[tokio::test]
async fn fast_only_save_is_invisible_to_quality_search() {
    let h = harness();
    h.coordinator
        .save_fast(&episode("team", "Alice joined Acme"))
        .await
        .unwrap();

    let request = SearchRequest {
        query: "Alice Acme".to_string(),
        group_ids: vec!["team".to_string()],
        limit: 10,
        center_node_uuid: None,
        mode: SearchMode::Quality,
    };
    assert!(h.router.search_facts(&request).await.unwrap().is_empty());

    let request = SearchRequest {
        mode: SearchMode::Fast,
        ..request
    };
    assert!(!h.router.search_facts(&request).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_an_episode_keeps_extracted_entities() {
    let h = harness();
    let ep = episode("team", "Alice joined Acme");
    h.coordinator.synchronize(&ep).await.unwrap();
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);

    let outcome = h.coordinator.delete_episode(&ep.uuid).await.unwrap();
    assert!(outcome.any_deleted());

    assert_eq!(h.fast_store.counts().episodes, 0);
    assert_eq!(h.quality_store.counts().episodes, 0);
    // Entities survive their source episode
    assert_eq!(h.fast_store.counts().nodes, 2);
    assert_eq!(h.quality_store.counts().nodes, 2);
}

#[tokio::test]
async fn group_delete_then_search_returns_nothing() {
    let h = harness();
    h.coordinator
        .synchronize(&episode("team", "Alice joined Acme"))
        .await
        .unwrap();
    h.coordinator
        .synchronize(&episode("other", "Dana joined Globex"))
        .await
        .unwrap();
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);

    h.coordinator.delete_group("team").await.unwrap();

    let request = SearchRequest {
        query: "joined".to_string(),
        group_ids: vec![],
        limit: 10,
        center_node_uuid: None,
        mode: SearchMode::Dual,
    };
    let facts = h.router.search_facts(&request).await.unwrap();
    assert!(facts.iter().all(|f| f.fact.contains("Globex")));

    // The untouched group is intact in both stores
    assert_eq!(h.fast_store.counts().episodes, 1);
    assert_eq!(h.quality_store.counts().episodes, 1);
}

#[tokio::test]
async fn clear_all_empties_both_stores_and_is_idempotent() {
    let h = harness();
    h.coordinator
        .synchronize(&episode("team", "Alice joined Acme"))
        .await
        .unwrap();
    assert!(h.coordinator.drain(Duration::from_secs(5)).await);

    h.coordinator.clear_all().await.unwrap();
    h.coordinator.clear_all().await.unwrap();

    assert_eq!(h.fast_store.counts().episodes, 0);
    assert_eq!(h.fast_store.counts().nodes, 0);
    assert_eq!(h.quality_store.counts().edges, 0);
}

/// Store stub that fails every search, for router error-policy tests.
struct FailingStore;

#[async_trait]
impl GraphStore for FailingStore {
    async fn persist(
        &self,
        _snapshot: &epigraph::graph::ExtractionResult,
    ) -> Result<(), GraphError> {
        Ok(())
    }

    async fn search_edges(
        &self,
        _query: &epigraph::store::EdgeQuery,
    ) -> Result<Vec<epigraph::graph::EntityEdge>, GraphError> {
        Err(GraphError::Storage("fast store is down".to_string()))
    }

    async fn search_nodes(
        &self,
        _query: &epigraph::store::NodeQuery,
    ) -> Result<Vec<epigraph::graph::EntityNode>, GraphError> {
        Err(GraphError::Storage("fast store is down".to_string()))
    }

    async fn get_edge(
        &self,
        _uuid: &str,
    ) -> Result<Option<epigraph::graph::EntityEdge>, GraphError> {
        Ok(None)
    }

    async fn recent_episodes(
        &self,
        _group_id: &str,
        _last_n: usize,
    ) -> Result<Vec<Episode>, GraphError> {
        Ok(vec![])
    }

    async fn delete_edge(
        &self,
        _uuid: &str,
    ) -> Result<epigraph::graph::DeleteOutcome, GraphError> {
        Ok(epigraph::graph::DeleteOutcome::NotFound)
    }

    async fn delete_episode(
        &self,
        _uuid: &str,
    ) -> Result<epigraph::graph::DeleteOutcome, GraphError> {
        Ok(epigraph::graph::DeleteOutcome::NotFound)
    }

    async fn delete_group(
        &self,
        _group_id: &str,
    ) -> Result<epigraph::graph::GroupDeleteStats, GraphError> {
        Ok(epigraph::graph::GroupDeleteStats::default())
    }

    async fn clear(&self) -> Result<(), GraphError> {
        Ok(())
    }

    async fn build_indices(&self) -> Result<(), GraphError> {
        Ok(())
    }
}

#[tokio::test]
async fn dual_search_fails_when_one_leg_fails() {
    let quality_store = Arc::new(MemoryGraphStore::new());
    let extractor = Arc::new(NaiveExtractor {
        calls: AtomicUsize::new(0),
    });
    let quality = Arc::new(StoreAdapter::new(
        "quality",
        Arc::clone(&quality_store) as Arc<dyn GraphStore>,
        Arc::new(HashEmbedder { base: 0.75 }),
        Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
    ));
    let fast = Arc::new(StoreAdapter::new(
        "fast",
        Arc::new(FailingStore) as Arc<dyn GraphStore>,
        Arc::new(HashEmbedder { base: 0.25 }),
        extractor as Arc<dyn ExtractionProvider>,
    ));
    let router = SearchRouter::new(Arc::clone(&fast), Arc::clone(&quality));

    quality
        .ingest(&episode("team", "Alice joined Acme"))
        .await
        .unwrap();

    let request = SearchRequest {
        query: "Alice".to_string(),
        group_ids: vec![],
        limit: 10,
        center_node_uuid: None,
        mode: SearchMode::Dual,
    };
    // No partial results: a dual request is all-or-nothing
    assert!(router.search_facts(&request).await.is_err());

    // The healthy leg alone still works
    let request = SearchRequest {
        mode: SearchMode::Quality,
        ..request
    };
    assert!(!router.search_facts(&request).await.unwrap().is_empty());
}
