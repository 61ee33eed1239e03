/// Dual-save coordination
///
/// One episode, two stores. The coordinator runs extraction once through the
/// fast adapter, awaits that persist, then replicates the snapshot into the
/// quality store as a detached background task. The caller observes fast-store
/// latency only; quality-store replication errors are logged and swallowed.
///
/// Cross-store consistency is eventual. Records keep the same uuid and
/// group_id in both stores, so a record found in one store can be joined
/// against its twin in the other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::errors::GraphError;
use crate::graph::{DeleteOutcome, Episode, GroupDeleteStats};
use crate::store::StoreAdapter;

/// What one save actually did, reported back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReceipt {
    pub episode_uuid: String,
    /// Entities persisted in the awaited store.
    pub nodes: usize,
    /// Facts persisted in the awaited store.
    pub edges: usize,
    /// True when a detached quality-store replication was scheduled. The
    /// replication itself may still be running, or may yet fail.
    pub replication_scheduled: bool,
}

/// A delete applied to both stores; each leg reports independently.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DualDeleteOutcome {
    pub fast: DeleteOutcome,
    pub quality: DeleteOutcome,
}

impl DualDeleteOutcome {
    /// True when at least one store held the record.
    pub fn any_deleted(&self) -> bool {
        self.fast == DeleteOutcome::Deleted || self.quality == DeleteOutcome::Deleted
    }
}

/// Group delete counts from both stores.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DualGroupDeleteStats {
    pub fast: GroupDeleteStats,
    pub quality: GroupDeleteStats,
}

/// Decrements the pending-replication counter when dropped, so the count
/// stays accurate even if the replication task panics.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Coordinates saves, deletes, and maintenance across the fast and quality
/// stores. Cheap to clone via the contained Arcs; the server, worker, and CLI
/// all share one instance.
pub struct DualSaveCoordinator {
    fast: Arc<StoreAdapter>,
    quality: Arc<StoreAdapter>,
    /// Both adapters talk to the same underlying database. Maintenance ops
    /// run once instead of twice; saves still run both legs (the upsert is
    /// idempotent) so the re-embedding behavior stays uniform.
    single_backend: bool,
    pending: Arc<AtomicUsize>,
}

impl DualSaveCoordinator {
    pub fn new(fast: Arc<StoreAdapter>, quality: Arc<StoreAdapter>, single_backend: bool) -> Self {
        DualSaveCoordinator {
            fast,
            quality,
            single_backend,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fast(&self) -> &Arc<StoreAdapter> {
        &self.fast
    }

    pub fn quality(&self) -> &Arc<StoreAdapter> {
        &self.quality
    }

    /// Save to both stores: await the fast leg, detach the quality leg.
    ///
    /// Extraction runs exactly once, inside the fast adapter's ingest. The
    /// detached replication clears and regenerates embeddings for the quality
    /// store. A fast-leg failure fails the save; a quality-leg failure is
    /// logged by the background task and never surfaces here.
    pub async fn synchronize(&self, episode: &Episode) -> Result<SyncReceipt, GraphError> {
        let snapshot = self.fast.ingest(episode).await?;

        let receipt = SyncReceipt {
            episode_uuid: snapshot.episode.uuid.clone(),
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            replication_scheduled: true,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(Arc::clone(&self.pending));
        let quality = Arc::clone(&self.quality);
        tokio::spawn(async move {
            let _guard = guard;
            match quality.replicate_from(&snapshot).await {
                Ok(persisted) => {
                    tracing::debug!(
                        episode = %snapshot.episode.uuid,
                        nodes = persisted.nodes,
                        edges = persisted.edges,
                        "Quality replication complete"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        episode = %snapshot.episode.uuid,
                        error = %e,
                        "Quality replication failed; stores have diverged for this episode"
                    );
                }
            }
        });

        Ok(receipt)
    }

    /// Save to the fast store only. No replication is scheduled.
    pub async fn save_fast(&self, episode: &Episode) -> Result<SyncReceipt, GraphError> {
        let snapshot = self.fast.ingest(episode).await?;
        Ok(SyncReceipt {
            episode_uuid: snapshot.episode.uuid.clone(),
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            replication_scheduled: false,
        })
    }

    /// Save to the quality store only, awaited.
    pub async fn save_quality(&self, episode: &Episode) -> Result<SyncReceipt, GraphError> {
        let snapshot = self.quality.ingest(episode).await?;
        Ok(SyncReceipt {
            episode_uuid: snapshot.episode.uuid.clone(),
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            replication_scheduled: false,
        })
    }

    /// Number of detached quality replications still in flight.
    pub fn pending_replications(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait for in-flight replications to finish, up to `timeout`.
    ///
    /// Returns true if the count reached zero. Used at shutdown so detached
    /// quality saves are not silently dropped with the runtime.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.pending_replications();
            if remaining == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "Drain timed out with replications still pending");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Delete one entity edge from both stores. Absence in either store is
    /// benign; the caller sees both outcomes.
    pub async fn delete_entity_edge(&self, uuid: &str) -> Result<DualDeleteOutcome, GraphError> {
        let fast = self.fast.delete_edge(uuid).await?;
        let quality = if self.single_backend {
            fast
        } else {
            self.quality.delete_edge(uuid).await?
        };
        Ok(DualDeleteOutcome { fast, quality })
    }

    /// Delete one episode (and its episodic edges) from both stores.
    pub async fn delete_episode(&self, uuid: &str) -> Result<DualDeleteOutcome, GraphError> {
        let fast = self.fast.delete_episode(uuid).await?;
        let quality = if self.single_backend {
            fast
        } else {
            self.quality.delete_episode(uuid).await?
        };
        Ok(DualDeleteOutcome { fast, quality })
    }

    /// Delete every record in a group from both stores.
    pub async fn delete_group(&self, group_id: &str) -> Result<DualGroupDeleteStats, GraphError> {
        let fast = self.fast.delete_group(group_id).await?;
        let quality = if self.single_backend {
            fast
        } else {
            self.quality.delete_group(group_id).await?
        };
        Ok(DualGroupDeleteStats { fast, quality })
    }

    /// Wipe both stores. Idempotent.
    pub async fn clear_all(&self) -> Result<(), GraphError> {
        self.fast.clear().await?;
        if !self.single_backend {
            self.quality.clear().await?;
        }
        Ok(())
    }

    /// Build indices and constraints in both stores.
    pub async fn build_indices_all(&self) -> Result<(), GraphError> {
        self.fast.build_indices().await?;
        if !self.single_backend {
            self.quality.build_indices().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::extraction::{ExtractedEntity, ExtractedRelation, ExtractionProvider, RawExtraction};
    use crate::graph::{new_uuid, EpisodeType};
    use crate::store::memory::MemoryGraphStore;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubEmbedder {
        vector: Vec<f32>,
        calls: AtomicUsize,
    }

    impl StubEmbedder {
        fn new(vector: Vec<f32>) -> Self {
            StubEmbedder {
                vector,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::embedding::EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector.clone())
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }
    }

    struct StubExtractor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExtractionProvider for StubExtractor {
        async fn extract(
            &self,
            _content: &str,
        ) -> Result<RawExtraction, crate::extraction::ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawExtraction {
                entities: vec![
                    ExtractedEntity {
                        name: "Alice".to_string(),
                        summary: "engineer".to_string(),
                        labels: vec![],
                    },
                    ExtractedEntity {
                        name: "Acme".to_string(),
                        summary: "company".to_string(),
                        labels: vec![],
                    },
                ],
                relations: vec![ExtractedRelation {
                    source: "Alice".to_string(),
                    target: "Acme".to_string(),
                    name: "WORKS_AT".to_string(),
                    fact: "Alice works at Acme".to_string(),
                }],
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn episode(group: &str) -> Episode {
        Episode {
            uuid: new_uuid(),
            group_id: group.to_string(),
            name: "test".to_string(),
            content: "Alice works at Acme".to_string(),
            episode_type: EpisodeType::Text,
            reference_time: Utc::now(),
            source_description: None,
            role: None,
            role_type: None,
            created_at: Utc::now(),
        }
    }

    fn coordinator(
        extraction_calls: Arc<AtomicUsize>,
    ) -> (DualSaveCoordinator, Arc<MemoryGraphStore>, Arc<MemoryGraphStore>) {
        let fast_store = Arc::new(MemoryGraphStore::new());
        let quality_store = Arc::new(MemoryGraphStore::new());
        let extractor = Arc::new(StubExtractor {
            calls: extraction_calls,
        });
        let fast = Arc::new(StoreAdapter::new(
            "fast",
            Arc::clone(&fast_store) as Arc<dyn crate::store::GraphStore>,
            Arc::new(StubEmbedder::new(vec![1.0, 0.0])),
            Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
        ));
        let quality = Arc::new(StoreAdapter::new(
            "quality",
            Arc::clone(&quality_store) as Arc<dyn crate::store::GraphStore>,
            Arc::new(StubEmbedder::new(vec![0.0, 1.0])),
            extractor as Arc<dyn ExtractionProvider>,
        ));
        (
            DualSaveCoordinator::new(fast, quality, false),
            fast_store,
            quality_store,
        )
    }

    #[tokio::test]
    async fn synchronize_extracts_once_and_reaches_both_stores() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (coordinator, fast_store, quality_store) = coordinator(Arc::clone(&calls));

        let receipt = coordinator.synchronize(&episode("g1")).await.unwrap();
        assert!(receipt.replication_scheduled);
        assert_eq!(receipt.nodes, 2);
        assert_eq!(receipt.edges, 1);

        assert!(coordinator.drain(Duration::from_secs(5)).await);

        // One extraction served both stores
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fast_store.counts().nodes, 2);
        assert_eq!(quality_store.counts().nodes, 2);
        assert_eq!(quality_store.counts().edges, 1);
    }

    #[tokio::test]
    async fn replica_keeps_uuids_but_not_embeddings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (coordinator, fast_store, quality_store) = coordinator(calls);

        coordinator.synchronize(&episode("g1")).await.unwrap();
        assert!(coordinator.drain(Duration::from_secs(5)).await);

        let fast_counts = fast_store.counts();
        assert_eq!(fast_counts.nodes, quality_store.counts().nodes);

        // Same uuid in both stores, different vectors
        for (uuid, fast_node) in fast_store.nodes_snapshot() {
            let quality_node = quality_store.get_node(&uuid).unwrap();
            assert_eq!(fast_node.name, quality_node.name);
            assert_ne!(fast_node.name_embedding, quality_node.name_embedding);
        }
    }

    #[tokio::test]
    async fn save_fast_skips_replication() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (coordinator, fast_store, quality_store) = coordinator(calls);

        let receipt = coordinator.save_fast(&episode("g1")).await.unwrap();
        assert!(!receipt.replication_scheduled);
        assert_eq!(coordinator.pending_replications(), 0);
        assert_eq!(fast_store.counts().nodes, 2);
        assert_eq!(quality_store.counts().nodes, 0);
    }

    #[tokio::test]
    async fn group_delete_hits_both_stores() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (coordinator, fast_store, quality_store) = coordinator(calls);

        coordinator.synchronize(&episode("g1")).await.unwrap();
        assert!(coordinator.drain(Duration::from_secs(5)).await);

        let stats = coordinator.delete_group("g1").await.unwrap();
        assert_eq!(stats.fast.nodes, 2);
        assert_eq!(stats.quality.nodes, 2);
        assert_eq!(fast_store.counts().nodes, 0);
        assert_eq!(quality_store.counts().nodes, 0);
    }

    #[tokio::test]
    async fn edge_delete_reports_absence_per_store() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (coordinator, _fast_store, _quality_store) = coordinator(calls);

        let outcome = coordinator.delete_entity_edge("no-such-edge").await.unwrap();
        assert!(!outcome.any_deleted());
        assert_eq!(outcome.fast, DeleteOutcome::NotFound);
        assert_eq!(outcome.quality, DeleteOutcome::NotFound);
    }
}
