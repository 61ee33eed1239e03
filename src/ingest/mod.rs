/// Ingestion queue and worker
///
/// Episodes are accepted immediately and processed strictly in order by a
/// single consumer task, one at a time. Serial processing is the ordering
/// guarantee: extraction for episode N+1 never starts before episode N is
/// persisted to its awaited store, so later episodes can reference entities
/// from earlier ones. A failing job is logged and dropped; it never stops the
/// worker or affects later jobs.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::GraphError;
use crate::graph::Episode;
use crate::sync::DualSaveCoordinator;

/// Which store legs an ingestion job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Fast store only, no replication.
    Fast,
    /// Quality store only, awaited.
    Quality,
    /// Fast store awaited, quality store replicated in the background.
    Dual,
}

impl FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(IngestMode::Fast),
            "quality" => Ok(IngestMode::Quality),
            // Historical alias: unqualified requests get the dual path
            "dual" | "default" => Ok(IngestMode::Dual),
            other => Err(format!(
                "Unknown ingest mode: {} (expected fast, quality, or dual)",
                other
            )),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub episode: Episode,
    pub mode: IngestMode,
}

/// Single-consumer FIFO ingestion worker.
///
/// enqueue() is non-blocking and never applies backpressure; the queue is
/// unbounded and depth is observable for health reporting. stop() aborts the
/// consumer, which discards any jobs still queued — ingestion acks are
/// acceptance, not completion.
pub struct IngestWorker {
    tx: mpsc::UnboundedSender<IngestJob>,
    depth: Arc<AtomicUsize>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IngestWorker {
    /// Spawn the consumer task and return the worker handle.
    pub fn start(coordinator: Arc<DualSaveCoordinator>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IngestJob>();
        let depth = Arc::new(AtomicUsize::new(0));

        let queue_depth = Arc::clone(&depth);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                queue_depth.fetch_sub(1, Ordering::SeqCst);
                let episode_uuid = job.episode.uuid.clone();
                let mode = job.mode;
                // Run each job in its own task so a panic is contained in
                // the JoinError instead of taking down the consumer loop.
                let stores = Arc::clone(&coordinator);
                let outcome = tokio::spawn(async move {
                    match mode {
                        IngestMode::Fast => stores.save_fast(&job.episode).await,
                        IngestMode::Quality => stores.save_quality(&job.episode).await,
                        IngestMode::Dual => stores.synchronize(&job.episode).await,
                    }
                })
                .await;
                match outcome {
                    Ok(Ok(receipt)) => {
                        tracing::info!(
                            episode = %receipt.episode_uuid,
                            nodes = receipt.nodes,
                            edges = receipt.edges,
                            mode = ?mode,
                            "Ingestion job completed"
                        );
                    }
                    Ok(Err(e)) => {
                        // Log and move on; one bad episode must not wedge the queue
                        tracing::error!(
                            episode = %episode_uuid,
                            error = %e,
                            "Episode ingestion failed"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            episode = %episode_uuid,
                            error = %e,
                            "Episode ingestion panicked"
                        );
                    }
                }
            }
            tracing::debug!("Ingestion worker exiting");
        });

        IngestWorker {
            tx,
            depth,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue a job for processing. Returns as soon as the job is accepted.
    pub fn enqueue(&self, job: IngestJob) -> Result<(), GraphError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            GraphError::QueueUnavailable("ingestion worker is stopped".to_string())
        })
    }

    /// Jobs accepted but not yet picked up by the consumer.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Stop the consumer. Jobs still queued are discarded; subsequent
    /// enqueue() calls fail.
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .expect("worker handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
            // Cancelled is the expected outcome here
            let _ = handle.await;
        }
        // Queued jobs are gone with the receiver
        self.depth.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, EmbeddingProvider};
    use crate::extraction::{
        ExtractedEntity, ExtractionError, ExtractionProvider, RawExtraction,
    };
    use crate::graph::{new_uuid, EpisodeType};
    use crate::store::memory::MemoryGraphStore;
    use crate::store::{GraphStore, StoreAdapter};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    /// Records the order contents arrive in; fails on contents containing
    /// "poison"; optionally sleeps to keep jobs in the queue.
    struct RecordingExtractor {
        seen: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl RecordingExtractor {
        fn new(delay: Option<Duration>) -> Self {
            RecordingExtractor {
                seen: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl ExtractionProvider for RecordingExtractor {
        async fn extract(&self, content: &str) -> Result<RawExtraction, ExtractionError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(content.to_string());
            if content.contains("poison") {
                return Err(ExtractionError::Generation("model refused".to_string()));
            }
            if content.contains("combust") {
                panic!("extractor blew up");
            }
            Ok(RawExtraction {
                entities: vec![ExtractedEntity {
                    name: content.to_string(),
                    summary: String::new(),
                    labels: vec![],
                }],
                relations: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "recording"
        }
    }

    fn episode(content: &str) -> Episode {
        Episode {
            uuid: new_uuid(),
            group_id: "g1".to_string(),
            name: content.to_string(),
            content: content.to_string(),
            episode_type: EpisodeType::Text,
            reference_time: Utc::now(),
            source_description: None,
            role: None,
            role_type: None,
            created_at: Utc::now(),
        }
    }

    fn build(
        delay: Option<Duration>,
    ) -> (
        Arc<DualSaveCoordinator>,
        Arc<MemoryGraphStore>,
        Arc<RecordingExtractor>,
    ) {
        let fast_store = Arc::new(MemoryGraphStore::new());
        let quality_store = Arc::new(MemoryGraphStore::new());
        let extractor = Arc::new(RecordingExtractor::new(delay));
        let fast = Arc::new(StoreAdapter::new(
            "fast",
            Arc::clone(&fast_store) as Arc<dyn GraphStore>,
            Arc::new(StubEmbedder),
            Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
        ));
        let quality = Arc::new(StoreAdapter::new(
            "quality",
            quality_store as Arc<dyn GraphStore>,
            Arc::new(StubEmbedder),
            Arc::clone(&extractor) as Arc<dyn ExtractionProvider>,
        ));
        (
            Arc::new(DualSaveCoordinator::new(fast, quality, false)),
            fast_store,
            extractor,
        )
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

    #[test]
    fn mode_parsing_accepts_default_alias() {
        assert_eq!("fast".parse::<IngestMode>().unwrap(), IngestMode::Fast);
        assert_eq!("DUAL".parse::<IngestMode>().unwrap(), IngestMode::Dual);
        assert_eq!("default".parse::<IngestMode>().unwrap(), IngestMode::Dual);
        assert!("bogus".parse::<IngestMode>().is_err());
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (coordinator, fast_store, extractor) = build(None);
        let worker = IngestWorker::start(coordinator);

        for content in ["first", "second", "third"] {
            worker
                .enqueue(IngestJob {
                    episode: episode(content),
                    mode: IngestMode::Fast,
                })
                .unwrap();
        }

        wait_for_episodes(&fast_store, 3).await;
        assert_eq!(
            *extractor.seen.lock().unwrap(),
            vec!["first", "second", "third"]
        );
        worker.stop().await;
    }

    #[tokio::test]
    async fn failing_job_does_not_stop_the_worker() {
        let (coordinator, fast_store, extractor) = build(None);
        let worker = IngestWorker::start(coordinator);

        worker
            .enqueue(IngestJob {
                episode: episode("poison pill"),
                mode: IngestMode::Fast,
            })
            .unwrap();
        worker
            .enqueue(IngestJob {
                episode: episode("survivor"),
                mode: IngestMode::Fast,
            })
            .unwrap();

        wait_for_episodes(&fast_store, 1).await;
        assert_eq!(extractor.seen.lock().unwrap().len(), 2);
        assert_eq!(fast_store.counts().episodes, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_worker() {
        let (coordinator, fast_store, extractor) = build(None);
        let worker = IngestWorker::start(coordinator);

        worker
            .enqueue(IngestJob {
                episode: episode("combust on contact"),
                mode: IngestMode::Fast,
            })
            .unwrap();
        worker
            .enqueue(IngestJob {
                episode: episode("survivor"),
                mode: IngestMode::Fast,
            })
            .unwrap();

        // The panicking job is dropped; the next one still runs
        wait_for_episodes(&fast_store, 1).await;
        assert_eq!(extractor.seen.lock().unwrap().len(), 2);
        assert_eq!(fast_store.counts().episodes, 1);

        // The queue is still accepting work
        worker
            .enqueue(IngestJob {
                episode: episode("after the fire"),
                mode: IngestMode::Fast,
            })
            .unwrap();
        wait_for_episodes(&fast_store, 2).await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_discards_queued_jobs_and_rejects_new_ones() {
        // Slow extraction keeps later jobs queued while we stop
        let (coordinator, fast_store, _extractor) = build(Some(Duration::from_secs(60)));
        let worker = IngestWorker::start(coordinator);

        for content in ["a", "b", "c"] {
            worker
                .enqueue(IngestJob {
                    episode: episode(content),
                    mode: IngestMode::Fast,
                })
                .unwrap();
        }

        worker.stop().await;
        assert_eq!(fast_store.counts().episodes, 0);
        assert_eq!(worker.depth(), 0);

        let rejected = worker.enqueue(IngestJob {
            episode: episode("late"),
            mode: IngestMode::Fast,
        });
        assert!(matches!(rejected, Err(GraphError::QueueUnavailable(_))));
    }

    #[tokio::test]
    async fn depth_tracks_accepted_jobs() {
        let (coordinator, _fast_store, _extractor) = build(Some(Duration::from_secs(60)));
        let worker = IngestWorker::start(coordinator);

        for content in ["a", "b", "c"] {
            worker
                .enqueue(IngestJob {
                    episode: episode(content),
                    mode: IngestMode::Fast,
                })
                .unwrap();
        }
        // The consumer may have picked up the first job already
        assert!(worker.depth() >= 2);
        worker.stop().await;
    }
}
