/// Embedding provider trait and supporting types
///
/// Provides a pluggable interface for text embedding generation. Each store
/// carries its own provider: the fast store a low-latency model, the quality
/// store a higher-fidelity one. Supports local fastembed models (default, no
/// API key) and OpenAI-compatible APIs.

pub mod local;
pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

use crate::graph::EntityNode;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// fastembed model initialization failure
    #[error("Model initialization error: {0}")]
    ModelInit(String),

    /// Embedding generation failure (inference error)
    #[error("Embedding generation error: {0}")]
    Generation(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Core trait for embedding text into fixed-dimension float vectors.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn EmbeddingProvider>).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Return the model name identifier (e.g., "all-MiniLM-L6-v2").
    fn model_name(&self) -> &str;

    /// Return the dimension of the embedding vectors produced by this model.
    fn dimension(&self) -> usize;
}

/// Build the text embedded for an entity node: name plus summary when present.
pub fn node_embedding_text(node: &EntityNode) -> String {
    if node.summary.is_empty() {
        node.name.clone()
    } else {
        format!("{}: {}", node.name, node.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_node_embedding_text_with_summary() {
        let node = EntityNode {
            uuid: "u".to_string(),
            group_id: "g".to_string(),
            name: "Alice".to_string(),
            summary: "a software engineer".to_string(),
            labels: vec![],
            name_embedding: None,
            attributes: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert_eq!(node_embedding_text(&node), "Alice: a software engineer");
    }

    #[test]
    fn test_node_embedding_text_name_only() {
        let node = EntityNode {
            uuid: "u".to_string(),
            group_id: "g".to_string(),
            name: "Alice".to_string(),
            summary: String::new(),
            labels: vec![],
            name_embedding: None,
            attributes: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert_eq!(node_embedding_text(&node), "Alice");
    }
}
