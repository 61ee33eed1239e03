/// OpenAI embedding provider
///
/// Calls an OpenAI-compatible Embeddings API using reqwest.
/// Supports text-embedding-3-small (1536 dimensions) by default; model and
/// base URL are configurable per store so the fast and quality legs can point
/// at different endpoints.

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingProvider};

/// Request body for the Embeddings API
#[derive(serde::Serialize)]
struct EmbedRequest {
    input: String,
    model: String,
}

/// Response from the Embeddings API
#[derive(serde::Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

/// Single embedding result
#[derive(serde::Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// OpenAI-backed embedding provider.
///
/// Requires a valid API key — validated on construction, not at embed time.
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dim: usize,
}

impl OpenAIEmbeddingProvider {
    /// Create a new OpenAIEmbeddingProvider.
    ///
    /// # Arguments
    /// * `api_key` - API key (must be non-empty)
    /// * `base_url` - API base URL override (defaults to api.openai.com)
    /// * `model` - Embedding model name (e.g., "text-embedding-3-small")
    ///
    /// # Errors
    /// Returns `EmbeddingError::NotConfigured` if api_key is empty.
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        model: String,
    ) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "OpenAI API key is required when using the openai embedding provider. \
                 Set EPIGRAPH_<STORE>__EMBEDDING__OPENAI_API_KEY or openai_api_key in epigraph.toml"
                    .to_string(),
            ));
        }

        // text-embedding-3-small and ada-002 are both 1536-dimensional; other
        // models on compatible endpoints are assumed to match unless the store
        // is configured otherwise.
        let dim = if model.contains("3-large") { 3072 } else { 1536 };

        Ok(OpenAIEmbeddingProvider {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dim,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbedRequest {
            input: text.to_string(),
            model: self.model.clone(),
        };

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EmbeddingError::Api {
                status,
                message: body,
            });
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("Failed to parse API response: {}", e)))?;

        embed_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Generation("API returned empty embedding list".to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
