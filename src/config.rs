/// Configuration management using figment
///
/// Loads configuration with this precedence (highest wins):
/// 1. Defaults (hardcoded)
/// 2. TOML file: epigraph.toml (in working directory)
/// 3. Environment variables: prefixed EPIGRAPH_ (e.g., EPIGRAPH_LOG_LEVEL=debug,
///    EPIGRAPH_FAST_STORE__DATABASE_URL=postgres://...)
///
/// Fast-store settings left unset fall back to the quality store's values, so a
/// sparse config yields a working single-database deployment.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::errors::GraphError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Quality store: higher-fidelity embeddings, written on the async leg.
    #[serde(default)]
    pub quality_store: StoreConfig,

    /// Fast store: low-latency embeddings, written synchronously.
    /// Unset fields inherit from quality_store via normalize().
    #[serde(default = "StoreConfig::empty")]
    pub fast_store: StoreConfig,

    /// LLM extraction settings (shared by both stores — extraction runs once).
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Ingestion queue / shutdown settings.
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection URL for this store's graph database.
    #[serde(default)]
    pub database_url: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl StoreConfig {
    /// A fully-unset store config, resolved against the quality store later.
    fn empty() -> Self {
        StoreConfig {
            database_url: String::new(),
            embedding: EmbeddingConfig {
                provider: String::new(),
                ..EmbeddingConfig::default()
            },
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_url: "postgres://localhost:5432/epigraph".to_string(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: "local" (fastembed, no API key) or "openai"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Cache directory for local model weights
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// OpenAI API key (required when provider is "openai")
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// OpenAI-compatible base URL override
    #[serde(default)]
    pub openai_base_url: Option<String>,

    /// OpenAI embedding model name
    #[serde(default = "default_openai_embedding_model")]
    pub openai_model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: default_embedding_provider(),
            cache_dir: default_cache_dir(),
            openai_api_key: None,
            openai_base_url: None,
            openai_model: default_openai_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Extraction provider: "ollama" (local, default) or "openai"
    #[serde(default = "default_extraction_provider")]
    pub provider: String,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,

    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_extraction_model")]
    pub openai_model: String,

    /// Maximum episode body length passed to the extractor before truncation
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            provider: default_extraction_provider(),
            ollama_base_url: default_ollama_base_url(),
            ollama_model: default_ollama_model(),
            openai_api_key: None,
            openai_model: default_openai_extraction_model(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Seconds to wait on shutdown for detached quality replications to finish
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_embedding_provider() -> String {
    "local".to_string()
}

fn default_cache_dir() -> String {
    dirs::cache_dir()
        .map(|d| d.join("epigraph").join("models"))
        .and_then(|p| p.to_str().map(String::from))
        .unwrap_or_else(|| ".epigraph-cache".to_string())
}

fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_extraction_provider() -> String {
    "ollama".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2:3b".to_string()
}

fn default_openai_extraction_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_content_chars() -> usize {
    1500
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            quality_store: StoreConfig::default(),
            fast_store: StoreConfig::empty(),
            extraction: ExtractionConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, TOML file, and environment variables.
    ///
    /// Environment variables override TOML file values.
    /// Example: EPIGRAPH_LOG_LEVEL=debug overrides log_level in epigraph.toml
    pub fn load() -> Result<Config, GraphError> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("epigraph.toml"))
            .merge(Env::prefixed("EPIGRAPH_").split("__"))
            .extract()
            .map_err(|e| GraphError::Config(format!("Failed to load config: {}", e)))?;
        config.normalize();
        Ok(config)
    }

    /// Resolve unset fast-store fields against the quality store.
    ///
    /// An empty fast database URL means both legs target the same database
    /// (single-database mode); an empty fast embedding provider means the fast
    /// store reuses the quality store's embedding settings.
    pub fn normalize(&mut self) {
        if self.fast_store.database_url.is_empty() {
            self.fast_store.database_url = self.quality_store.database_url.clone();
        }
        if self.fast_store.embedding.provider.is_empty() {
            self.fast_store.embedding = self.quality_store.embedding.clone();
        }
    }

    /// True when the fast and quality legs point at the same database.
    pub fn single_database(&self) -> bool {
        self.fast_store.database_url == self.quality_store.database_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.quality_store.database_url,
            "postgres://localhost:5432/epigraph"
        );
        assert_eq!(config.extraction.provider, "ollama");
        assert_eq!(config.ingest.drain_timeout_secs, 30);
    }

    #[test]
    fn test_normalize_inherits_quality_settings() {
        let mut config = Config::default();
        config.normalize();
        assert_eq!(
            config.fast_store.database_url,
            config.quality_store.database_url
        );
        assert_eq!(config.fast_store.embedding.provider, "local");
        assert!(config.single_database());
    }

    #[test]
    fn test_normalize_keeps_explicit_fast_store() {
        let mut config = Config::default();
        config.fast_store.database_url = "postgres://localhost:5433/epigraph_fast".to_string();
        config.fast_store.embedding.provider = "local".to_string();
        config.normalize();
        assert!(!config.single_database());
        assert_eq!(
            config.fast_store.database_url,
            "postgres://localhost:5433/epigraph_fast"
        );
    }
}
