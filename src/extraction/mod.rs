/// Extraction provider trait and supporting types
///
/// Provides a pluggable interface for mining entities and relationships out of
/// episode content. This is the expensive LLM step — the ingestion path runs it
/// exactly once per episode regardless of how many stores are targeted.
/// Supports Ollama (local, default, no API key) and OpenAI API.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur during extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Model initialization failure
    #[error("Model initialization error: {0}")]
    ModelInit(String),

    /// Extraction generation failure (inference error or parse error)
    #[error("Extraction generation error: {0}")]
    Generation(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// An entity mined from episode content, before it becomes a graph node.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A relationship mined from episode content, referencing entities by name.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    /// Relationship label (e.g. "WORKS_AT")
    pub name: String,
    /// Human-readable fact string
    pub fact: String,
}

/// Raw model output of one extraction pass.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// Truncate content to at most `max_bytes`, backing up to the nearest UTF-8
/// character boundary so the cut never splits a multibyte character.
pub(crate) fn truncate_for_prompt(content: &str, max_bytes: usize) -> &str {
    if content.len() <= max_bytes {
        return content;
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// Build the extraction prompt for a given content string.
pub fn build_extraction_prompt(content: &str) -> String {
    format!(
        "Extract entities and factual relationships from the following text.\n\
         Entities: people, places, organizations, tools, projects, concepts, preferences — \
         each with a name, a one-sentence summary, and optional type labels.\n\
         Relations: specific assertions between two extracted entities, each with a \
         source entity name, target entity name, an UPPER_SNAKE_CASE relationship name, \
         and the fact stated as one sentence.\n\
         Be comprehensive. Output only JSON matching the provided schema.\n\n\
         Text:\n{}",
        content
    )
}

/// JSON schema for structured extraction output
pub(crate) fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "summary": {"type": "string"},
                        "labels": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["name"]
                }
            },
            "relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "target": {"type": "string"},
                        "name": {"type": "string"},
                        "fact": {"type": "string"}
                    },
                    "required": ["source", "target", "name", "fact"]
                }
            }
        },
        "required": ["entities", "relations"]
    })
}

/// Core trait for mining entities and relationships from text.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn ExtractionProvider>).
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Extract entities and relations from the given content.
    async fn extract(&self, content: &str) -> Result<RawExtraction, ExtractionError>;

    /// Return the model name identifier used by this provider.
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_extraction_parses_with_defaults() {
        let raw: RawExtraction = serde_json::from_str(
            r#"{"entities": [{"name": "Alice"}], "relations": []}"#,
        )
        .unwrap();
        assert_eq!(raw.entities.len(), 1);
        assert_eq!(raw.entities[0].name, "Alice");
        assert!(raw.entities[0].summary.is_empty());
        assert!(raw.relations.is_empty());
    }

    #[test]
    fn test_prompt_contains_content() {
        let prompt = build_extraction_prompt("Bob works at Initech");
        assert!(prompt.contains("Bob works at Initech"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 'é' spans bytes 1..3; a cut at byte 2 must back up to 1
        assert_eq!(truncate_for_prompt("aéb", 2), "a");
        assert_eq!(truncate_for_prompt("aéb", 3), "aé");
        assert_eq!(truncate_for_prompt("aéb", 100), "aéb");
        assert_eq!(truncate_for_prompt("日本語", 4), "日");
        assert_eq!(truncate_for_prompt("", 10), "");
    }
}
