/// Domain-specific error types for epigraph
///
/// Provides actionable error messages with detailed context to enable
/// AI agents to self-correct on bad tool calls.

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{kind} not found: {uuid}")]
    NotFound { kind: &'static str, uuid: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Ingestion queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl From<sqlx::Error> for GraphError {
    fn from(e: sqlx::Error) -> Self {
        GraphError::Storage(e.to_string())
    }
}

impl From<crate::embedding::EmbeddingError> for GraphError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        GraphError::Internal(e.to_string())
    }
}

impl From<crate::extraction::ExtractionError> for GraphError {
    fn from(e: crate::extraction::ExtractionError) -> Self {
        GraphError::Extraction(e.to_string())
    }
}

impl GraphError {
    /// Helper to create validation errors with field names
    pub fn validation(field: &str, message: &str) -> Self {
        GraphError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }

    /// Helper for not-found errors on a named record kind ("edge", "episode", "node").
    pub fn not_found(kind: &'static str, uuid: &str) -> Self {
        GraphError::NotFound {
            kind,
            uuid: uuid.to_string(),
        }
    }
}
