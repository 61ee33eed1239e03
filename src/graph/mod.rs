/// Knowledge graph domain types
///
/// Episodes are the ingested units of content; extraction mines them into
/// entity nodes and factual edges. The same records (same UUIDs) live in both
/// the fast and the quality store — UUID + group_id is the cross-store join key
/// used by deletes and replication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The source type of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    Text,
    Json,
    Message,
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeType::Text => write!(f, "text"),
            EpisodeType::Json => write!(f, "json"),
            EpisodeType::Message => write!(f, "message"),
        }
    }
}

impl FromStr for EpisodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(EpisodeType::Text),
            "json" => Ok(EpisodeType::Json),
            "message" => Ok(EpisodeType::Message),
            other => Err(format!("Unknown episode type: {}", other)),
        }
    }
}

/// One unit of ingested content to be mined for entities and facts.
///
/// Immutable after creation. `reference_time` is event time, not ingestion
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub uuid: String,
    pub group_id: String,
    pub name: String,
    pub content: String,
    pub episode_type: EpisodeType,
    pub reference_time: DateTime<Utc>,
    pub source_description: Option<String>,
    /// Speaker role, message episodes only (e.g. "Alice")
    pub role: Option<String>,
    /// Role category, message episodes only (e.g. "user", "assistant")
    pub role_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    /// The text handed to the extractor and stored as episode content.
    ///
    /// Message episodes are rendered as `"{role}({role_type}): {content}"`;
    /// text and json episodes pass content through unchanged.
    pub fn body(&self) -> String {
        match self.episode_type {
            EpisodeType::Message => format!(
                "{}({}): {}",
                self.role.as_deref().unwrap_or(""),
                self.role_type.as_deref().unwrap_or(""),
                self.content
            ),
            EpisodeType::Text | EpisodeType::Json => self.content.clone(),
        }
    }
}

/// An entity mined from one or more episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub uuid: String,
    pub group_id: String,
    pub name: String,
    pub summary: String,
    pub labels: Vec<String>,
    /// Embedding of the entity name/summary; store-specific, never shared
    /// across stores.
    pub name_embedding: Option<Vec<f32>>,
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A factual relationship between two entity nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEdge {
    pub uuid: String,
    pub group_id: String,
    pub source_node_uuid: String,
    pub target_node_uuid: String,
    /// Relationship label (e.g. "WORKS_AT")
    pub name: String,
    /// Human-readable fact string
    pub fact: String,
    /// Embedding of the fact; store-specific, never shared across stores.
    pub fact_embedding: Option<Vec<f32>>,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

/// A MENTIONS link from an episode to an entity node it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicEdge {
    pub uuid: String,
    pub group_id: String,
    pub episode_uuid: String,
    pub node_uuid: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable snapshot of one extraction pass: the episode plus everything the
/// extractor produced, with embeddings computed by the ingesting store's
/// embedder.
///
/// Owned by the dual-save coordinator for the duration of one dual-save
/// operation; replicated into each store, never persisted as its own record.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub episode: Episode,
    pub nodes: Vec<EntityNode>,
    pub edges: Vec<EntityEdge>,
    pub episodic_edges: Vec<EpisodicEdge>,
}

impl ExtractionResult {
    /// Drop every embedding vector in the snapshot.
    ///
    /// Embeddings are store-specific: a replica targeting a differently
    /// embedded store must re-embed from scratch rather than carry vectors
    /// produced by another embedder.
    pub fn clear_embeddings(&mut self) {
        for node in &mut self.nodes {
            node.name_embedding = None;
        }
        for edge in &mut self.edges {
            edge.fact_embedding = None;
        }
    }
}

/// Outcome of a per-store delete. NotFound is benign: dual-store presence is
/// not guaranteed, so the caller aggregates these instead of treating absence
/// as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Per-kind record counts removed by a group delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupDeleteStats {
    pub nodes: u64,
    pub edges: u64,
    pub episodes: u64,
}

impl GroupDeleteStats {
    pub fn total(&self) -> u64 {
        self.nodes + self.edges + self.episodes
    }
}

/// Fact projection returned by edge search — an EntityEdge without embeddings
/// or graph plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactResult {
    pub uuid: String,
    pub name: String,
    pub fact: String,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl From<&EntityEdge> for FactResult {
    fn from(edge: &EntityEdge) -> Self {
        FactResult {
            uuid: edge.uuid.clone(),
            name: edge.name.clone(),
            fact: edge.fact.clone(),
            valid_at: edge.valid_at,
            invalid_at: edge.invalid_at,
            created_at: edge.created_at,
            expired_at: edge.expired_at,
        }
    }
}

/// Node projection returned by node search. Attributes are scrubbed of any
/// embedding-like keys so vectors never leak into responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub uuid: String,
    pub name: String,
    pub labels: Vec<String>,
    pub summary: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    pub attributes: serde_json::Value,
}

impl From<&EntityNode> for NodeResult {
    fn from(node: &EntityNode) -> Self {
        let attributes = match &node.attributes {
            serde_json::Value::Object(map) => {
                let scrubbed: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .filter(|(k, _)| !k.to_lowercase().contains("embedding"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                serde_json::Value::Object(scrubbed)
            }
            other => other.clone(),
        };

        NodeResult {
            uuid: node.uuid.clone(),
            name: node.name.clone(),
            labels: node.labels.clone(),
            summary: node.summary.clone(),
            group_id: node.group_id.clone(),
            created_at: node.created_at,
            attributes,
        }
    }
}

/// Generate a fresh record UUID.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}
