use rmcp::{
    ServerHandler,
    tool,
    model::{
        ServerCapabilities, Implementation, ProtocolVersion, CallToolResult,
    },
    handler::server::wrapper::Parameters,
    ErrorData as McpError,
};
use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};

use crate::errors::GraphError;
use crate::graph::{new_uuid, Episode, EpisodeType};
use crate::ingest::{IngestJob, IngestMode, IngestWorker};
use crate::search::{SearchMode, SearchRequest, SearchRouter};
use crate::sync::DualSaveCoordinator;

/// Upper bound on search limits; mirrors the store-side candidate pools.
const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_EPISODE_COUNT: usize = 10;

pub struct GraphService {
    coordinator: Arc<DualSaveCoordinator>,
    worker: Arc<IngestWorker>,
    search: SearchRouter,
    start_time: Instant,
}

impl GraphService {
    pub fn new(
        coordinator: Arc<DualSaveCoordinator>,
        worker: Arc<IngestWorker>,
        search: SearchRouter,
    ) -> Self {
        Self {
            coordinator,
            worker,
            search,
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// Parameter structs

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct EpisodeInput {
    /// Episode content. For message episodes this is the utterance text.
    pub content: String,
    /// Episode uuid. Supply one to pin the identity across stores; generated
    /// when omitted (optional)
    pub uuid: Option<String>,
    /// Episode type: "text", "json", or "message" (default: "message";
    /// unrecognized values are treated as "message")
    pub episode_type: Option<String>,
    /// Short episode name for display (optional)
    pub name: Option<String>,
    /// Speaker name, message episodes only (optional)
    pub role: Option<String>,
    /// Speaker category such as "user" or "assistant", message episodes only (optional)
    pub role_type: Option<String>,
    /// Where this content came from (optional)
    pub source_description: Option<String>,
    /// ISO-8601 timestamp the content refers to (default: now)
    pub reference_time: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct AddEpisodesParams {
    /// Graph partition the episodes belong to (required)
    pub group_id: String,
    /// Episodes to ingest, processed strictly in order (required)
    pub episodes: Vec<EpisodeInput>,
    /// Ingest mode: "fast", "quality", or "dual" (default: "dual")
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SearchFactsParams {
    /// Natural language search query (required)
    pub query: String,
    /// Graph partitions to search; empty searches everything (optional)
    pub group_ids: Option<Vec<String>>,
    /// Maximum number of results to return (1-100, default: 10)
    pub limit: Option<u32>,
    /// Rerank results by graph distance from this entity node (optional)
    pub center_node_uuid: Option<String>,
    /// Search mode: "fast", "quality", or "dual" (default: "quality")
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct SearchNodesParams {
    /// Natural language search query (required)
    pub query: String,
    /// Graph partitions to search; empty searches everything (optional)
    pub group_ids: Option<Vec<String>>,
    /// Maximum number of results to return (1-100, default: 10)
    pub limit: Option<u32>,
    /// Search mode: "fast", "quality", or "dual" (default: "quality")
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct MessageInput {
    /// Speaker name (optional)
    pub role: Option<String>,
    /// Speaker category such as "user" or "assistant" (optional)
    pub role_type: Option<String>,
    /// Message text (required)
    pub content: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetMemoryParams {
    /// Graph partition to search (required)
    pub group_id: String,
    /// Conversation messages; the search query is composed from these (required)
    pub messages: Vec<MessageInput>,
    /// Maximum number of facts to return (1-100, default: 10)
    pub limit: Option<u32>,
    /// Rerank results by graph distance from this entity node (optional)
    pub center_node_uuid: Option<String>,
    /// Search mode: "fast", "quality", or "dual" (default: "quality")
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetEntityEdgeParams {
    /// Entity edge UUID (required)
    pub uuid: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct GetEpisodesParams {
    /// Graph partition to read (required)
    pub group_id: String,
    /// How many most-recent episodes to return (default: 10)
    pub last_n: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct DeleteEntityEdgeParams {
    /// Entity edge UUID to delete from both stores (required)
    pub uuid: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct DeleteEpisodeParams {
    /// Episode UUID to delete from both stores (required)
    pub uuid: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct DeleteGroupParams {
    /// Graph partition to delete from both stores (required)
    pub group_id: String,
}

// Helper: convert GraphError to CallToolResult with isError: true
fn graph_error_to_result(err: GraphError) -> CallToolResult {
    match err {
        GraphError::NotFound { kind, uuid } => CallToolResult::structured_error(json!({
            "isError": true,
            "error": format!("{} not found: {}", kind, uuid),
        })),
        GraphError::Validation { message, field } => {
            let mut obj = json!({
                "isError": true,
                "error": message,
            });
            if let Some(f) = field {
                obj["field"] = json!(f);
            }
            CallToolResult::structured_error(obj)
        }
        GraphError::Storage(msg) => CallToolResult::structured_error(json!({
            "isError": true,
            "error": format!("Storage error: {}", msg)
        })),
        other => CallToolResult::structured_error(json!({
            "isError": true,
            "error": other.to_string()
        })),
    }
}

fn validation_result(field: &str, message: &str) -> CallToolResult {
    CallToolResult::structured_error(json!({
        "isError": true,
        "error": message,
        "field": field
    }))
}

// Helper: parse optional ISO-8601 string to DateTime<Utc>
fn parse_datetime(s: &str, field: &str) -> Result<DateTime<Utc>, CallToolResult> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            CallToolResult::structured_error(json!({
                "isError": true,
                "error": format!("Invalid datetime format for '{}': expected ISO-8601 (e.g. 2026-02-17T00:00:00Z)", field),
                "field": field
            }))
        })
}

fn clamp_limit(limit: Option<u32>) -> usize {
    (limit.unwrap_or(DEFAULT_SEARCH_LIMIT as u32) as usize).clamp(1, MAX_SEARCH_LIMIT)
}

fn parse_search_mode(mode: Option<&str>) -> Result<SearchMode, CallToolResult> {
    match mode {
        None => Ok(SearchMode::Quality),
        Some(raw) => SearchMode::from_str(raw).map_err(|e| validation_result("mode", &e)),
    }
}

/// Compose one search query from a slice of conversation messages, rendered
/// as `"{role_type}({role}): {content}"` lines.
fn compose_query_from_messages(messages: &[MessageInput]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "{}({}): {}\n",
                m.role_type.as_deref().unwrap_or(""),
                m.role.as_deref().unwrap_or(""),
                m.content
            )
        })
        .collect()
}

// Tool implementations
#[rmcp::tool_router]
impl GraphService {
    #[tool(description = "Add episodes to the knowledge graph. Episodes are queued and processed in order in the background; a success response means the episodes were accepted, not that extraction has finished.")]
    async fn add_episodes(
        &self,
        Parameters(params): Parameters<AddEpisodesParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "add_episodes",
            group_id = %params.group_id,
            count = params.episodes.len(),
            mode = ?params.mode,
            "Tool called"
        );

        if params.group_id.trim().is_empty() {
            return Ok(validation_result(
                "group_id",
                "Field 'group_id' is required and cannot be empty",
            ));
        }
        if params.episodes.is_empty() {
            return Ok(validation_result(
                "episodes",
                "Field 'episodes' must contain at least one episode",
            ));
        }

        let mode = match params.mode.as_deref() {
            None => IngestMode::Dual,
            Some(raw) => match IngestMode::from_str(raw) {
                Ok(mode) => mode,
                Err(e) => return Ok(validation_result("mode", &e)),
            },
        };

        let mut accepted: Vec<String> = Vec::with_capacity(params.episodes.len());
        for input in params.episodes {
            if input.content.trim().is_empty() {
                return Ok(validation_result(
                    "content",
                    "Episode 'content' is required and cannot be empty",
                ));
            }
            // Unrecognized types fall back to the conversational default
            let episode_type = input
                .episode_type
                .as_deref()
                .and_then(|raw| EpisodeType::from_str(raw).ok())
                .unwrap_or(EpisodeType::Message);
            let reference_time = match input.reference_time.as_deref() {
                None => Utc::now(),
                Some(raw) => match parse_datetime(raw, "reference_time") {
                    Ok(dt) => dt,
                    Err(result) => return Ok(result),
                },
            };

            let episode = Episode {
                uuid: input.uuid.unwrap_or_else(new_uuid),
                group_id: params.group_id.clone(),
                name: input.name.unwrap_or_default(),
                content: input.content,
                episode_type,
                reference_time,
                source_description: input.source_description,
                role: input.role,
                role_type: input.role_type,
                created_at: Utc::now(),
            };
            let uuid = episode.uuid.clone();

            if let Err(e) = self.worker.enqueue(IngestJob { episode, mode }) {
                return Ok(graph_error_to_result(e));
            }
            accepted.push(uuid);
        }

        Ok(CallToolResult::structured(json!({
            "accepted": accepted.len(),
            "episode_uuids": accepted,
            "queue_depth": self.worker.depth(),
            "hint": "Episodes are processed in the background; use get_episodes to confirm ingestion"
        })))
    }

    #[tool(description = "Search the knowledge graph for facts (entity relationships). Mode selects the store: 'fast' for low latency, 'quality' for best extraction, 'dual' to query both.")]
    async fn search_facts(
        &self,
        Parameters(params): Parameters<SearchFactsParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "search_facts",
            query = %params.query,
            mode = ?params.mode,
            "Tool called"
        );

        if params.query.trim().is_empty() {
            return Ok(validation_result(
                "query",
                "Field 'query' is required and cannot be empty",
            ));
        }
        let mode = match parse_search_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(result) => return Ok(result),
        };

        let request = SearchRequest {
            query: params.query,
            group_ids: params.group_ids.unwrap_or_default(),
            limit: clamp_limit(params.limit),
            center_node_uuid: params.center_node_uuid,
            mode,
        };

        match self.search.search_facts(&request).await {
            Ok(facts) => {
                let count = facts.len();
                Ok(CallToolResult::structured(json!({
                    "facts": facts,
                    "count": count,
                })))
            }
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Search the knowledge graph for entity nodes by name and summary.")]
    async fn search_nodes(
        &self,
        Parameters(params): Parameters<SearchNodesParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "search_nodes",
            query = %params.query,
            mode = ?params.mode,
            "Tool called"
        );

        if params.query.trim().is_empty() {
            return Ok(validation_result(
                "query",
                "Field 'query' is required and cannot be empty",
            ));
        }
        let mode = match parse_search_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(result) => return Ok(result),
        };

        let request = SearchRequest {
            query: params.query,
            group_ids: params.group_ids.unwrap_or_default(),
            limit: clamp_limit(params.limit),
            center_node_uuid: None,
            mode,
        };

        match self.search.search_nodes(&request).await {
            Ok(nodes) => {
                let count = nodes.len();
                Ok(CallToolResult::structured(json!({
                    "nodes": nodes,
                    "count": count,
                })))
            }
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Retrieve facts relevant to a conversation. Composes a search query from the supplied messages and returns matching facts from the group.")]
    async fn get_memory(
        &self,
        Parameters(params): Parameters<GetMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            tool = "get_memory",
            group_id = %params.group_id,
            messages = params.messages.len(),
            "Tool called"
        );

        if params.group_id.trim().is_empty() {
            return Ok(validation_result(
                "group_id",
                "Field 'group_id' is required and cannot be empty",
            ));
        }
        if params.messages.is_empty() {
            return Ok(validation_result(
                "messages",
                "Field 'messages' must contain at least one message",
            ));
        }
        let mode = match parse_search_mode(params.mode.as_deref()) {
            Ok(mode) => mode,
            Err(result) => return Ok(result),
        };

        let request = SearchRequest {
            query: compose_query_from_messages(&params.messages),
            group_ids: vec![params.group_id],
            limit: clamp_limit(params.limit),
            center_node_uuid: params.center_node_uuid,
            mode,
        };

        match self.search.search_facts(&request).await {
            Ok(facts) => {
                let count = facts.len();
                Ok(CallToolResult::structured(json!({
                    "facts": facts,
                    "count": count,
                })))
            }
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Retrieve a specific entity edge (fact) by UUID.")]
    async fn get_entity_edge(
        &self,
        Parameters(params): Parameters<GetEntityEdgeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "get_entity_edge", uuid = %params.uuid, "Tool called");

        if params.uuid.trim().is_empty() {
            return Ok(validation_result(
                "uuid",
                "Field 'uuid' is required and cannot be empty",
            ));
        }

        // The quality store is authoritative for reads by key
        match self.coordinator.quality().get_entity_edge(&params.uuid).await {
            Ok(Some(edge)) => {
                let fact = crate::graph::FactResult::from(&edge);
                Ok(CallToolResult::structured(json!({
                    "fact": fact,
                    "source_node_uuid": edge.source_node_uuid,
                    "target_node_uuid": edge.target_node_uuid,
                    "group_id": edge.group_id,
                })))
            }
            Ok(None) => Ok(graph_error_to_result(GraphError::not_found(
                "entity edge",
                &params.uuid,
            ))),
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Retrieve the most recent episodes for a group, newest first.")]
    async fn get_episodes(
        &self,
        Parameters(params): Parameters<GetEpisodesParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "get_episodes", group_id = %params.group_id, "Tool called");

        if params.group_id.trim().is_empty() {
            return Ok(validation_result(
                "group_id",
                "Field 'group_id' is required and cannot be empty",
            ));
        }
        let last_n = (params.last_n.unwrap_or(DEFAULT_EPISODE_COUNT as u32) as usize)
            .clamp(1, MAX_SEARCH_LIMIT);

        match self
            .coordinator
            .quality()
            .recent_episodes(&params.group_id, last_n)
            .await
        {
            Ok(episodes) => {
                let count = episodes.len();
                Ok(CallToolResult::structured(json!({
                    "episodes": episodes,
                    "count": count,
                })))
            }
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Delete an entity edge (fact) from both stores. Absence in a store is reported, not treated as an error.")]
    async fn delete_entity_edge(
        &self,
        Parameters(params): Parameters<DeleteEntityEdgeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "delete_entity_edge", uuid = %params.uuid, "Tool called");

        if params.uuid.trim().is_empty() {
            return Ok(validation_result(
                "uuid",
                "Field 'uuid' is required and cannot be empty",
            ));
        }

        match self.coordinator.delete_entity_edge(&params.uuid).await {
            Ok(outcome) => Ok(CallToolResult::structured(json!({
                "uuid": params.uuid,
                "deleted": outcome.any_deleted(),
                "fast": outcome.fast,
                "quality": outcome.quality,
            }))),
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Delete an episode and its mention edges from both stores. Entities extracted from the episode are kept.")]
    async fn delete_episode(
        &self,
        Parameters(params): Parameters<DeleteEpisodeParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "delete_episode", uuid = %params.uuid, "Tool called");

        if params.uuid.trim().is_empty() {
            return Ok(validation_result(
                "uuid",
                "Field 'uuid' is required and cannot be empty",
            ));
        }

        match self.coordinator.delete_episode(&params.uuid).await {
            Ok(outcome) => Ok(CallToolResult::structured(json!({
                "uuid": params.uuid,
                "deleted": outcome.any_deleted(),
                "fast": outcome.fast,
                "quality": outcome.quality,
            }))),
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Delete every node, edge, and episode in a group from both stores. This is permanent and cannot be undone.")]
    async fn delete_group(
        &self,
        Parameters(params): Parameters<DeleteGroupParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "delete_group", group_id = %params.group_id, "Tool called");

        if params.group_id.trim().is_empty() {
            return Ok(validation_result(
                "group_id",
                "Field 'group_id' is required and cannot be empty",
            ));
        }

        match self.coordinator.delete_group(&params.group_id).await {
            Ok(stats) => Ok(CallToolResult::structured(json!({
                "group_id": params.group_id,
                "fast": stats.fast,
                "quality": stats.quality,
                "deleted_total": stats.fast.total() + stats.quality.total(),
            }))),
            Err(e) => Ok(graph_error_to_result(e)),
        }
    }

    #[tool(description = "Clear all data from both stores and rebuild indices. This is permanent and cannot be undone.")]
    async fn clear_graph(&self) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "clear_graph", "Tool called");

        if let Err(e) = self.coordinator.clear_all().await {
            return Ok(graph_error_to_result(e));
        }
        if let Err(e) = self.coordinator.build_indices_all().await {
            return Ok(graph_error_to_result(e));
        }

        Ok(CallToolResult::structured(json!({
            "cleared": true,
        })))
    }

    #[tool(description = "Check server health, queue depth, and pending background replications")]
    async fn health_check(&self) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = "health_check", "Tool called");

        let response = json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.uptime_seconds(),
            "queue_depth": self.worker.depth(),
            "pending_replications": self.coordinator.pending_replications(),
            "fast_embedder": self.coordinator.fast().embedder_model(),
            "quality_embedder": self.coordinator.quality().embedder_model(),
        });

        Ok(CallToolResult::structured(response))
    }
}

// ServerHandler implementation
#[rmcp::tool_handler(router = Self::tool_router())]
impl ServerHandler for GraphService {
    fn get_info(&self) -> rmcp::model::InitializeResult {
        rmcp::model::InitializeResult {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "epigraph".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Dual-store knowledge graph memory server with background ingestion"
                        .to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Knowledge graph memory for AI agents. Episodes added with add_episodes are mined for entities and facts in the background. Tools: add_episodes, search_facts, search_nodes, get_memory, get_entity_edge, get_episodes, delete_entity_edge, delete_episode, delete_group, clear_graph, health_check.".to_string()
            ),
        }
    }
}
