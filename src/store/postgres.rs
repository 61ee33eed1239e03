/// PostgreSQL-backed implementation of GraphStore
///
/// Uses sqlx with PgPool for connection pooling and pgvector for similarity
/// search. Hybrid edge/node retrieval runs a keyword leg (tsvector) and a
/// vector leg (cosine distance) against Postgres, then fuses the ranked uuid
/// lists with RRF on the Rust side. Supports optional migration execution on
/// startup.
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Row,
};

use crate::errors::GraphError;
use crate::graph::{
    DeleteOutcome, EntityEdge, EntityNode, Episode, EpisodeType, ExtractionResult,
    GroupDeleteStats,
};
use crate::search::{rerank_by_node_distance, rrf_fuse, RRF_K};
use crate::store::{EdgeQuery, GraphStore, NodeQuery};

const EDGE_COLUMNS: &str = "uuid, group_id, source_node_uuid, target_node_uuid, name, fact, \
     fact_embedding, valid_at, invalid_at, created_at, expired_at";

const NODE_COLUMNS: &str =
    "uuid, group_id, name, summary, labels, name_embedding, attributes, created_at";

const EPISODE_COLUMNS: &str = "uuid, group_id, name, content, episode_type, reference_time, \
     source_description, role, role_type, created_at";

/// PostgreSQL-backed graph store using a sqlx connection pool.
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    /// Create a new PostgresGraphStore, connecting to the database at database_url.
    ///
    /// Configures a production-ready connection pool with sensible defaults.
    /// If run_migrations is true, automatically runs pending migrations on startup.
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, GraphError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)         // good default for single-server MCP stdio
            .min_connections(1)          // keep at least one warm connection
            .idle_timeout(Duration::from_secs(300))    // 5 min idle cleanup
            .max_lifetime(Duration::from_secs(1800))   // 30 min max connection age
            .connect(database_url)
            .await
            .map_err(|e| GraphError::Storage(format!("Failed to connect to database: {}", e)))?;

        if run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| GraphError::Storage(format!("Migration failed: {}", e)))?;
        }

        Ok(PostgresGraphStore { pool })
    }

    /// Ranked keyword leg over a tsvector expression; returns 1-based ranks.
    async fn keyword_ranks(
        &self,
        table: &str,
        text_expr: &str,
        text: &str,
        group_ids: &[String],
        limit: i64,
    ) -> Result<Vec<(String, i64)>, GraphError> {
        let group_filter = if group_ids.is_empty() {
            ""
        } else {
            "AND group_id = ANY($2)"
        };
        let sql = format!(
            "SELECT uuid FROM {table} \
             WHERE to_tsvector('english', {expr}) @@ plainto_tsquery('english', $1) {filter} \
             ORDER BY ts_rank(to_tsvector('english', {expr}), plainto_tsquery('english', $1)) DESC \
             LIMIT {limit}",
            table = table,
            expr = text_expr,
            filter = group_filter,
            limit = limit,
        );

        let mut q = sqlx::query(&sql).bind(text);
        if !group_ids.is_empty() {
            q = q.bind(group_ids);
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.iter()
            .enumerate()
            .map(|(i, row)| Ok((row.try_get::<String, _>("uuid")?, (i + 1) as i64)))
            .collect()
    }

    /// Ranked vector leg, cosine distance ascending; returns 1-based ranks.
    async fn vector_ranks(
        &self,
        table: &str,
        embedding_column: &str,
        embedding: &[f32],
        group_ids: &[String],
        limit: i64,
    ) -> Result<Vec<(String, i64)>, GraphError> {
        if embedding.is_empty() {
            return Ok(Vec::new());
        }
        let group_filter = if group_ids.is_empty() {
            ""
        } else {
            "AND group_id = ANY($2)"
        };
        let sql = format!(
            "SELECT uuid FROM {table} \
             WHERE {column} IS NOT NULL {filter} \
             ORDER BY {column} <=> $1 \
             LIMIT {limit}",
            table = table,
            column = embedding_column,
            filter = group_filter,
            limit = limit,
        );

        let mut q = sqlx::query(&sql).bind(Vector::from(embedding.to_vec()));
        if !group_ids.is_empty() {
            q = q.bind(group_ids);
        }
        let rows = q.fetch_all(&self.pool).await?;

        rows.iter()
            .enumerate()
            .map(|(i, row)| Ok((row.try_get::<String, _>("uuid")?, (i + 1) as i64)))
            .collect()
    }

    /// Undirected adjacency over entity edges, scoped to the query's groups.
    async fn adjacency(
        &self,
        group_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, GraphError> {
        let sql = if group_ids.is_empty() {
            "SELECT source_node_uuid, target_node_uuid FROM entity_edges".to_string()
        } else {
            "SELECT source_node_uuid, target_node_uuid FROM entity_edges \
             WHERE group_id = ANY($1)"
                .to_string()
        };
        let mut q = sqlx::query(&sql);
        if !group_ids.is_empty() {
            q = q.bind(group_ids);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            let source: String = row.try_get("source_node_uuid")?;
            let target: String = row.try_get("target_node_uuid")?;
            adjacency.entry(source.clone()).or_default().push(target.clone());
            adjacency.entry(target).or_default().push(source);
        }
        Ok(adjacency)
    }

    /// Fetch full edge rows for fused uuids, preserving the fused order.
    async fn fetch_edges_ordered(&self, uuids: &[String]) -> Result<Vec<EntityEdge>, GraphError> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM entity_edges WHERE uuid = ANY($1)",
            EDGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(uuids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_uuid: HashMap<String, EntityEdge> = HashMap::new();
        for row in &rows {
            let edge = row_to_edge(row)?;
            by_uuid.insert(edge.uuid.clone(), edge);
        }
        Ok(uuids.iter().filter_map(|u| by_uuid.remove(u)).collect())
    }

    async fn fetch_nodes_ordered(&self, uuids: &[String]) -> Result<Vec<EntityNode>, GraphError> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM entity_nodes WHERE uuid = ANY($1)",
            NODE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(uuids)
            .fetch_all(&self.pool)
            .await?;

        let mut by_uuid: HashMap<String, EntityNode> = HashMap::new();
        for row in &rows {
            let node = row_to_node(row)?;
            by_uuid.insert(node.uuid.clone(), node);
        }
        Ok(uuids.iter().filter_map(|u| by_uuid.remove(u)).collect())
    }
}

/// Map a sqlx PgRow to an EntityEdge.
///
/// PostgreSQL native types map directly:
/// - TIMESTAMPTZ -> DateTime<Utc> (no string parsing)
/// - vector -> pgvector::Vector -> Vec<f32>
fn row_to_edge(row: &PgRow) -> Result<EntityEdge, GraphError> {
    let embedding: Option<Vector> = row.try_get("fact_embedding")?;
    Ok(EntityEdge {
        uuid: row.try_get("uuid")?,
        group_id: row.try_get("group_id")?,
        source_node_uuid: row.try_get("source_node_uuid")?,
        target_node_uuid: row.try_get("target_node_uuid")?,
        name: row.try_get("name")?,
        fact: row.try_get("fact")?,
        fact_embedding: embedding.map(|v| v.to_vec()),
        valid_at: row.try_get("valid_at")?,
        invalid_at: row.try_get("invalid_at")?,
        created_at: row.try_get("created_at")?,
        expired_at: row.try_get("expired_at")?,
    })
}

/// Map a sqlx PgRow to an EntityNode. Labels are stored as a JSONB array.
fn row_to_node(row: &PgRow) -> Result<EntityNode, GraphError> {
    let embedding: Option<Vector> = row.try_get("name_embedding")?;
    let labels: serde_json::Value = row.try_get("labels")?;
    let labels: Vec<String> = serde_json::from_value(labels)
        .map_err(|e| GraphError::Storage(format!("Malformed labels column: {}", e)))?;
    Ok(EntityNode {
        uuid: row.try_get("uuid")?,
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        summary: row.try_get("summary")?,
        labels,
        name_embedding: embedding.map(|v| v.to_vec()),
        attributes: row.try_get("attributes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_episode(row: &PgRow) -> Result<Episode, GraphError> {
    let episode_type: String = row.try_get("episode_type")?;
    let episode_type = EpisodeType::from_str(&episode_type)
        .map_err(GraphError::Storage)?;
    Ok(Episode {
        uuid: row.try_get("uuid")?,
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        content: row.try_get("content")?,
        episode_type,
        reference_time: row.try_get("reference_time")?,
        source_description: row.try_get("source_description")?,
        role: row.try_get("role")?,
        role_type: row.try_get("role_type")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn persist(&self, snapshot: &ExtractionResult) -> Result<(), GraphError> {
        let mut tx = self.pool.begin().await?;

        let episode = &snapshot.episode;
        sqlx::query(
            "INSERT INTO episodes (uuid, group_id, name, content, episode_type, reference_time, \
                                   source_description, role, role_type, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (uuid) DO UPDATE SET \
                 name = EXCLUDED.name, content = EXCLUDED.content, \
                 episode_type = EXCLUDED.episode_type, reference_time = EXCLUDED.reference_time, \
                 source_description = EXCLUDED.source_description, \
                 role = EXCLUDED.role, role_type = EXCLUDED.role_type",
        )
        .bind(&episode.uuid)
        .bind(&episode.group_id)
        .bind(&episode.name)
        .bind(&episode.content)
        .bind(episode.episode_type.to_string())
        .bind(episode.reference_time)
        .bind(&episode.source_description)
        .bind(&episode.role)
        .bind(&episode.role_type)
        .bind(episode.created_at)
        .execute(&mut *tx)
        .await?;

        for node in &snapshot.nodes {
            sqlx::query(
                "INSERT INTO entity_nodes (uuid, group_id, name, summary, labels, \
                                           name_embedding, attributes, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (uuid) DO UPDATE SET \
                     name = EXCLUDED.name, summary = EXCLUDED.summary, \
                     labels = EXCLUDED.labels, name_embedding = EXCLUDED.name_embedding, \
                     attributes = EXCLUDED.attributes",
            )
            .bind(&node.uuid)
            .bind(&node.group_id)
            .bind(&node.name)
            .bind(&node.summary)
            .bind(serde_json::json!(node.labels))
            .bind(node.name_embedding.as_ref().map(|v| Vector::from(v.clone())))
            .bind(&node.attributes)
            .bind(node.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &snapshot.edges {
            sqlx::query(
                "INSERT INTO entity_edges (uuid, group_id, source_node_uuid, target_node_uuid, \
                                           name, fact, fact_embedding, valid_at, invalid_at, \
                                           created_at, expired_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (uuid) DO UPDATE SET \
                     name = EXCLUDED.name, fact = EXCLUDED.fact, \
                     fact_embedding = EXCLUDED.fact_embedding, \
                     valid_at = EXCLUDED.valid_at, invalid_at = EXCLUDED.invalid_at, \
                     expired_at = EXCLUDED.expired_at",
            )
            .bind(&edge.uuid)
            .bind(&edge.group_id)
            .bind(&edge.source_node_uuid)
            .bind(&edge.target_node_uuid)
            .bind(&edge.name)
            .bind(&edge.fact)
            .bind(edge.fact_embedding.as_ref().map(|v| Vector::from(v.clone())))
            .bind(edge.valid_at)
            .bind(edge.invalid_at)
            .bind(edge.created_at)
            .bind(edge.expired_at)
            .execute(&mut *tx)
            .await?;
        }

        for episodic in &snapshot.episodic_edges {
            sqlx::query(
                "INSERT INTO episodic_edges (uuid, group_id, episode_uuid, node_uuid, created_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (uuid) DO NOTHING",
            )
            .bind(&episodic.uuid)
            .bind(&episodic.group_id)
            .bind(&episodic.episode_uuid)
            .bind(&episodic.node_uuid)
            .bind(episodic.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search_edges(&self, query: &EdgeQuery) -> Result<Vec<EntityEdge>, GraphError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        // Over-fetch per leg so fusion has candidates beyond the final cut
        let leg_limit = (query.limit * 2) as i64;

        let keyword = self
            .keyword_ranks("entity_edges", "fact", &query.text, &query.group_ids, leg_limit)
            .await?;
        let vector = self
            .vector_ranks(
                "entity_edges",
                "fact_embedding",
                &query.embedding,
                &query.group_ids,
                leg_limit,
            )
            .await?;

        let fused: Vec<String> = rrf_fuse(&keyword, &vector, RRF_K)
            .into_iter()
            .map(|(uuid, _)| uuid)
            .collect();

        match query.center_node_uuid.as_deref() {
            None => {
                let top: Vec<String> = fused.into_iter().take(query.limit).collect();
                self.fetch_edges_ordered(&top).await
            }
            Some(center) => {
                // Rerank the whole candidate pool before cutting to limit
                let candidates = self.fetch_edges_ordered(&fused).await?;
                let adjacency = self.adjacency(&query.group_ids).await?;
                let mut reranked = rerank_by_node_distance(candidates, &adjacency, center);
                reranked.truncate(query.limit);
                Ok(reranked)
            }
        }
    }

    async fn search_nodes(&self, query: &NodeQuery) -> Result<Vec<EntityNode>, GraphError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let leg_limit = (query.limit * 2) as i64;

        let keyword = self
            .keyword_ranks(
                "entity_nodes",
                "name || ' ' || summary",
                &query.text,
                &query.group_ids,
                leg_limit,
            )
            .await?;
        let vector = self
            .vector_ranks(
                "entity_nodes",
                "name_embedding",
                &query.embedding,
                &query.group_ids,
                leg_limit,
            )
            .await?;

        let top: Vec<String> = rrf_fuse(&keyword, &vector, RRF_K)
            .into_iter()
            .take(query.limit)
            .map(|(uuid, _)| uuid)
            .collect();
        self.fetch_nodes_ordered(&top).await
    }

    async fn get_edge(&self, uuid: &str) -> Result<Option<EntityEdge>, GraphError> {
        let sql = format!("SELECT {} FROM entity_edges WHERE uuid = $1", EDGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_edge).transpose()
    }

    async fn recent_episodes(
        &self,
        group_id: &str,
        last_n: usize,
    ) -> Result<Vec<Episode>, GraphError> {
        let sql = format!(
            "SELECT {} FROM episodes WHERE group_id = $1 \
             ORDER BY reference_time DESC LIMIT $2",
            EPISODE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(group_id)
            .bind(last_n as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_episode).collect()
    }

    async fn delete_edge(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        let result = sqlx::query("DELETE FROM entity_edges WHERE uuid = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn delete_episode(&self, uuid: &str) -> Result<DeleteOutcome, GraphError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM episodic_edges WHERE episode_uuid = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM episodes WHERE uuid = $1")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn delete_group(&self, group_id: &str) -> Result<GroupDeleteStats, GraphError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM episodic_edges WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let edges = sqlx::query("DELETE FROM entity_edges WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let nodes = sqlx::query("DELETE FROM entity_nodes WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let episodes = sqlx::query("DELETE FROM episodes WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(GroupDeleteStats {
            nodes: nodes.rows_affected(),
            edges: edges.rows_affected(),
            episodes: episodes.rows_affected(),
        })
    }

    async fn clear(&self) -> Result<(), GraphError> {
        sqlx::query("TRUNCATE episodic_edges, entity_edges, entity_nodes, episodes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn build_indices(&self) -> Result<(), GraphError> {
        let statements = [
            "CREATE INDEX IF NOT EXISTS idx_episodes_group ON episodes (group_id, reference_time DESC)",
            "CREATE INDEX IF NOT EXISTS idx_entity_nodes_group ON entity_nodes (group_id)",
            "CREATE INDEX IF NOT EXISTS idx_entity_edges_group ON entity_edges (group_id)",
            "CREATE INDEX IF NOT EXISTS idx_entity_edges_source ON entity_edges (source_node_uuid)",
            "CREATE INDEX IF NOT EXISTS idx_entity_edges_target ON entity_edges (target_node_uuid)",
            "CREATE INDEX IF NOT EXISTS idx_episodic_edges_episode ON episodic_edges (episode_uuid)",
            "CREATE INDEX IF NOT EXISTS idx_episodic_edges_group ON episodic_edges (group_id)",
            "CREATE INDEX IF NOT EXISTS idx_entity_edges_fact_fts ON entity_edges \
             USING GIN (to_tsvector('english', fact))",
            "CREATE INDEX IF NOT EXISTS idx_entity_nodes_name_fts ON entity_nodes \
             USING GIN (to_tsvector('english', name || ' ' || summary))",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}
