use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use epigraph::config::{Config, EmbeddingConfig};
use epigraph::embedding::local::LocalEmbeddingProvider;
use epigraph::embedding::openai::OpenAIEmbeddingProvider;
use epigraph::embedding::EmbeddingProvider;
use epigraph::extraction::ollama::OllamaExtractionProvider;
use epigraph::extraction::openai::OpenAIExtractionProvider;
use epigraph::extraction::ExtractionProvider;
use epigraph::ingest::IngestWorker;
use epigraph::logging;
use epigraph::search::SearchRouter;
use epigraph::server::GraphService;
use epigraph::store::postgres::PostgresGraphStore;
use epigraph::store::{GraphStore, StoreAdapter};
use epigraph::sync::DualSaveCoordinator;
use rmcp::ServiceExt;

#[derive(Parser)]
#[command(name = "epigraph", version, about = "Dual-store knowledge graph MCP server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build database indices and constraints in both stores, then exit
    Indices,
    /// Delete all graph data from both stores and rebuild indices
    Clear,
}

/// Create the extraction provider based on configuration. One provider is
/// shared by both stores so extraction runs once per episode.
fn create_extraction_provider(config: &Config) -> Result<Arc<dyn ExtractionProvider>> {
    match config.extraction.provider.as_str() {
        "openai" => {
            let api_key = config.extraction.openai_api_key.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "OpenAI API key required when extraction provider is 'openai'. \
                     Set EPIGRAPH_EXTRACTION__OPENAI_API_KEY or extraction.openai_api_key in epigraph.toml"
                )
            })?;
            Ok(Arc::new(OpenAIExtractionProvider::new(
                api_key,
                config.extraction.openai_model.clone(),
                config.extraction.max_content_chars,
            )?))
        }
        "ollama" | _ => Ok(Arc::new(OllamaExtractionProvider::new(
            config.extraction.ollama_base_url.clone(),
            config.extraction.ollama_model.clone(),
            config.extraction.max_content_chars,
        ))),
    }
}

/// Create an embedding provider for one store leg.
async fn create_embedding_provider(
    embedding: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match embedding.provider.as_str() {
        "openai" => {
            let api_key = embedding.openai_api_key.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "OpenAI API key required when embedding provider is 'openai'. \
                     Set the store's EMBEDDING__OPENAI_API_KEY or openai_api_key in epigraph.toml"
                )
            })?;
            Ok(Arc::new(OpenAIEmbeddingProvider::new(
                api_key,
                embedding.openai_base_url.clone(),
                embedding.openai_model.clone(),
            )?))
        }
        "local" | _ => Ok(Arc::new(
            LocalEmbeddingProvider::new(&embedding.cache_dir).await?,
        )),
    }
}

/// Connect both store legs and wire them into a coordinator.
async fn build_coordinator(
    config: &Config,
    run_migrations: bool,
) -> Result<Arc<DualSaveCoordinator>> {
    let extractor = create_extraction_provider(config)?;
    let single_database = config.single_database();

    let quality_store = Arc::new(
        PostgresGraphStore::new(&config.quality_store.database_url, run_migrations).await?,
    );
    // Same database means the quality connection already migrated it
    let fast_store = Arc::new(
        PostgresGraphStore::new(
            &config.fast_store.database_url,
            run_migrations && !single_database,
        )
        .await?,
    );

    let quality_embedder = create_embedding_provider(&config.quality_store.embedding).await?;
    let fast_embedder = create_embedding_provider(&config.fast_store.embedding).await?;

    tracing::info!(
        quality_embedder = quality_embedder.model_name(),
        fast_embedder = fast_embedder.model_name(),
        single_database,
        "Stores initialized"
    );

    let quality = Arc::new(StoreAdapter::new(
        "quality",
        quality_store as Arc<dyn GraphStore>,
        quality_embedder,
        Arc::clone(&extractor),
    ));
    let fast = Arc::new(StoreAdapter::new(
        "fast",
        fast_store as Arc<dyn GraphStore>,
        fast_embedder,
        extractor,
    ));

    Ok(Arc::new(DualSaveCoordinator::new(
        fast,
        quality,
        single_database,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        let mut config = Config::default();
        config.normalize();
        config
    });

    // 3. Initialize logging FIRST (before any other output)
    // CRITICAL: logging goes to stderr only — stdout is reserved for JSON-RPC
    logging::init_logging(&config);

    match cli.command {
        Some(Commands::Indices) => {
            let coordinator = build_coordinator(&config, !cli.skip_migrate).await?;
            coordinator.build_indices_all().await?;
            println!("Indices built.");
        }

        Some(Commands::Clear) => {
            let coordinator = build_coordinator(&config, !cli.skip_migrate).await?;
            coordinator.clear_all().await?;
            coordinator.build_indices_all().await?;
            println!("Graph cleared.");
        }

        None => {
            // Default: start the MCP server
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "epigraph server starting"
            );

            let coordinator = build_coordinator(&config, !cli.skip_migrate).await?;

            // Indices are cheap to re-assert and the server depends on them
            coordinator.build_indices_all().await?;

            let worker = Arc::new(IngestWorker::start(Arc::clone(&coordinator)));
            let search = SearchRouter::new(
                Arc::clone(coordinator.fast()),
                Arc::clone(coordinator.quality()),
            );
            let service = GraphService::new(
                Arc::clone(&coordinator),
                Arc::clone(&worker),
                search,
            );

            // Serve via stdio transport
            let (stdin, stdout) = rmcp::transport::io::stdio();
            let server = service.serve((stdin, stdout)).await?;

            tracing::info!("epigraph server running — awaiting tool calls via stdio");

            // Wait for shutdown (client disconnects or signal)
            server.waiting().await?;

            // Stop accepting work, then give detached replications a chance
            // to land before the runtime is torn down
            worker.stop().await;
            let drained = coordinator
                .drain(Duration::from_secs(config.ingest.drain_timeout_secs))
                .await;
            if !drained {
                tracing::warn!("Shutdown drain incomplete; some replications were abandoned");
            }

            tracing::info!("epigraph server stopped");
        }
    }

    Ok(())
}
