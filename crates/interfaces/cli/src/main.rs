use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engram_engine::MemoryEngine;
use engram_llm::HttpLlmClient;
use engram_server::AppState;
use engram_store::MetadataStore;
use engram_vector::QdrantStore;

#[derive(Debug, Parser)]
#[command(
    name = "engram",
    version,
    about = "A long-term memory service for conversational agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the REST + MCP server (the default).
    Serve {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:8765", env = "ENGRAM_BIND")]
        bind: SocketAddr,
        /// SQLite database URL for the metadata store.
        #[arg(long, default_value = "sqlite://engram.db", env = "ENGRAM_DATABASE_URL")]
        database: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (bind, database) = match cli.command {
        Some(Commands::Serve { bind, database }) => (bind, database),
        None => ("0.0.0.0:8765".parse()?, "sqlite://engram.db".to_string()),
    };

    serve(bind, &database).await
}

async fn serve(bind: SocketAddr, database: &str) -> Result<()> {
    // The metadata store is load-bearing: failure here is a startup failure.
    let store = MetadataStore::connect(database)
        .await
        .with_context(|| format!("opening metadata store at {database}"))?;

    // Seed the persisted settings document on first run so operators can
    // edit it in place; environment overrides apply on every read.
    let mut settings = store.load_settings().await?.unwrap_or_default();
    settings.apply_env();
    store.save_settings(&settings).await?;

    // Vector store and LLM construction is offline; if either service is
    // down, only the operations that need it return 503.
    let vector = Arc::new(QdrantStore::new(&settings.vector, settings.llm.embedding_dims));
    let llm = Arc::new(HttpLlmClient::from_settings(&settings.llm));

    info!(
        provider = %settings.llm.provider,
        model = %settings.llm.model,
        vector_url = %settings.vector.url,
        collection = %settings.vector.collection,
        "engram configured"
    );
    if settings.llm.api_key.is_none() && settings.llm.provider.eq_ignore_ascii_case("openai") {
        warn!("no API key configured for the OpenAI-compatible provider");
    }

    let engine = Arc::new(MemoryEngine::new(store, vector, llm));
    engram_server::serve(bind, AppState::new(engine))
        .await
        .context("server error")?;
    Ok(())
}
