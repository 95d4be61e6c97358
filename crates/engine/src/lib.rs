pub mod attachments;
pub mod config_cache;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod retrieval;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use engram_llm::LlmClient;
use engram_store::MetadataStore;
use engram_vector::VectorStore;
use tokio::sync::OnceCell;

pub use config_cache::ConfigCache;
pub use error::EngineError;
pub use ingest::{AddOutcome, AddRequest};
pub use lifecycle::PauseRequest;
pub use retrieval::{SearchHit, SearchRequest};

/// How long a loaded settings document is served before the store is
/// consulted again.
const SETTINGS_TTL: Duration = Duration::from_secs(2);

/// The ingestion and retrieval engine.
///
/// Owns the three gateways and the settings cache.  The vector store and
/// LLM are reachable only through their traits, so their absence degrades
/// the operations that need them instead of the whole service.
pub struct MemoryEngine {
    store: MetadataStore,
    vector: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    config: ConfigCache,
    /// Lazy one-shot collection bootstrap; a failed attempt is retried on
    /// the next vector-touching operation.
    vector_ready: OnceCell<()>,
}

impl MemoryEngine {
    pub fn new(
        store: MetadataStore,
        vector: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let config = ConfigCache::new(store.clone(), SETTINGS_TTL);
        Self { store, vector, llm, config, vector_ready: OnceCell::new() }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn config(&self) -> &ConfigCache {
        &self.config
    }

    pub(crate) async fn ensure_vector_ready(&self) -> Result<(), EngineError> {
        self.vector_ready
            .get_or_try_init(|| self.vector.ensure_ready())
            .await?;
        Ok(())
    }
}
