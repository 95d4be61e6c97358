pub mod error;
pub mod filters;
mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use error::VectorError;
pub use filters::{FilterCondition, SearchFilters};
pub use qdrant::QdrantStore;

/// Per-point payload stored alongside the embedding.  Source of truth for
/// retrieval metadata, including `attachment_ids` inside `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPayload {
    pub data: String,
    pub hash: String,
    pub user_id: String,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// The full metadata object as persisted on the memory row.
    #[serde(default)]
    pub metadata: Value,
}

impl MemoryPayload {
    /// The ordered attachment list carried in the payload metadata.
    pub fn attachment_ids(&self) -> Vec<Uuid> {
        self.metadata
            .get("attachment_ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|raw| Uuid::parse_str(raw).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: MemoryPayload,
}

/// The narrow vector-store surface the engine consumes.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create the backing collection.  Called lazily before
    /// the first write/search; failure means the store is unreachable.
    async fn ensure_ready(&self) -> Result<(), VectorError>;

    async fn upsert(
        &self,
        id: Uuid,
        vector: Vec<f32>,
        payload: MemoryPayload,
    ) -> Result<(), VectorError>;

    /// Ordered (id, score, payload) hits for the query vector under the
    /// given payload filter.
    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPoint>, VectorError>;

    /// Payload read-back, used after an UPDATE event to obtain the
    /// authoritative merged metadata.
    async fn get(&self, id: Uuid) -> Result<Option<MemoryPayload>, VectorError>;

    /// Idempotent point delete.
    async fn delete(&self, id: Uuid) -> Result<(), VectorError>;
}
