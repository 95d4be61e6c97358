use engram_store::memories;
use engram_store::{
    AccessLogRecord, AccessType, MemoryFilter, MemoryListItem, MemoryRecord, MemoryState, PageOf,
};
use engram_vector::SearchFilters;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::MemoryEngine;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub user_id: String,
    pub app: String,
    pub query: String,
    pub limit: usize,
    /// Caller-supplied payload filters (equality, `in`, date ranges).
    pub filters: Option<serde_json::Value>,
    /// Full metadata in each hit; wins over `attachment_ids_show`.
    pub include_metadata: bool,
    /// `None` defers to the configured default.
    pub attachment_ids_show: Option<bool>,
    /// Only hits whose metadata carries this `agent_id`.
    pub agent_id: Option<String>,
}

impl SearchRequest {
    pub fn new(user_id: impl Into<String>, app: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            app: app.into(),
            query: query.into(),
            limit: 10,
            filters: None,
            include_metadata: false,
            attachment_ids_show: None,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub memory: String,
    pub hash: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MemoryEngine {
    /// Semantic search: embed → vector search → ACL filter → projection,
    /// with one `search` access-log row per returned hit.
    pub async fn search(&self, req: SearchRequest) -> Result<Vec<SearchHit>, EngineError> {
        let settings = self.config().current().await;
        let (user, app) = self
            .store()
            .get_or_create_user_and_app(&req.user_id, &req.app)
            .await?;
        self.ensure_vector_ready().await?;

        let acl = self.store().accessible_memory_ids(app.id).await?;

        let mut filters = SearchFilters::for_user(&user.user_id);
        if let Some(raw) = &req.filters {
            filters.extend_from_json(raw)?;
        }

        let embedding = self.llm.embed(&req.query).await?;
        let hits = self.vector.search(embedding, req.limit, &filters).await?;
        debug!(user_id = %req.user_id, raw_hits = hits.len(), "vector search returned");

        let attachment_ids_show = req
            .attachment_ids_show
            .unwrap_or(settings.memory.default_attachment_ids_show);
        let needs_record =
            req.include_metadata || attachment_ids_show || req.agent_id.is_some();

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if !acl.allows(hit.id) {
                continue;
            }
            let record = if needs_record { self.store().get_memory(hit.id).await? } else { None };

            if let Some(agent_id) = req.agent_id.as_deref() {
                let matches = record
                    .as_ref()
                    .is_some_and(|r| r.metadata.agent_id() == Some(agent_id));
                if !matches {
                    continue;
                }
            }

            let metadata = if req.include_metadata {
                record.as_ref().map(|r| r.metadata.to_value())
            } else if attachment_ids_show {
                record
                    .as_ref()
                    .map(|r| json!({"attachment_ids": r.metadata.attachment_ids}))
            } else {
                None
            };

            results.push(SearchHit {
                id: hit.id,
                memory: hit.payload.data,
                hash: hit.payload.hash,
                created_at: hit.payload.created_at,
                updated_at: hit.payload.updated_at,
                score: hit.score,
                metadata,
            });
        }

        let mut tx = self.store().begin().await?;
        for hit in &results {
            memories::insert_access_log(
                &mut tx,
                hit.id,
                app.id,
                AccessType::Search,
                &json!({"query": req.query, "score": hit.score, "hash": hit.hash}),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(results)
    }

    /// Every active memory visible to the app, with `list` access logging.
    pub async fn list_memories(
        &self,
        user_id: &str,
        app: &str,
    ) -> Result<Vec<MemoryRecord>, EngineError> {
        let (user, app) = self.store().get_or_create_user_and_app(user_id, app).await?;
        let acl = self.store().accessible_memory_ids(app.id).await?;

        let visible: Vec<MemoryRecord> = self
            .store()
            .user_memories(user.id)
            .await?
            .into_iter()
            .filter(|memory| memory.state == MemoryState::Active && acl.allows(memory.id))
            .collect();

        let mut tx = self.store().begin().await?;
        for memory in &visible {
            memories::insert_access_log(
                &mut tx,
                memory.id,
                app.id,
                AccessType::List,
                &json!({"hash": super::ingest::content_hash(&memory.content)}),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(visible)
    }

    pub async fn filter_memories(
        &self,
        user_id: &str,
        filter: &MemoryFilter,
    ) -> Result<PageOf<MemoryListItem>, EngineError> {
        let user = self.store().require_user(user_id).await?;
        Ok(self.store().filter_memories(user.id, filter).await?)
    }

    pub async fn get_memory_item(&self, id: Uuid) -> Result<MemoryListItem, EngineError> {
        Ok(self.store().get_memory_item(id).await?)
    }

    pub async fn related_memories(
        &self,
        user_id: &str,
        memory_id: Uuid,
        page: u32,
    ) -> Result<PageOf<MemoryListItem>, EngineError> {
        let user = self.store().require_user(user_id).await?;
        Ok(self.store().related_memories(user.id, memory_id, page).await?)
    }

    pub async fn user_categories(&self, user_id: &str) -> Result<Vec<String>, EngineError> {
        let user = self.store().require_user(user_id).await?;
        Ok(self.store().user_categories(user.id).await?)
    }

    pub async fn memory_access_logs(
        &self,
        memory_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<PageOf<AccessLogRecord>, EngineError> {
        Ok(self.store().access_logs(memory_id, page, page_size).await?)
    }
}
