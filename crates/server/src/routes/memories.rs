use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_engine::{AddOutcome, AddRequest, PauseRequest};
use engram_store::{MemoryFilter, MemoryListItem, MemoryRecord, PageOf};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Ceiling on a single ingestion call; inference on large documents can
/// legitimately take a while, but not forever.
const INGEST_TIMEOUT: Duration = Duration::from_secs(120);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_memories).post(create_memory).delete(delete_memories))
        .route("/categories", get(get_categories))
        .route("/filter", post(filter_memories))
        .route("/actions/archive", post(archive_memories))
        .route("/actions/pause", post(pause_memories))
        .route("/:memory_id", get(get_memory).put(update_memory))
        .route("/:memory_id/related", get(related_memories))
        .route("/:memory_id/access-log", get(memory_access_log))
}

// ── request/response shapes ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateMemoryRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub infer: Option<bool>,
    pub extract: Option<bool>,
    pub deduplicate: Option<bool>,
    #[serde(default = "default_app")]
    pub app: String,
    pub attachment_text: Option<String>,
    pub attachment_id: Option<Uuid>,
}

fn default_app() -> String {
    "engram".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DeleteMemoriesRequest {
    pub user_id: String,
    pub memory_ids: Vec<Uuid>,
    #[serde(default)]
    pub delete_attachments: bool,
}

#[derive(Debug, Deserialize)]
pub struct FilterMemoriesRequest {
    pub user_id: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_size")]
    pub size: u32,
    pub search_query: Option<String>,
    pub app_ids: Option<Vec<Uuid>>,
    pub category_ids: Option<Vec<Uuid>>,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    #[serde(default)]
    pub show_archived: bool,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct ListMemoriesQuery {
    pub user_id: String,
    pub app_id: Option<Uuid>,
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    /// Comma-separated category names.
    pub categories: Option<String>,
    pub search_query: Option<String>,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_size")]
    pub size: u32,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveMemoriesRequest {
    pub user_id: String,
    pub memory_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemoryRequest {
    pub user_id: String,
    pub memory_content: String,
}

#[derive(Debug, Deserialize)]
pub struct RelatedQuery {
    pub user_id: String,
    #[serde(default = "default_page")]
    pub page: u32,
}

#[derive(Debug, Deserialize)]
pub struct AccessLogQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_access_log_size")]
    pub page_size: u32,
}

fn default_access_log_size() -> u32 {
    10
}

/// The record shape served by list/filter/related pages.
#[derive(Debug, Serialize)]
pub struct MemoryResponse {
    pub id: Uuid,
    pub content: String,
    pub created_at: i64,
    pub state: String,
    pub app_id: Uuid,
    pub app_name: String,
    pub categories: Vec<String>,
    pub metadata_: Value,
}

impl From<MemoryListItem> for MemoryResponse {
    fn from(item: MemoryListItem) -> Self {
        Self {
            id: item.id,
            content: item.content,
            created_at: item.created_at.timestamp(),
            state: item.state.to_string(),
            app_id: item.app_id,
            app_name: item.app_name,
            categories: item.categories,
            metadata_: item.metadata.to_value(),
        }
    }
}

fn map_page(page: PageOf<MemoryListItem>) -> PageOf<MemoryResponse> {
    PageOf {
        items: page.items.into_iter().map(MemoryResponse::from).collect(),
        total: page.total,
        page: page.page,
        size: page.size,
        pages: page.pages,
    }
}

fn created_body(record: &MemoryRecord) -> Value {
    json!({
        "id": record.id,
        "user_id": record.user_id,
        "app_id": record.app_id,
        "content": record.content,
        "metadata_": record.metadata.to_value(),
        "state": record.state.to_string(),
        "created_at": record.created_at.timestamp(),
    })
}

// ── handlers ──────────────────────────────────────────────────────────────────

async fn create_memory(
    State(state): State<AppState>,
    Json(req): Json<CreateMemoryRequest>,
) -> ApiResult<Json<Value>> {
    let add = AddRequest {
        user_id: req.user_id,
        app: req.app,
        text: req.text,
        metadata: req.metadata,
        infer: req.infer,
        extract: req.extract,
        deduplicate: req.deduplicate,
        attachment_text: req.attachment_text,
        attachment_id: req.attachment_id,
    };

    let outcome = tokio::time::timeout(INGEST_TIMEOUT, state.engine.add(add))
        .await
        .map_err(|_| ApiError::ServiceUnavailable("ingestion timed out".to_string()))??;

    match outcome {
        AddOutcome::Created(records) => Ok(Json(created_body(&records[0]))),
        AddOutcome::None { message, original_text } => Ok(Json(json!({
            "message": message,
            "event": "NONE",
            "original_text": original_text,
        }))),
    }
}

async fn list_memories(
    State(state): State<AppState>,
    Query(query): Query<ListMemoriesQuery>,
) -> ApiResult<Json<PageOf<MemoryResponse>>> {
    let filter = MemoryFilter {
        page: query.page,
        size: query.size,
        search_query: query.search_query,
        app_ids: query.app_id.into_iter().collect(),
        category_ids: Vec::new(),
        category_names: query
            .categories
            .map(|raw| raw.split(',').map(|c| c.trim().to_string()).collect())
            .unwrap_or_default(),
        from_date: query.from_date,
        to_date: query.to_date,
        sort_column: query.sort_column,
        sort_direction: query.sort_direction,
        show_archived: false,
    };
    let page = state.engine.filter_memories(&query.user_id, &filter).await?;
    Ok(Json(map_page(page)))
}

async fn filter_memories(
    State(state): State<AppState>,
    Json(req): Json<FilterMemoriesRequest>,
) -> ApiResult<Json<PageOf<MemoryResponse>>> {
    let filter = MemoryFilter {
        page: req.page,
        size: req.size,
        search_query: req.search_query,
        app_ids: req.app_ids.unwrap_or_default(),
        category_ids: req.category_ids.unwrap_or_default(),
        category_names: Vec::new(),
        from_date: req.from_date,
        to_date: req.to_date,
        sort_column: req.sort_column,
        sort_direction: req.sort_direction,
        show_archived: req.show_archived,
    };
    let page = state.engine.filter_memories(&req.user_id, &filter).await?;
    Ok(Json(map_page(page)))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let item = state.engine.get_memory_item(memory_id).await?;
    Ok(Json(json!({
        "id": item.id,
        "text": item.content,
        "created_at": item.created_at.timestamp(),
        "state": item.state.to_string(),
        "app_id": item.app_id,
        "app_name": item.app_name,
        "categories": item.categories,
        "metadata_": item.metadata.to_value(),
    })))
}

async fn update_memory(
    State(state): State<AppState>,
    Path(memory_id): Path<Uuid>,
    Json(req): Json<UpdateMemoryRequest>,
) -> ApiResult<Json<Value>> {
    let record = state
        .engine
        .update_memory_content(&req.user_id, memory_id, &req.memory_content)
        .await?;
    Ok(Json(created_body(&record)))
}

async fn delete_memories(
    State(state): State<AppState>,
    Json(req): Json<DeleteMemoriesRequest>,
) -> ApiResult<Json<Value>> {
    let deleted = state
        .engine
        .delete_memories(&req.user_id, &req.memory_ids, req.delete_attachments, None)
        .await?;
    Ok(Json(json!({"message": format!("Successfully deleted {deleted} memories")})))
}

async fn archive_memories(
    State(state): State<AppState>,
    Json(req): Json<ArchiveMemoriesRequest>,
) -> ApiResult<Json<Value>> {
    let archived = state.engine.archive_memories(&req.user_id, &req.memory_ids).await?;
    Ok(Json(json!({"message": format!("Successfully archived {archived} memories")})))
}

async fn pause_memories(
    State(state): State<AppState>,
    Json(req): Json<PauseRequest>,
) -> ApiResult<Json<Value>> {
    let message = state.engine.pause_memories(req).await?;
    Ok(Json(json!({"message": message})))
}

async fn get_categories(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Value>> {
    let categories = state.engine.user_categories(&query.user_id).await?;
    Ok(Json(json!({"total": categories.len(), "categories": categories})))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

async fn related_memories(
    State(state): State<AppState>,
    Path(memory_id): Path<Uuid>,
    Query(query): Query<RelatedQuery>,
) -> ApiResult<Json<PageOf<MemoryResponse>>> {
    let page = state
        .engine
        .related_memories(&query.user_id, memory_id, query.page)
        .await?;
    Ok(Json(map_page(page)))
}

async fn memory_access_log(
    State(state): State<AppState>,
    Path(memory_id): Path<Uuid>,
    Query(query): Query<AccessLogQuery>,
) -> ApiResult<Json<Value>> {
    let page = state
        .engine
        .memory_access_logs(memory_id, query.page, query.page_size)
        .await?;
    let logs: Vec<Value> = page
        .items
        .iter()
        .map(|log| {
            json!({
                "id": log.id,
                "memory_id": log.memory_id,
                "app_id": log.app_id,
                "app_name": log.app_name,
                "access_type": log.access_type,
                "metadata_": log.metadata,
                "accessed_at": log.accessed_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({
        "total": page.total,
        "page": page.page,
        "page_size": page.size,
        "logs": logs,
    })))
}
