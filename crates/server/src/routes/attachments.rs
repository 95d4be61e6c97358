use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use engram_store::{AttachmentFilter, AttachmentListItem, AttachmentRecord, PageOf};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_attachment))
        .route("/filter", post(filter_attachments))
        .route(
            "/:attachment_id",
            axum::routing::get(get_attachment)
                .put(update_attachment)
                .delete(delete_attachment),
        )
}

#[derive(Debug, Deserialize)]
pub struct AttachmentCreate {
    pub content: String,
    pub id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentUpdate {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub id: Uuid,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<AttachmentRecord> for AttachmentResponse {
    fn from(record: AttachmentRecord) -> Self {
        Self {
            id: record.id,
            content: record.content,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachmentFilterRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_size")]
    pub size: u32,
    pub search_query: Option<String>,
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    /// Statement-timeout hint in milliseconds.
    pub timeout_ms: Option<u64>,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    10
}

async fn create_attachment(
    State(state): State<AppState>,
    Json(req): Json<AttachmentCreate>,
) -> ApiResult<(StatusCode, Json<AttachmentResponse>)> {
    let record = state.engine.create_attachment(req.id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn get_attachment(
    State(state): State<AppState>,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<Json<AttachmentResponse>> {
    let record = state.engine.get_attachment(attachment_id).await?;
    Ok(Json(record.into()))
}

async fn update_attachment(
    State(state): State<AppState>,
    Path(attachment_id): Path<Uuid>,
    Json(req): Json<AttachmentUpdate>,
) -> ApiResult<Json<AttachmentResponse>> {
    let record = state.engine.update_attachment(attachment_id, &req.content).await?;
    Ok(Json(record.into()))
}

/// Idempotent: 204 whether or not the attachment existed.
async fn delete_attachment(
    State(state): State<AppState>,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.delete_attachment(attachment_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn filter_attachments(
    State(state): State<AppState>,
    Json(req): Json<AttachmentFilterRequest>,
) -> ApiResult<Json<PageOf<AttachmentListItem>>> {
    let filter = AttachmentFilter {
        page: req.page,
        size: req.size,
        search_query: req.search_query,
        from_date: req.from_date,
        to_date: req.to_date,
        sort_column: req.sort_column,
        sort_direction: req.sort_direction,
        timeout_ms: req.timeout_ms,
    };
    let page = state.engine.filter_attachments(&filter).await?;
    Ok(Json(page))
}
