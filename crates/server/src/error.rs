use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engram_engine::EngineError;
use engram_llm::LlmError;
use serde::Serialize;
use thiserror::Error;

// Error kinds surfaced over REST.  MCP tool handlers never use this type:
// they fold failures into `{"error": ...}` payloads instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

/// FastAPI-compatible error body: clients read `detail`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { detail: self.to_string() })).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        use engram_store::StoreError;
        match err {
            EngineError::Store(StoreError::NotFound(msg)) => Self::NotFound(msg),
            EngineError::Store(StoreError::Conflict(msg)) => Self::Conflict(msg),
            EngineError::Store(StoreError::BadRequest(msg)) => Self::BadRequest(msg),
            EngineError::Store(err @ StoreError::PayloadTooLarge { .. }) => {
                Self::PayloadTooLarge(err.to_string())
            }
            EngineError::Store(err @ StoreError::Timeout(_)) => {
                Self::ServiceUnavailable(err.to_string())
            }
            EngineError::Store(err) => Self::Internal(err.to_string()),
            EngineError::Vector(err) => Self::ServiceUnavailable(err.to_string()),
            EngineError::Llm(err @ LlmError::Unavailable(_)) => {
                Self::ServiceUnavailable(err.to_string())
            }
            EngineError::Llm(err) => Self::Internal(err.to_string()),
            EngineError::AppPaused(app) => {
                Self::Forbidden(format!("App {app} is currently paused. Cannot create new memories."))
            }
            EngineError::BadRequest(msg) => Self::BadRequest(msg),
            EngineError::Sqlx(err) => Self::Internal(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
