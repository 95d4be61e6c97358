use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("content size ({size} bytes) exceeds maximum allowed size ({limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("query timed out after {0} ms")]
    Timeout(u64),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}
