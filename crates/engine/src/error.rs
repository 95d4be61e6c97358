use engram_llm::LlmError;
use engram_store::StoreError;
use engram_vector::VectorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Writes from a paused app are rejected before any store touch.
    #[error("App {0} is currently paused. Cannot create new memories.")]
    AppPaused(String),

    #[error("{0}")]
    BadRequest(String),
}

impl EngineError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}
