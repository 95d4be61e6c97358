use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    /// The store cannot be reached at all (connect/timeout).  Operations
    /// that need the vector store surface this as 503; everything else
    /// keeps working.
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store request failed: {0}")]
    Request(String),

    #[error("invalid search filter: {0}")]
    Filter(String),

    #[error("vector store returned malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<reqwest::Error> for VectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}
