mod parse;
mod prompts;
mod provider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use prompts::{DEFAULT_FACT_EXTRACTION_PROMPT, DEFAULT_MERGE_PROMPT};
pub use provider::{HttpLlmClient, Provider};

#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider cannot be reached (or answered with a non-success
    /// status).  Fatal for the inference path: the engine never silently
    /// falls back to the fast path.
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),

    #[error("llm returned malformed output: {0}")]
    Malformed(String),
}

/// One decision over a candidate fact, in the order the model emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Add,
    Update,
    Delete,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub event: EventKind,
    /// Target memory for UPDATE/DELETE.  Always absent on ADD; the engine
    /// mints the UUID exactly once at commit time.
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub text: String,
    /// On UPDATE: the merged attachment list the model chose for the
    /// surviving memory.
    #[serde(default)]
    pub attachment_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub text: String,
    /// Optional side-channel: category tags for the fact.
    #[serde(default)]
    pub categories: Vec<String>,
}

/// A vector-search neighbor handed to the merge decision.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborMemory {
    pub id: Uuid,
    pub content: String,
    pub attachment_ids: Vec<Uuid>,
}

/// The black-box LLM surface the engine consumes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Distill a text blob into an ordered list of short atomic facts.
    /// May legitimately return an empty list.
    async fn extract_facts(
        &self,
        text: &str,
        instructions: Option<&str>,
    ) -> Result<Vec<ExtractedFact>, LlmError>;

    /// Decide how a candidate fact relates to its vector-similar neighbors.
    /// Returns an ordered ADD/UPDATE/DELETE/NONE event list.
    async fn decide_merge(
        &self,
        fact: &str,
        fact_attachment_ids: &[Uuid],
        neighbors: &[NeighborMemory],
        prompt_override: Option<&str>,
    ) -> Result<Vec<MemoryEvent>, LlmError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}
