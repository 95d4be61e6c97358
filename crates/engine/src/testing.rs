//! In-memory doubles for the vector store and the LLM, shared by the
//! engine test modules.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use engram_llm::{EventKind, ExtractedFact, LlmClient, LlmError, MemoryEvent, NeighborMemory};
use engram_store::MetadataStore;
use engram_vector::{
    FilterCondition, MemoryPayload, ScoredPoint, SearchFilters, VectorError, VectorStore,
};
use uuid::Uuid;

use crate::MemoryEngine;

#[derive(Default)]
pub struct StubVectorStore {
    points: Mutex<HashMap<Uuid, MemoryPayload>>,
    upserts: AtomicUsize,
}

impl StubVectorStore {
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn payload_of(&self, id: Uuid) -> Option<MemoryPayload> {
        self.points.lock().unwrap().get(&id).cloned()
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().unwrap().len()
    }
}

#[async_trait]
impl VectorStore for StubVectorStore {
    async fn ensure_ready(&self) -> Result<(), VectorError> {
        Ok(())
    }

    async fn upsert(
        &self,
        id: Uuid,
        _vector: Vec<f32>,
        payload: MemoryPayload,
    ) -> Result<(), VectorError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.points.lock().unwrap().insert(id, payload);
        Ok(())
    }

    async fn search(
        &self,
        _vector: Vec<f32>,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let user = filters.conditions().iter().find_map(|condition| match condition {
            FilterCondition::Eq { key, value } if key == "user_id" => {
                value.as_str().map(ToString::to_string)
            }
            _ => None,
        });
        let points = self.points.lock().unwrap();
        let mut hits: Vec<ScoredPoint> = points
            .iter()
            .filter(|(_, payload)| user.as_deref().is_none_or(|u| payload.user_id == u))
            .map(|(id, payload)| ScoredPoint { id: *id, score: 0.9, payload: payload.clone() })
            .collect();
        hits.sort_by_key(|hit| hit.payload.created_at);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryPayload>, VectorError> {
        Ok(self.points.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<(), VectorError> {
        self.points.lock().unwrap().remove(&id);
        Ok(())
    }
}

/// Scripted LLM double.  Unscripted calls fall back to deterministic
/// defaults: extraction passes the text through as one fact, merge decides
/// ADD.
#[derive(Default)]
pub struct ScriptedLlm {
    extractions: Mutex<VecDeque<Result<Vec<ExtractedFact>, LlmError>>>,
    merges: Mutex<VecDeque<Vec<MemoryEvent>>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn script_facts(&self, facts: Vec<ExtractedFact>) {
        self.extractions.lock().unwrap().push_back(Ok(facts));
    }

    pub fn fail_next_extraction(&self, err: LlmError) {
        self.extractions.lock().unwrap().push_back(Err(err));
    }

    pub fn script_events(&self, events: Vec<MemoryEvent>) {
        self.merges.lock().unwrap().push_back(events);
    }

    /// Every provider interaction: extraction, merge decision, embedding.
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn extract_facts(
        &self,
        text: &str,
        _instructions: Option<&str>,
    ) -> Result<Vec<ExtractedFact>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.extractions.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(vec![ExtractedFact { text: text.to_string(), categories: Vec::new() }]),
        }
    }

    async fn decide_merge(
        &self,
        fact: &str,
        _fact_attachment_ids: &[Uuid],
        _neighbors: &[NeighborMemory],
        _prompt_override: Option<&str>,
    ) -> Result<Vec<MemoryEvent>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.merges.lock().unwrap().pop_front() {
            Some(events) => Ok(events),
            None => Ok(vec![MemoryEvent {
                event: EventKind::Add,
                id: None,
                text: fact.to_string(),
                attachment_ids: None,
            }]),
        }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.1, 0.2, 0.3, 0.4])
    }
}

pub struct EngineHarness {
    pub engine: MemoryEngine,
    pub vector: Arc<StubVectorStore>,
    pub llm: Arc<ScriptedLlm>,
}

pub fn scripted() -> Arc<ScriptedLlm> {
    Arc::new(ScriptedLlm::default())
}

pub async fn engine_with(llm: Arc<ScriptedLlm>) -> anyhow::Result<EngineHarness> {
    let store = MetadataStore::in_memory().await?;
    let vector = Arc::new(StubVectorStore::default());
    let engine = MemoryEngine::new(store, vector.clone(), llm.clone());
    Ok(EngineHarness { engine, vector, llm })
}
