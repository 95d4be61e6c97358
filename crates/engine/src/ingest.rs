use chrono::Utc;
use engram_llm::{EventKind, ExtractedFact, MemoryEvent, NeighborMemory};
use engram_store::memories;
use engram_store::{
    AppRecord, MemoryMetadata, MemoryRecord, MemoryState, StoreError, UserRecord,
};
use engram_vector::{MemoryPayload, SearchFilters};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::MemoryEngine;

/// The `add` operation's inputs, REST and MCP alike.
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub user_id: String,
    pub app: String,
    pub text: String,
    /// Caller-supplied metadata object; `Null` means empty.
    pub metadata: Value,
    pub infer: Option<bool>,
    pub extract: Option<bool>,
    pub deduplicate: Option<bool>,
    pub attachment_text: Option<String>,
    pub attachment_id: Option<Uuid>,
}

impl AddRequest {
    pub fn new(user_id: impl Into<String>, app: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            app: app.into(),
            text: text.into(),
            metadata: Value::Null,
            infer: None,
            extract: None,
            deduplicate: None,
            attachment_text: None,
            attachment_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Rows touched by ADD/UPDATE events, in event order.
    Created(Vec<MemoryRecord>),
    /// Every event was NONE (or extraction yielded nothing).
    None { message: String, original_text: String },
}

pub(crate) fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

impl MemoryEngine {
    /// Ingest one text blob for a user.
    ///
    /// Routes between the fast path (verbatim row, no vector store, no LLM)
    /// and the inference path (extraction, deduplication, event
    /// application) based on resolved flags.
    pub async fn add(&self, req: AddRequest) -> Result<AddOutcome, EngineError> {
        let settings = self.config.current().await;
        let (user, app) = self
            .store()
            .get_or_create_user_and_app(&req.user_id, &req.app)
            .await?;
        if !app.is_active {
            return Err(EngineError::AppPaused(app.name.clone()));
        }

        let infer = req.infer.unwrap_or(settings.memory.default_infer);
        let mut extract = req.extract.unwrap_or(settings.memory.default_extract);
        let mut deduplicate = req.deduplicate.unwrap_or(settings.memory.default_deduplicate);
        // The fast path must never reach the LLM, whatever the caller sent.
        if !infer {
            extract = false;
            deduplicate = false;
        }

        let mut metadata = parse_metadata(req.metadata.clone())?;
        metadata.source_app.get_or_insert_with(|| "engram".to_string());
        metadata.mcp_client = Some(req.app.clone());

        // Attachment intake happens before any other write so collisions
        // and missing references fail the call cleanly.
        let incoming_attachment = self
            .intake_attachment(&req, &mut metadata, settings.attachments.max_size_bytes())
            .await?;

        if !infer {
            return self.add_fast_path(&user, &app, &req.text, &metadata).await;
        }

        self.ensure_vector_ready().await?;

        let facts: Vec<ExtractedFact> = if extract {
            self.llm
                .extract_facts(&req.text, settings.llm.custom_instructions.as_deref())
                .await?
        } else {
            vec![ExtractedFact { text: req.text.clone(), categories: Vec::new() }]
        };
        if facts.is_empty() {
            debug!(user_id = %req.user_id, "extraction produced no facts");
            return Ok(none_outcome(req.text));
        }

        // Plan every event before opening the metadata transaction; LLM
        // failures here abort the call with nothing written.
        let mut planned: Vec<(ExtractedFact, Vec<MemoryEvent>)> = Vec::with_capacity(facts.len());
        for fact in facts {
            let events = if deduplicate {
                let embedding = self.llm.embed(&fact.text).await?;
                let neighbors = self
                    .vector
                    .search(
                        embedding,
                        settings.memory.dedup_top_k,
                        &SearchFilters::for_user(&user.user_id),
                    )
                    .await?
                    .into_iter()
                    .map(|hit| NeighborMemory {
                        id: hit.id,
                        content: hit.payload.data.clone(),
                        attachment_ids: hit.payload.attachment_ids(),
                    })
                    .collect::<Vec<_>>();
                self.llm
                    .decide_merge(
                        &fact.text,
                        &metadata.attachment_ids,
                        &neighbors,
                        settings.llm.custom_update_memory_prompt.as_deref(),
                    )
                    .await?
            } else {
                vec![MemoryEvent {
                    event: EventKind::Add,
                    id: None,
                    text: fact.text.clone(),
                    attachment_ids: None,
                }]
            };
            planned.push((fact, events));
        }

        let mut vector_writes = 0usize;
        let mut tx = self.store().begin().await?;
        let applied = self
            .apply_events(&mut tx, &user, &app, &metadata, incoming_attachment, &planned, &mut vector_writes)
            .await;

        let created_ids = match applied {
            Ok(ids) => ids,
            Err(err) => {
                drop(tx);
                if vector_writes > 0 {
                    warn!(
                        orphaned_points = vector_writes,
                        error = %err,
                        "metadata transaction rolled back after vector writes; \
                         orphaned points stay hidden behind read-time filtering"
                    );
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        if created_ids.is_empty() {
            return Ok(none_outcome(req.text));
        }

        let mut records = Vec::with_capacity(created_ids.len());
        for id in created_ids {
            records.push(self.store().require_memory(id).await?);
        }
        info!(user_id = %req.user_id, app = %req.app, memories = records.len(), "ingestion committed");
        Ok(AddOutcome::Created(records))
    }

    async fn intake_attachment(
        &self,
        req: &AddRequest,
        metadata: &mut MemoryMetadata,
        max_bytes: usize,
    ) -> Result<Option<Uuid>, EngineError> {
        if let Some(text) = &req.attachment_text {
            let created = self
                .store()
                .create_attachment(req.attachment_id, text, max_bytes)
                .await?;
            metadata.push_attachment(created.id);
            return Ok(Some(created.id));
        }
        if let Some(id) = req.attachment_id {
            self.store().require_attachment(id).await?;
            metadata.push_attachment(id);
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn add_fast_path(
        &self,
        user: &UserRecord,
        app: &AppRecord,
        text: &str,
        metadata: &MemoryMetadata,
    ) -> Result<AddOutcome, EngineError> {
        let id = Uuid::new_v4();
        let mut tx = self.store().begin().await?;
        memories::insert_memory(&mut tx, id, user.id, app.id, text, metadata).await?;
        memories::insert_history(&mut tx, id, user.id, MemoryState::Deleted, MemoryState::Active)
            .await?;
        tx.commit().await?;

        info!(%id, user_id = %user.user_id, "fast-path memory created (off-index)");
        Ok(AddOutcome::Created(vec![self.store().require_memory(id).await?]))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_events(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        user: &UserRecord,
        app: &AppRecord,
        metadata: &MemoryMetadata,
        incoming_attachment: Option<Uuid>,
        planned: &[(ExtractedFact, Vec<MemoryEvent>)],
        vector_writes: &mut usize,
    ) -> Result<Vec<Uuid>, EngineError> {
        let mut touched = Vec::new();
        for (fact, events) in planned {
            for event in events {
                match event.event {
                    EventKind::Add => {
                        // The UUID is minted exactly once and shared with
                        // the vector point.
                        let id = event.id.unwrap_or_else(Uuid::new_v4);
                        let text = if event.text.is_empty() { &fact.text } else { &event.text };
                        let now = Utc::now();
                        let payload = MemoryPayload {
                            data: text.clone(),
                            hash: content_hash(text),
                            user_id: user.user_id.clone(),
                            created_at: now.timestamp(),
                            updated_at: None,
                            metadata: metadata.to_value(),
                        };
                        let embedding = self.llm.embed(text).await?;
                        self.vector.upsert(id, embedding, payload).await?;
                        *vector_writes += 1;

                        let existed =
                            memories::activate_memory(&mut *tx, id, user.id, app.id, text, metadata)
                                .await?;
                        memories::insert_history(
                            &mut *tx,
                            id,
                            user.id,
                            MemoryState::Deleted,
                            MemoryState::Active,
                        )
                        .await?;
                        if !fact.categories.is_empty() {
                            memories::link_categories(&mut *tx, id, &fact.categories).await?;
                        }
                        debug!(%id, existed, "ADD event applied");
                        touched.push(id);
                    }
                    EventKind::Update => {
                        let Some(id) = event.id else {
                            return Err(engram_llm::LlmError::Malformed(
                                "UPDATE event without a target id".to_string(),
                            )
                            .into());
                        };
                        let text = if event.text.is_empty() { &fact.text } else { &event.text };
                        let previous = self.vector.get(id).await?;

                        // The merged list is the LLM's decision; the engine
                        // only guarantees the just-created attachment rides
                        // along.
                        let mut merged = event
                            .attachment_ids
                            .clone()
                            .or_else(|| previous.as_ref().map(|p| p.attachment_ids()))
                            .unwrap_or_else(|| metadata.attachment_ids.clone());
                        if let Some(new_id) = incoming_attachment {
                            if !merged.contains(&new_id) {
                                merged.push(new_id);
                            }
                        }
                        let mut updated_meta = metadata.clone();
                        updated_meta.set_attachments(merged);

                        let now = Utc::now();
                        let payload = MemoryPayload {
                            data: text.clone(),
                            hash: content_hash(text),
                            user_id: user.user_id.clone(),
                            created_at: previous
                                .as_ref()
                                .map(|p| p.created_at)
                                .unwrap_or_else(|| now.timestamp()),
                            updated_at: Some(now.timestamp()),
                            metadata: updated_meta.to_value(),
                        };
                        let embedding = self.llm.embed(text).await?;
                        self.vector.upsert(id, embedding, payload).await?;
                        *vector_writes += 1;

                        // Read the payload back: the vector store is the
                        // authority for the reconciled attachment list.
                        match self.vector.get(id).await? {
                            Some(payload) => updated_meta.set_attachments(payload.attachment_ids()),
                            None => warn!(%id, "payload read-back after UPDATE came up empty"),
                        }

                        let updated =
                            memories::update_memory_row(&mut *tx, id, text, &updated_meta).await?;
                        if updated {
                            memories::insert_history(
                                &mut *tx,
                                id,
                                user.id,
                                MemoryState::Active,
                                MemoryState::Active,
                            )
                            .await?;
                            touched.push(id);
                        } else {
                            warn!(%id, "UPDATE event targets a memory with no metadata row");
                        }
                    }
                    EventKind::Delete => {
                        let Some(id) = event.id else {
                            return Err(engram_llm::LlmError::Malformed(
                                "DELETE event without a target id".to_string(),
                            )
                            .into());
                        };
                        self.vector.delete(id).await?;
                        match memories::set_memory_state(&mut *tx, id, MemoryState::Deleted, user.id)
                            .await
                        {
                            Ok(_) | Err(StoreError::NotFound(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                        debug!(%id, "DELETE event applied");
                    }
                    EventKind::None => {
                        debug!(fact = %fact.text, "NONE event: candidate is a duplicate");
                    }
                }
            }
        }
        Ok(touched)
    }
}

fn parse_metadata(raw: Value) -> Result<MemoryMetadata, EngineError> {
    let value = if raw.is_null() { Value::Object(serde_json::Map::new()) } else { raw };
    if !value.is_object() {
        return Err(EngineError::bad_request("metadata must be a JSON object"));
    }
    MemoryMetadata::from_value(value)
        .map_err(|err| EngineError::bad_request(format!("invalid metadata: {err}")))
}

fn none_outcome(original_text: String) -> AddOutcome {
    AddOutcome::None {
        message: "No new memory created. Content may already exist (deduplication) \
                  or no facts were extracted."
            .to_string(),
        original_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, scripted, EngineHarness};
    use anyhow::Result;
    use engram_llm::LlmError;
    use serde_json::json;

    fn add_req(text: &str) -> AddRequest {
        AddRequest::new("alice", "claude", text)
    }

    #[tokio::test]
    async fn fast_path_is_verbatim_and_never_touches_llm_or_vector() -> Result<()> {
        let EngineHarness { engine, vector, llm } = engine_with(scripted()).await?;

        let mut req = add_req("Freddy and I like hiking in the mountains.");
        req.infer = Some(false);
        // Contradictory flags are normalized away.
        req.extract = Some(true);
        req.deduplicate = Some(true);

        let outcome = engine.add(req).await?;
        let AddOutcome::Created(records) = outcome else { panic!("expected Created") };
        assert_eq!(records[0].content, "Freddy and I like hiking in the mountains.");

        assert_eq!(llm.total_calls(), 0, "fast path must not call the LLM");
        assert_eq!(vector.upsert_count(), 0, "fast path must not write the vector store");

        // Direct GET by ID still works.
        let fetched = engine.store().require_memory(records[0].id).await?;
        assert_eq!(fetched.state, MemoryState::Active);
        assert_eq!(
            engine.store().history_of(fetched.id).await?,
            vec![(MemoryState::Deleted, MemoryState::Active)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn inference_add_keeps_both_stores_on_the_same_id() -> Result<()> {
        let EngineHarness { engine, vector, .. } = engine_with(scripted()).await?;

        let outcome = engine.add(add_req("Lives in Berlin")).await?;
        let AddOutcome::Created(records) = outcome else { panic!("expected Created") };
        let id = records[0].id;

        let payload = vector.payload_of(id).expect("vector point exists under the same UUID");
        assert_eq!(payload.data, "Lives in Berlin");
        assert_eq!(payload.hash, content_hash("Lives in Berlin"));
        assert_eq!(payload.user_id, "alice");
        Ok(())
    }

    #[tokio::test]
    async fn dedup_update_reuses_the_existing_id() -> Result<()> {
        let EngineHarness { engine, llm, .. } = engine_with(scripted()).await?;

        let AddOutcome::Created(first) = engine.add(add_req("Lives in Berlin")).await? else {
            panic!("expected Created");
        };
        let existing = first[0].id;

        llm.script_events(vec![MemoryEvent {
            event: EventKind::Update,
            id: Some(existing),
            text: "Lives in Berlin".to_string(),
            attachment_ids: None,
        }]);
        let AddOutcome::Created(second) = engine.add(add_req("Lives in Berlin")).await? else {
            panic!("expected Created");
        };
        assert_eq!(second[0].id, existing);

        let active = engine
            .store()
            .user_memories(first[0].user_id)
            .await?
            .into_iter()
            .filter(|m| m.state == MemoryState::Active)
            .count();
        assert_eq!(active, 1, "repeat ingestion must not grow the active set");
        Ok(())
    }

    #[tokio::test]
    async fn update_merges_attachments_and_includes_the_incoming_one() -> Result<()> {
        let EngineHarness { engine, llm, .. } = engine_with(scripted()).await?;

        let mut req = add_req("Lives in Berlin");
        req.attachment_text = Some("first conversation".to_string());
        let AddOutcome::Created(first) = engine.add(req).await? else { panic!("expected Created") };
        let existing = first[0].id;
        let attachment_a = first[0].metadata.attachment_ids[0];

        // The model returns only the old attachment; the engine appends the
        // just-created one.
        llm.script_events(vec![MemoryEvent {
            event: EventKind::Update,
            id: Some(existing),
            text: "Lives in Berlin".to_string(),
            attachment_ids: Some(vec![attachment_a]),
        }]);
        let mut req = add_req("Lives in Berlin");
        req.attachment_text = Some("second conversation".to_string());
        let AddOutcome::Created(second) = engine.add(req).await? else { panic!("expected Created") };

        let ids = &second[0].metadata.attachment_ids;
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], attachment_a, "first-seen ordering is preserved");
        assert!(engine.store().get_attachment(ids[1]).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn none_events_produce_a_none_outcome_without_rows() -> Result<()> {
        let EngineHarness { engine, llm, .. } = engine_with(scripted()).await?;

        let AddOutcome::Created(first) = engine.add(add_req("Lives in Berlin")).await? else {
            panic!("expected Created");
        };

        llm.script_events(vec![MemoryEvent {
            event: EventKind::None,
            id: None,
            text: String::new(),
            attachment_ids: None,
        }]);
        let outcome = engine.add(add_req("Lives in Berlin")).await?;
        let AddOutcome::None { original_text, .. } = outcome else { panic!("expected None") };
        assert_eq!(original_text, "Lives in Berlin");

        let active = engine
            .store()
            .user_memories(first[0].user_id)
            .await?
            .into_iter()
            .filter(|m| m.state == MemoryState::Active)
            .count();
        assert_eq!(active, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_then_readd_yields_a_fresh_id() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;

        let AddOutcome::Created(first) = engine.add(add_req("Lives in Berlin")).await? else {
            panic!("expected Created");
        };
        let original = first[0].id;
        engine.delete_memories("alice", &[original], false, None).await?;

        let AddOutcome::Created(second) = engine.add(add_req("Lives in Berlin")).await? else {
            panic!("expected Created");
        };
        assert_ne!(second[0].id, original, "re-adding after delete is an ADD, not a revival");

        let active: Vec<_> = engine
            .store()
            .user_memories(first[0].user_id)
            .await?
            .into_iter()
            .filter(|m| m.state == MemoryState::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second[0].id);
        Ok(())
    }

    #[tokio::test]
    async fn llm_failure_fails_the_call_without_partial_rows() -> Result<()> {
        let EngineHarness { engine, llm, .. } = engine_with(scripted()).await?;
        llm.fail_next_extraction(LlmError::Unavailable("connection refused".to_string()));

        let mut req = add_req("Lives in Berlin");
        req.extract = Some(true);
        let err = engine.add(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Llm(LlmError::Unavailable(_))));

        let (user, _) = engine.store().get_or_create_user_and_app("alice", "claude").await?;
        assert!(engine.store().user_memories(user.id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn attachment_intake_failures_happen_before_any_write() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;

        // Referencing a missing attachment is a NotFound.
        let mut req = add_req("fact");
        req.attachment_id = Some(Uuid::new_v4());
        let err = engine.add(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));

        // Creating under a taken ID is a Conflict.
        let taken = engine
            .store()
            .create_attachment(None, "existing", 1024)
            .await?;
        let mut req = add_req("fact");
        req.attachment_text = Some("new".to_string());
        req.attachment_id = Some(taken.id);
        let err = engine.add(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Conflict(_))));

        let (user, _) = engine.store().get_or_create_user_and_app("alice", "claude").await?;
        assert!(engine.store().user_memories(user.id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn paused_app_is_rejected_before_any_write() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let (_, app) = engine.store().get_or_create_user_and_app("alice", "claude").await?;
        engine.store().set_app_active(app.id, false).await?;

        let err = engine.add(add_req("fact")).await.unwrap_err();
        assert!(matches!(err, EngineError::AppPaused(name) if name == "claude"));
        Ok(())
    }

    #[tokio::test]
    async fn caller_metadata_keys_survive_ingestion() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;

        let mut req = add_req("Lives in Berlin");
        req.metadata = json!({"project": "atlas"});
        let AddOutcome::Created(records) = engine.add(req).await? else { panic!("expected Created") };
        assert_eq!(records[0].metadata.extra.get("project"), Some(&json!("atlas")));
        assert_eq!(records[0].metadata.mcp_client.as_deref(), Some("claude"));
        Ok(())
    }

    #[tokio::test]
    async fn scalar_metadata_is_a_bad_request() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let mut req = add_req("fact");
        req.metadata = json!("not-an-object");
        let err = engine.add(req).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
        Ok(())
    }
}
