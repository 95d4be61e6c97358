use engram_store::memories;
use engram_store::{AccessType, MemoryRecord, MemoryState, StoreError};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::MemoryEngine;

/// Scope selector for the pause operation: exactly one branch applies, in
/// the order global → app → explicit IDs → categories.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PauseRequest {
    pub user_id: String,
    #[serde(default)]
    pub memory_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub category_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub app_id: Option<Uuid>,
    #[serde(default)]
    pub all_for_app: bool,
    #[serde(default)]
    pub global_pause: bool,
    /// Target state; defaults to `paused` (pass `active` to unpause).
    #[serde(default)]
    pub state: Option<MemoryState>,
}

impl MemoryEngine {
    /// Soft-delete memories: vector points removed (best effort), metadata
    /// rows transitioned to `deleted` with history and access-log rows,
    /// attachments cascaded when `delete_attachments` is set.
    ///
    /// `acl_app` restricts the operation to memories that app may touch
    /// (the MCP surface passes it; REST does not).
    pub async fn delete_memories(
        &self,
        user_id: &str,
        memory_ids: &[Uuid],
        delete_attachments: bool,
        acl_app: Option<Uuid>,
    ) -> Result<usize, EngineError> {
        let user = self.store().require_user(user_id).await?;
        let acl = match acl_app {
            Some(app_id) => Some(self.store().accessible_memory_ids(app_id).await?),
            None => None,
        };

        let mut targets: Vec<MemoryRecord> = Vec::new();
        for id in memory_ids {
            let Some(memory) = self.store().get_memory(*id).await? else {
                warn!(%id, "delete skips unknown memory id");
                continue;
            };
            if memory.user_id != user.id {
                continue;
            }
            if let Some(acl) = &acl {
                if !acl.allows(memory.id) {
                    continue;
                }
            }
            targets.push(memory);
        }
        if targets.is_empty() {
            return Err(StoreError::not_found("No valid accessible memories found to delete").into());
        }

        if delete_attachments {
            for memory in &targets {
                for attachment_id in memory.metadata.cascade_attachment_ids() {
                    // Tolerant of rows already gone.
                    self.store().delete_attachment(attachment_id).await?;
                }
            }
        }

        for memory in &targets {
            if let Err(err) = self.vector.delete(memory.id).await {
                warn!(id = %memory.id, error = %err, "vector delete failed; point may linger");
            }
        }

        let mut tx = self.store().begin().await?;
        for memory in &targets {
            memories::set_memory_state(&mut tx, memory.id, MemoryState::Deleted, user.id).await?;
            memories::insert_access_log(
                &mut tx,
                memory.id,
                acl_app.unwrap_or(memory.app_id),
                AccessType::Delete,
                &json!({"operation": "delete_memories"}),
            )
            .await?;
        }
        tx.commit().await?;

        info!(user_id, deleted = targets.len(), "memories deleted");
        Ok(targets.len())
    }

    /// Delete every memory the calling app may touch.
    pub async fn delete_all_memories(
        &self,
        user_id: &str,
        app: &str,
        delete_attachments: bool,
    ) -> Result<usize, EngineError> {
        let (user, app) = self.store().get_or_create_user_and_app(user_id, app).await?;
        let acl = self.store().accessible_memory_ids(app.id).await?;

        let targets: Vec<MemoryRecord> = self
            .store()
            .user_memories(user.id)
            .await?
            .into_iter()
            .filter(|memory| memory.state != MemoryState::Deleted && acl.allows(memory.id))
            .collect();

        if delete_attachments {
            for memory in &targets {
                for attachment_id in memory.metadata.cascade_attachment_ids() {
                    self.store().delete_attachment(attachment_id).await?;
                }
            }
        }
        for memory in &targets {
            if let Err(err) = self.vector.delete(memory.id).await {
                warn!(id = %memory.id, error = %err, "vector delete failed; point may linger");
            }
        }

        let mut tx = self.store().begin().await?;
        for memory in &targets {
            memories::set_memory_state(&mut tx, memory.id, MemoryState::Deleted, user.id).await?;
            memories::insert_access_log(
                &mut tx,
                memory.id,
                app.id,
                AccessType::DeleteAll,
                &json!({"operation": "bulk_delete"}),
            )
            .await?;
        }
        tx.commit().await?;

        info!(user_id = %user.user_id, deleted = targets.len(), "all accessible memories deleted");
        Ok(targets.len())
    }

    pub async fn archive_memories(
        &self,
        user_id: &str,
        memory_ids: &[Uuid],
    ) -> Result<usize, EngineError> {
        let user = self.store().require_user(user_id).await?;
        let mut tx = self.store().begin().await?;
        for id in memory_ids {
            memories::set_memory_state(&mut tx, *id, MemoryState::Archived, user.id).await?;
        }
        tx.commit().await?;
        Ok(memory_ids.len())
    }

    /// Pause (or transition to an explicit state) by scope.
    pub async fn pause_memories(&self, req: PauseRequest) -> Result<String, EngineError> {
        let user = self.store().require_user(&req.user_id).await?;
        let state = req.state.unwrap_or(MemoryState::Paused);

        let live = |memory: &MemoryRecord| {
            memory.state != MemoryState::Deleted && memory.state != MemoryState::Archived
        };

        if req.global_pause {
            let targets: Vec<MemoryRecord> = self
                .store()
                .user_memories(user.id)
                .await?
                .into_iter()
                .filter(live)
                .collect();
            self.transition_all(&targets, state, user.id).await?;
            return Ok("Successfully paused all memories".to_string());
        }

        if let Some(app_id) = req.app_id {
            let targets: Vec<MemoryRecord> = self
                .store()
                .user_memories(user.id)
                .await?
                .into_iter()
                .filter(|memory| memory.app_id == app_id && live(memory))
                .collect();
            self.transition_all(&targets, state, user.id).await?;
            return Ok(format!("Successfully paused all memories for app {app_id}"));
        }

        if let Some(memory_ids) = &req.memory_ids {
            if !memory_ids.is_empty() {
                let mut tx = self.store().begin().await?;
                for id in memory_ids {
                    memories::set_memory_state(&mut tx, *id, state, user.id).await?;
                }
                tx.commit().await?;
                return Ok(format!("Successfully paused {} memories", memory_ids.len()));
            }
        }

        if let Some(category_ids) = &req.category_ids {
            if !category_ids.is_empty() {
                let page = self
                    .store()
                    .filter_memories(
                        user.id,
                        &engram_store::MemoryFilter {
                            category_ids: category_ids.clone(),
                            size: 100,
                            ..Default::default()
                        },
                    )
                    .await?;
                let mut tx = self.store().begin().await?;
                for item in &page.items {
                    memories::set_memory_state(&mut tx, item.id, state, user.id).await?;
                }
                tx.commit().await?;
                return Ok(format!(
                    "Successfully paused memories in {} categories",
                    category_ids.len()
                ));
            }
        }

        Err(EngineError::bad_request("Invalid pause request parameters"))
    }

    async fn transition_all(
        &self,
        targets: &[MemoryRecord],
        state: MemoryState,
        changed_by: Uuid,
    ) -> Result<(), EngineError> {
        let mut tx = self.store().begin().await?;
        for memory in targets {
            memories::set_memory_state(&mut tx, memory.id, state, changed_by).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Manual content rewrite (`PUT /memories/{id}`); no LLM involvement.
    pub async fn update_memory_content(
        &self,
        user_id: &str,
        memory_id: Uuid,
        content: &str,
    ) -> Result<MemoryRecord, EngineError> {
        self.store().require_user(user_id).await?;
        Ok(self.store().update_memory_content(memory_id, content).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{AddOutcome, AddRequest};
    use crate::testing::{engine_with, scripted, EngineHarness};
    use anyhow::Result;

    async fn seed(engine: &MemoryEngine, text: &str, attachment: Option<&str>) -> Result<MemoryRecord> {
        let mut req = AddRequest::new("alice", "claude", text);
        req.attachment_text = attachment.map(ToString::to_string);
        let AddOutcome::Created(records) = engine.add(req).await? else { panic!("expected Created") };
        Ok(records.into_iter().next().unwrap())
    }

    #[tokio::test]
    async fn delete_cascades_attachments_when_asked() -> Result<()> {
        let EngineHarness { engine, vector, .. } = engine_with(scripted()).await?;
        let first = seed(&engine, "first", Some("attachment one")).await?;
        let second = seed(&engine, "second", Some("attachment two")).await?;
        let attachment_one = first.metadata.attachment_ids[0];
        let attachment_two = second.metadata.attachment_ids[0];

        let deleted = engine
            .delete_memories("alice", &[first.id, second.id], true, None)
            .await?;
        assert_eq!(deleted, 2);

        assert!(engine.store().get_attachment(attachment_one).await?.is_none());
        assert!(engine.store().get_attachment(attachment_two).await?.is_none());
        assert_eq!(vector.point_count(), 0);

        for memory in [first.id, second.id] {
            let record = engine.store().require_memory(memory).await?;
            assert_eq!(record.state, MemoryState::Deleted);
            assert!(record.deleted_at.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_without_flag_preserves_attachments() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let memory = seed(&engine, "keeper", Some("precious")).await?;
        let attachment = memory.metadata.attachment_ids[0];

        engine.delete_memories("alice", &[memory.id], false, None).await?;
        assert!(engine.store().get_attachment(attachment).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn delete_with_no_valid_ids_is_not_found_without_side_effects() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let kept = seed(&engine, "kept", None).await?;

        for ids in [vec![], vec![Uuid::new_v4(), Uuid::new_v4()]] {
            let err = engine.delete_memories("alice", &ids, true, None).await.unwrap_err();
            assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
        }
        assert_eq!(engine.store().require_memory(kept.id).await?.state, MemoryState::Active);
        Ok(())
    }

    #[tokio::test]
    async fn delete_ignores_other_users_memories() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let alice_memory = seed(&engine, "alice's", None).await?;

        let AddOutcome::Created(bobs) = engine
            .add(AddRequest::new("bob", "claude", "bob's"))
            .await?
        else {
            panic!("expected Created");
        };

        let deleted = engine
            .delete_memories("alice", &[alice_memory.id, bobs[0].id], false, None)
            .await?;
        assert_eq!(deleted, 1);
        assert_eq!(engine.store().require_memory(bobs[0].id).await?.state, MemoryState::Active);
        Ok(())
    }

    #[tokio::test]
    async fn archive_stamps_archived_at() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let memory = seed(&engine, "to archive", None).await?;

        engine.archive_memories("alice", &[memory.id]).await?;
        let record = engine.store().require_memory(memory.id).await?;
        assert_eq!(record.state, MemoryState::Archived);
        assert!(record.archived_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn pause_scopes_and_unpause() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let memory = seed(&engine, "pausable", None).await?;

        engine
            .pause_memories(PauseRequest {
                user_id: "alice".to_string(),
                memory_ids: Some(vec![memory.id]),
                ..Default::default()
            })
            .await?;
        assert_eq!(engine.store().require_memory(memory.id).await?.state, MemoryState::Paused);

        engine
            .pause_memories(PauseRequest {
                user_id: "alice".to_string(),
                global_pause: false,
                memory_ids: Some(vec![memory.id]),
                state: Some(MemoryState::Active),
                ..Default::default()
            })
            .await?;
        assert_eq!(engine.store().require_memory(memory.id).await?.state, MemoryState::Active);

        let err = engine
            .pause_memories(PauseRequest { user_id: "alice".to_string(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
        Ok(())
    }

    #[tokio::test]
    async fn pause_by_app_scope_only_touches_that_app() -> Result<()> {
        let EngineHarness { engine, .. } = engine_with(scripted()).await?;
        let claude_memory = seed(&engine, "from claude", None).await?;
        let mut req = AddRequest::new("alice", "cursor", "from cursor");
        req.infer = Some(false);
        let AddOutcome::Created(cursor_records) = engine.add(req).await? else { panic!() };

        engine
            .pause_memories(PauseRequest {
                user_id: "alice".to_string(),
                app_id: Some(claude_memory.app_id),
                ..Default::default()
            })
            .await?;

        assert_eq!(
            engine.store().require_memory(claude_memory.id).await?.state,
            MemoryState::Paused
        );
        assert_eq!(
            engine.store().require_memory(cursor_records[0].id).await?.state,
            MemoryState::Active
        );
        Ok(())
    }

    #[tokio::test]
    async fn update_memory_content_is_a_plain_rewrite() -> Result<()> {
        let EngineHarness { engine, llm, .. } = engine_with(scripted()).await?;
        let memory = seed(&engine, "original", None).await?;
        let calls_before = llm.total_calls();

        let updated = engine
            .update_memory_content("alice", memory.id, "rewritten by hand")
            .await?;
        assert_eq!(updated.content, "rewritten by hand");
        assert_eq!(llm.total_calls(), calls_before, "manual update must not call the LLM");
        Ok(())
    }
}
