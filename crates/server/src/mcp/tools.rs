//! The MCP tool set.  Every tool returns a JSON string payload (or a short
//! human-readable message); failures become `{"error": "..."}` payloads
//! rather than transport-level faults.

use std::time::Duration;

use engram_engine::{AddOutcome, AddRequest, SearchRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::Identity;
use crate::state::AppState;

const INGEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Descriptors served by `tools/list`.
pub fn tool_list() -> Vec<Value> {
    fn tool(name: &str, description: &str, schema: Value) -> Value {
        json!({"name": name, "description": description, "inputSchema": schema})
    }
    let object = |properties: Value, required: Vec<&str>| {
        json!({"type": "object", "properties": properties, "required": required})
    };

    vec![
        tool(
            "add_memories",
            "Add a new memory to the user's memory store. Supports optional metadata \
             and attachments. Returns the created memory with its ID and content.",
            object(
                json!({
                    "text": {"type": "string"},
                    "metadata": {"type": "object"},
                    "attachment_text": {"type": "string"},
                    "attachment_id": {"type": "string"},
                    "infer": {"type": "boolean"},
                    "extract": {"type": "boolean"},
                    "deduplicate": {"type": "boolean"},
                }),
                vec!["text"],
            ),
        ),
        tool(
            "search_memory",
            "Search stored memories by semantic similarity, with optional filtering \
             and metadata inclusion.",
            object(
                json!({
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "agent_id": {"type": "string"},
                    "include_metadata": {"type": "boolean"},
                    "attachment_ids_show": {"type": "boolean"},
                }),
                vec!["query"],
            ),
        ),
        tool(
            "list_memories",
            "List all memories stored for the current user.",
            object(json!({}), vec![]),
        ),
        tool(
            "update_memory",
            "Rewrite the content of an existing memory by its UUID.",
            object(
                json!({"memory_id": {"type": "string"}, "content": {"type": "string"}}),
                vec!["memory_id", "content"],
            ),
        ),
        tool(
            "delete_memories",
            "Delete specific memories by their IDs, optionally with their attachments.",
            object(
                json!({
                    "memory_ids": {"type": "array", "items": {"type": "string"}},
                    "delete_attachments": {"type": "boolean"},
                }),
                vec!["memory_ids"],
            ),
        ),
        tool(
            "delete_all_memories",
            "Delete all memories for the current user, optionally with their attachments.",
            object(json!({"delete_attachments": {"type": "boolean"}}), vec![]),
        ),
        tool(
            "create_attachment",
            "Create a new standalone attachment with optional ID.",
            object(
                json!({"content": {"type": "string"}, "attachment_id": {"type": "string"}}),
                vec!["content"],
            ),
        ),
        tool(
            "update_attachment",
            "Update an existing attachment's content by its UUID.",
            object(
                json!({"attachment_id": {"type": "string"}, "content": {"type": "string"}}),
                vec!["attachment_id", "content"],
            ),
        ),
        tool(
            "get_attachment",
            "Retrieve the full text content of an attachment by its UUID.",
            object(json!({"attachment_id": {"type": "string"}}), vec!["attachment_id"]),
        ),
        tool(
            "delete_attachment",
            "Delete an attachment by its UUID. Idempotent.",
            object(json!({"attachment_id": {"type": "string"}}), vec!["attachment_id"]),
        ),
    ]
}

/// Route one `tools/call` to its handler.  `None` means the tool name is
/// unknown.
pub async fn dispatch(
    state: &AppState,
    identity: &Identity,
    name: &str,
    arguments: Value,
) -> Option<String> {
    let payload = match name {
        "add_memories" => add_memories(state, identity, arguments).await,
        "search_memory" => search_memory(state, identity, arguments).await,
        "list_memories" => list_memories(state, identity).await,
        "update_memory" => update_memory(state, identity, arguments).await,
        "delete_memories" => delete_memories(state, identity, arguments).await,
        "delete_all_memories" => delete_all_memories(state, identity, arguments).await,
        "create_attachment" => create_attachment(state, arguments).await,
        "update_attachment" => update_attachment(state, arguments).await,
        "get_attachment" => get_attachment(state, arguments).await,
        "delete_attachment" => delete_attachment(state, arguments).await,
        _ => return None,
    };
    Some(payload)
}

fn err_json(message: impl Into<String>) -> String {
    json!({"error": message.into()}).to_string()
}

/// Both identity headers, or the error payload naming the missing one.
fn require_identity(identity: &Identity) -> Result<(String, String), String> {
    let Some(user_id) = identity.user_id.clone() else {
        return Err("Error: user_id not provided".to_string());
    };
    let Some(client_name) = identity.client_name.clone() else {
        return Err("Error: client_name not provided".to_string());
    };
    Ok((user_id, client_name))
}

fn parse_uuid_arg(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|_| err_json("Invalid attachment ID format"))
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, String> {
    serde_json::from_value(arguments).map_err(|err| err_json(format!("Invalid arguments: {err}")))
}

// ── memory tools ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddMemoriesArgs {
    text: String,
    #[serde(default)]
    metadata: Value,
    attachment_text: Option<String>,
    attachment_id: Option<String>,
    infer: Option<bool>,
    extract: Option<bool>,
    deduplicate: Option<bool>,
}

async fn add_memories(state: &AppState, identity: &Identity, arguments: Value) -> String {
    let (user_id, client_name) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    let args: AddMemoriesArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let attachment_id = match args.attachment_id.as_deref().map(parse_uuid_arg).transpose() {
        Ok(id) => id,
        Err(payload) => return payload,
    };

    let add = AddRequest {
        user_id,
        app: client_name,
        text: args.text,
        metadata: args.metadata,
        infer: args.infer,
        extract: args.extract,
        deduplicate: args.deduplicate,
        attachment_text: args.attachment_text,
        attachment_id,
    };

    let outcome = match tokio::time::timeout(INGEST_TIMEOUT, state.engine.add(add)).await {
        Ok(result) => result,
        Err(_) => return "Error adding to memory: ingestion timed out".to_string(),
    };
    match outcome {
        Ok(AddOutcome::Created(records)) => {
            let results: Vec<Value> = records
                .iter()
                .map(|record| {
                    json!({
                        "id": record.id,
                        "memory": record.content,
                        "event": "ADD",
                        "metadata": record.metadata.to_value(),
                    })
                })
                .collect();
            json!({"results": results}).to_string()
        }
        Ok(AddOutcome::None { message, original_text }) => json!({
            "results": [],
            "message": message,
            "event": "NONE",
            "original_text": original_text,
        })
        .to_string(),
        Err(err) => format!("Error adding to memory: {err}"),
    }
}

#[derive(Debug, Deserialize)]
struct SearchMemoryArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    agent_id: Option<String>,
    #[serde(default)]
    include_metadata: bool,
    attachment_ids_show: Option<bool>,
    #[serde(default)]
    filters: Option<Value>,
}

fn default_limit() -> usize {
    10
}

async fn search_memory(state: &AppState, identity: &Identity, arguments: Value) -> String {
    let (user_id, client_name) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    let args: SearchMemoryArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };

    let request = SearchRequest {
        user_id,
        app: client_name,
        query: args.query,
        limit: args.limit,
        filters: args.filters,
        include_metadata: args.include_metadata,
        attachment_ids_show: args.attachment_ids_show,
        agent_id: args.agent_id,
    };
    match state.engine.search(request).await {
        Ok(results) => serde_json::to_string_pretty(&json!({"results": results}))
            .unwrap_or_else(|err| err_json(format!("Error serializing results: {err}"))),
        Err(err) => format!("Error searching memory: {err}"),
    }
}

async fn list_memories(state: &AppState, identity: &Identity) -> String {
    let (user_id, client_name) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    match state.engine.list_memories(&user_id, &client_name).await {
        Ok(memories) => {
            let entries: Vec<Value> = memories
                .iter()
                .map(|memory| {
                    json!({
                        "id": memory.id,
                        "memory": memory.content,
                        "created_at": memory.created_at.timestamp(),
                        "metadata_": memory.metadata.to_value(),
                    })
                })
                .collect();
            serde_json::to_string_pretty(&entries)
                .unwrap_or_else(|err| err_json(format!("Error serializing memories: {err}")))
        }
        Err(err) => format!("Error getting memories: {err}"),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateMemoryArgs {
    memory_id: String,
    content: String,
}

async fn update_memory(state: &AppState, identity: &Identity, arguments: Value) -> String {
    let (user_id, _) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    let args: UpdateMemoryArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let memory_id = match Uuid::parse_str(&args.memory_id) {
        Ok(id) => id,
        Err(_) => return err_json("Invalid memory ID format"),
    };
    match state
        .engine
        .update_memory_content(&user_id, memory_id, &args.content)
        .await
    {
        Ok(record) => json!({
            "success": true,
            "id": record.id,
            "content": record.content,
        })
        .to_string(),
        Err(err) => err_json(format!("Error updating memory: {err}")),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteMemoriesArgs {
    memory_ids: Vec<String>,
    #[serde(default)]
    delete_attachments: bool,
}

async fn delete_memories(state: &AppState, identity: &Identity, arguments: Value) -> String {
    let (user_id, client_name) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    let args: DeleteMemoriesArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };

    // Invalid UUIDs are skipped, matching the tolerant bulk contract.
    let mut memory_ids = Vec::with_capacity(args.memory_ids.len());
    for raw in &args.memory_ids {
        match Uuid::parse_str(raw) {
            Ok(id) => memory_ids.push(id),
            Err(_) => warn!(raw, "skipping invalid memory id in delete_memories"),
        }
    }

    let (_, app) = match state
        .engine
        .store()
        .get_or_create_user_and_app(&user_id, &client_name)
        .await
    {
        Ok(pair) => pair,
        Err(err) => return err_json(format!("Error deleting memories: {err}")),
    };

    match state
        .engine
        .delete_memories(&user_id, &memory_ids, args.delete_attachments, Some(app.id))
        .await
    {
        Ok(deleted) => json!({
            "success": true,
            "message": format!("Successfully deleted {deleted} memories"),
        })
        .to_string(),
        Err(err) => err_json(format!("Error deleting memories: {err}")),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteAllArgs {
    #[serde(default)]
    delete_attachments: bool,
}

async fn delete_all_memories(state: &AppState, identity: &Identity, arguments: Value) -> String {
    let (user_id, client_name) = match require_identity(identity) {
        Ok(pair) => pair,
        Err(payload) => return payload,
    };
    let args: DeleteAllArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    match state
        .engine
        .delete_all_memories(&user_id, &client_name, args.delete_attachments)
        .await
    {
        Ok(_) => "Successfully deleted all memories".to_string(),
        Err(err) => format!("Error deleting memories: {err}"),
    }
}

// ── attachment tools ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateAttachmentArgs {
    content: String,
    attachment_id: Option<String>,
}

async fn create_attachment(state: &AppState, arguments: Value) -> String {
    let args: CreateAttachmentArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let id = match args.attachment_id.as_deref().map(parse_uuid_arg).transpose() {
        Ok(id) => id,
        Err(payload) => return payload,
    };
    match state.engine.create_attachment(id, &args.content).await {
        Ok(record) => json!({
            "success": true,
            "id": record.id,
            "content": record.content,
            "created_at": record.created_at.to_rfc3339(),
            "updated_at": record.updated_at.to_rfc3339(),
        })
        .to_string(),
        Err(err) => err_json(format!("Error creating attachment: {err}")),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateAttachmentArgs {
    attachment_id: String,
    content: String,
}

async fn update_attachment(state: &AppState, arguments: Value) -> String {
    let args: UpdateAttachmentArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let id = match parse_uuid_arg(&args.attachment_id) {
        Ok(id) => id,
        Err(payload) => return payload,
    };
    match state.engine.update_attachment(id, &args.content).await {
        Ok(record) => json!({
            "success": true,
            "id": record.id,
            "content": record.content,
            "created_at": record.created_at.to_rfc3339(),
            "updated_at": record.updated_at.to_rfc3339(),
        })
        .to_string(),
        Err(err) => err_json(format!("Error updating attachment: {err}")),
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentIdArgs {
    attachment_id: String,
}

async fn get_attachment(state: &AppState, arguments: Value) -> String {
    let args: AttachmentIdArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let id = match parse_uuid_arg(&args.attachment_id) {
        Ok(id) => id,
        Err(payload) => return payload,
    };
    match state.engine.store().get_attachment(id).await {
        Ok(Some(record)) => json!({
            "id": record.id,
            "content": record.content,
            "created_at": record.created_at.to_rfc3339(),
            "updated_at": record.updated_at.to_rfc3339(),
        })
        .to_string(),
        Ok(None) => err_json("Attachment not found"),
        Err(err) => err_json(format!("Error getting attachment: {err}")),
    }
}

async fn delete_attachment(state: &AppState, arguments: Value) -> String {
    let args: AttachmentIdArgs = match parse_args(arguments) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let id = match parse_uuid_arg(&args.attachment_id) {
        Ok(id) => id,
        Err(payload) => return payload,
    };
    match state.engine.delete_attachment(id).await {
        Ok(true) => json!({
            "success": true,
            "message": format!("Attachment {id} deleted"),
        })
        .to_string(),
        Ok(false) => json!({
            "success": true,
            "message": "Attachment not found (idempotent)",
        })
        .to_string(),
        Err(err) => err_json(format!("Error deleting attachment: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use engram_engine::MemoryEngine;
    use engram_llm::HttpLlmClient;
    use engram_store::MetadataStore;
    use engram_vector::QdrantStore;
    use std::sync::Arc;

    /// State whose vector/LLM gateways exist but are never reached by the
    /// paths under test.
    async fn offline_state() -> Result<AppState> {
        let store = MetadataStore::in_memory().await?;
        let settings = engram_config::Settings::default();
        let vector = Arc::new(QdrantStore::new(&settings.vector, settings.llm.embedding_dims));
        let llm = Arc::new(HttpLlmClient::from_settings(&settings.llm));
        Ok(AppState::new(Arc::new(MemoryEngine::new(store, vector, llm))))
    }

    #[test]
    fn tool_list_carries_all_ten_tools() {
        let names: Vec<String> = tool_list()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap().to_string())
            .collect();
        for expected in [
            "add_memories",
            "search_memory",
            "list_memories",
            "update_memory",
            "delete_memories",
            "delete_all_memories",
            "create_attachment",
            "update_attachment",
            "get_attachment",
            "delete_attachment",
        ] {
            assert!(names.contains(&expected.to_string()), "missing tool {expected}");
        }
    }

    #[tokio::test]
    async fn missing_identity_headers_yield_error_payloads() -> Result<()> {
        let state = offline_state().await?;

        let no_identity = Identity::default();
        let payload = dispatch(&state, &no_identity, "add_memories", json!({"text": "x"}))
            .await
            .unwrap();
        assert_eq!(payload, "Error: user_id not provided");

        let half_identity = Identity { user_id: Some("alice".into()), client_name: None };
        let payload = dispatch(&state, &half_identity, "search_memory", json!({"query": "x"}))
            .await
            .unwrap();
        assert_eq!(payload, "Error: client_name not provided");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_is_signalled_to_the_rpc_layer() -> Result<()> {
        let state = offline_state().await?;
        let identity = Identity::default();
        assert!(dispatch(&state, &identity, "no_such_tool", json!({})).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn attachment_tools_work_without_identity_and_without_vector_store() -> Result<()> {
        let state = offline_state().await?;
        let identity = Identity::default();

        let created = dispatch(
            &state,
            &identity,
            "create_attachment",
            json!({"content": "standalone blob"}),
        )
        .await
        .unwrap();
        let created: Value = serde_json::from_str(&created)?;
        assert_eq!(created["success"], true);
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = dispatch(&state, &identity, "get_attachment", json!({"attachment_id": id}))
            .await
            .unwrap();
        let fetched: Value = serde_json::from_str(&fetched)?;
        assert_eq!(fetched["content"], "standalone blob");

        // Idempotent delete, twice.
        for _ in 0..2 {
            let deleted = dispatch(
                &state,
                &identity,
                "delete_attachment",
                json!({"attachment_id": fetched["id"]}),
            )
            .await
            .unwrap();
            let deleted: Value = serde_json::from_str(&deleted)?;
            assert_eq!(deleted["success"], true);
        }
        Ok(())
    }

    #[tokio::test]
    async fn invalid_attachment_uuid_is_an_error_payload() -> Result<()> {
        let state = offline_state().await?;
        let payload = dispatch(
            &state,
            &Identity::default(),
            "get_attachment",
            json!({"attachment_id": "not-a-uuid"}),
        )
        .await
        .unwrap();
        let value: Value = serde_json::from_str(&payload)?;
        assert_eq!(value["error"], "Invalid attachment ID format");
        Ok(())
    }
}
