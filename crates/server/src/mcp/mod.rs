//! MCP surface: JSON-RPC 2.0 over a single streamable-http endpoint.
//!
//! Stateless: each POST carries one request and receives one
//! SSE-framed JSON-RPC response.  Identity rides in on the `X-User-Id` and
//! `X-Client-Name` headers; a missing header surfaces as an error payload
//! inside the tool result, never as a transport fault.

pub mod tools;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::state::AppState;

pub const SERVER_NAME: &str = "engram-mcp-server";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Request-scoped identity extracted by the middleware.  Tool handlers
/// receive it as a parameter; callers never repeat identity per call.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub client_name: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/mcp", post(handle_jsonrpc))
        .layer(middleware::from_fn(identity_middleware))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

async fn identity_middleware(mut req: Request, next: Next) -> Response {
    let identity = Identity {
        user_id: header_string(req.headers(), "X-User-Id"),
        client_name: header_string(req.headers(), "X-Client-Name"),
    };
    req.extensions_mut().insert(identity);
    next.run(req).await
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    /// Absent for notifications, which get acknowledged without a body.
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

async fn handle_jsonrpc(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<JsonRpcRequest>,
) -> Response {
    let Some(id) = req.id else {
        debug!(method = %req.method, "acknowledging notification");
        return StatusCode::ACCEPTED.into_response();
    };

    let body = match req.method.as_str() {
        "initialize" => jsonrpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
            }),
        ),
        "ping" => jsonrpc_result(id, json!({})),
        "tools/list" => jsonrpc_result(id, json!({"tools": tools::tool_list()})),
        "tools/call" => {
            let name = req
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = req.params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match tools::dispatch(&state, &identity, &name, arguments).await {
                Some(text) => jsonrpc_result(
                    id,
                    json!({"content": [{"type": "text", "text": text}], "isError": false}),
                ),
                None => jsonrpc_error(id, -32602, format!("Unknown tool: {name}")),
            }
        }
        other => jsonrpc_error(id, -32601, format!("Method not found: {other}")),
    };

    sse_response(&body)
}

pub(crate) fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub(crate) fn jsonrpc_error(id: Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// One SSE frame carrying the whole JSON-RPC response on a single `data:`
/// line.
pub(crate) fn sse_response(body: &Value) -> Response {
    let frame = format!("data: {body}\n\n");
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        frame,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_is_a_single_data_line() {
        let body = jsonrpc_result(json!(1), json!({"ok": true}));
        let frame = format!("data: {body}\n\n");
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert_eq!(frame.matches("data:").count(), 1);
    }

    #[test]
    fn error_body_carries_code_and_message() {
        let body = jsonrpc_error(json!(7), -32601, "Method not found: nope".to_string());
        assert_eq!(body["id"], 7);
        assert_eq!(body["error"]["code"], -32601);
    }
}
