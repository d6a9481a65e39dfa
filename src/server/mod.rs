//! JSON-RPC 2.0 serving — shared handler for both transports.
//!
//! One [`Handler`] answers `initialize`, `tools/list`, `tools/call`,
//! `prompts/list`, `resources/list`, `embed_texts` and `embed_single`
//! for the stdio and SSE transports alike.  Transport-level failures
//! (bad JSON, unknown method) become JSON-RPC error objects; tool
//! failures stay inside an OK response whose result is a canonical
//! envelope with `isError: true`, so the LLM can always continue its
//! turn without transport-level error handling.

pub mod sse;
pub mod stdio;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::embed::Embedder;
use crate::kernel::Kernel;

/// Advertised protocol revision.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent on notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC error codes used by the transports.
pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ── Handler ─────────────────────────────────────────────────

pub struct Handler {
    kernel: Arc<Kernel>,
    embedder: Arc<dyn Embedder>,
}

impl Handler {
    pub fn new(kernel: Arc<Kernel>, embedder: Arc<dyn Embedder>) -> Self {
        Self { kernel, embedder }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Answer one request.  `cancel` scopes any tool call it triggers to
    /// the calling session.
    pub async fn handle_request(&self, req: RpcRequest, cancel: &CancellationToken) -> RpcResponse {
        let id = req.id.clone().unwrap_or(Value::Null);
        debug!(method = %req.method, "request");

        match req.method.as_str() {
            "initialize" => RpcResponse::ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": { "listChanged": true },
                        "prompts": {},
                        "resources": {},
                    },
                    "serverInfo": {
                        "name": "skilld",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),

            "tools/list" => {
                let tools = self.kernel.list_tools();
                RpcResponse::ok(id, json!({ "tools": tools }))
            }

            "tools/call" => {
                let Some(name) = req.params.get("name").and_then(Value::as_str) else {
                    return RpcResponse::err(id, INVALID_PARAMS, "missing tool `name`");
                };
                let arguments = req
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let envelope = self
                    .kernel
                    .execute_tool_with(name, arguments, None, cancel)
                    .await;
                // Success OR handled failure: always an OK response whose
                // result is the canonical envelope.
                RpcResponse::ok(id, serde_json::to_value(envelope).unwrap_or(Value::Null))
            }

            "prompts/list" => RpcResponse::ok(id, json!({ "prompts": [] })),
            "resources/list" => RpcResponse::ok(id, json!({ "resources": [] })),

            // Thin pass-throughs to the embedder; the blocking call runs
            // on a worker thread so the event loop never stalls.
            "embed_texts" => {
                let Some(texts) = req.params.get("texts").and_then(Value::as_array) else {
                    return RpcResponse::err(id, INVALID_PARAMS, "missing `texts` array");
                };
                let texts: Vec<String> = texts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                let embedder = Arc::clone(&self.embedder);
                match tokio::task::spawn_blocking(move || embedder.embed_batch(&texts)).await {
                    Ok(Ok(vecs)) => RpcResponse::ok(id, json!({ "embeddings": vecs })),
                    Ok(Err(e)) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                    Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                }
            }

            "embed_single" => {
                let Some(text) = req.params.get("text").and_then(Value::as_str) else {
                    return RpcResponse::err(id, INVALID_PARAMS, "missing `text`");
                };
                let text = text.to_string();
                let embedder = Arc::clone(&self.embedder);
                match tokio::task::spawn_blocking(move || embedder.embed(&text)).await {
                    Ok(Ok(vec)) => RpcResponse::ok(id, json!({ "embedding": vec })),
                    Ok(Err(e)) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                    Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                }
            }

            other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method: {other}")),
        }
    }

    /// Client→server notifications need no answer; today they are all
    /// acknowledged by ignoring them.
    pub fn handle_notification(&self, method: &str, _params: Value) {
        debug!(method, "notification received");
    }
}

// ── Tests ───────────────────────────────────────────────────
