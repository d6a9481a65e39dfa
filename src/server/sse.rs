//! SSE transport — one long-lived stream per session.
//!
//! `GET /sse` opens an `event: message` stream of JSON-RPC messages and
//! announces the companion endpoint; `POST /messages?session_id=…`
//! receives client→server requests whose responses are correlated over
//! the stream by id.  Each session owns a bounded queue: when a client
//! reads too slowly the oldest queued messages are dropped and counted.
//! A client disconnect cancels that session's in-flight tool calls.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::bus::NotificationHub;
use crate::server::{Handler, RpcRequest, RpcResponse, INVALID_PARAMS, PARSE_ERROR};

/// Per-session outbound queue depth.  The broadcast channel drops the
/// oldest entries for lagging receivers, which is exactly the policy the
/// transport wants.
const SESSION_QUEUE: usize = 64;

struct SseSession {
    tx: broadcast::Sender<String>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct SseState {
    handler: Arc<Handler>,
    hub: NotificationHub,
    sessions: Arc<Mutex<HashMap<String, Arc<SseSession>>>>,
}

impl SseState {
    pub fn new(handler: Arc<Handler>, hub: NotificationHub) -> Self {
        Self {
            handler,
            hub,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("sessions poisoned").len()
    }
}

/// Build the SSE router.
pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/sse", get(sse_stream))
        .route("/messages", post(post_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the kernel's cancel token fires.
pub async fn serve(state: SseState, addr: SocketAddr) -> anyhow::Result<()> {
    let cancel = state.handler.kernel().cancel_token().clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "sse transport listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Removes the session and cancels its in-flight calls when the client's
/// stream goes away.
struct SessionGuard {
    id: String,
    sessions: Arc<Mutex<HashMap<String, Arc<SseSession>>>>,
    cancel: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.sessions
            .lock()
            .expect("sessions poisoned")
            .remove(&self.id);
        debug!(session_id = %self.id, "sse session closed");
    }
}

async fn sse_stream(State(state): State<SseState>) -> impl IntoResponse {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = broadcast::channel::<String>(SESSION_QUEUE);
    let cancel = state.handler.kernel().cancel_token().child_token();
    let dropped = Arc::new(AtomicU64::new(0));

    let session = Arc::new(SseSession {
        tx: tx.clone(),
        cancel: cancel.clone(),
        dropped: Arc::clone(&dropped),
    });
    state
        .sessions
        .lock()
        .expect("sessions poisoned")
        .insert(session_id.clone(), session);

    // Pump hub notifications into this session's queue.
    let mut hub_rx = state.hub.subscribe();
    let pump_tx = tx.clone();
    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pump_cancel.cancelled() => break,
                next = hub_rx.recv() => match next {
                    Ok(n) => {
                        let _ = pump_tx.send(n.to_json().to_string());
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    });

    info!(session_id = %session_id, "sse session opened");
    let guard = SessionGuard {
        id: session_id.clone(),
        sessions: Arc::clone(&state.sessions),
        cancel,
    };

    let stream = async_stream::stream! {
        // Announce the companion endpoint first, then relay messages.
        let _guard = guard;
        yield Ok::<Event, Infallible>(
            Event::default()
                .event("endpoint")
                .data(format!("/messages?session_id={session_id}")),
        );
        let mut rx = rx;
        loop {
            match rx.recv().await {
                Ok(message) => {
                    yield Ok(Event::default().event("message").data(message));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Drop-oldest policy: count and keep streaming.
                    dropped.fetch_add(missed, Ordering::Relaxed);
                    warn!(session_id = %session_id, missed, "slow sse client dropped notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    let session = state
        .sessions
        .lock()
        .expect("sessions poisoned")
        .get(&query.session_id)
        .cloned();
    let Some(session) = session else {
        return (
            axum::http::StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session_id"})),
        );
    };

    let req: RpcRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            let resp = RpcResponse::err(Value::Null, PARSE_ERROR, format!("bad JSON-RPC: {e}"));
            let _ = session
                .tx
                .send(serde_json::to_string(&resp).unwrap_or_default());
            return (
                axum::http::StatusCode::ACCEPTED,
                Json(json!({"status": "accepted"})),
            );
        }
    };

    if req.id.is_none() {
        state.handler.handle_notification(&req.method, req.params);
        return (
            axum::http::StatusCode::ACCEPTED,
            Json(json!({"status": "accepted"})),
        );
    }

    if req.method.is_empty() {
        let resp = RpcResponse::err(Value::Null, INVALID_PARAMS, "missing method");
        let _ = session
            .tx
            .send(serde_json::to_string(&resp).unwrap_or_default());
        return (
            axum::http::StatusCode::ACCEPTED,
            Json(json!({"status": "accepted"})),
        );
    }

    // Answer over the stream, in completion order.
    let handler = Arc::clone(&state.handler);
    tokio::spawn(async move {
        let resp = handler.handle_request(req, &session.cancel).await;
        if let Ok(line) = serde_json::to_string(&resp) {
            let _ = session.tx.send(line);
        }
    });

    (
        axum::http::StatusCode::ACCEPTED,
        Json(json!({"status": "accepted"})),
    )
}
