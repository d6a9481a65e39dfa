//! stdio transport — newline-framed JSON-RPC 2.0.
//!
//! Requests are read from stdin in arrival order; responses go back in
//! completion order (each carries its originating id), so a slow tool
//! call never blocks the line.  Notifications are one-way writes with
//! newline termination, flushed immediately.  Logging goes to stderr so
//! stdout stays a clean protocol channel.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::NotificationHub;
use crate::server::{Handler, RpcRequest, RpcResponse, PARSE_ERROR};

/// Serve the handler over stdin/stdout until EOF.
pub async fn serve(handler: Arc<Handler>, hub: NotificationHub) -> anyhow::Result<()> {
    let (write_tx, mut write_rx) = mpsc::channel::<String>(256);

    // Single writer lane: every outbound message is one line, flushed.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = write_rx.recv().await {
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    // Broadcast fan-in: hub notifications become one-way writes.
    let notify_tx = write_tx.clone();
    let mut hub_rx = hub.subscribe();
    let notifier = tokio::spawn(async move {
        loop {
            match hub_rx.recv().await {
                Ok(n) => {
                    let line = n.to_json().to_string();
                    if notify_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "stdio notification stream lagged");
                }
                Err(_) => break,
            }
        }
    });

    let cancel = handler.kernel().cancel_token().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) if req.id.is_none() => {
                handler.handle_notification(&req.method, req.params);
            }
            Ok(req) => {
                // Completion-order responses: each request gets its own task.
                let handler = Arc::clone(&handler);
                let write_tx = write_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let resp = handler.handle_request(req, &cancel).await;
                    if let Ok(json) = serde_json::to_string(&resp) {
                        let _ = write_tx.send(json).await;
                    }
                });
            }
            Err(e) => {
                let resp =
                    RpcResponse::err(serde_json::Value::Null, PARSE_ERROR, format!("bad JSON: {e}"));
                if let Ok(json) = serde_json::to_string(&resp) {
                    let _ = write_tx.send(json).await;
                }
            }
        }
    }

    debug!("stdin closed; stdio transport shutting down");
    drop(write_tx);
    notifier.abort();
    let _ = writer.await;
    Ok(())
}
