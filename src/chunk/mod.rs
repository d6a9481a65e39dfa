//! Chunked workflow engine — stateful delivery of large payloads.
//!
//! One tool, three client-driven phases selected by an `action` argument:
//! `start` stores the payload and returns the first batch, `batch`
//! returns one batch by index (appending a digest to the session
//! accumulator), `synthesize` folds the accumulator through the
//! workflow's synthesis function and destroys the session.  An
//! `auto_complete` action runs the whole sequence server-side and
//! returns only the summary.
//!
//! Sessions are keyed by server-generated ids with per-key locks and a
//! mandatory idle TTL.  `total_batches` and the payload are immutable
//! after `start`; only the cursor, accumulator and status mutate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ChunkConfig;
use crate::error::{KernelError, KernelResult};

/// Characters of each batch quoted into its accumulator digest.
const DIGEST_PREVIEW_CHARS: usize = 120;

/// One-way session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    InProgress,
    Synthesized,
    Expired,
}

struct ChunkSession {
    workflow_type: String,
    created_at: Instant,
    last_touch: Instant,
    batch_size: usize,
    total_batches: usize,
    cursor: usize,
    payload: String,
    accumulator: Vec<String>,
    status: SessionStatus,
}

impl ChunkSession {
    /// Character-exact batch slice; concatenating all batches reproduces
    /// the payload byte-for-byte.
    fn batch_at(&self, index: usize) -> Option<String> {
        if index >= self.total_batches {
            return None;
        }
        Some(
            self.payload
                .chars()
                .skip(index * self.batch_size)
                .take(self.batch_size)
                .collect(),
        )
    }
}

/// Synthesis function: `(workflow_type, accumulator) → summary`.
pub type SynthesisFn = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

fn default_synthesis(workflow_type: &str, accumulated: &[String]) -> String {
    let mut out = format!(
        "{} synthesis over {} batch(es):\n",
        workflow_type,
        accumulated.len()
    );
    for digest in accumulated {
        out.push_str("- ");
        out.push_str(digest);
        out.push('\n');
    }
    out
}

pub struct ChunkEngine {
    sessions: Mutex<HashMap<String, Arc<Mutex<ChunkSession>>>>,
    cfg: ChunkConfig,
    synthesizers: Mutex<HashMap<String, SynthesisFn>>,
}

impl ChunkEngine {
    pub fn new(cfg: ChunkConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cfg,
            synthesizers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a synthesis function for a workflow type.  Workflows
    /// without one fall back to the default digest join.
    pub async fn register_synthesis(&self, workflow_type: &str, f: SynthesisFn) {
        self.synthesizers
            .lock()
            .await
            .insert(workflow_type.to_string(), f);
    }

    // ── Actions ─────────────────────────────────────────────

    /// `action = "start"`: store the payload, return the first batch.
    pub async fn start(
        &self,
        workflow_type: &str,
        payload: String,
        batch_size: Option<usize>,
    ) -> KernelResult<Value> {
        let batch_size = batch_size.unwrap_or(self.cfg.batch_size_default).max(1);
        let char_count = payload.chars().count();
        let total_batches = char_count.div_ceil(batch_size).max(1);

        let session = ChunkSession {
            workflow_type: workflow_type.to_string(),
            created_at: Instant::now(),
            last_touch: Instant::now(),
            batch_size,
            total_batches,
            cursor: 0,
            payload,
            accumulator: Vec::new(),
            status: SessionStatus::Started,
        };
        let first = session.batch_at(0).unwrap_or_default();
        let session_id = uuid::Uuid::new_v4().to_string();

        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));

        info!(
            session_id = %session_id,
            workflow = workflow_type,
            batches = total_batches,
            chars = char_count,
            "chunked session started"
        );
        Ok(json!({
            "session_id": session_id,
            "batch_count": total_batches,
            "batch": first,
        }))
    }

    /// `action = "batch"`: one batch by index, digest appended.
    pub async fn batch(&self, session_id: &str, batch_index: usize) -> KernelResult<Value> {
        let session = self.lookup(session_id).await?;
        let mut guard = session.lock().await;
        guard.last_touch = Instant::now();

        let batch = guard
            .batch_at(batch_index)
            .ok_or(KernelError::InvalidBatchIndex {
                index: batch_index,
                total: guard.total_batches,
            })?;

        if guard.status == SessionStatus::Started {
            guard.status = SessionStatus::InProgress;
        }
        guard.cursor = batch_index;
        let digest = format!(
            "batch {batch_index}: {} chars: {}",
            batch.chars().count(),
            crate::truncate_chars(&batch, DIGEST_PREVIEW_CHARS),
        );
        guard.accumulator.push(digest);

        Ok(json!({
            "session_id": session_id,
            "batch_index": batch_index,
            "batch": batch,
        }))
    }

    /// `action = "synthesize"`: fold the accumulator and destroy the
    /// session.
    pub async fn synthesize(&self, session_id: &str) -> KernelResult<Value> {
        let session = self.lookup(session_id).await?;
        let (summary, age_s, last_cursor) = {
            let mut guard = session.lock().await;
            guard.status = SessionStatus::Synthesized;
            let age_s = guard.created_at.elapsed().as_secs();
            let last_cursor = guard.cursor;
            let synth = self
                .synthesizers
                .lock()
                .await
                .get(&guard.workflow_type)
                .cloned();
            let summary = match synth {
                Some(f) => f(&guard.workflow_type, &guard.accumulator),
                None => default_synthesis(&guard.workflow_type, &guard.accumulator),
            };
            (summary, age_s, last_cursor)
        };
        // Completion destroys the session.
        self.sessions.lock().await.remove(session_id);
        debug!(
            session_id,
            age_s, last_cursor, "chunked session synthesized and removed"
        );

        Ok(json!({
            "session_id": session_id,
            "summary": summary,
        }))
    }

    /// Server-side fast path: walk every batch, synthesize, return only
    /// the summary.  No session survives the call.
    pub async fn auto_complete(
        &self,
        workflow_type: &str,
        payload: String,
        batch_size: Option<usize>,
    ) -> KernelResult<Value> {
        let started = self.start(workflow_type, payload, batch_size).await?;
        let session_id = started["session_id"].as_str().unwrap_or_default().to_string();
        let total = started["batch_count"].as_u64().unwrap_or(0) as usize;
        for index in 0..total {
            self.batch(&session_id, index).await?;
        }
        self.synthesize(&session_id).await
    }

    /// Single-tool dispatch surface: `{action, ...}` arguments.
    pub async fn handle_action(&self, args: Value) -> KernelResult<Value> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("start");
        let batch_size = args
            .get("batch_size")
            .and_then(Value::as_u64)
            .map(|v| v as usize);
        let workflow = args
            .get("workflow_type")
            .and_then(Value::as_str)
            .unwrap_or("digest");

        match action {
            "start" => {
                let payload = args
                    .get("payload")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::InvalidArguments {
                        tool: "chunked".into(),
                        reason: "start requires `payload`".into(),
                    })?
                    .to_string();
                self.start(workflow, payload, batch_size).await
            }
            "batch" => {
                let session_id = require_session_id(&args)?;
                let index = args
                    .get("batch_index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| KernelError::InvalidArguments {
                        tool: "chunked".into(),
                        reason: "batch requires `batch_index`".into(),
                    })? as usize;
                self.batch(&session_id, index).await
            }
            "synthesize" => {
                let session_id = require_session_id(&args)?;
                self.synthesize(&session_id).await
            }
            "auto_complete" => {
                let payload = args
                    .get("payload")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KernelError::InvalidArguments {
                        tool: "chunked".into(),
                        reason: "auto_complete requires `payload`".into(),
                    })?
                    .to_string();
                self.auto_complete(workflow, payload, batch_size).await
            }
            other => Err(KernelError::InvalidArguments {
                tool: "chunked".into(),
                reason: format!("unknown action `{other}`"),
            }),
        }
    }

    // ── Eviction ────────────────────────────────────────────

    /// Drop sessions idle past the TTL.  Returns how many were evicted.
    pub async fn evict_expired(&self) -> usize {
        let ttl = Duration::from_secs(self.cfg.ttl_seconds);
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            let guard = session.lock().await;
            if guard.last_touch.elapsed() > ttl {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sessions.remove(id);
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "chunked sessions expired");
        }
        expired.len()
    }

    /// Spawn the periodic TTL janitor.
    pub fn spawn_janitor(engine: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(engine.cfg.ttl_seconds.clamp(1, 60));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                engine.evict_expired().await;
            }
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn lookup(&self, session_id: &str) -> KernelResult<Arc<Mutex<ChunkSession>>> {
        if session_id.is_empty() {
            return Err(KernelError::SessionRequired);
        }
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| KernelError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }
}

fn require_session_id(args: &Value) -> KernelResult<String> {
    args.get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(KernelError::SessionRequired)
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(ttl_seconds: u64) -> ChunkEngine {
        ChunkEngine::new(ChunkConfig {
            batch_size_default: 10_000,
            ttl_seconds,
        })
    }

    #[tokio::test]
    async fn round_trip_reconstructs_payload() {
        let engine = engine(60);
        let payload = "x".repeat(25_000) + "tail";
        let started = engine
            .start("digest", payload.clone(), Some(10_000))
            .await
            .unwrap();
        let sid = started["session_id"].as_str().unwrap().to_string();
        let total = started["batch_count"].as_u64().unwrap() as usize;
        assert_eq!(total, 3);

        let mut rebuilt = String::new();
        for i in 0..total {
            let resp = engine.batch(&sid, i).await.unwrap();
            rebuilt.push_str(resp["batch"].as_str().unwrap());
        }
        assert_eq!(rebuilt, payload);
    }

    #[tokio::test]
    async fn round_trip_with_multibyte_payload() {
        let engine = engine(60);
        let payload = "héllo wörld 🦀 ".repeat(100);
        let started = engine
            .start("digest", payload.clone(), Some(37))
            .await
            .unwrap();
        let sid = started["session_id"].as_str().unwrap().to_string();
        let total = started["batch_count"].as_u64().unwrap() as usize;

        let mut rebuilt = String::new();
        for i in 0..total {
            let resp = engine.batch(&sid, i).await.unwrap();
            rebuilt.push_str(resp["batch"].as_str().unwrap());
        }
        assert_eq!(rebuilt, payload);
    }

    #[tokio::test]
    async fn start_returns_first_batch() {
        let engine = engine(60);
        let started = engine
            .start("digest", "abcdefgh".into(), Some(3))
            .await
            .unwrap();
        assert_eq!(started["batch"], "abc");
        assert_eq!(started["batch_count"], 3);
    }

    #[tokio::test]
    async fn out_of_range_index_is_invalid() {
        let engine = engine(60);
        let started = engine.start("digest", "abc".into(), Some(10)).await.unwrap();
        let sid = started["session_id"].as_str().unwrap();
        let err = engine.batch(sid, 5).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_batch_index");
    }

    #[tokio::test]
    async fn missing_and_unknown_sessions_are_distinct_errors() {
        let engine = engine(60);
        assert_eq!(
            engine.batch("", 0).await.unwrap_err().kind(),
            "session_required"
        );
        assert_eq!(
            engine.batch("nope", 0).await.unwrap_err().kind(),
            "session_not_found"
        );
    }

    #[tokio::test]
    async fn synthesize_references_all_batches_and_destroys() {
        let engine = engine(60);
        let payload = "a".repeat(30_000);
        let started = engine
            .start("summary", payload, Some(10_000))
            .await
            .unwrap();
        let sid = started["session_id"].as_str().unwrap().to_string();
        for i in 0..3 {
            engine.batch(&sid, i).await.unwrap();
        }
        let out = engine.synthesize(&sid).await.unwrap();
        let summary = out["summary"].as_str().unwrap();
        assert!(summary.contains("batch 0"));
        assert!(summary.contains("batch 1"));
        assert!(summary.contains("batch 2"));

        // Completion destroys the session.
        assert_eq!(
            engine.batch(&sid, 0).await.unwrap_err().kind(),
            "session_not_found"
        );
        assert_eq!(engine.session_count().await, 0);
    }

    #[tokio::test]
    async fn auto_complete_walks_server_side() {
        let engine = engine(60);
        let out = engine
            .auto_complete("summary", "z".repeat(2500), Some(1000))
            .await
            .unwrap();
        let summary = out["summary"].as_str().unwrap();
        assert!(summary.contains("3 batch(es)"));
        assert_eq!(engine.session_count().await, 0);
    }

    #[tokio::test]
    async fn custom_synthesis_function_is_used() {
        let engine = engine(60);
        engine
            .register_synthesis(
                "upper",
                Arc::new(|wf, acc| format!("{}:{}", wf.to_uppercase(), acc.len())),
            )
            .await;
        let out = engine
            .auto_complete("upper", "abcdef".into(), Some(2))
            .await
            .unwrap();
        assert_eq!(out["summary"], "UPPER:3");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_evicts_idle_sessions() {
        let engine = engine(1);
        let started = engine.start("digest", "abc".into(), None).await.unwrap();
        let sid = started["session_id"].as_str().unwrap().to_string();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(engine.evict_expired().await, 1);
        assert_eq!(
            engine.batch(&sid, 0).await.unwrap_err().kind(),
            "session_not_found"
        );
    }

    #[tokio::test]
    async fn handle_action_dispatches() {
        let engine = engine(60);
        let started = engine
            .handle_action(json!({"action": "start", "payload": "hello world", "batch_size": 5}))
            .await
            .unwrap();
        let sid = started["session_id"].as_str().unwrap();
        let batch = engine
            .handle_action(json!({"action": "batch", "session_id": sid, "batch_index": 1}))
            .await
            .unwrap();
        assert_eq!(batch["batch"], " worl");
        let err = engine
            .handle_action(json!({"action": "frobnicate"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }
}
