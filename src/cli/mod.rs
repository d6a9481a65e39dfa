//! Runtime wiring and CLI subcommand implementations.
//!
//! [`Runtime::build`] assembles the process singletons — store, indexer,
//! router, kernel, chunk engine, notification hub — with explicit
//! construction so tests stay hermetic.  The subcommands (`sync`,
//! `reindex`, `route`, `run`, `health`, `serve`) are thin drivers over
//! that wiring.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::NotificationHub;
use crate::chunk::ChunkEngine;
use crate::config::Settings;
use crate::embed::{Embedder, HttpEmbedder, StaticEmbedder};
use crate::index::indexer::{spawn_worker, EmbedCache, Indexer};
use crate::index::RoutingStore;
use crate::kernel::invoke::FnInvoker;
use crate::kernel::{CommandMeta, Kernel};
use crate::router::{AuditSink, IntentMode, Router};
use crate::scanner;
use crate::server::{sse, stdio, Handler};

/// Queue depth in front of the indexer; the backpressure high-water mark.
const INDEX_QUEUE_DEPTH: usize = 64;

/// Process singletons, built once per invocation.
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub store: Arc<RoutingStore>,
    pub embedder: Arc<dyn Embedder>,
    pub indexer: Arc<Indexer>,
    pub router: Arc<Router>,
    pub kernel: Arc<Kernel>,
    pub chunk: Arc<ChunkEngine>,
    pub hub: NotificationHub,
    pub cancel: CancellationToken,
}

impl Runtime {
    /// Wire the runtime.  Failure to open the index directory is fatal.
    pub fn build(settings: Settings) -> anyhow::Result<Runtime> {
        let settings = Arc::new(settings);
        let data_dir = settings.data_dir();
        let cache_dir = settings.cache_dir();

        let store = Arc::new(
            RoutingStore::open(&data_dir.join("routing.db"), settings.index.compact_threshold)
                .context("failed to open routing index")?,
        );

        let embedder: Arc<dyn Embedder> = if settings.embedder.endpoint.is_some() {
            Arc::new(HttpEmbedder::new(
                &settings.embedder,
                settings.embedder_api_key(),
            )?)
        } else {
            warn!("no embedder endpoint configured; using deterministic fallback");
            Arc::new(StaticEmbedder::new(settings.index.embedding_dimension))
        };

        let cache = match EmbedCache::open(&cache_dir.join("embeddings.db")) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "embedding cache unavailable; continuing without");
                None
            }
        };
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            cache,
            settings.paths.skills_root.clone(),
        ));

        let audit = if settings.router.audit {
            match AuditSink::open(&data_dir.join("router_audit.db")) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(error = %e, "route audit sink unavailable");
                    None
                }
            }
        } else {
            None
        };
        let router = Arc::new(Router::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            settings.router.clone(),
            audit,
        ));

        let cancel = CancellationToken::new();
        let kernel = Arc::new(Kernel::new(&settings, cancel.clone()));
        let chunk = Arc::new(ChunkEngine::new(settings.chunk.clone()));
        register_chunked_tool(&kernel, &chunk);
        register_router_tool(&kernel, &router, settings.router.limits.candidate_limit);

        Ok(Runtime {
            settings,
            store,
            embedder,
            indexer,
            router,
            kernel,
            chunk,
            hub: NotificationHub::new(),
            cancel,
        })
    }

    /// Scan the skills root and populate the kernel registry.
    pub fn load_skills(&self) -> usize {
        let skills = scanner::scan_all(&self.settings.paths.skills_root);
        self.kernel.load_from_scan(&skills);
        skills.len()
    }
}

/// Expose the chunked workflow engine as a regular tool so it flows
/// through the same dispatch, envelope, and error-kind machinery.
fn register_chunked_tool(kernel: &Arc<Kernel>, chunk: &Arc<ChunkEngine>) {
    let engine = Arc::clone(chunk);
    kernel.register_command(
        CommandMeta {
            name: "chunked.process".into(),
            skill_name: "chunked".into(),
            description: "Deliver large payloads in batches: start / batch / synthesize / auto_complete"
                .into(),
            category: "workflow".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["start", "batch", "synthesize", "auto_complete"]},
                    "workflow_type": {"type": "string"},
                    "payload": {"type": "string"},
                    "batch_size": {"type": "integer"},
                    "session_id": {"type": "string"},
                    "batch_index": {"type": "integer"},
                },
                "required": ["action"],
                "additionalProperties": false,
            }),
            is_async: true,
        },
        vec![],
        Arc::new(FnInvoker::from_fn(move |args| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_action(args).await }
        })),
    );
}

/// Expose the router as a tool so an LLM can resolve natural-language
/// requests into candidate commands over `tools/call`.
fn register_router_tool(kernel: &Arc<Kernel>, router: &Arc<Router>, default_limit: usize) {
    let router = Arc::clone(router);
    kernel.register_command(
        CommandMeta {
            name: "router.route".into(),
            skill_name: "router".into(),
            description: "Resolve a natural-language request into ranked command candidates"
                .into(),
            category: "routing".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "intent": {"type": "string", "enum": ["exact", "semantic", "hybrid"]},
                    "limit": {"type": "integer"},
                    "context": {"type": "string"},
                },
                "required": ["query"],
                "additionalProperties": false,
            }),
            is_async: true,
        },
        vec![],
        Arc::new(FnInvoker::from_fn(move |args| {
            let router = Arc::clone(&router);
            async move {
                let query = args
                    .get("query")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let intent = args
                    .get("intent")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("hybrid")
                    .parse::<IntentMode>()
                    .unwrap_or_default();
                let limit = args
                    .get("limit")
                    .and_then(serde_json::Value::as_u64)
                    .map(|v| v as usize)
                    .unwrap_or(default_limit);
                let context = args
                    .get("context")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                // The route path embeds synchronously; keep it off the
                // event loop.
                let plan = tokio::task::spawn_blocking(move || {
                    router.route(&query, intent, limit, context.as_deref())
                })
                .await
                .map_err(|e| crate::error::KernelError::Internal(e.to_string()))??;
                serde_json::to_value(plan)
                    .map_err(|e| crate::error::KernelError::Internal(e.to_string()))
            }
        })),
    );
}

// ── Subcommands ─────────────────────────────────────────────

/// `sync` — rebuild the routing index from disk.
pub async fn cmd_sync(settings: Settings) -> anyhow::Result<()> {
    let runtime = Runtime::build(settings)?;
    let indexer = Arc::clone(&runtime.indexer);
    let rows = tokio::task::spawn_blocking(move || indexer.sync_all())
        .await?
        .map_err(|e| anyhow::anyhow!(e))?;
    let health = runtime.store.health().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("indexed {rows} command(s); {} row(s) live", health.row_count);
    Ok(())
}

/// `reindex <path>` — single-file reindex.
pub async fn cmd_reindex(settings: Settings, path: &Path) -> anyhow::Result<()> {
    let runtime = Runtime::build(settings)?;
    let indexer = Arc::clone(&runtime.indexer);
    let path = path.to_path_buf();
    let rows = tokio::task::spawn_blocking(move || indexer.reindex_file(&path))
        .await?
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("reindexed {rows} command(s)");
    Ok(())
}

/// `route <query>` — diagnostic: print the route plan.
pub async fn cmd_route(settings: Settings, query: &str, intent: IntentMode) -> anyhow::Result<()> {
    let runtime = Runtime::build(settings)?;
    let router = Arc::clone(&runtime.router);
    let query = query.to_string();
    let limit = runtime.settings.router.limits.candidate_limit;
    let plan = tokio::task::spawn_blocking(move || router.route(&query, intent, limit, None))
        .await?
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// `run <skill>.<cmd> <json-args>` — one-shot dispatch.
pub async fn cmd_run(settings: Settings, name: &str, args_json: &str) -> anyhow::Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(args_json).context("arguments must be valid JSON")?;
    let runtime = Runtime::build(settings)?;
    runtime.load_skills();
    let envelope = runtime.kernel.execute_tool(name, args, None).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if envelope.is_error {
        std::process::exit(1);
    }
    Ok(())
}

/// `health` — index health and query metrics.
pub async fn cmd_health(settings: Settings) -> anyhow::Result<()> {
    let runtime = Runtime::build(settings)?;
    let health = runtime.store.health().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let metrics = runtime.store.query_metrics();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "health": health,
            "query_metrics": metrics,
        }))?
    );
    Ok(())
}

/// `serve` — start the runtime: kernel, watcher, janitor, transport.
pub async fn cmd_serve(
    settings: Settings,
    config_path: PathBuf,
    sse_addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let runtime = Runtime::build(settings)?;
    let skills = runtime.load_skills();
    info!(
        skills,
        commands = runtime.kernel.command_count(),
        "skill registry loaded"
    );

    // Index what is on disk before accepting traffic.
    {
        let indexer = Arc::clone(&runtime.indexer);
        match tokio::task::spawn_blocking(move || indexer.sync_all()).await? {
            Ok(rows) => info!(rows, "startup index sync complete"),
            Err(e) => warn!(error = %e, "startup index sync failed; serving stale index"),
        }
    }

    let (index_tx, _index_worker) = spawn_worker(Arc::clone(&runtime.indexer), INDEX_QUEUE_DEPTH);
    let _watcher = crate::watcher::spawn(
        runtime.settings.paths.skills_root.clone(),
        Arc::clone(&runtime.kernel),
        index_tx,
        runtime.hub.clone(),
    )?;
    let _janitor = ChunkEngine::spawn_janitor(Arc::clone(&runtime.chunk));

    let handler = Arc::new(Handler::new(
        Arc::clone(&runtime.kernel),
        Arc::clone(&runtime.embedder),
    ));

    // SIGHUP re-reads the config file and swaps the alias map in place.
    #[cfg(unix)]
    {
        let kernel = Arc::clone(&runtime.kernel);
        let config_path = config_path.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                match Settings::load(&config_path) {
                    Ok(fresh) => kernel.reload_aliases(fresh.aliases),
                    Err(e) => warn!(error = %e, "SIGHUP reload failed; keeping old aliases"),
                }
            }
        });
    }

    match sse_addr {
        Some(addr) => {
            // Ctrl-C → cancel → graceful drain.
            let kernel = Arc::clone(&runtime.kernel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received Ctrl-C, shutting down");
                    kernel.shutdown(Duration::from_secs(10)).await;
                }
            });
            sse::serve(sse::SseState::new(handler, runtime.hub.clone()), addr).await?;
        }
        None => {
            stdio::serve(handler, runtime.hub.clone()).await?;
            runtime.kernel.shutdown(Duration::from_secs(5)).await;
        }
    }
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(tmp: &Path) -> Settings {
        let yaml = format!(
            "paths:\n  skills_root: {}\n  data_dir: {}\n  cache_dir: {}\n",
            tmp.join("skills").display(),
            tmp.join("data").display(),
            tmp.join("cache").display(),
        );
        serde_yaml_ng::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn build_wires_singletons() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
        let runtime = Runtime::build(settings(tmp.path())).unwrap();
        // The chunked tool is always registered.
        assert!(runtime
            .kernel
            .list_tools()
            .iter()
            .any(|t| t.name == "chunked.process"));
        assert_eq!(runtime.load_skills(), 0);
    }

    #[tokio::test]
    async fn chunked_tool_round_trips_through_kernel() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
        let runtime = Runtime::build(settings(tmp.path())).unwrap();

        let started = runtime
            .kernel
            .execute_tool(
                "chunked.process",
                json!({"action": "start", "payload": "hello world", "batch_size": 5}),
                None,
            )
            .await;
        assert!(!started.is_error);
        let body: serde_json::Value = serde_json::from_str(started.first_text()).unwrap();
        assert_eq!(body["batch_count"], 3);
        assert_eq!(body["batch"], "hello");
    }
}
