//! Live-wire watcher — reflects skill-source changes without restart.
//!
//! Observes the skills root recursively through a debounced notify
//! watcher.  Bursts for the same path coalesce inside the debounce
//! window; a quiet period separates reindex batches so editors that save
//! via write-then-rename never produce torn reads.  Deletions win over
//! modifications because each path is evaluated against the filesystem
//! state at processing time, not at event time.
//!
//! The watcher knows nothing about transports: it updates the kernel
//! registry, feeds the indexer queue (awaiting when it is full — events
//! are delayed, never dropped), and emits `tools/listChanged` through the
//! [`NotificationHub`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{Notification, NotificationHub};
use crate::index::indexer::IndexOp;
use crate::kernel::Kernel;
use crate::scanner;

/// Debounce window for raw filesystem events.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Minimum quiet period between reindex batches.
const QUIET_PERIOD: Duration = Duration::from_millis(250);

/// Running watcher.  Dropping it stops the underlying notify watcher.
pub struct Watcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Start watching `skills_root`.
pub fn spawn(
    skills_root: PathBuf,
    kernel: Arc<Kernel>,
    index_tx: mpsc::Sender<IndexOp>,
    hub: NotificationHub,
) -> anyhow::Result<Watcher> {
    // An empty installation still gets a live watch.
    std::fs::create_dir_all(&skills_root)?;
    let (tx, rx) = mpsc::channel::<PathBuf>(1024);

    let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, move |res: DebounceEventResult| {
        match res {
            Ok(events) => {
                for DebouncedEvent { path, .. } in events {
                    // Runs on the notify thread; backpressure blocks it
                    // rather than dropping the event.
                    if tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        }
    })?;
    debouncer
        .watcher()
        .watch(&skills_root, RecursiveMode::Recursive)?;
    info!(root = %skills_root.display(), "skill watcher started");

    let task = tokio::spawn(run_loop(skills_root, kernel, index_tx, hub, rx));
    Ok(Watcher {
        _debouncer: debouncer,
        task,
    })
}

/// Drain loop: gather a batch until the quiet period elapses, then apply.
async fn run_loop(
    skills_root: PathBuf,
    kernel: Arc<Kernel>,
    index_tx: mpsc::Sender<IndexOp>,
    hub: NotificationHub,
    mut rx: mpsc::Receiver<PathBuf>,
) {
    loop {
        let first = match rx.recv().await {
            Some(p) => p,
            None => break,
        };
        let mut batch = vec![first];
        // Keep absorbing until the tree has been quiet for a while.
        loop {
            match tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
                Ok(Some(path)) => batch.push(path),
                Ok(None) => break,
                Err(_) => break, // quiet period reached
            }
        }
        process_batch(&skills_root, &kernel, &index_tx, &hub, batch).await;
    }
    debug!("watcher loop stopped (channel closed)");
}

/// Apply one coalesced batch of changed paths.
pub async fn process_batch(
    skills_root: &Path,
    kernel: &Arc<Kernel>,
    index_tx: &mpsc::Sender<IndexOp>,
    hub: &NotificationHub,
    batch: Vec<PathBuf>,
) {
    let pre_surface = kernel.surface_hash();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut scripts_changed = false;
    let mut manifests_changed = false;

    for path in batch {
        if !seen.insert(path.clone()) {
            continue; // burst coalesced to one evaluation
        }

        if path.file_name().is_some_and(|n| n == "SKILL.md") {
            manifests_changed = true;
            handle_manifest_change(skills_root, kernel, &path).await;
            continue;
        }

        if path.extension().is_some_and(|ext| ext == "py") {
            let Some(skill_name) = scanner::skill_for_path(skills_root, &path) else {
                continue;
            };
            scripts_changed = true;

            // Latest filesystem state decides: a vanished file is a
            // delete no matter what the burst contained.
            let op = if path.exists() {
                IndexOp::Reindex(path.clone())
            } else {
                IndexOp::Remove(path.clone())
            };
            if index_tx.send(op).await.is_err() {
                warn!("indexer queue closed; watcher event dropped");
                return;
            }

            // Mirror the change into the kernel registry.
            refresh_kernel_skill(skills_root, kernel, &skill_name).await;
        }
    }

    // Script mutations always announce; manifest edits only when the
    // visible surface actually moved.
    let surface_moved = kernel.surface_hash() != pre_surface;
    if scripts_changed || (manifests_changed && surface_moved) {
        hub.broadcast(Notification::tools_list_changed());
        debug!("tools/listChanged broadcast");
    }
}

async fn handle_manifest_change(skills_root: &Path, kernel: &Arc<Kernel>, path: &Path) {
    let Some(skill_name) = path
        .parent()
        .and_then(|d| d.strip_prefix(skills_root).ok())
        .and_then(|rel| rel.to_str())
        .map(str::to_string)
    else {
        return;
    };

    let root = skills_root.to_path_buf();
    let name = skill_name.clone();
    let metadata =
        tokio::task::spawn_blocking(move || scanner::scan_metadata(&root, &name)).await;
    match metadata {
        Ok(Some(meta)) => {
            debug!(skill = %skill_name, "manifest refreshed");
            kernel.update_skill_metadata(meta);
        }
        Ok(None) => {
            info!(skill = %skill_name, "manifest gone or invalid; skill disabled");
            kernel.remove_skill(&skill_name);
        }
        Err(e) => warn!(error = %e, "manifest rescan failed"),
    }
}

async fn refresh_kernel_skill(skills_root: &Path, kernel: &Arc<Kernel>, skill_name: &str) {
    let root = skills_root.to_path_buf();
    let name = skill_name.to_string();
    let scanned = tokio::task::spawn_blocking(move || scanner::scan_skill(&root, &name)).await;
    match scanned {
        Ok(Some(skill)) => kernel.update_skill(&skill),
        Ok(None) => kernel.remove_skill(skill_name),
        Err(e) => warn!(error = %e, "skill rescan failed"),
    }
}

// ── Tests ───────────────────────────────────────────────────
