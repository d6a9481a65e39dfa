//! Indexer — turns scanner output into routing rows.
//!
//! Three entry points, all idempotent at (skill, file) granularity:
//! `index_file`, `reindex_file` (delete-by-source then index), and
//! `remove_file`.  Embeddings are fetched in one batched call per file;
//! a failed batch leaves the index untouched.  A checksum cache keyed by
//! the embedding source text's hash skips re-embedding unchanged content
//! across restarts.
//!
//! All mutation funnels through this type — it owns the store's single
//! write lane.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::embed::Embedder;
use crate::error::{KernelError, KernelResult, StoreResult};
use crate::index::{vector_to_blob, blob_to_vector, RoutingRow, RoutingStore};
use crate::scanner::{self, SkillMetadata, ToolRecord};

// ── Checksum cache ──────────────────────────────────────────

/// Embedding checksum cache, persisted under the cache dir.
pub struct EmbedCache {
    conn: Mutex<Connection>,
}

impl EmbedCache {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::StoreError::Migration(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS embedding_cache (
                content_hash TEXT PRIMARY KEY,
                embedding    BLOB NOT NULL,
                dim          INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(&self, content_hash: &str) -> StoreResult<Option<Vec<f32>>> {
        let conn = self.conn.lock().expect("embed cache poisoned");
        let mut stmt =
            conn.prepare("SELECT embedding, dim FROM embedding_cache WHERE content_hash = ?1")?;
        let mut rows = stmt.query_map(params![content_hash], |row| {
            let blob: Vec<u8> = row.get(0)?;
            let dim: i64 = row.get(1)?;
            Ok(blob_to_vector(&blob, dim as usize))
        })?;
        Ok(rows.next().transpose()?)
    }

    fn put(&self, content_hash: &str, embedding: &[f32]) -> StoreResult<()> {
        let conn = self.conn.lock().expect("embed cache poisoned");
        conn.execute(
            "INSERT INTO embedding_cache (content_hash, embedding, dim)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(content_hash) DO UPDATE SET embedding=?2, dim=?3",
            params![content_hash, vector_to_blob(embedding), embedding.len() as i64],
        )?;
        Ok(())
    }
}

// ── Indexer ─────────────────────────────────────────────────

pub struct Indexer {
    store: Arc<RoutingStore>,
    embedder: Arc<dyn Embedder>,
    cache: Option<EmbedCache>,
    skills_root: PathBuf,
    /// Serializes every mutation against the store.
    write_lane: Mutex<()>,
}

impl Indexer {
    pub fn new(
        store: Arc<RoutingStore>,
        embedder: Arc<dyn Embedder>,
        cache: Option<EmbedCache>,
        skills_root: PathBuf,
    ) -> Self {
        Self {
            store,
            embedder,
            cache,
            skills_root,
            write_lane: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<RoutingStore> {
        &self.store
    }

    pub fn skills_root(&self) -> &Path {
        &self.skills_root
    }

    /// Index every command in `path`.  One batched embed call; the store
    /// transaction commits all rows or none.
    pub fn index_file(&self, path: &Path) -> KernelResult<usize> {
        let (metadata, records) = self.scan(path)?;
        if records.is_empty() {
            debug!(path = %path.display(), "no tagged commands in file");
            return Ok(0);
        }
        let rows = self.rows_with_embeddings(&metadata, &records)?;

        let _lane = self.write_lane.lock().expect("write lane poisoned");
        self.store.upsert(&rows)?;
        info!(path = %path.display(), rows = rows.len(), "indexed");
        Ok(rows.len())
    }

    /// Delete everything sourced from `path`, then re-index it.  Rows
    /// whose commands disappeared from the file stay gone.
    pub fn reindex_file(&self, path: &Path) -> KernelResult<usize> {
        let (metadata, records) = self.scan(path)?;
        let rows = if records.is_empty() {
            Vec::new()
        } else {
            self.rows_with_embeddings(&metadata, &records)?
        };

        let _lane = self.write_lane.lock().expect("write lane poisoned");
        let removed = self.store.delete_by_source(&path.to_string_lossy())?;
        if !rows.is_empty() {
            self.store.upsert(&rows)?;
        }
        info!(
            path = %path.display(),
            removed = removed.len(),
            rows = rows.len(),
            "reindexed"
        );
        Ok(rows.len())
    }

    /// Delete every row sourced from `path`.
    pub fn remove_file(&self, path: &Path) -> KernelResult<Vec<String>> {
        let _lane = self.write_lane.lock().expect("write lane poisoned");
        let removed = self.store.delete_by_source(&path.to_string_lossy())?;
        if !removed.is_empty() {
            info!(path = %path.display(), removed = removed.len(), "rows removed");
        }
        Ok(removed)
    }

    /// Full rebuild from disk: index every scanned file and drop rows
    /// whose source no longer exists.
    pub fn sync_all(&self) -> KernelResult<usize> {
        let skills = scanner::scan_all(&self.skills_root);
        let mut live_ids = Vec::new();
        let mut total = 0usize;

        for skill in &skills {
            let mut by_file: Vec<(&Path, Vec<&ToolRecord>)> = Vec::new();
            for tool in &skill.tools {
                live_ids.push(tool.canonical_name());
                match by_file.iter_mut().find(|(p, _)| *p == tool.source_path) {
                    Some((_, bucket)) => bucket.push(tool),
                    None => by_file.push((&tool.source_path, vec![tool])),
                }
            }
            for (path, bucket) in by_file {
                let records: Vec<ToolRecord> = bucket.into_iter().cloned().collect();
                match self.rows_with_embeddings(&skill.metadata, &records) {
                    Ok(rows) => {
                        let _lane = self.write_lane.lock().expect("write lane poisoned");
                        self.store.upsert(&rows)?;
                        total += rows.len();
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "file skipped during sync");
                    }
                }
            }
        }

        // Dead rows: present in the index, absent on disk.
        let dead: Vec<String> = self
            .store
            .all_ids()?
            .into_iter()
            .filter(|id| !live_ids.contains(id))
            .collect();
        if !dead.is_empty() {
            let _lane = self.write_lane.lock().expect("write lane poisoned");
            self.store.delete(&dead)?;
            info!(dead = dead.len(), "stale rows dropped during sync");
        }

        info!(skills = skills.len(), rows = total, "full sync complete");
        Ok(total)
    }

    // ── Internals ───────────────────────────────────────────

    fn scan(&self, path: &Path) -> KernelResult<(SkillMetadata, Vec<ToolRecord>)> {
        let skill_name = scanner::skill_for_path(&self.skills_root, path).ok_or_else(|| {
            KernelError::Internal(format!(
                "{} is not under a skill's scripts tree",
                path.display()
            ))
        })?;
        let metadata = scanner::scan_metadata(&self.skills_root, &skill_name)
            .ok_or_else(|| KernelError::Internal(format!("skill '{skill_name}' has no manifest")))?;
        let records = scanner::scan_source_file(path, &metadata)
            .map_err(|e| KernelError::Internal(e.to_string()))?;
        Ok((metadata, records))
    }

    /// Build routing rows for one file, embedding missing texts in a
    /// single batched call.
    fn rows_with_embeddings(
        &self,
        metadata: &SkillMetadata,
        records: &[ToolRecord],
    ) -> KernelResult<Vec<RoutingRow>> {
        let intents = metadata.intents.join("\n");
        let keywords = metadata.routing_keywords.join(" ");

        let texts: Vec<String> = records
            .iter()
            .map(|r| {
                RoutingRow::embedding_text(&r.canonical_name(), &r.description, &intents)
            })
            .collect();

        // Cache lookup first; embed only the misses, in one batch.
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let cached = self
                .cache
                .as_ref()
                .and_then(|c| c.get(&scanner::content_hash(text.as_bytes())).ok().flatten());
            if cached.is_none() {
                misses.push(i);
            }
            embeddings.push(cached);
        }

        if !misses.is_empty() {
            let batch: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.embedder.embed_batch(&batch)?;
            for (&i, vec) in misses.iter().zip(fresh.into_iter()) {
                if let Some(cache) = &self.cache {
                    let key = scanner::content_hash(texts[i].as_bytes());
                    if let Err(e) = cache.put(&key, &vec) {
                        warn!(error = %e, "embedding cache write failed");
                    }
                }
                embeddings[i] = Some(vec);
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        Ok(records
            .iter()
            .zip(embeddings.into_iter())
            .map(|(record, embedding)| RoutingRow {
                id: record.canonical_name(),
                tool_name: record.canonical_name(),
                intents: intents.clone(),
                keywords: keywords.clone(),
                description: record.description.clone(),
                category: record.category.clone(),
                source_path: record.source_path.to_string_lossy().into_owned(),
                file_hash: record.file_hash.clone(),
                updated_at: now.clone(),
                embedding: embedding.unwrap_or_default(),
            })
            .collect())
    }
}

// ── Async work queue ────────────────────────────────────────

/// Operations accepted by the indexer worker.
#[derive(Debug, Clone)]
pub enum IndexOp {
    Index(PathBuf),
    Reindex(PathBuf),
    Remove(PathBuf),
}

/// Spawn the single-lane indexer worker.
///
/// The bounded channel is the backpressure point: when the embedder is
/// slow the queue fills and senders (the watcher) wait — events are
/// delayed, never dropped.
pub fn spawn_worker(
    indexer: Arc<Indexer>,
    capacity: usize,
) -> (mpsc::Sender<IndexOp>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<IndexOp>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let indexer = Arc::clone(&indexer);
            let result = tokio::task::spawn_blocking(move || match &op {
                IndexOp::Index(p) => indexer.index_file(p).map(|_| ()),
                IndexOp::Reindex(p) => indexer.reindex_file(p).map(|_| ()),
                IndexOp::Remove(p) => indexer.remove_file(p).map(|_| ()),
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "index operation failed"),
                Err(e) => warn!(error = %e, "index worker task panicked"),
            }
        }
        debug!("indexer worker stopped (channel closed)");
    });
    (tx, handle)
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::StaticEmbedder;

    const MANIFEST: &str = r#"---
name: git
description: Version control operations
metadata:
  version: 1.0.0
  routing_keywords: [git, vcs]
  intents: ["commit my changes"]
---
body
"#;

    const TOOLS: &str = r#"
@skill_command(category="git", description="Show working tree status")
def status():
    """Show working tree status."""

@skill_command(category="git", description="Commit staged changes")
def commit(message: str):
    """Commit staged changes."""
"#;

    fn fixture() -> (tempfile::TempDir, Arc<Indexer>) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("git/scripts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(tmp.path().join("git/SKILL.md"), MANIFEST).unwrap();
        std::fs::write(dir.join("tools.py"), TOOLS).unwrap();

        let store = Arc::new(RoutingStore::in_memory().unwrap());
        let indexer = Arc::new(Indexer::new(
            store,
            Arc::new(StaticEmbedder::new(64)),
            Some(EmbedCache::in_memory().unwrap()),
            tmp.path().to_path_buf(),
        ));
        (tmp, indexer)
    }

    #[test]
    fn index_file_writes_rows_with_current_hash() {
        let (tmp, indexer) = fixture();
        let path = tmp.path().join("git/scripts/tools.py");
        assert_eq!(indexer.index_file(&path).unwrap(), 2);

        let hits = indexer.store().search_keyword("status", 10).unwrap();
        assert_eq!(hits[0].id, "git.status");
        let expected = scanner::content_hash(&std::fs::read(&path).unwrap());
        assert_eq!(hits[0].file_hash, expected);
    }

    #[test]
    fn reindex_drops_vanished_commands() {
        let (tmp, indexer) = fixture();
        let path = tmp.path().join("git/scripts/tools.py");
        indexer.index_file(&path).unwrap();
        assert_eq!(indexer.store().all_ids().unwrap().len(), 2);

        // Rewrite the file with only one command left.
        std::fs::write(
            &path,
            "@skill_command(category=\"git\", description=\"Show status\")\ndef status():\n    pass\n",
        )
        .unwrap();
        indexer.reindex_file(&path).unwrap();
        assert_eq!(indexer.store().all_ids().unwrap(), vec!["git.status"]);
    }

    #[test]
    fn remove_file_deletes_rows() {
        let (tmp, indexer) = fixture();
        let path = tmp.path().join("git/scripts/tools.py");
        indexer.index_file(&path).unwrap();
        let removed = indexer.remove_file(&path).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(indexer.store().all_ids().unwrap().is_empty());
    }

    #[test]
    fn sync_all_drops_stale_rows() {
        let (tmp, indexer) = fixture();
        // Seed a stale row whose source never existed on disk.
        indexer
            .store()
            .upsert(&[RoutingRow {
                id: "ghost.cmd".into(),
                tool_name: "ghost.cmd".into(),
                intents: String::new(),
                keywords: String::new(),
                description: String::new(),
                category: "general".into(),
                source_path: "/nowhere.py".into(),
                file_hash: "x".into(),
                updated_at: chrono::Utc::now().to_rfc3339(),
                embedding: vec![1.0],
            }])
            .unwrap();

        indexer.sync_all().unwrap();
        let ids = indexer.store().all_ids().unwrap();
        assert_eq!(ids, vec!["git.commit", "git.status"]);
        drop(tmp);
    }

    #[test]
    fn checksum_cache_skips_reembedding() {
        struct CountingEmbedder {
            inner: StaticEmbedder,
            calls: std::sync::atomic::AtomicUsize,
        }
        impl Embedder for CountingEmbedder {
            fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
                self.calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                self.inner.embed_batch(texts)
            }
            fn dimension(&self) -> Option<usize> {
                self.inner.dimension()
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("git/scripts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(tmp.path().join("git/SKILL.md"), MANIFEST).unwrap();
        std::fs::write(dir.join("tools.py"), TOOLS).unwrap();

        let embedder = Arc::new(CountingEmbedder {
            inner: StaticEmbedder::new(32),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cache = EmbedCache::in_memory().unwrap();
        let indexer = Indexer::new(
            Arc::new(RoutingStore::in_memory().unwrap()),
            embedder.clone(),
            Some(cache),
            tmp.path().to_path_buf(),
        );

        let path = tmp.path().join("git/scripts/tools.py");
        indexer.index_file(&path).unwrap();
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Unchanged content: the second pass is served from the cache.
        indexer.reindex_file(&path).unwrap();
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn embed_failure_leaves_index_untouched() {
        struct FailingEmbedder;
        impl Embedder for FailingEmbedder {
            fn embed_batch(&self, _texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
                Err(KernelError::EmbedderUnavailable("down".into()))
            }
            fn dimension(&self) -> Option<usize> {
                None
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("git/scripts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(tmp.path().join("git/SKILL.md"), MANIFEST).unwrap();
        std::fs::write(dir.join("tools.py"), TOOLS).unwrap();

        let indexer = Indexer::new(
            Arc::new(RoutingStore::in_memory().unwrap()),
            Arc::new(FailingEmbedder),
            None,
            tmp.path().to_path_buf(),
        );

        let path = tmp.path().join("git/scripts/tools.py");
        let err = indexer.index_file(&path).unwrap_err();
        assert_eq!(err.kind(), "embedder_unavailable");
        assert!(indexer.store().all_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_processes_queue_in_order() {
        let (tmp, indexer) = fixture();
        let path = tmp.path().join("git/scripts/tools.py");
        let (tx, handle) = spawn_worker(Arc::clone(&indexer), 8);

        tx.send(IndexOp::Index(path.clone())).await.unwrap();
        tx.send(IndexOp::Remove(path.clone())).await.unwrap();
        tx.send(IndexOp::Index(path.clone())).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(indexer.store().all_ids().unwrap().len(), 2);
    }
}
