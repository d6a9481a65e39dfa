//! Hybrid routing index — one row per command.
//!
//! SQLite-backed store exposing two co-located retrieval modes:
//! BM25 keyword search over four weighted text columns (tool_name=5,
//! intents=4, keywords=3, description=1; category stored but never
//! queried) and cosine nearest-neighbour over dense embedding blobs.
//!
//! The store is the single authority on row identity: everything else in
//! the runtime addresses rows only by their `id`
//! (`<skill>.<function>`).  Writes are serialized through the indexer's
//! write lane; reads take short critical sections; compaction may block
//! writes but never readers for long.

pub mod indexer;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

/// BM25 column weights: tool_name, intents, keywords, description.
const BM25_WEIGHTS: &str = "5.0, 4.0, 3.0, 1.0";

/// One row written to the routing index.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingRow {
    /// Primary key, `<skill>.<function>`.
    pub id: String,
    pub tool_name: String,
    /// Natural-language intent phrases, newline-joined.
    pub intents: String,
    /// Routing keywords, space-joined.
    pub keywords: String,
    pub description: String,
    /// Stored, never queried.
    pub category: String,
    pub source_path: String,
    pub file_hash: String,
    pub updated_at: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl RoutingRow {
    /// The fixed embedding source template.  Pre-computed indexes stay
    /// compatible across versions only because this never changes.
    pub fn embedding_text(tool_name: &str, description: &str, intents: &str) -> String {
        format!("{tool_name}. {description}. intents: {intents}")
    }
}

/// Stable result shape for both retrieval modes.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub id: String,
    pub score: f64,
    pub tool_name: String,
    pub intents: String,
    pub keywords: String,
    pub description: String,
    pub category: String,
    pub source_path: String,
    pub file_hash: String,
}

/// Index health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub row_count: usize,
    pub fragment_count: usize,
    pub fragmentation_ratio: f64,
    pub recommendations: Vec<String>,
}

/// Rolling search counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryMetrics {
    pub keyword_searches: u64,
    pub vector_searches: u64,
    pub total_keyword_micros: u64,
    pub total_vector_micros: u64,
}

#[derive(Default)]
struct MetricCells {
    keyword_searches: AtomicU64,
    vector_searches: AtomicU64,
    keyword_micros: AtomicU64,
    vector_micros: AtomicU64,
}

/// The hybrid routing store.
pub struct RoutingStore {
    conn: Mutex<Connection>,
    metrics: MetricCells,
    /// Bumped on every mutation; the route cache keys on it.
    generation: AtomicU64,
    compact_threshold: f64,
}

impl RoutingStore {
    /// Open (or create) the routing database at `path`.
    pub fn open(path: &Path, compact_threshold: f64) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, compact_threshold)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, 0.3)
    }

    fn with_connection(conn: Connection, compact_threshold: f64) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS commands (
                id          TEXT PRIMARY KEY,
                tool_name   TEXT NOT NULL,
                intents     TEXT NOT NULL DEFAULT '',
                keywords    TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                category    TEXT NOT NULL DEFAULT 'general',
                source_path TEXT NOT NULL,
                file_hash   TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commands_source ON commands(source_path);",
        )?;

        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS commands_fts USING fts5(
                tool_name, intents, keywords, description,
                content='commands',
                content_rowid='rowid'
            );",
        )?;

        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS commands_ai AFTER INSERT ON commands BEGIN
                INSERT INTO commands_fts(rowid, tool_name, intents, keywords, description)
                VALUES (new.rowid, new.tool_name, new.intents, new.keywords, new.description);
            END;
            CREATE TRIGGER IF NOT EXISTS commands_ad AFTER DELETE ON commands BEGIN
                INSERT INTO commands_fts(commands_fts, rowid, tool_name, intents, keywords, description)
                VALUES ('delete', old.rowid, old.tool_name, old.intents, old.keywords, old.description);
            END;
            CREATE TRIGGER IF NOT EXISTS commands_au AFTER UPDATE ON commands BEGIN
                INSERT INTO commands_fts(commands_fts, rowid, tool_name, intents, keywords, description)
                VALUES ('delete', old.rowid, old.tool_name, old.intents, old.keywords, old.description);
                INSERT INTO commands_fts(rowid, tool_name, intents, keywords, description)
                VALUES (new.rowid, new.tool_name, new.intents, new.keywords, new.description);
            END;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS command_embeddings (
                id        TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                dim       INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            metrics: MetricCells::default(),
            generation: AtomicU64::new(0),
            compact_threshold,
        })
    }

    // ── Mutation ────────────────────────────────────────────

    /// Insert or replace rows atomically.  All rows land or none do.
    pub fn upsert(&self, rows: &[RoutingRow]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("routing store poisoned");
        let tx = conn.transaction()?;
        for row in rows {
            // DELETE + INSERT keeps the FTS triggers simple and avoids the
            // UPDATE trigger path entirely.
            tx.execute("DELETE FROM commands WHERE id = ?1", params![row.id])?;
            tx.execute(
                "INSERT INTO commands
                     (id, tool_name, intents, keywords, description, category,
                      source_path, file_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.id,
                    row.tool_name,
                    row.intents,
                    row.keywords,
                    row.description,
                    row.category,
                    row.source_path,
                    row.file_hash,
                    row.updated_at,
                ],
            )?;
            tx.execute(
                "INSERT INTO command_embeddings (id, embedding, dim)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET embedding=?2, dim=?3",
                params![row.id, vector_to_blob(&row.embedding), row.embedding.len() as i64],
            )?;
        }
        tx.commit()?;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete rows by id.
    pub fn delete(&self, ids: &[String]) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("routing store poisoned");
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM commands WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM command_embeddings WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete every row whose source file is `path`.  Returns the ids
    /// that were removed.
    pub fn delete_by_source(&self, path: &str) -> StoreResult<Vec<String>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().expect("routing store poisoned");
            let mut stmt =
                conn.prepare("SELECT id FROM commands WHERE source_path = ?1")?;
            let rows = stmt.query_map(params![path], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        if !ids.is_empty() {
            self.delete(&ids)?;
        }
        Ok(ids)
    }

    // ── Retrieval ───────────────────────────────────────────

    /// BM25 keyword search over the four text columns.
    ///
    /// Raw BM25 scores are negative (more negative = better); they come
    /// back normalized into (0, 1], best first.
    pub fn search_keyword(&self, query: &str, k: usize) -> StoreResult<Vec<Hit>> {
        let started = Instant::now();
        let fts_query = sanitize_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().expect("routing store poisoned");
        let sql = format!(
            "SELECT c.id, c.tool_name, c.intents, c.keywords, c.description,
                    c.category, c.source_path, c.file_hash,
                    bm25(commands_fts, {BM25_WEIGHTS}) AS rank
             FROM commands_fts f
             JOIN commands c ON c.rowid = f.rowid
             WHERE commands_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![fts_query, k as i64], |row| {
            Ok((
                Hit {
                    id: row.get(0)?,
                    score: 0.0,
                    tool_name: row.get(1)?,
                    intents: row.get(2)?,
                    keywords: row.get(3)?,
                    description: row.get(4)?,
                    category: row.get(5)?,
                    source_path: row.get(6)?,
                    file_hash: row.get(7)?,
                },
                row.get::<_, f64>(8)?,
            ))
        })?;

        let mut scored: Vec<(Hit, f64)> = rows.collect::<Result<_, _>>()?;
        let max_abs = scored
            .iter()
            .map(|(_, s)| s.abs())
            .fold(0.0f64, f64::max);
        let hits = scored
            .iter_mut()
            .map(|(hit, bm25)| {
                hit.score = if max_abs > 0.0 { bm25.abs() / max_abs } else { 0.0 };
                hit.clone()
            })
            .collect();

        self.metrics.keyword_searches.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .keyword_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(hits)
    }

    /// Cosine nearest-neighbour over the embedding column, best first.
    ///
    /// `filter` restricts candidates to one stored category.
    pub fn search_vector(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> StoreResult<Vec<Hit>> {
        let started = Instant::now();
        let conn = self.conn.lock().expect("routing store poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.id, c.tool_name, c.intents, c.keywords, c.description,
                    c.category, c.source_path, c.file_hash, e.embedding, e.dim
             FROM command_embeddings e
             JOIN commands c ON c.id = e.id
             WHERE (?1 IS NULL OR c.category = ?1)",
        )?;
        let rows = stmt.query_map(params![filter], |row| {
            Ok((
                Hit {
                    id: row.get(0)?,
                    score: 0.0,
                    tool_name: row.get(1)?,
                    intents: row.get(2)?,
                    keywords: row.get(3)?,
                    description: row.get(4)?,
                    category: row.get(5)?,
                    source_path: row.get(6)?,
                    file_hash: row.get(7)?,
                },
                row.get::<_, Vec<u8>>(8)?,
                row.get::<_, i64>(9)? as usize,
            ))
        })?;

        let mut scored: Vec<Hit> = Vec::new();
        for row in rows {
            let (mut hit, blob, dim) = row?;
            let emb = blob_to_vector(&blob, dim);
            hit.score = cosine_similarity(query, &emb);
            scored.push(hit);
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        self.metrics.vector_searches.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .vector_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(scored)
    }

    /// Fetch one row by canonical id.
    pub fn get(&self, id: &str) -> StoreResult<Option<Hit>> {
        let conn = self.conn.lock().expect("routing store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, tool_name, intents, keywords, description, category,
                    source_path, file_hash
             FROM commands WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(Hit {
                id: row.get(0)?,
                score: 1.0,
                tool_name: row.get(1)?,
                intents: row.get(2)?,
                keywords: row.get(3)?,
                description: row.get(4)?,
                category: row.get(5)?,
                source_path: row.get(6)?,
                file_hash: row.get(7)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// All live canonical ids, sorted.
    pub fn all_ids(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().expect("routing store poisoned");
        let mut stmt = conn.prepare("SELECT id FROM commands ORDER BY id")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ── Maintenance ─────────────────────────────────────────

    /// Row count, free-page stats and a compaction recommendation.
    pub fn health(&self) -> StoreResult<HealthReport> {
        let conn = self.conn.lock().expect("routing store poisoned");
        let row_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM commands", [], |r| r.get(0))?;
        let page_count: i64 =
            conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let freelist: i64 =
            conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;

        let ratio = if page_count > 0 {
            freelist as f64 / page_count as f64
        } else {
            0.0
        };
        let mut recommendations = Vec::new();
        if ratio > self.compact_threshold {
            recommendations.push(format!(
                "fragmentation ratio {ratio:.2} exceeds {:.2}; run compact()",
                self.compact_threshold
            ));
        }
        if row_count == 0 {
            recommendations.push("index is empty; run a full sync".into());
        }

        Ok(HealthReport {
            row_count: row_count as usize,
            fragment_count: freelist as usize,
            fragmentation_ratio: ratio,
            recommendations,
        })
    }

    /// Merge FTS segments and reclaim free pages.  Blocks writers for the
    /// duration; readers queue briefly on the connection.
    pub fn compact(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("routing store poisoned");
        conn.execute(
            "INSERT INTO commands_fts(commands_fts) VALUES('optimize')",
            [],
        )?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// Search counters since process start.
    pub fn query_metrics(&self) -> QueryMetrics {
        QueryMetrics {
            keyword_searches: self.metrics.keyword_searches.load(Ordering::Relaxed),
            vector_searches: self.metrics.vector_searches.load(Ordering::Relaxed),
            total_keyword_micros: self.metrics.keyword_micros.load(Ordering::Relaxed),
            total_vector_micros: self.metrics.vector_micros.load(Ordering::Relaxed),
        }
    }

    /// Mutation generation; bumped on every upsert/delete.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

// ── Helpers ─────────────────────────────────────────────────

/// Quote each word for FTS5 with prefix matching so partial words hit.
fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            let clean: String = w
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if clean.is_empty() {
                String::new()
            } else {
                format!("\"{clean}\" OR \"{clean}\"*")
            }
        })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Serialize an f32 slice to a little-endian byte blob.
pub(crate) fn vector_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a byte blob back to an f32 vector.
pub(crate) fn blob_to_vector(blob: &[u8], dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|i| {
            let start = i * 4;
            let bytes: [u8; 4] = blob
                .get(start..start + 4)
                .and_then(|s| s.try_into().ok())
                .unwrap_or([0; 4]);
            f32::from_le_bytes(bytes)
        })
        .collect()
}

/// Cosine similarity between two vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

// ── Tests ───────────────────────────────────────────────────
