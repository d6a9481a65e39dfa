//! Episodic memory provider.
//!
//! Backs the context assembler's associative-recall layer: small
//! free-text episodes keyed by name, searchable by FTS5 keyword rank or
//! by cosine similarity over cached embeddings.
//!
//! Storage: `<data>/memory.db`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::index::{blob_to_vector, cosine_similarity, vector_to_blob};

/// One recalled episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub key: String,
    pub content: String,
    /// Where the episode came from (channel, skill, operator).
    pub source: String,
    pub ts: String,
    /// Relevance score, populated only in recall results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// SQLite-backed episodic store with FTS5 and embedding recall.
pub struct EpisodeStore {
    conn: Mutex<Connection>,
}

impl EpisodeStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::StoreError::Migration(e.to_string()))?;
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                key     TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                source  TEXT NOT NULL DEFAULT '',
                ts      TEXT NOT NULL
            );",
        )?;
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS episodes_fts USING fts5(
                key, content,
                content='episodes',
                content_rowid='rowid'
            );",
        )?;
        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS episodes_ai AFTER INSERT ON episodes BEGIN
                INSERT INTO episodes_fts(rowid, key, content)
                VALUES (new.rowid, new.key, new.content);
            END;
            CREATE TRIGGER IF NOT EXISTS episodes_ad AFTER DELETE ON episodes BEGIN
                INSERT INTO episodes_fts(episodes_fts, rowid, key, content)
                VALUES ('delete', old.rowid, old.key, old.content);
            END;
            CREATE TRIGGER IF NOT EXISTS episodes_au AFTER UPDATE ON episodes BEGIN
                INSERT INTO episodes_fts(episodes_fts, rowid, key, content)
                VALUES ('delete', old.rowid, old.key, old.content);
                INSERT INTO episodes_fts(rowid, key, content)
                VALUES (new.rowid, new.key, new.content);
            END;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episode_embeddings (
                key       TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                dim       INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert an episode by key.
    pub fn remember(&self, key: &str, content: &str, source: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("episode store poisoned");
        conn.execute(
            "INSERT INTO episodes (key, content, source, ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET content=?2, source=?3, ts=?4",
            params![key, content, source, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete an episode.  Returns true when a row was removed.
    pub fn forget(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("episode store poisoned");
        let n = conn.execute("DELETE FROM episodes WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM episode_embeddings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// FTS5-ranked keyword recall.
    pub fn recall(&self, query: &str, limit: usize) -> StoreResult<Vec<Episode>> {
        let fts_query = query
            .split_whitespace()
            .map(|w| {
                let clean = w.replace('"', "");
                format!("\"{clean}\" OR \"{clean}\"*")
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().expect("episode store poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.key, e.content, e.source, e.ts, rank
             FROM episodes_fts f
             JOIN episodes e ON e.rowid = f.rowid
             WHERE episodes_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
            Ok(Episode {
                key: row.get(0)?,
                content: row.get(1)?,
                source: row.get(2)?,
                ts: row.get(3)?,
                score: Some(row.get::<_, f64>(4)?.abs()),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Cosine recall over cached embeddings, best first.
    pub fn recall_semantic(&self, query_vec: &[f32], limit: usize) -> StoreResult<Vec<Episode>> {
        let conn = self.conn.lock().expect("episode store poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.key, e.content, e.source, e.ts, m.embedding, m.dim
             FROM episode_embeddings m
             JOIN episodes e ON e.key = m.key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                Episode {
                    key: row.get(0)?,
                    content: row.get(1)?,
                    source: row.get(2)?,
                    ts: row.get(3)?,
                    score: None,
                },
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, i64>(5)? as usize,
            ))
        })?;

        let mut scored: Vec<Episode> = Vec::new();
        for row in rows {
            let (mut ep, blob, dim) = row?;
            let sim = cosine_similarity(query_vec, &blob_to_vector(&blob, dim));
            ep.score = Some(sim);
            scored.push(ep);
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Cache an embedding for an episode key.
    pub fn save_embedding(&self, key: &str, embedding: &[f32]) -> StoreResult<()> {
        let conn = self.conn.lock().expect("episode store poisoned");
        conn.execute(
            "INSERT INTO episode_embeddings (key, embedding, dim)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET embedding=?2, dim=?3",
            params![key, vector_to_blob(embedding), embedding.len() as i64],
        )?;
        Ok(())
    }

    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().expect("episode store poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}
