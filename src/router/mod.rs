//! Router — natural-language query → ranked command candidates.
//!
//! Runs keyword-only, vector-only, or fused hybrid retrieval over the
//! routing index, applies a deterministic metadata re-rank and a
//! confidence gate, and returns a [`RoutePlan`].  The router never
//! executes anything; dispatch belongs to the kernel.
//!
//! Fusion is Reciprocal Rank Fusion, implemented exactly once:
//! `score(id) = Σ 1/(k + rank_i(id))` with `k = 60`, stable ties on
//! insertion order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use crate::config::RouterConfig;
use crate::embed::Embedder;
use crate::error::{KernelResult, StoreResult};
use crate::index::{Hit, RoutingStore};

/// RRF rank constant.
const RRF_K: f64 = 60.0;

/// Cap on the metadata alignment boost.
const ALIGN_BOOST_CAP: f64 = 0.15;

/// Boost per aligned metadata field.
const ALIGN_BOOST_STEP: f64 = 0.05;

/// Relative top-1/top-2 gap required for high confidence.
const HIGH_CONFIDENCE_GAP: f64 = 0.2;

/// Route-cache capacity bound.
const CACHE_MAX: usize = 1000;

// ── Types ───────────────────────────────────────────────────

/// Requested retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentMode {
    Exact,
    Semantic,
    Hybrid,
}

impl Default for IntentMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl std::str::FromStr for IntentMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown intent mode: {other}")),
        }
    }
}

impl IntentMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Confidence bucket derived from the top score and the top-1/top-2 gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    None,
    Low,
    Medium,
    High,
}

/// One routed candidate.
#[derive(Debug, Clone, Serialize)]
pub struct RouteCandidate {
    pub id: String,
    pub score: f64,
    pub description: String,
    pub category: String,
}

/// Value returned to the dispatcher; lives for one dispatch only.
#[derive(Debug, Clone, Serialize)]
pub struct RoutePlan {
    pub requested_mode: String,
    /// The mode actually executed; may differ after confidence routing.
    pub selected_mode: String,
    pub reason: String,
    pub graph_hit_count: usize,
    /// Normalized top score, clamped to [0, 1].
    pub graph_confidence_score: f64,
    pub graph_confidence_level: ConfidenceLevel,
    pub candidate_limit: usize,
    pub max_sources: usize,
    pub rows_per_source: usize,
    pub candidates: Vec<RouteCandidate>,
    #[serde(default)]
    pub from_cache: bool,
}

// ── Normalization ───────────────────────────────────────────

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("url regex"))
}

/// Normalize a query: apply the config typo map word-wise, then collapse
/// URLs into short tokens so their characters stop diluting both the
/// embedding and the keyword signal while the intent marker survives.
pub fn normalize_query(query: &str, typos: &HashMap<String, String>) -> String {
    let with_urls = url_re().replace_all(query, |caps: &regex::Captures| {
        let url = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        if host.to_lowercase().contains("github") {
            " github url "
        } else {
            " url "
        }
    });

    let corrected: Vec<String> = with_urls
        .split_whitespace()
        .map(|word| {
            let key = word.to_lowercase();
            typos.get(&key).cloned().unwrap_or_else(|| word.to_string())
        })
        .collect();
    corrected.join(" ")
}

// ── Fusion ──────────────────────────────────────────────────

/// Reciprocal Rank Fusion over any number of ranked lists.
///
/// Ranks are 1-based.  Ties break on first-insertion order, so identical
/// input lists fuse to the input order unchanged.
fn rrf_fuse(lists: &[Vec<Hit>]) -> Vec<(Hit, f64)> {
    let mut order: Vec<String> = Vec::new();
    let mut fused: HashMap<String, (Hit, f64)> = HashMap::new();

    for list in lists {
        for (rank, hit) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            match fused.get_mut(&hit.id) {
                Some((_, score)) => *score += contribution,
                None => {
                    order.push(hit.id.clone());
                    fused.insert(hit.id.clone(), (hit.clone(), contribution));
                }
            }
        }
    }

    let mut out: Vec<(usize, Hit, f64)> = order
        .into_iter()
        .enumerate()
        .map(|(pos, id)| {
            let (hit, score) = fused.remove(&id).expect("fused entry");
            (pos, hit, score)
        })
        .collect();
    out.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    out.into_iter().map(|(_, hit, score)| (hit, score)).collect()
}

/// Deterministic boost for rows whose metadata aligns with the query.
///
/// +0.05 per aligned field (keywords, intents, description, category),
/// whole-word and case-insensitive, capped at +0.15.
fn alignment_boost(hit: &Hit, query_terms: &[String]) -> f64 {
    let fields = [
        &hit.keywords,
        &hit.intents,
        &hit.description,
        &hit.category,
    ];
    let mut boost = 0.0;
    for field in fields {
        let words: Vec<String> = field
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        if query_terms.iter().any(|t| words.iter().any(|w| w == t)) {
            boost += ALIGN_BOOST_STEP;
        }
        if boost >= ALIGN_BOOST_CAP {
            return ALIGN_BOOST_CAP;
        }
    }
    boost
}

// ── Audit sink ──────────────────────────────────────────────

/// Optional per-query score audit, persisted next to the routing db.
pub struct AuditSink {
    conn: Mutex<Connection>,
}

impl AuditSink {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::StoreError::Migration(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS route_audit (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                ts               TEXT NOT NULL,
                query            TEXT NOT NULL,
                requested_mode   TEXT NOT NULL,
                selected_mode    TEXT NOT NULL,
                confidence_level TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                hit_count        INTEGER NOT NULL,
                candidates       TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, query: &str, plan: &RoutePlan) -> StoreResult<()> {
        let conn = self.conn.lock().expect("audit sink poisoned");
        conn.execute(
            "INSERT INTO route_audit
                (ts, query, requested_mode, selected_mode, confidence_level,
                 confidence_score, hit_count, candidates)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chrono::Utc::now().to_rfc3339(),
                query,
                plan.requested_mode,
                plan.selected_mode,
                serde_json::to_string(&plan.graph_confidence_level)
                    .unwrap_or_default()
                    .trim_matches('"'),
                plan.graph_confidence_score,
                plan.graph_hit_count as i64,
                serde_json::to_string(&plan.candidates).unwrap_or_else(|_| "[]".into()),
            ],
        )?;
        Ok(())
    }

    /// Number of audited queries (diagnostics).
    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().expect("audit sink poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM route_audit", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

// ── Route cache ─────────────────────────────────────────────

struct CachedPlan {
    plan: RoutePlan,
    inserted: Instant,
    generation: u64,
}

// ── Router ──────────────────────────────────────────────────

pub struct Router {
    store: Arc<RoutingStore>,
    embedder: Arc<dyn Embedder>,
    cfg: RouterConfig,
    cache: Mutex<HashMap<String, CachedPlan>>,
    audit: Option<AuditSink>,
}

impl Router {
    pub fn new(
        store: Arc<RoutingStore>,
        embedder: Arc<dyn Embedder>,
        cfg: RouterConfig,
        audit: Option<AuditSink>,
    ) -> Self {
        Self {
            store,
            embedder,
            cfg,
            cache: Mutex::new(HashMap::new()),
            audit,
        }
    }

    /// Route a query.  Pure over the index snapshot; the only side
    /// effects are the cache and the audit sink.
    ///
    /// `context` (recent conversation text) participates in the metadata
    /// alignment re-rank but never in retrieval itself.
    pub fn route(
        &self,
        query: &str,
        intent: IntentMode,
        limit: usize,
        context: Option<&str>,
    ) -> KernelResult<RoutePlan> {
        let normalized = normalize_query(query, &self.cfg.normalize.typos);
        let cache_key = format!(
            "{}\u{1f}{}\u{1f}{}",
            intent.as_str(),
            normalized.to_lowercase(),
            context.unwrap_or_default().to_lowercase(),
        );

        if let Some(plan) = self.cache_get(&cache_key) {
            debug!(query = %normalized, "route served from cache");
            return Ok(plan);
        }

        let k = limit.max(self.cfg.limits.candidate_limit);
        let requested = intent.as_str().to_string();

        // Retrieval per mode.
        let keyword_hits = match intent {
            IntentMode::Semantic => Vec::new(),
            _ => self.store.search_keyword(&normalized, k)?,
        };
        let vector_hits = match intent {
            IntentMode::Exact => Vec::new(),
            _ => {
                let query_vec = self.embedder.embed(&normalized)?;
                self.store.search_vector(&query_vec, k, None)?
            }
        };

        // Fusion + normalization into a [0, 1] confidence scale.
        let (selected_mode, scored, norm): (String, Vec<(Hit, f64)>, f64) = match intent {
            IntentMode::Exact => (
                "keyword_only".into(),
                keyword_hits.iter().map(|h| (h.clone(), h.score)).collect(),
                1.0,
            ),
            IntentMode::Semantic => (
                "vector_only".into(),
                vector_hits.iter().map(|h| (h.clone(), h.score)).collect(),
                1.0,
            ),
            IntentMode::Hybrid => {
                // Downgrade when one side came back empty.
                if keyword_hits.is_empty() && !vector_hits.is_empty() {
                    (
                        "vector_only".into(),
                        vector_hits.iter().map(|h| (h.clone(), h.score)).collect(),
                        1.0,
                    )
                } else if vector_hits.is_empty() && !keyword_hits.is_empty() {
                    (
                        "keyword_only".into(),
                        keyword_hits.iter().map(|h| (h.clone(), h.score)).collect(),
                        1.0,
                    )
                } else {
                    let fused = rrf_fuse(&[vector_hits.clone(), keyword_hits.clone()]);
                    // Best possible RRF sum with two lists is 2/(k+1).
                    ("hybrid".into(), fused, 2.0 / (RRF_K + 1.0))
                }
            }
        };

        // Metadata alignment re-rank on the normalized scale.  Context
        // terms count toward alignment only.
        let alignment_text = match context {
            Some(ctx) => format!("{normalized} {ctx}"),
            None => normalized.clone(),
        };
        let query_terms: Vec<String> = alignment_text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        let mut ranked: Vec<(Hit, f64)> = scored
            .into_iter()
            .map(|(hit, score)| {
                let base = (score / norm).clamp(0.0, 1.0);
                let boost = alignment_boost(&hit, &query_terms);
                (hit, base + boost)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let graph_hit_count = ranked.len();

        // Confidence gate.
        let top = ranked.first().map(|(_, s)| *s).unwrap_or(0.0);
        let second = ranked.get(1).map(|(_, s)| *s).unwrap_or(0.0);
        let confidence_score = top.clamp(0.0, 1.0);
        let relative_gap = if top > 0.0 { (top - second) / top } else { 0.0 };
        let level = if ranked.is_empty() {
            ConfidenceLevel::None
        } else if confidence_score >= self.cfg.high_threshold && relative_gap >= HIGH_CONFIDENCE_GAP
        {
            ConfidenceLevel::High
        } else if confidence_score < self.cfg.low_threshold {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::Medium
        };

        // Budgets: rows per skill, distinct skills, total.
        let limits = &self.cfg.limits;
        let mut per_source: HashMap<String, usize> = HashMap::new();
        let mut sources: Vec<String> = Vec::new();
        let mut candidates = Vec::new();
        for (hit, score) in &ranked {
            let source = hit.id.split('.').next().unwrap_or_default().to_string();
            if !sources.contains(&source) {
                if sources.len() >= limits.max_sources {
                    continue;
                }
                sources.push(source.clone());
            }
            let seen = per_source.entry(source).or_insert(0);
            if *seen >= limits.rows_per_source {
                continue;
            }
            *seen += 1;
            candidates.push(RouteCandidate {
                id: hit.id.clone(),
                score: *score,
                description: hit.description.clone(),
                category: hit.category.clone(),
            });
            if candidates.len() >= limits.candidate_limit.min(limit.max(1)) {
                break;
            }
        }

        let reason = format!(
            "{selected_mode} retrieval: {} hit(s), confidence {:?}",
            graph_hit_count, level
        );

        let plan = RoutePlan {
            requested_mode: requested,
            selected_mode,
            reason,
            graph_hit_count,
            graph_confidence_score: confidence_score,
            graph_confidence_level: level,
            candidate_limit: limits.candidate_limit,
            max_sources: limits.max_sources,
            rows_per_source: limits.rows_per_source,
            candidates,
            from_cache: false,
        };

        if self.cfg.audit {
            if let Some(audit) = &self.audit {
                if let Err(e) = audit.append(&normalized, &plan) {
                    tracing::warn!(error = %e, "route audit append failed");
                }
            }
        }
        self.cache_put(cache_key, &plan);
        Ok(plan)
    }

    // ── Cache ───────────────────────────────────────────────

    fn cache_get(&self, key: &str) -> Option<RoutePlan> {
        if self.cfg.cache_ttl_seconds == 0 {
            return None;
        }
        let mut cache = self.cache.lock().expect("route cache poisoned");
        let entry = cache.get(key)?;
        let expired = entry.inserted.elapsed().as_secs() > self.cfg.cache_ttl_seconds;
        let stale = entry.generation != self.store.generation();
        if expired || stale {
            cache.remove(key);
            return None;
        }
        let mut plan = entry.plan.clone();
        plan.from_cache = true;
        Some(plan)
    }

    fn cache_put(&self, key: String, plan: &RoutePlan) {
        if self.cfg.cache_ttl_seconds == 0 {
            return;
        }
        let mut cache = self.cache.lock().expect("route cache poisoned");
        if cache.len() >= CACHE_MAX {
            if let Some(victim) = cache.keys().next().cloned() {
                cache.remove(&victim);
            }
        }
        cache.insert(
            key,
            CachedPlan {
                plan: plan.clone(),
                inserted: Instant::now(),
                generation: self.store.generation(),
            },
        );
    }
}

// ── Tests ───────────────────────────────────────────────────
