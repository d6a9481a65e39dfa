use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Query normalization settings.
///
/// The typo map is purely config-driven; there is no built-in table.
/// Keys are matched word-wise and case-insensitively against the query.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NormalizeConfig {
    /// Map of misspelling → replacement applied before retrieval.
    #[serde(default)]
    pub typos: HashMap<String, String>,
}

/// Budget parameters carried into every route plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouterLimits {
    /// Maximum candidates a plan may carry.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Maximum distinct skills represented in a plan.
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    /// Maximum candidates per skill.
    #[serde(default = "default_rows_per_source")]
    pub rows_per_source: usize,
}

fn default_candidate_limit() -> usize {
    8
}
fn default_max_sources() -> usize {
    4
}
fn default_rows_per_source() -> usize {
    3
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            max_sources: default_max_sources(),
            rows_per_source: default_rows_per_source(),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub limits: RouterLimits,
    /// Confidence thresholds for the routing gate.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// When true, every routed query is appended to the score audit db.
    #[serde(default = "default_true")]
    pub audit: bool,
    /// Route-cache TTL in seconds.  `0` disables the cache.
    #[serde(default = "default_route_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_high_threshold() -> f64 {
    0.6
}
fn default_low_threshold() -> f64 {
    0.25
}
fn default_route_cache_ttl() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            normalize: NormalizeConfig::default(),
            limits: RouterLimits::default(),
            high_threshold: default_high_threshold(),
            low_threshold: default_low_threshold(),
            audit: true,
            cache_ttl_seconds: default_route_cache_ttl(),
        }
    }
}

/// Routing index configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    /// Dense vector dimension.  Discovered from the first embedder call
    /// when left at 0, otherwise enforced.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    /// Fragmentation ratio above which `health()` recommends compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: f64,
}

fn default_embedding_dimension() -> usize {
    1024
}
fn default_compact_threshold() -> f64 {
    0.3
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: default_embedding_dimension(),
            compact_threshold: default_compact_threshold(),
        }
    }
}

/// Dispatcher timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Hard upper bound for a whole tool call, in milliseconds.
    #[serde(default = "default_total_ms")]
    pub total_ms: u64,
    /// Cancel when no heartbeat arrives within this window, in milliseconds.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

fn default_total_ms() -> u64 {
    120_000
}
fn default_idle_ms() -> u64 {
    30_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            total_ms: default_total_ms(),
            idle_ms: default_idle_ms(),
        }
    }
}

/// Chunked workflow configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkConfig {
    /// Default batch size in characters when the caller omits one.
    #[serde(default = "default_batch_size")]
    pub batch_size_default: usize,
    /// Idle TTL after which a session is evicted.
    #[serde(default = "default_chunk_ttl")]
    pub ttl_seconds: u64,
}

fn default_batch_size() -> usize {
    10_000
}
fn default_chunk_ttl() -> u64 {
    1800
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            batch_size_default: default_batch_size(),
            ttl_seconds: default_chunk_ttl(),
        }
    }
}

/// Embedder endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedderConfig {
    /// Base URL of an OpenAI-compatible `/embeddings` endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model name sent with each request.
    #[serde(default)]
    pub model: Option<String>,
    /// API key (plain text or `$ENV_VAR` reference).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Retry attempts for transient failures.
    #[serde(default = "default_embed_retries")]
    pub max_retries: usize,
}

fn default_embed_retries() -> usize {
    3
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            api_key: None,
            max_retries: default_embed_retries(),
        }
    }
}

/// Context assembly configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AssembleConfig {
    /// Total token budget for one turn (chars/4 accounting).
    #[serde(default = "default_turn_budget")]
    pub turn_budget_tokens: usize,
    /// Conversational rounds the history pruner keeps intact.
    #[serde(default = "default_keep_rounds")]
    pub keep_recent_rounds: usize,
    /// Queries shorter than this skip episodic memory retrieval.
    #[serde(default = "default_memory_min_query")]
    pub memory_min_query_chars: usize,
}

fn default_turn_budget() -> usize {
    24_000
}
fn default_keep_rounds() -> usize {
    4
}
fn default_memory_min_query() -> usize {
    12
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            turn_budget_tokens: default_turn_budget(),
            keep_recent_rounds: default_keep_rounds(),
            memory_min_query_chars: default_memory_min_query(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory containing one subdirectory per skill.
    pub skills_root: PathBuf,
    /// Persistent state (routing db, audit db, sessions).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Rebuildable caches (embedding checksum cache).
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// Top-level settings tree loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub paths: PathsConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub assemble: AssembleConfig,
    /// Short name → canonical `<skill>.<function>`.  Aliases are shown in
    /// place of their targets in the exposed tool list.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Python interpreter used by the subprocess invoker.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_interpreter() -> String {
    "python3".into()
}

impl Settings {
    /// Read and parse the settings tree.
    ///
    /// A sibling `config.local.yaml` (user override) is merged on top of
    /// the base file at the YAML mapping level, so an override only needs
    /// to carry the keys it changes.
    pub fn load(path: &Path) -> anyhow::Result<Settings> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut doc: serde_yaml_ng::Value =
            serde_yaml_ng::from_str(&contents).context("failed to parse config YAML")?;

        let local = path.with_file_name("config.local.yaml");
        if local.is_file() {
            let raw = std::fs::read_to_string(&local)
                .with_context(|| format!("failed to read {}", local.display()))?;
            let overlay: serde_yaml_ng::Value =
                serde_yaml_ng::from_str(&raw).context("failed to parse config.local.yaml")?;
            merge_yaml(&mut doc, overlay);
            tracing::debug!(path = %local.display(), "applied local config overlay");
        }

        let settings: Settings =
            serde_yaml_ng::from_value(doc).context("invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks serde cannot express.
    fn validate(&self) -> anyhow::Result<()> {
        if self.timeouts.idle_ms == 0 || self.timeouts.total_ms == 0 {
            anyhow::bail!("config: timeouts must be non-zero");
        }
        if self.timeouts.idle_ms > self.timeouts.total_ms {
            anyhow::bail!(
                "config: idle_ms ({}) exceeds total_ms ({})",
                self.timeouts.idle_ms,
                self.timeouts.total_ms
            );
        }
        if self.chunk.batch_size_default == 0 {
            anyhow::bail!("config: chunk.batch_size_default must be > 0");
        }
        if self.router.low_threshold > self.router.high_threshold {
            anyhow::bail!("config: router.low_threshold exceeds high_threshold");
        }
        for (alias, target) in &self.aliases {
            if !target.contains('.') {
                anyhow::bail!(
                    "config: alias '{alias}' target '{target}' is not a canonical <skill>.<function> name"
                );
            }
        }
        Ok(())
    }

    /// Serialize and write the settings back to a YAML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml_ng::to_string(self).context("serialize config YAML")?;
        std::fs::write(path, &contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Persistent state directory, defaulting under the runtime home.
    pub fn data_dir(&self) -> PathBuf {
        self.paths
            .data_dir
            .clone()
            .unwrap_or_else(|| crate::runtime_home().join("data"))
    }

    /// Cache directory, defaulting under the runtime home.
    pub fn cache_dir(&self) -> PathBuf {
        self.paths
            .cache_dir
            .clone()
            .unwrap_or_else(|| crate::runtime_home().join("cache"))
    }

    /// Resolve the embedder API key, expanding a `$ENV_VAR` reference.
    pub fn embedder_api_key(&self) -> Option<String> {
        let raw = self.embedder.api_key.as_deref()?;
        if let Some(var) = raw.strip_prefix('$') {
            std::env::var(var).ok()
        } else {
            Some(raw.to_string())
        }
    }
}

/// Recursive YAML mapping merge: overlay wins, mappings merge key-wise,
/// everything else replaces.
fn merge_yaml(base: &mut serde_yaml_ng::Value, overlay: serde_yaml_ng::Value) {
    use serde_yaml_ng::Value;
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
