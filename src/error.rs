//! Error types for the skill runtime.
//!
//! Every component boundary returns a typed error; the transport layer is
//! the only place that converts errors into JSON-RPC objects or result
//! envelopes.  Each variant carries a stable machine string (`kind()`)
//! that callers and tests can match on without parsing messages.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error, classified by the dispatcher.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("unknown tool: {name}")]
    ToolNotFound { name: String },

    #[error("skill '{skill_name}' is not permitted to call '{tool_name}'")]
    PermissionDenied {
        skill_name: String,
        tool_name: String,
        /// The pattern that would have had to match.  Reported in logs and
        /// structured errors, never echoed with the skill's full pattern list.
        required_permission: String,
    },

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool call exceeded idle timeout of {ms} ms (no heartbeat)")]
    TimeoutIdle { ms: u64 },

    #[error("tool call exceeded total timeout of {ms} ms")]
    TimeoutTotal { ms: u64 },

    #[error("tool call cancelled")]
    Cancelled,

    #[error("session_id is required for this action")]
    SessionRequired,

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("batch index {index} out of range (session has {total} batches)")]
    InvalidBatchIndex { index: usize, total: usize },

    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("routing index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::TimeoutIdle { .. } => "timeout_idle",
            Self::TimeoutTotal { .. } => "timeout_total",
            Self::Cancelled => "cancelled",
            Self::SessionRequired => "session_required",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::InvalidBatchIndex { .. } => "invalid_batch_index",
            Self::EmbedderUnavailable(_) => "embedder_unavailable",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

/// Errors raised while scanning skill directories.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("missing SKILL.md in {dir}")]
    MissingManifest { dir: PathBuf },

    #[error("malformed frontmatter in {path}: {reason}")]
    BadFrontmatter { path: PathBuf, reason: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the routing index store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("embedding dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("index schema migration failed: {0}")]
    Migration(String),
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        KernelError::IndexUnavailable(err.to_string())
    }
}

/// Result aliases used across the crate.
pub type KernelResult<T> = std::result::Result<T, KernelError>;
pub type ScanResult<T> = std::result::Result<T, ScanError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
