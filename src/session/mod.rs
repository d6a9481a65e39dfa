//! Channel session history and the skill-memory pruner.
//!
//! Histories persist as `<data>/sessions/<id>.json` (sanitized
//! filenames) with an in-memory cache on the hot path.  The pruner keeps
//! the runtime's skill memory inside budget: the system message always
//! survives, the most recent rounds stay intact, and dropped tool
//! outputs collapse to a placeholder that preserves their
//! `tool_call_id` so the transcript stays well-formed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Placeholder substituted for pruned tool outputs.
const PRUNED_PLACEHOLDER: &str = "[tool output pruned]";

/// One message of a skill-memory transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Set on `tool` messages: the id of the assistant tool call this
    /// result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ── Persistence ─────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct SessionFile {
    session_id: String,
    history: Vec<ChatMessage>,
}

/// File-backed session store with an in-memory cache.
pub struct SessionStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("sessions"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a fresh session id.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = if safe.is_empty() { "default".into() } else { safe };
        self.dir.join(format!("{safe}.json"))
    }

    /// Load a session's history; empty when unknown.
    pub fn load(&self, session_id: &str) -> Vec<ChatMessage> {
        if let Some(hit) = self.cache.lock().expect("session cache poisoned").get(session_id) {
            return hit.clone();
        }
        let path = self.path_for(session_id);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        match serde_json::from_str::<SessionFile>(&raw) {
            Ok(file) => {
                self.cache
                    .lock()
                    .expect("session cache poisoned")
                    .insert(session_id.to_string(), file.history.clone());
                file.history
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt session file ignored");
                Vec::new()
            }
        }
    }

    /// Persist a session's history and refresh the cache.
    pub fn save(&self, session_id: &str, history: &[ChatMessage]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create sessions dir: {}", self.dir.display()))?;
        let path = self.path_for(session_id);
        let file = SessionFile {
            session_id: session_id.to_string(),
            history: history.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize session")?;
        std::fs::write(&path, json)
            .with_context(|| format!("write session: {}", path.display()))?;
        self.cache
            .lock()
            .expect("session cache poisoned")
            .insert(session_id.to_string(), history.to_vec());
        debug!(session_id, messages = history.len(), "session saved");
        Ok(())
    }

    /// Session ids present on disk, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        ids.sort();
        ids
    }
}

// ── Pruner ──────────────────────────────────────────────────

/// Budgeted skill-memory pruner.
///
/// Keeps the leading system message and the last `keep_rounds`
/// conversational rounds (a round starts at a `user` message) intact.
/// In everything older, tool outputs are replaced by a short placeholder
/// that preserves the `tool_call_id`.
pub fn prune_history(messages: &mut [ChatMessage], keep_rounds: usize) {
    // Indices where rounds start.
    let round_starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == "user")
        .map(|(i, _)| i)
        .collect();
    let cutoff = if round_starts.len() > keep_rounds {
        round_starts[round_starts.len() - keep_rounds]
    } else {
        return; // everything is recent
    };

    let mut pruned = 0usize;
    for msg in messages[..cutoff].iter_mut() {
        if msg.role == "tool" && msg.content != PRUNED_PLACEHOLDER {
            msg.content = PRUNED_PLACEHOLDER.to_string();
            pruned += 1;
        }
    }
    if pruned > 0 {
        debug!(pruned, "old tool outputs pruned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", "persona"),
            ChatMessage::new("user", "first question"),
            ChatMessage::new("assistant", "calling git.status"),
            ChatMessage::tool_result("call_1", "big tool output ".repeat(50)),
            ChatMessage::new("assistant", "first answer"),
            ChatMessage::new("user", "second question"),
            ChatMessage::new("assistant", "calling git.commit"),
            ChatMessage::tool_result("call_2", "recent tool output"),
            ChatMessage::new("assistant", "second answer"),
        ]
    }

    #[test]
    fn pruner_keeps_system_and_recent_rounds() {
        let mut msgs = transcript();
        prune_history(&mut msgs, 1);

        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[0].content, "persona");
        // Old tool output collapsed, id preserved.
        assert_eq!(msgs[3].content, PRUNED_PLACEHOLDER);
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call_1"));
        // Recent round untouched.
        assert_eq!(msgs[7].content, "recent tool output");
    }

    #[test]
    fn pruner_is_noop_when_everything_is_recent() {
        let mut msgs = transcript();
        let before = msgs.clone();
        prune_history(&mut msgs, 5);
        assert_eq!(msgs, before);
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        let history = transcript();
        store.save("abc-123", &history).unwrap();

        // Fresh store (cold cache) reads from disk.
        let store2 = SessionStore::new(tmp.path());
        assert_eq!(store2.load("abc-123"), history);
        assert_eq!(store2.list(), vec!["abc-123"]);
    }

    #[test]
    fn unknown_session_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(store.load("missing").is_empty());
    }

    #[test]
    fn hostile_session_ids_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path());
        store
            .save("../../etc/passwd", &[ChatMessage::new("system", "s")])
            .unwrap();
        // Nothing escaped the sessions dir.
        let ids = store.list();
        assert_eq!(ids.len(), 1);
        assert!(!ids[0].contains('/'));
        assert!(tmp.path().join("sessions").is_dir());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bad.json"), "{not json").unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(store.load("bad").is_empty());
    }
}
