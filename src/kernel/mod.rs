//! Kernel dispatcher — permission-checked command execution.
//!
//! Resolves aliases to canonical names, enforces the owning/calling
//! skill's permission patterns, runs the command under the idle/total
//! timeout supervisor, and normalizes every outcome into the canonical
//! tool-result envelope `{content: [{type: "text", text}], isError}`.
//! Extra top-level keys never survive normalization.
//!
//! The registry maps canonical `<skill>.<function>` names to command
//! records with an invoker trait object, populated from scanner output.
//! Exact-name dispatch never consults the router.

pub mod heartbeat;
pub mod invoke;
pub mod permission;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Settings, TimeoutsConfig};
use crate::error::{KernelError, KernelResult};
use crate::kernel::heartbeat::SuperviseOutcome;
use crate::kernel::invoke::{Invoker, SubprocessInvoker};
use crate::scanner::{ScannedSkill, SkillMetadata};

// ── Envelope ────────────────────────────────────────────────

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// The canonical MCP tool-result envelope.  The wire shape is exactly
/// `{"content": [...], "isError": bool}` — nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolEnvelope {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock {
                kind: "text".into(),
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock {
                kind: "text".into(),
                text: text.into(),
            }],
            is_error: true,
        }
    }

    /// First text block, for convenience in tests and the CLI.
    pub fn first_text(&self) -> &str {
        self.content.first().map(|c| c.text.as_str()).unwrap_or("")
    }
}

/// Wrap a raw command return value into the canonical envelope.
///
/// A value already in canonical shape passes through with extra keys
/// stripped; anything else is stringified into a single text block.
pub fn normalize_result(value: Value) -> ToolEnvelope {
    if let Some(obj) = value.as_object() {
        if let Some(content) = obj.get("content").and_then(Value::as_array) {
            let blocks: Option<Vec<ContentBlock>> = content
                .iter()
                .map(|item| {
                    let kind = item.get("type")?.as_str()?;
                    let text = item.get("text")?.as_str()?;
                    Some(ContentBlock {
                        kind: kind.to_string(),
                        text: text.to_string(),
                    })
                })
                .collect();
            if let Some(blocks) = blocks {
                return ToolEnvelope {
                    content: blocks,
                    is_error: obj.get("isError").and_then(Value::as_bool).unwrap_or(false),
                };
            }
        }
    }
    match value {
        Value::String(s) => ToolEnvelope::text(s),
        other => ToolEnvelope::text(serde_json::to_string(&other).unwrap_or_default()),
    }
}

/// Envelope text for a dispatch error: `{"error": {"kind", "message"}}`.
fn error_envelope(err: &KernelError) -> ToolEnvelope {
    let text = serde_json::json!({
        "error": { "kind": err.kind(), "message": err.to_string() }
    });
    ToolEnvelope::error(text.to_string())
}

// ── Registry ────────────────────────────────────────────────

/// Public metadata for one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandMeta {
    /// Canonical `<skill>.<function>`.
    pub name: String,
    pub skill_name: String,
    pub description: String,
    pub category: String,
    pub input_schema: Value,
    pub is_async: bool,
}

struct CommandEntry {
    meta: CommandMeta,
    invoker: Arc<dyn Invoker>,
    /// Registered in-process (builtins, tests); survives registry reloads
    /// from disk scans.
    builtin: bool,
}

/// Entry of the exposed tool list.  When an alias targets a command the
/// alias name is listed *instead of* the canonical one.
#[derive(Debug, Clone, Serialize)]
pub struct ToolListing {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

// ── Kernel ──────────────────────────────────────────────────

pub struct Kernel {
    commands: RwLock<HashMap<String, CommandEntry>>,
    skills: RwLock<HashMap<String, SkillMetadata>>,
    /// Short name → canonical target; replaced wholesale on SIGHUP.
    aliases: RwLock<HashMap<String, String>>,
    timeouts: TimeoutsConfig,
    interpreter: String,
    cancel: CancellationToken,
    in_flight: AtomicUsize,
    /// The skill whose guide is injected into the next turn's context.
    active_skill: RwLock<Option<String>>,
}

impl Kernel {
    pub fn new(settings: &Settings, cancel: CancellationToken) -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
            skills: RwLock::new(HashMap::new()),
            aliases: RwLock::new(settings.aliases.clone()),
            timeouts: settings.timeouts.clone(),
            interpreter: settings.interpreter.clone(),
            cancel,
            in_flight: AtomicUsize::new(0),
            active_skill: RwLock::new(None),
        }
    }

    // ── Population ──────────────────────────────────────────

    /// Replace the scanned registry contents; builtins survive.
    pub fn load_from_scan(&self, skills: &[ScannedSkill]) {
        let mut commands = self.commands.write().expect("registry poisoned");
        let mut skill_map = self.skills.write().expect("skills poisoned");
        let builtin_skills: std::collections::HashSet<String> = commands
            .values()
            .filter(|e| e.builtin)
            .map(|e| e.meta.skill_name.clone())
            .collect();
        commands.retain(|_, entry| entry.builtin);
        skill_map.retain(|name, _| builtin_skills.contains(name));

        for skill in skills {
            skill_map.insert(skill.metadata.name.clone(), skill.metadata.clone());
            for tool in &skill.tools {
                let name = tool.canonical_name();
                let invoker = Arc::new(SubprocessInvoker::new(
                    self.interpreter.clone(),
                    tool.source_path.clone(),
                    tool.def_name.clone(),
                ));
                commands.insert(
                    name.clone(),
                    CommandEntry {
                        meta: CommandMeta {
                            name,
                            skill_name: tool.skill_name.clone(),
                            description: tool.description.clone(),
                            category: tool.category.clone(),
                            input_schema: tool.input_schema.clone(),
                            is_async: tool.is_async,
                        },
                        invoker,
                        builtin: false,
                    },
                );
            }
        }
        info!(
            commands = commands.len(),
            skills = skill_map.len(),
            "kernel registry loaded"
        );
    }

    /// Register a single command with an explicit invoker (builtins, tests).
    pub fn register_command(
        &self,
        meta: CommandMeta,
        permissions: Vec<String>,
        invoker: Arc<dyn Invoker>,
    ) {
        let mut skills = self.skills.write().expect("skills poisoned");
        skills
            .entry(meta.skill_name.clone())
            .or_insert_with(|| SkillMetadata {
                name: meta.skill_name.clone(),
                version: "0.0.0".into(),
                description: String::new(),
                routing_keywords: Vec::new(),
                intents: Vec::new(),
                authors: Vec::new(),
                repository: None,
                permissions,
                guide: String::new(),
                dir: std::path::PathBuf::new(),
            });
        let mut commands = self.commands.write().expect("registry poisoned");
        commands.insert(
            meta.name.clone(),
            CommandEntry {
                meta,
                invoker,
                builtin: true,
            },
        );
    }

    /// Refresh a single skill's metadata (watcher, SKILL.md edits).
    pub fn update_skill_metadata(&self, metadata: SkillMetadata) {
        let mut skills = self.skills.write().expect("skills poisoned");
        skills.insert(metadata.name.clone(), metadata);
    }

    /// Replace one skill's commands and metadata from a fresh scan.
    pub fn update_skill(&self, skill: &ScannedSkill) {
        {
            let mut skills = self.skills.write().expect("skills poisoned");
            skills.insert(skill.metadata.name.clone(), skill.metadata.clone());
        }
        let mut commands = self.commands.write().expect("registry poisoned");
        commands.retain(|_, entry| entry.meta.skill_name != skill.metadata.name);
        for tool in &skill.tools {
            let name = tool.canonical_name();
            commands.insert(
                name.clone(),
                CommandEntry {
                    meta: CommandMeta {
                        name,
                        skill_name: tool.skill_name.clone(),
                        description: tool.description.clone(),
                        category: tool.category.clone(),
                        input_schema: tool.input_schema.clone(),
                        is_async: tool.is_async,
                    },
                    invoker: Arc::new(SubprocessInvoker::new(
                        self.interpreter.clone(),
                        tool.source_path.clone(),
                        tool.def_name.clone(),
                    )),
                    builtin: false,
                },
            );
        }
    }

    /// Drop a skill and every command it owns.
    pub fn remove_skill(&self, name: &str) {
        self.skills.write().expect("skills poisoned").remove(name);
        self.commands
            .write()
            .expect("registry poisoned")
            .retain(|_, entry| entry.meta.skill_name != name);
    }

    // ── Introspection ───────────────────────────────────────

    /// Resolve an alias to its canonical target, or echo the input.
    pub fn resolve_alias(&self, name: &str) -> String {
        self.aliases
            .read()
            .expect("alias map poisoned")
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Replace the alias map (config reload on SIGHUP).
    pub fn reload_aliases(&self, aliases: HashMap<String, String>) {
        let count = aliases.len();
        *self.aliases.write().expect("alias map poisoned") = aliases;
        info!(count, "alias map reloaded");
    }

    /// The exposed tool list.  Aliases replace their canonical targets.
    pub fn list_tools(&self) -> Vec<ToolListing> {
        let commands = self.commands.read().expect("registry poisoned");
        let aliases = self.aliases.read().expect("alias map poisoned");
        // Reverse map canonical → alias; first alias wins alphabetically.
        let mut reverse: HashMap<&str, &str> = HashMap::new();
        let mut alias_names: Vec<(&String, &String)> = aliases.iter().collect();
        alias_names.sort();
        for (alias, target) in alias_names {
            reverse.entry(target.as_str()).or_insert(alias.as_str());
        }

        let mut out: Vec<ToolListing> = commands
            .values()
            .map(|entry| ToolListing {
                name: reverse
                    .get(entry.meta.name.as_str())
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| entry.meta.name.clone()),
                description: entry.meta.description.clone(),
                input_schema: entry.meta.input_schema.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stable fingerprint of the visible tool surface; used by the
    /// watcher to decide whether a `listChanged` notification is due.
    pub fn surface_hash(&self) -> String {
        let names: Vec<String> = self.list_tools().into_iter().map(|t| t.name).collect();
        crate::scanner::content_hash(names.join("\n").as_bytes())
    }

    /// A skill's procedural guide (SKILL.md body), if known.
    pub fn skill_guide(&self, name: &str) -> Option<String> {
        self.skills
            .read()
            .expect("skills poisoned")
            .get(name)
            .map(|m| m.guide.clone())
    }

    pub fn set_active_skill(&self, name: Option<String>) {
        *self.active_skill.write().expect("active skill poisoned") = name;
    }

    pub fn active_skill(&self) -> Option<String> {
        self.active_skill
            .read()
            .expect("active skill poisoned")
            .clone()
    }

    pub fn command_count(&self) -> usize {
        self.commands.read().expect("registry poisoned").len()
    }

    // ── Dispatch ────────────────────────────────────────────

    /// The kernel's root cancellation token.  Transports derive per-
    /// session child tokens from it so a global shutdown cancels
    /// everything while a client disconnect cancels only its own calls.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Execute a tool call.  Always returns a canonical envelope; failures
    /// land inside it with `isError = true`.
    pub async fn execute_tool(
        &self,
        name: &str,
        arguments: Value,
        caller: Option<&str>,
    ) -> ToolEnvelope {
        let cancel = self.cancel.clone();
        self.execute_tool_with(name, arguments, caller, &cancel).await
    }

    /// Like [`execute_tool`](Self::execute_tool) with an explicit
    /// cancellation token (per-session transports).
    pub async fn execute_tool_with(
        &self,
        name: &str,
        arguments: Value,
        caller: Option<&str>,
        cancel: &CancellationToken,
    ) -> ToolEnvelope {
        let started = Instant::now();
        let resolved = self.resolve_alias(name);
        let from_alias = resolved != name;

        let (envelope, outcome) = match self
            .execute_checked_with(&resolved, arguments, caller, cancel)
            .await
        {
            Ok(value) => (normalize_result(value), SuperviseOutcome::Ok),
            Err(err) => {
                let outcome = match &err {
                    KernelError::TimeoutIdle { .. } => SuperviseOutcome::TimeoutIdle,
                    KernelError::TimeoutTotal { .. } => SuperviseOutcome::TimeoutTotal,
                    KernelError::Cancelled => SuperviseOutcome::Cancelled,
                    _ => SuperviseOutcome::Error,
                };
                (error_envelope(&err), outcome)
            }
        };

        info!(
            tool = %resolved,
            caller = caller.unwrap_or("user"),
            from_alias,
            duration_ms = started.elapsed().as_millis() as u64,
            result = outcome.as_str(),
            "dispatch"
        );
        envelope
    }

    /// The typed dispatch path used internally and by tests.
    pub async fn execute_checked(
        &self,
        canonical: &str,
        arguments: Value,
        caller: Option<&str>,
    ) -> KernelResult<Value> {
        let cancel = self.cancel.clone();
        self.execute_checked_with(canonical, arguments, caller, &cancel)
            .await
    }

    async fn execute_checked_with(
        &self,
        canonical: &str,
        arguments: Value,
        caller: Option<&str>,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        let (invoker, schema) = {
            let commands = self.commands.read().expect("registry poisoned");
            let entry = commands.get(canonical).ok_or_else(|| {
                KernelError::ToolNotFound {
                    name: canonical.to_string(),
                }
            })?;
            (Arc::clone(&entry.invoker), entry.meta.input_schema.clone())
        };

        // Zero-trust: a calling skill may only reach what its own
        // declared patterns admit.  End users (no caller) are unrestricted.
        if let Some(caller_skill) = caller {
            let permissions = {
                let skills = self.skills.read().expect("skills poisoned");
                skills
                    .get(caller_skill)
                    .map(|m| m.permissions.clone())
                    .unwrap_or_default()
            };
            if !permission::check(canonical, &permissions) {
                warn!(caller = caller_skill, tool = canonical, "permission denied");
                return Err(KernelError::PermissionDenied {
                    skill_name: caller_skill.to_string(),
                    tool_name: canonical.to_string(),
                    required_permission: canonical.to_string(),
                });
            }
        }

        validate_arguments(canonical, &arguments, &schema)?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result =
            heartbeat::supervise(invoker.invoke(arguments), &self.timeouts, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    // ── Shutdown ────────────────────────────────────────────

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Signal cancellation and wait for in-flight calls to drain, up to
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let start = Instant::now();
        while self.in_flight_count() > 0 {
            if start.elapsed() >= timeout {
                warn!(
                    remaining = self.in_flight_count(),
                    "shutdown drain timeout reached, proceeding"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        debug!("kernel shutdown complete");
    }
}

/// Minimal argument validation against the command's JSON Schema:
/// arguments must be an object and every `required` key must be present.
fn validate_arguments(tool: &str, arguments: &Value, schema: &Value) -> KernelResult<()> {
    if !arguments.is_object() {
        return Err(KernelError::InvalidArguments {
            tool: tool.to_string(),
            reason: "arguments must be a JSON object".into(),
        });
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if arguments.get(key).is_none() {
                return Err(KernelError::InvalidArguments {
                    tool: tool.to_string(),
                    reason: format!("missing required argument `{key}`"),
                });
            }
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::invoke::FnInvoker;
    use serde_json::json;

    fn test_settings() -> Settings {
        let yaml = "paths:\n  skills_root: ./skills\naliases:\n  st: git.status\n";
        let doc: Settings = serde_yaml_ng::from_str(yaml).unwrap();
        doc
    }

    fn kernel_with_echo() -> Kernel {
        let kernel = Kernel::new(&test_settings(), CancellationToken::new());
        kernel.register_command(
            CommandMeta {
                name: "git.status".into(),
                skill_name: "git".into(),
                description: "Show status".into(),
                category: "git".into(),
                input_schema: json!({"type": "object", "properties": {}, "required": []}),
                is_async: false,
            },
            vec!["git:*".into()],
            Arc::new(FnInvoker::from_fn(|_| async {
                Ok(json!({"branch": "main", "clean": true}))
            })),
        );
        kernel
    }

    #[test]
    fn normalize_wraps_arbitrary_json() {
        let env = normalize_result(json!({"a": 1}));
        assert!(!env.is_error);
        assert_eq!(env.content.len(), 1);
        assert_eq!(env.content[0].kind, "text");
        assert!(env.first_text().contains("\"a\":1"));
    }

    #[test]
    fn normalize_passes_canonical_through_and_strips_extras() {
        let env = normalize_result(json!({
            "content": [{"type": "text", "text": "hello", "annotation": "x"}],
            "isError": true,
            "extra_top_level": 42,
        }));
        assert!(env.is_error);
        assert_eq!(env.first_text(), "hello");
        let wire = serde_json::to_value(&env).unwrap();
        let keys: Vec<&str> = wire.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["content", "isError"]);
        let block_keys: Vec<&str> = wire["content"][0]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(block_keys, vec!["type", "text"]);
    }

    #[tokio::test]
    async fn unknown_tool_yields_tool_not_found() {
        let kernel = kernel_with_echo();
        let env = kernel.execute_tool("nope.nothing", json!({}), None).await;
        assert!(env.is_error);
        assert!(env.first_text().contains("tool_not_found"));
    }

    #[tokio::test]
    async fn alias_and_canonical_dispatch_identically() {
        let kernel = kernel_with_echo();
        let via_alias = kernel.execute_tool("st", json!({}), None).await;
        let via_canonical = kernel.execute_tool("git.status", json!({}), None).await;
        assert_eq!(via_alias, via_canonical);
        assert!(!via_alias.is_error);
    }

    #[tokio::test]
    async fn alias_replaces_canonical_in_listing() {
        let kernel = kernel_with_echo();
        let names: Vec<String> = kernel.list_tools().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"st".to_string()));
        assert!(!names.contains(&"git.status".to_string()));
    }

    #[tokio::test]
    async fn user_caller_bypasses_permission_patterns() {
        let kernel = kernel_with_echo();
        let env = kernel.execute_tool("git.status", json!({}), None).await;
        assert!(!env.is_error);
    }

    #[tokio::test]
    async fn skill_caller_is_gated_by_its_own_patterns() {
        let kernel = kernel_with_echo();
        // The git skill declared `git:*`, so it may call its own commands…
        let ok = kernel
            .execute_checked("git.status", json!({}), Some("git"))
            .await;
        assert!(ok.is_ok());

        // …but a skill with no matching grant is denied.
        kernel.register_command(
            CommandMeta {
                name: "web.crawl".into(),
                skill_name: "web".into(),
                description: "Crawl".into(),
                category: "web".into(),
                input_schema: json!({"type": "object", "required": []}),
                is_async: false,
            },
            vec!["web:*".into()],
            Arc::new(FnInvoker::from_fn(|_| async { Ok(json!("ok")) })),
        );
        let err = kernel
            .execute_checked("git.status", json!({}), Some("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn missing_required_argument_is_invalid() {
        let kernel = kernel_with_echo();
        kernel.register_command(
            CommandMeta {
                name: "git.commit".into(),
                skill_name: "git".into(),
                description: "Commit".into(),
                category: "git".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"],
                }),
                is_async: false,
            },
            vec![],
            Arc::new(FnInvoker::from_fn(|_| async { Ok(json!("ok")) })),
        );
        let err = kernel
            .execute_checked("git.commit", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }

    #[tokio::test]
    async fn idle_timeout_surfaces_in_envelope() {
        let yaml =
            "paths:\n  skills_root: ./skills\ntimeouts:\n  total_ms: 30000\n  idle_ms: 150\n";
        let settings: Settings = serde_yaml_ng::from_str(yaml).unwrap();
        let kernel = Kernel::new(&settings, CancellationToken::new());
        kernel.register_command(
            CommandMeta {
                name: "slow.sleep".into(),
                skill_name: "slow".into(),
                description: "Sleep silently".into(),
                category: "test".into(),
                input_schema: json!({"type": "object", "required": []}),
                is_async: true,
            },
            vec![],
            Arc::new(FnInvoker::from_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("done"))
            })),
        );
        let env = kernel.execute_tool("slow.sleep", json!({}), None).await;
        assert!(env.is_error);
        assert!(env.first_text().contains("timeout_idle"));
    }

    #[tokio::test]
    async fn surface_hash_tracks_registry_changes() {
        let kernel = kernel_with_echo();
        let before = kernel.surface_hash();
        kernel.register_command(
            CommandMeta {
                name: "demo.hello".into(),
                skill_name: "demo".into(),
                description: "Say hello".into(),
                category: "demo".into(),
                input_schema: json!({"type": "object", "required": []}),
                is_async: false,
            },
            vec![],
            Arc::new(FnInvoker::from_fn(|_| async { Ok(json!("hi")) })),
        );
        assert_ne!(before, kernel.surface_hash());
    }

    #[tokio::test]
    async fn remove_skill_drops_its_commands() {
        let kernel = kernel_with_echo();
        assert_eq!(kernel.command_count(), 1);
        kernel.remove_skill("git");
        assert_eq!(kernel.command_count(), 0);
    }
}
