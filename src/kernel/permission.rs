//! Permission gatekeeper — zero-trust by default.
//!
//! A pure predicate over `(tool_name, declared patterns)`; no filesystem,
//! network, or global state.  Patterns come from a skill's `SKILL.md`
//! front-matter and use colon notation:
//!
//! - `"*"` matches anything
//! - `"git:*"` matches any command whose canonical name begins with `git.`
//! - `"filesystem:read"` matches exactly `filesystem.read`

/// Evaluate `tool_name` (canonical `<skill>.<function>`) against one
/// pattern.
fn matches(tool_name: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return tool_name.starts_with(&format!("{prefix}."));
    }
    // Exact: colon notation normalizes to the canonical dotted form.
    tool_name == pattern.replace(':', ".")
}

/// `true` when any declared pattern admits the canonical name.
///
/// An empty pattern list admits nothing.
pub fn check(tool_name: &str, permissions: &[String]) -> bool {
    permissions.iter().any(|p| matches(tool_name, p))
}
