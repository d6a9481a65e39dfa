//! Skill scanner — discovers directory-packaged skills.
//!
//! A skill is a directory under the skills root carrying a `SKILL.md`
//! manifest (YAML front-matter between `---` fences, markdown body =
//! procedural guide) and a `scripts/` tree of Python entry points tagged
//! with the `@skill_command` marker.
//!
//! The scanner is pure: it only reads the filesystem and is deterministic
//! for a stable snapshot.  A malformed manifest disables that one skill
//! and never prevents enumeration of its siblings.

pub mod pyscan;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};

/// Directories never descended into when walking `scripts/`.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    "target",
    ".venv",
    "venv",
    ".cache",
    "dist",
    "build",
];

// ── Types ───────────────────────────────────────────────────

/// Nested `metadata:` block of a `SKILL.md` front-matter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    /// Upstream repository URL.
    #[serde(default)]
    pub source: Option<String>,
    /// Dotted or glob permission patterns (`"*"`, `"git:*"`, `"filesystem:read"`).
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Raw front-matter shape as written in `SKILL.md`.
#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    metadata: ManifestMetadata,
}

/// Parsed skill manifest plus its procedural guide.
#[derive(Debug, Clone, Serialize)]
pub struct SkillMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub routing_keywords: Vec<String>,
    pub intents: Vec<String>,
    pub authors: Vec<String>,
    pub repository: Option<String>,
    pub permissions: Vec<String>,
    /// Markdown body shown to the LLM while the skill is active.
    #[serde(skip)]
    pub guide: String,
    /// Filesystem path of the skill directory.
    #[serde(skip)]
    pub dir: PathBuf,
}

/// One command entry point lifted from a skill's `scripts/` tree.
#[derive(Debug, Clone)]
pub struct ToolRecord {
    pub skill_name: String,
    pub function_name: String,
    /// The `def` identifier in the source (may differ from the exposed name).
    pub def_name: String,
    pub description: String,
    pub category: String,
    pub docstring: String,
    pub input_schema: serde_json::Value,
    /// `sync` or `async`, from the def form.
    pub is_async: bool,
    /// Keywords inherited from the owning skill's routing_keywords.
    pub keywords: Vec<String>,
    pub source_path: PathBuf,
    /// SHA-256 of the source file, hex-encoded.
    pub file_hash: String,
}

impl ToolRecord {
    /// Canonical public name, `<skill>.<function>`.
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.skill_name, self.function_name)
    }
}

/// A skill plus its enumerated commands.
#[derive(Debug, Clone)]
pub struct ScannedSkill {
    pub metadata: SkillMetadata,
    pub tools: Vec<ToolRecord>,
}

// ── Entry points ────────────────────────────────────────────

/// Enumerate every skill under `root` (non-recursive at the top level).
///
/// Ordering is stable: skills sort by directory name, tools by source
/// path then declaration order.
pub fn scan_all(root: &Path) -> Vec<ScannedSkill> {
    let mut names: Vec<String> = match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .collect(),
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot read skills root");
            return Vec::new();
        }
    };
    names.sort();

    let mut out = Vec::new();
    for name in names {
        match scan_skill(root, &name) {
            Some(skill) => out.push(skill),
            None => debug!(skill = %name, "skipped (no valid SKILL.md)"),
        }
    }
    out
}

/// Scan a single skill directory.  Returns `None` when the directory has
/// no parseable `SKILL.md`.
pub fn scan_skill(root: &Path, name: &str) -> Option<ScannedSkill> {
    let dir = root.join(name);
    let manifest_path = dir.join("SKILL.md");

    let metadata = match read_manifest(&manifest_path, &dir) {
        Ok(m) => m,
        Err(e) => {
            warn!(skill = %name, error = %e, "skill disabled");
            return None;
        }
    };

    let tools = scan_scripts(&dir, &metadata);
    Some(ScannedSkill { metadata, tools })
}

/// Parse just a skill's manifest, without walking `scripts/`.
pub fn scan_metadata(root: &Path, name: &str) -> Option<SkillMetadata> {
    let dir = root.join(name);
    match read_manifest(&dir.join("SKILL.md"), &dir) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(skill = %name, error = %e, "manifest unreadable");
            None
        }
    }
}

// ── SKILL.md ────────────────────────────────────────────────

fn read_manifest(path: &Path, dir: &Path) -> ScanResult<SkillMetadata> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ScanError::MissingManifest {
                dir: dir.to_path_buf(),
            }
        } else {
            ScanError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let (yaml, body) = split_front_matter(&content).ok_or_else(|| ScanError::BadFrontmatter {
        path: path.to_path_buf(),
        reason: "missing --- fences".into(),
    })?;

    let manifest: Manifest =
        serde_yaml_ng::from_str(yaml).map_err(|e| ScanError::BadFrontmatter {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let version = manifest
        .metadata
        .version
        .clone()
        .ok_or_else(|| ScanError::BadFrontmatter {
            path: path.to_path_buf(),
            reason: "metadata.version is required".into(),
        })?;

    Ok(SkillMetadata {
        name: manifest.name,
        version,
        description: manifest.description.unwrap_or_default(),
        routing_keywords: manifest.metadata.routing_keywords,
        intents: manifest.metadata.intents,
        authors: manifest.metadata.authors,
        repository: manifest.metadata.source,
        permissions: manifest.metadata.permissions,
        guide: body.to_string(),
        dir: dir.to_path_buf(),
    })
}

/// Split `SKILL.md` content into `(yaml_front_matter, markdown_body)`.
pub fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let trimmed = content.trim_start();
    let rest = trimmed.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let close = rest.find("\n---")?;
    let yaml = &rest[..close];
    let body = &rest[close + 4..];
    Some((yaml, body.strip_prefix('\n').unwrap_or(body)))
}

// ── scripts/ walk ───────────────────────────────────────────

fn scan_scripts(dir: &Path, metadata: &SkillMetadata) -> Vec<ToolRecord> {
    let scripts = dir.join("scripts");
    if !scripts.is_dir() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(&scripts)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !EXCLUDED_DIRS.contains(&name.as_ref())
        })
        .build()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "py"))
        .collect();
    files.sort();

    let mut tools = Vec::new();
    for path in files {
        match scan_source_file(&path, metadata) {
            Ok(mut found) => tools.append(&mut found),
            Err(e) => warn!(path = %path.display(), error = %e, "script skipped"),
        }
    }
    tools
}

/// Parse one Python file into its tool records.
pub fn scan_source_file(path: &Path, metadata: &SkillMetadata) -> ScanResult<Vec<ToolRecord>> {
    let source = std::fs::read_to_string(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let hash = content_hash(source.as_bytes());

    Ok(pyscan::extract_commands(&source)
        .into_iter()
        .map(|cmd| ToolRecord {
            skill_name: metadata.name.clone(),
            function_name: cmd.name,
            def_name: cmd.def_name,
            description: cmd.description,
            category: cmd.category,
            docstring: cmd.docstring,
            input_schema: cmd.input_schema,
            is_async: cmd.is_async,
            keywords: metadata.routing_keywords.clone(),
            source_path: path.to_path_buf(),
            file_hash: hash.clone(),
        })
        .collect())
}

/// SHA-256 content hash, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Locate the skill directory a script path belongs to, relative to the
/// skills root.  Returns the skill name when `path` lies under
/// `<root>/<skill>/scripts/`.
pub fn skill_for_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = rel.components();
    let skill = parts.next()?.as_os_str().to_str()?.to_string();
    match parts.next()?.as_os_str().to_str()? {
        "scripts" => Some(skill),
        _ => None,
    }
}

// ── Tests ───────────────────────────────────────────────────
