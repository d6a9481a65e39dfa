//! Cold boot: skills on disk → initialize → tools/list.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use skilld::cli::Runtime;
use skilld::config::Settings;
use skilld::server::{Handler, RpcRequest, PROTOCOL_VERSION};
use tokio_util::sync::CancellationToken;

const GIT_MANIFEST: &str = r#"---
name: git
description: Version control operations
metadata:
  version: 1.0.0
  routing_keywords: [git, commit, status]
  intents: ["commit my changes", "show git status"]
  permissions: ["git:*"]
---
# Git

Run `git.status` before committing.
"#;

const GIT_TOOLS: &str = r#"
@skill_command(category="git", description="Show working tree status")
def status():
    """Show working tree status."""
    return {"clean": True}
"#;

const FS_MANIFEST: &str = r#"---
name: filesystem
description: File operations
metadata:
  version: 0.3.0
  routing_keywords: [file, read]
  intents: ["read a file"]
  permissions: ["filesystem:*"]
---
# Filesystem
"#;

const FS_TOOLS: &str = r#"
@skill_command(category="fs", description="Read a file from the workspace")
def read_file(path: str):
    """Read a file from the workspace."""
    return ""
"#;

fn write_skill(root: &Path, name: &str, manifest: &str, tools: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    std::fs::write(dir.join("SKILL.md"), manifest).unwrap();
    std::fs::write(dir.join("scripts/tools.py"), tools).unwrap();
}

fn settings_for(tmp: &Path) -> Settings {
    let yaml = format!(
        "paths:\n  skills_root: {}\n  data_dir: {}\n  cache_dir: {}\n",
        tmp.join("skills").display(),
        tmp.join("data").display(),
        tmp.join("cache").display(),
    );
    serde_yaml_ng::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn cold_boot_lists_both_skills() {
    let tmp = tempfile::tempdir().unwrap();
    let skills_root = tmp.path().join("skills");
    write_skill(&skills_root, "git", GIT_MANIFEST, GIT_TOOLS);
    write_skill(&skills_root, "filesystem", FS_MANIFEST, FS_TOOLS);

    let runtime = Runtime::build(settings_for(tmp.path())).unwrap();
    assert_eq!(runtime.load_skills(), 2);

    let handler = Arc::new(Handler::new(
        Arc::clone(&runtime.kernel),
        Arc::clone(&runtime.embedder),
    ));
    let cancel = CancellationToken::new();

    // initialize handshake.
    let init = handler
        .handle_request(
            RpcRequest {
                jsonrpc: Some("2.0".into()),
                id: Some(json!(0)),
                method: "initialize".into(),
                params: json!({}),
            },
            &cancel,
        )
        .await;
    let result = init.result.unwrap();
    assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(result["serverInfo"]["name"], "skilld");

    // tools/list carries both scanned commands plus the chunked builtin.
    let listed = handler
        .handle_request(
            RpcRequest {
                jsonrpc: Some("2.0".into()),
                id: Some(json!(1)),
                method: "tools/list".into(),
                params: json!({}),
            },
            &cancel,
        )
        .await;
    let tools = listed.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"git.status"));
    assert!(names.contains(&"filesystem.read_file"));

    let git_status = tools
        .iter()
        .find(|t| t["name"] == "git.status")
        .unwrap();
    assert_eq!(git_status["description"], "Show working tree status");
    assert_eq!(
        git_status["inputSchema"]["type"],
        Value::String("object".into())
    );
}

#[tokio::test]
async fn sync_then_keyword_search_sees_fresh_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let skills_root = tmp.path().join("skills");
    write_skill(&skills_root, "git", GIT_MANIFEST, GIT_TOOLS);

    let runtime = Runtime::build(settings_for(tmp.path())).unwrap();
    let indexer = Arc::clone(&runtime.indexer);
    tokio::task::spawn_blocking(move || indexer.sync_all())
        .await
        .unwrap()
        .unwrap();

    let hits = runtime.store.search_keyword("status", 5).unwrap();
    assert_eq!(hits[0].id, "git.status");
    let on_disk = std::fs::read(skills_root.join("git/scripts/tools.py")).unwrap();
    assert_eq!(hits[0].file_hash, skilld::scanner::content_hash(&on_disk));
}

#[tokio::test]
async fn persisted_index_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let skills_root = tmp.path().join("skills");
    write_skill(&skills_root, "git", GIT_MANIFEST, GIT_TOOLS);

    {
        let runtime = Runtime::build(settings_for(tmp.path())).unwrap();
        let indexer = Arc::clone(&runtime.indexer);
        tokio::task::spawn_blocking(move || indexer.sync_all())
            .await
            .unwrap()
            .unwrap();
    }

    // A fresh runtime over the same data dir reads the same rows.
    let runtime = Runtime::build(settings_for(tmp.path())).unwrap();
    assert_eq!(runtime.store.all_ids().unwrap(), vec!["git.status"]);
}
