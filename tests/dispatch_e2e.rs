//! Dispatch scenarios: exact short-circuit, permissions, chunked reads.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use skilld::cli::Runtime;
use skilld::config::Settings;
use skilld::kernel::invoke::FnInvoker;
use skilld::kernel::CommandMeta;

fn settings_for(tmp: &Path, extra: &str) -> Settings {
    let yaml = format!(
        "paths:\n  skills_root: {}\n  data_dir: {}\n  cache_dir: {}\n{extra}",
        tmp.join("skills").display(),
        tmp.join("data").display(),
        tmp.join("cache").display(),
    );
    serde_yaml_ng::from_str(&yaml).unwrap()
}

fn register_echo(runtime: &Runtime, name: &str, skill: &str, permissions: Vec<String>) {
    runtime.kernel.register_command(
        CommandMeta {
            name: name.into(),
            skill_name: skill.into(),
            description: format!("Echo for {name}"),
            category: "test".into(),
            input_schema: json!({"type": "object", "required": []}),
            is_async: false,
        },
        permissions,
        Arc::new(FnInvoker::from_fn(|args| async move { Ok(json!({"echo": args})) })),
    );
}

#[tokio::test]
async fn exact_name_dispatch_never_touches_the_router() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
    let runtime = Runtime::build(settings_for(tmp.path(), "")).unwrap();
    register_echo(&runtime, "git.status", "git", vec!["git:*".into()]);

    let baseline = runtime.store.query_metrics();
    let env = runtime.kernel.execute_tool("git.status", json!({}), None).await;
    assert!(!env.is_error);

    // The kernel holds no router reference; no retrieval ran.
    let after = runtime.store.query_metrics();
    assert_eq!(baseline.keyword_searches, after.keyword_searches);
    assert_eq!(baseline.vector_searches, after.vector_searches);
}

#[tokio::test]
async fn permission_pattern_table() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
    let runtime = Runtime::build(settings_for(tmp.path(), "")).unwrap();

    register_echo(&runtime, "git.status", "git", vec!["git:*".into()]);
    register_echo(&runtime, "fs.read", "fs", vec!["fs:read".into()]);
    register_echo(&runtime, "ops.any", "ops", vec!["*".into()]);
    register_echo(&runtime, "mute.none", "mute", vec![]);

    // (caller skill, target, expected ok)
    let table = [
        ("ops", "git.status", true),  // "*" reaches anything
        ("git", "git.status", true),   // own namespace via git:*
        ("git", "fs.read", false),     // unrelated namespace
        ("fs", "fs.read", true),       // exact pattern
        ("fs", "git.status", false),   // exact pattern does not widen
        ("mute", "ops.any", false),   // empty grants deny all
    ];
    for (caller, target, expect_ok) in table {
        let result = runtime
            .kernel
            .execute_checked(target, json!({}), Some(caller))
            .await;
        assert_eq!(
            result.is_ok(),
            expect_ok,
            "caller={caller} target={target}"
        );
        if let Err(e) = result {
            assert_eq!(e.kind(), "permission_denied");
        }
    }
}

#[tokio::test]
async fn alias_from_config_is_reversed_before_execution() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
    let runtime = Runtime::build(settings_for(
        tmp.path(),
        "aliases:\n  st: git.status\n",
    ))
    .unwrap();
    register_echo(&runtime, "git.status", "git", vec![]);

    let via_alias = runtime.kernel.execute_tool("st", json!({}), None).await;
    let direct = runtime
        .kernel
        .execute_tool("git.status", json!({}), None)
        .await;
    assert_eq!(via_alias, direct);

    // The alias shows up in the surface instead of the canonical name.
    let names: Vec<String> = runtime
        .kernel
        .list_tools()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert!(names.contains(&"st".to_string()));
    assert!(!names.contains(&"git.status".to_string()));
}

#[tokio::test]
async fn chunked_read_reconstructs_thirty_thousand_chars() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
    let runtime = Runtime::build(settings_for(tmp.path(), "")).unwrap();

    let payload: String = (0..30_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let started = runtime
        .kernel
        .execute_tool(
            "chunked.process",
            json!({"action": "start", "payload": payload, "batch_size": 10_000}),
            None,
        )
        .await;
    assert!(!started.is_error);
    let body: Value = serde_json::from_str(started.first_text()).unwrap();
    let sid = body["session_id"].as_str().unwrap().to_string();
    assert_eq!(body["batch_count"], 3);

    let mut rebuilt = String::new();
    for index in 0..3 {
        let resp = runtime
            .kernel
            .execute_tool(
                "chunked.process",
                json!({"action": "batch", "session_id": sid, "batch_index": index}),
                None,
            )
            .await;
        let body: Value = serde_json::from_str(resp.first_text()).unwrap();
        rebuilt.push_str(body["batch"].as_str().unwrap());
    }
    assert_eq!(rebuilt, payload);

    let synth = runtime
        .kernel
        .execute_tool(
            "chunked.process",
            json!({"action": "synthesize", "session_id": sid}),
            None,
        )
        .await;
    let body: Value = serde_json::from_str(synth.first_text()).unwrap();
    let summary = body["summary"].as_str().unwrap();
    assert!(summary.contains("batch 0"));
    assert!(summary.contains("batch 1"));
    assert!(summary.contains("batch 2"));
}

#[tokio::test]
async fn expired_session_reports_not_found_kind() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("skills")).unwrap();
    let runtime = Runtime::build(settings_for(tmp.path(), "")).unwrap();

    let resp = runtime
        .kernel
        .execute_tool(
            "chunked.process",
            json!({"action": "batch", "session_id": "long-gone", "batch_index": 0}),
            None,
        )
        .await;
    assert!(resp.is_error);
    assert!(resp.first_text().contains("session_not_found"));
}
