// tests/status_report.rs
//
// Run only this file:
//   cargo test --test status_report -- --nocapture
//
// JSON status document: written via a temp file then renamed, fields taken
// from the run summary, and the shape of an aborted run.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde_json::Value;

use common::*;
use snapship::cancel::CancelToken;
use snapship::report::StatusReport;
use snapship::{Backend, Orchestrator};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_dir(prefix: &str) -> PathBuf {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "snapship-status-{prefix}-{}-{id}",
        std::process::id()
    ))
}

fn read_json(path: &std::path::Path) -> Result<Value> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

#[test]
fn summary_is_written_atomically() -> Result<()> {
    let cfg = base_config()
        .with_subvolume("Documents", "/home/docs")
        .with_subvolume("Scratch", "/srv/scratch");
    let local = FakeLocal::new();
    local.add_subvolume("/home/docs").add_dir("/srv/scratch");
    let remote = FakeRemote::new();
    let transport = FakeTransport::new(&remote);
    let clock = clock();
    let backend = Backend {
        local: &local,
        remote: &remote,
        transport: &transport,
        clock: &clock,
    };
    let summary = Orchestrator::new(&cfg, backend, CancelToken::new()).run()?;

    let dir = unique_dir("summary");
    let path = dir.join("nested").join("last-run.json");
    StatusReport::from_summary(&summary).write_to(&path)?;

    assert!(!path.with_extension("tmp").exists());
    let doc = read_json(&path)?;
    assert_eq!(doc["success"], Value::Bool(true));
    assert_eq!(doc["aborted"], Value::Null);
    assert_eq!(doc["succeeded"], serde_json::json!(["Documents"]));
    assert_eq!(doc["skipped"], serde_json::json!(["Scratch"]));
    assert_eq!(doc["failed"], serde_json::json!([]));
    assert_eq!(doc["subvolumes"][0]["name"], "Documents");
    assert_eq!(doc["subvolumes"][0]["outcome"]["status"], "succeeded");
    assert_eq!(doc["subvolumes"][0]["outcome"]["mode"], "full");
    assert_eq!(doc["subvolumes"][1]["outcome"]["status"], "skipped");
    assert_eq!(doc["metrics"]["snapshots_created"], 1);

    // Rewriting replaces the previous document.
    StatusReport::aborted("connectivity check failed: unreachable".into(), now())
        .write_to(&path)?;
    let doc = read_json(&path)?;
    assert_eq!(doc["success"], Value::Bool(false));

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn aborted_run_has_no_subvolumes() -> Result<()> {
    let dir = unique_dir("aborted");
    let path = dir.join("status.json");
    StatusReport::aborted("precondition failed: must run as root".into(), now())
        .write_to(&path)?;

    let doc = read_json(&path)?;
    assert_eq!(doc["success"], Value::Bool(false));
    assert_eq!(doc["started"], Value::Null);
    assert_eq!(doc["aborted"], "precondition failed: must run as root");
    assert_eq!(doc["subvolumes"], serde_json::json!([]));
    assert_eq!(doc["metrics"], Value::Null);

    fs::remove_dir_all(&dir)?;
    Ok(())
}
