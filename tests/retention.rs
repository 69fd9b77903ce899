// tests/retention.rs
//
// Run only this file:
//   cargo test --test retention -- --nocapture
//
// RetentionGc: strict cutoff, side independence, idempotence, the newest
// snapshot always kept, and delete failures reported as warnings without
// stopping the pass.

mod common;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use common::*;
use snapship::cancel::CancelToken;
use snapship::retention::RetentionGc;
use snapship::timestamp::ManualClock;
use snapship::transfer::StreamTransport;
use snapship::{
    Backend, BackupOutcome, NameCodec, Orchestrator, RetentionPolicy, Side, Snapshot,
    SnapshotManager,
};

fn policy(local_days: u32, remote_days: u32) -> RetentionPolicy {
    RetentionPolicy {
        local_days,
        remote_days,
    }
}

#[test]
fn prunes_strictly_older_than_cutoff_per_side() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    for d in [40, 10, 5, 1] {
        local.seed_snapshot("Pictures", days_ago(d));
        remote.seed_snapshot("Pictures", days_ago(d));
    }
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);
    let p = policy(7, 30);

    let lr = gc.prune("Pictures", Side::Local, &p);
    assert_eq!(
        lr.deleted,
        vec![
            snapshot_name("Pictures", days_ago(40)),
            snapshot_name("Pictures", days_ago(10)),
        ]
    );
    let rr = gc.prune("Pictures", Side::Remote, &p);
    assert_eq!(rr.deleted, vec![snapshot_name("Pictures", days_ago(40))]);
    assert!(lr.warnings.is_empty() && rr.warnings.is_empty());

    assert_eq!(local.snapshots_of("Pictures").len(), 2);
    assert_eq!(remote.snapshots_of("Pictures").len(), 3);
}

#[test]
fn snapshot_exactly_at_cutoff_survives() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    local.seed_snapshot("Documents", days_ago(7));
    local.seed_snapshot("Documents", days_ago(7).plus_seconds(-1));
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);

    assert_eq!(gc.cutoff(Side::Local, &policy(7, 30)), days_ago(7));
    let r = gc.prune("Documents", Side::Local, &policy(7, 30));
    assert_eq!(r.deleted_count(), 1);
    assert!(local.has(&local_snapshot_path("Documents", days_ago(7))));
}

#[test]
fn second_pass_is_a_no_op() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    for d in [20, 9, 3] {
        local.seed_snapshot("Documents", days_ago(d));
    }
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);

    let first = gc.prune("Documents", Side::Local, &policy(7, 30));
    assert_eq!(first.deleted_count(), 2);
    let second = gc.prune("Documents", Side::Local, &policy(7, 30));
    assert_eq!(second.deleted_count(), 0);
    assert!(second.warnings.is_empty());
}

#[test]
fn delete_failure_is_a_warning_and_the_rest_continue() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    for d in [30, 20, 10, 1] {
        remote.seed_snapshot("Documents", days_ago(d));
    }
    remote
        .state()
        .fail_delete
        .insert(remote_snapshot_path("Documents", days_ago(30)));
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);

    let r = gc.prune("Documents", Side::Remote, &policy(7, 5));
    assert_eq!(r.warnings.len(), 1);
    assert!(r.warnings[0].contains("Operation not permitted"));
    assert_eq!(
        r.deleted,
        vec![
            snapshot_name("Documents", days_ago(20)),
            snapshot_name("Documents", days_ago(10)),
        ]
    );
}

#[test]
fn unrelated_entries_are_never_touched() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    local.seed_snapshot("Documents", days_ago(30));
    local.add_subvolume("/.snapshots/Documents/Documents-2020");
    local.add_subvolume("/.snapshots/Documents/manual-keep");
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);

    let r = gc.prune("Documents", Side::Local, &policy(7, 30));
    assert_eq!(r.deleted_count(), 1);
    assert!(local.has(Path::new("/.snapshots/Documents/Documents-2020")));
    assert!(local.has(Path::new("/.snapshots/Documents/manual-keep")));
}

#[test]
fn newest_snapshot_survives_any_window() {
    let local = FakeLocal::new();
    let remote = FakeRemote::new();
    for d in [40, 20] {
        local.seed_snapshot("Pictures", days_ago(d));
        remote.seed_snapshot("Pictures", days_ago(d));
    }
    let clock = clock();
    let codec = NameCodec::default();
    let mgr = SnapshotManager::new(
        &local,
        &remote,
        &codec,
        &clock,
        Path::new(LOCAL_ROOT),
        Path::new(REMOTE_ROOT),
    );
    let gc = RetentionGc::new(&mgr, &local, &remote, &clock);

    let p = policy(7, 7);
    let lr = gc.prune("Pictures", Side::Local, &p);
    let rr = gc.prune("Pictures", Side::Remote, &p);
    assert_eq!(lr.deleted, vec![snapshot_name("Pictures", days_ago(40))]);
    assert_eq!(rr.deleted, vec![snapshot_name("Pictures", days_ago(40))]);
    assert_eq!(
        local.snapshots_of("Pictures"),
        vec![snapshot_name("Pictures", days_ago(20))]
    );
    assert_eq!(
        remote.snapshots_of("Pictures"),
        vec![snapshot_name("Pictures", days_ago(20))]
    );
}

/// Transport that takes a few seconds of (manual) time per send.
struct SlowTransport<'a> {
    inner: FakeTransport,
    clock: &'a ManualClock,
}

impl StreamTransport for SlowTransport<'_> {
    fn transfer(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        timeout: Duration,
    ) -> Result<()> {
        self.clock.advance_secs(5);
        self.inner.transfer(snapshot, parent, remote_dir, timeout)
    }
}

#[test]
fn zero_day_window_keeps_the_backup_just_made() -> Result<()> {
    // Unvalidated config: validation refuses zero windows, the prune pass
    // still must not destroy the fresh snapshot.
    let cfg = base_config()
        .with_subvolume("Documents", "/home/docs")
        .with_retention(0, 0);
    let local = FakeLocal::new();
    local.add_subvolume("/home/docs");
    let remote = FakeRemote::new();
    let clock = clock();
    let transport = SlowTransport {
        inner: FakeTransport::new(&remote),
        clock: &clock,
    };
    let backend = Backend {
        local: &local,
        remote: &remote,
        transport: &transport,
        clock: &clock,
    };

    let summary = Orchestrator::new(&cfg, backend, CancelToken::new()).run()?;

    let name = snapshot_name("Documents", now());
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(local.snapshots_of("Documents"), vec![name.clone()]);
    assert_eq!(remote.snapshots_of("Documents"), vec![name]);
    match summary.outcome("Documents") {
        Some(BackupOutcome::Succeeded {
            pruned_local,
            pruned_remote,
            ..
        }) => assert_eq!((*pruned_local, *pruned_remote), (0, 0)),
        other => panic!("unexpected outcome {:?}", other),
    }
    Ok(())
}
