//! Run sequencing.
//!
//! Run:           Preflight -> [Lock] -> Probe -> {subvolume}* -> Summary
//! Per subvolume: Skip (source missing / not a subvolume)
//!              | Snapshot -> Transfer -> Prune(local) -> Prune(remote) -> Done
//!                any failing stage -> Failed(stage); Prune never runs after a
//!                failed transfer so the last common ancestor survives.
//!
//! Only `RunError` (precondition, connectivity) leaves `run()` as an error.
//! Everything subvolume-scoped ends up in `RunSummary`.

use log::{error, info, warn};
use serde::Serialize;
use std::time::Instant;

use crate::btrfs::LocalVolumes;
use crate::cancel::CancelToken;
use crate::config::{BackupConfig, Subvolume};
use crate::error::{RunError, SnapshotError, Stage};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::parent::ParentResolver;
use crate::probe::{ConnectivityProbe, ProbeOutcome};
use crate::remote::RemoteStore;
use crate::retention::RetentionGc;
use crate::snapshot::{Side, SnapshotManager};
use crate::timestamp::{Clock, NameCodec, Timestamp};
use crate::transfer::{StreamTransport, TransferEngine, TransferMode};

pub const SUMMARY_MARKER: &str = "=== SNAPSHIP SUMMARY:";
pub const ABORT_MARKER: &str = "=== SNAPSHIP ABORTED:";

/// Host-facing collaborators of one run.
#[derive(Clone, Copy)]
pub struct Backend<'a> {
    pub local: &'a dyn LocalVolumes,
    pub remote: &'a dyn RemoteStore,
    pub transport: &'a dyn StreamTransport,
    pub clock: &'a dyn Clock,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Succeeded {
        snapshot: String,
        mode: TransferMode,
        parent: Option<String>,
        pruned_local: usize,
        pruned_remote: usize,
        prune_warnings: Vec<String>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        stage: Stage,
        cause: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct SubvolumeResult {
    pub name: String,
    pub outcome: BackupOutcome,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub started: Timestamp,
    pub finished: Timestamp,
    pub results: Vec<SubvolumeResult>,
    pub probe_warnings: Vec<String>,
    pub cancelled: bool,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    fn names<F: Fn(&BackupOutcome) -> bool>(&self, pred: F) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names(|o| matches!(o, BackupOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names(|o| matches!(o, BackupOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names(|o| matches!(o, BackupOutcome::Skipped { .. }))
    }

    pub fn outcome(&self, name: &str) -> Option<&BackupOutcome> {
        self.results
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }

    /// Zero failed subvolumes and the run was not interrupted.
    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && !self.cancelled
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Fixed-format line for grep/aggregation.
    pub fn marker_line(&self) -> String {
        format!(
            "{} succeeded=[{}] failed=[{}] skipped=[{}]{} ===",
            SUMMARY_MARKER,
            self.succeeded().join(","),
            self.failed().join(","),
            self.skipped().join(","),
            if self.cancelled { " cancelled" } else { "" }
        )
    }
}

pub fn abort_marker_line(err: &RunError) -> String {
    format!("{} {} ===", ABORT_MARKER, err)
}

pub struct Orchestrator<'a> {
    cfg: &'a BackupConfig,
    backend: Backend<'a>,
    cancel: CancelToken,
    codec: NameCodec,
    metrics: RunMetrics,
}

impl<'a> Orchestrator<'a> {
    pub fn new(cfg: &'a BackupConfig, backend: Backend<'a>, cancel: CancelToken) -> Self {
        Self {
            cfg,
            backend,
            cancel,
            codec: cfg.name_codec(),
            metrics: RunMetrics::new(),
        }
    }

    fn manager(&self) -> SnapshotManager<'_> {
        SnapshotManager::new(
            self.backend.local,
            self.backend.remote,
            &self.codec,
            self.backend.clock,
            &self.cfg.local_root,
            &self.cfg.remote_root,
        )
    }

    /// Local preconditions: root privilege (unless waived) and the btrfs tool.
    pub fn preflight(&self, require_privilege: bool) -> Result<(), RunError> {
        if require_privilege && !self.backend.local.privileged() {
            return Err(RunError::Precondition(
                "must run as root (btrfs snapshot/send need CAP_SYS_ADMIN)".into(),
            ));
        }
        if !self.backend.local.toolchain_present() {
            return Err(RunError::Precondition("btrfs tool not found locally".into()));
        }
        Ok(())
    }

    /// Connectivity probe; Ok carries the non-fatal warnings.
    pub fn check_connectivity(&self) -> Result<Vec<String>, RunError> {
        match ConnectivityProbe::new(self.backend.remote).probe(&self.cfg.remote_root) {
            ProbeOutcome::Ready => {
                info!(
                    "probe: {}:{} ready",
                    self.backend.remote.endpoint(),
                    self.cfg.remote_root.display()
                );
                Ok(Vec::new())
            }
            ProbeOutcome::Degraded(w) => Ok(w),
            ProbeOutcome::Failed(reason) => Err(RunError::Connectivity(reason)),
        }
    }

    pub fn run(&self) -> Result<RunSummary, RunError> {
        self.run_locked(|| Ok(()))
    }

    /// `run` with a run-exclusion guard taken right after the local preflight
    /// and held until the summary is built.
    pub fn run_locked<G, F>(&self, acquire: F) -> Result<RunSummary, RunError>
    where
        F: FnOnce() -> Result<G, RunError>,
    {
        let started = self.backend.clock.now();
        info!("run: start, {}", self.cfg);

        self.preflight(true)?;
        let _guard = acquire()?;
        let probe_warnings = self.check_connectivity()?;

        let mut results = Vec::with_capacity(self.cfg.subvolumes.len());
        let mut cancelled = false;

        for (i, sv) in self.cfg.subvolumes.iter().enumerate() {
            if i > 0 && !self.cancel.is_cancelled() && !self.cfg.pause_between.is_zero() {
                self.cancel.sleep(self.cfg.pause_between);
            }
            if self.cancel.is_cancelled() {
                if !cancelled {
                    warn!("run: cancelled, skipping remaining subvolumes");
                }
                cancelled = true;
                results.push(SubvolumeResult {
                    name: sv.name.clone(),
                    outcome: BackupOutcome::Skipped {
                        reason: "run cancelled".into(),
                    },
                });
                continue;
            }

            let outcome = self.run_subvolume(sv);
            match &outcome {
                BackupOutcome::Succeeded { mode, snapshot, .. } => {
                    info!("subvolume {}: done ({} transfer of {})", sv.name, mode, snapshot)
                }
                BackupOutcome::Skipped { reason } => {
                    warn!("subvolume {}: skipped: {}", sv.name, reason)
                }
                BackupOutcome::Failed { stage, cause } => {
                    error!("subvolume {}: failed at {}: {}", sv.name, stage, cause)
                }
            }
            results.push(SubvolumeResult {
                name: sv.name.clone(),
                outcome,
            });
        }

        let summary = RunSummary {
            started,
            finished: self.backend.clock.now(),
            results,
            probe_warnings,
            cancelled,
            metrics: self.metrics.snapshot(),
        };
        info!("run: metrics {}", summary.metrics);
        Ok(summary)
    }

    /// Snapshot -> transfer -> prune for one subvolume. Never panics or
    /// propagates: every error becomes the returned outcome.
    pub fn run_subvolume(&self, sv: &Subvolume) -> BackupOutcome {
        let deadline = Instant::now() + self.cfg.subvolume_deadline;
        let local = self.backend.local;
        info!("subvolume {}: start ({})", sv.name, sv.path.display());

        if !local.path_exists(&sv.path) {
            return BackupOutcome::Skipped {
                reason: format!("source {} does not exist", sv.path.display()),
            };
        }

        let manager = self.manager();
        let snapshot = match manager.create(sv) {
            Ok(s) => s,
            Err(e @ SnapshotError::NotASubvolume(_)) => {
                return BackupOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                return BackupOutcome::Failed {
                    stage: Stage::Snapshot,
                    cause: e.to_string(),
                }
            }
        };
        self.metrics.record_snapshot_created();

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return BackupOutcome::Failed {
                stage: Stage::Deadline,
                cause: format!(
                    "deadline of {:?} exceeded before transfer",
                    self.cfg.subvolume_deadline
                ),
            };
        }

        let history = manager.list(&sv.name, Side::Local);
        let parent = ParentResolver::new(self.backend.remote, &self.cfg.remote_root)
            .select(&snapshot, &history);
        match parent {
            Some(p) => info!("subvolume {}: parent {}", sv.name, p.name),
            None => info!("subvolume {}: no common parent, full transfer", sv.name),
        }

        let engine = TransferEngine::new(self.backend.transport, self.backend.remote, &self.cancel);
        let timeout = self.cfg.transfer_timeout.min(remaining);
        let remote_dir = self.cfg.remote_dir(&sv.name);
        let mode = match engine.send(&snapshot, parent, &remote_dir, timeout) {
            Ok(m) => m,
            Err(e) => {
                self.metrics.record_transfer_failed();
                return BackupOutcome::Failed {
                    stage: Stage::Transfer,
                    cause: e.to_string(),
                };
            }
        };
        match mode {
            TransferMode::Incremental => self.metrics.record_transfer_incremental(),
            TransferMode::Full => self.metrics.record_transfer_full(parent.is_some()),
        }
        let parent_name = parent.map(|p| p.name.clone());

        // Strictly after the transfer: the chosen parent is no longer needed by this run.
        let gc = RetentionGc::new(&manager, local, self.backend.remote, self.backend.clock);
        let pl = gc.prune(&sv.name, Side::Local, &self.cfg.retention);
        let pr = gc.prune(&sv.name, Side::Remote, &self.cfg.retention);
        self.metrics.record_pruned(
            pl.deleted_count(),
            pr.deleted_count(),
            pl.warnings.len() + pr.warnings.len(),
        );

        let mut prune_warnings = pl.warnings;
        prune_warnings.extend(pr.warnings);
        BackupOutcome::Succeeded {
            snapshot: snapshot.name,
            mode,
            parent: parent_name,
            pruned_local: pl.deleted.len(),
            pruned_remote: pr.deleted.len(),
            prune_warnings,
        }
    }
}
