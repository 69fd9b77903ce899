//! Per-run counters.
//!
//! Atomic so that a concurrent per-subvolume runner could share one instance;
//! `snapshot()` freezes them for logging and the status file.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RunMetrics {
    snapshots_created: AtomicU64,
    transfers_incremental: AtomicU64,
    transfers_full: AtomicU64,
    transfer_fallbacks: AtomicU64,
    transfers_failed: AtomicU64,
    pruned_local: AtomicU64,
    pruned_remote: AtomicU64,
    prune_warnings: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub snapshots_created: u64,
    pub transfers_incremental: u64,
    pub transfers_full: u64,
    /// Full transfers that followed a failed incremental attempt.
    pub transfer_fallbacks: u64,
    pub transfers_failed: u64,
    pub pruned_local: u64,
    pub pruned_remote: u64,
    pub prune_warnings: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_snapshot_created(&self) {
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_incremental(&self) {
        self.transfers_incremental.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_full(&self, after_fallback: bool) {
        self.transfers_full.fetch_add(1, Ordering::Relaxed);
        if after_fallback {
            self.transfer_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, local: usize, remote: usize, warnings: usize) {
        self.pruned_local.fetch_add(local as u64, Ordering::Relaxed);
        self.pruned_remote.fetch_add(remote as u64, Ordering::Relaxed);
        self.prune_warnings.fetch_add(warnings as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            snapshots_created: self.snapshots_created.load(Ordering::Relaxed),
            transfers_incremental: self.transfers_incremental.load(Ordering::Relaxed),
            transfers_full: self.transfers_full.load(Ordering::Relaxed),
            transfer_fallbacks: self.transfer_fallbacks.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            pruned_local: self.pruned_local.load(Ordering::Relaxed),
            pruned_remote: self.pruned_remote.load(Ordering::Relaxed),
            prune_warnings: self.prune_warnings.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshots={} incremental={} full={} (fallbacks={}) failed={} \
             pruned_local={} pruned_remote={} prune_warnings={}",
            self.snapshots_created,
            self.transfers_incremental,
            self.transfers_full,
            self.transfer_fallbacks,
            self.transfers_failed,
            self.pruned_local,
            self.pruned_remote,
            self.prune_warnings
        )
    }
}
