//! Age-based pruning, local and remote independently.
//!
//! cutoff = now - days, evaluated at prune time. A snapshot is deleted when its
//! embedded timestamp is strictly older than the cutoff. The newest snapshot
//! of a side is never deleted: it is the next run's incremental parent and,
//! right after a transfer, the only copy of the current state. Failing to
//! delete one snapshot is a warning; pruning continues with the rest.

use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;

use crate::btrfs::LocalVolumes;
use crate::config::RetentionPolicy;
use crate::remote::RemoteStore;
use crate::snapshot::{Side, Snapshot, SnapshotManager};
use crate::timestamp::{Clock, Timestamp};

#[derive(Clone, Debug, Default, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub warnings: Vec<String>,
}

impl PruneReport {
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

pub struct RetentionGc<'a> {
    manager: &'a SnapshotManager<'a>,
    local: &'a dyn LocalVolumes,
    remote: &'a dyn RemoteStore,
    clock: &'a dyn Clock,
}

impl<'a> RetentionGc<'a> {
    pub fn new(
        manager: &'a SnapshotManager<'a>,
        local: &'a dyn LocalVolumes,
        remote: &'a dyn RemoteStore,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            manager,
            local,
            remote,
            clock,
        }
    }

    pub fn cutoff(&self, side: Side, policy: &RetentionPolicy) -> Timestamp {
        self.clock.now().minus_days(policy.days(side))
    }

    pub fn prune(&self, subvolume: &str, side: Side, policy: &RetentionPolicy) -> PruneReport {
        let cutoff = self.cutoff(side, policy);
        let history = self.manager.list(subvolume, side);
        let newest = history.latest().map(|s| s.timestamp);
        let mut report = PruneReport::default();

        for snap in history.before(cutoff) {
            if Some(snap.timestamp) == newest {
                debug!("prune: keeping newest {} snapshot {}", side, snap.name);
                continue;
            }
            match self.delete(snap) {
                Ok(()) => {
                    info!("prune: deleted {} snapshot {}", side, snap.path.display());
                    report.deleted.push(snap.name.clone());
                }
                Err(e) => {
                    let w = format!(
                        "could not delete {} snapshot {}: {:#}",
                        side,
                        snap.path.display(),
                        e
                    );
                    warn!("prune: {}", w);
                    report.warnings.push(w);
                }
            }
        }

        if report.deleted.is_empty() && report.warnings.is_empty() {
            info!(
                "prune: {} {}: nothing older than {} ({} kept)",
                side,
                subvolume,
                cutoff,
                history.len()
            );
        }
        report
    }

    fn delete(&self, snap: &Snapshot) -> anyhow::Result<()> {
        let path: &Path = &snap.path;
        match snap.side {
            Side::Local => self.local.delete_subvolume(path),
            Side::Remote => self.remote.delete_subvolume(path),
        }
    }
}
