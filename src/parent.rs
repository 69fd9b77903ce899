//! Choice of the incremental parent.
//!
//! A parent must exist on BOTH sides: `btrfs receive` of a delta against a
//! parent the remote does not hold fails outright, and a parent the local side
//! no longer holds cannot be sent from. Among the local snapshots older than
//! the target we walk newest -> oldest and take the first one the remote also
//! has. No candidate means a full transfer.

use log::{debug, warn};
use std::path::Path;

use crate::remote::RemoteStore;
use crate::snapshot::{Side, Snapshot, SnapshotHistory};

/// Newest snapshot in `local_history` older than `target` for which
/// `remote_exists` holds.
pub fn select_parent<'h, F>(
    target: &Snapshot,
    local_history: &'h SnapshotHistory,
    mut remote_exists: F,
) -> Option<&'h Snapshot>
where
    F: FnMut(&Snapshot) -> bool,
{
    if local_history.subvolume != target.subvolume {
        return None;
    }
    local_history
        .before(target.timestamp)
        .iter()
        .rev()
        .filter(|c| c.subvolume == target.subvolume)
        .find(|c| {
            let hit = remote_exists(c);
            if !hit {
                debug!("parent: {} absent on remote, skipping", c.name);
            }
            hit
        })
}

/// `select_parent` with remote existence answered by a `RemoteStore`.
pub struct ParentResolver<'a> {
    remote: &'a dyn RemoteStore,
    remote_root: &'a Path,
}

impl<'a> ParentResolver<'a> {
    pub fn new(remote: &'a dyn RemoteStore, remote_root: &'a Path) -> Self {
        Self {
            remote,
            remote_root,
        }
    }

    pub fn select<'h>(
        &self,
        target: &Snapshot,
        local_history: &'h SnapshotHistory,
    ) -> Option<&'h Snapshot> {
        select_parent(target, local_history, |c| {
            let remote = c.on_side(Side::Remote, self.remote_root);
            match self.remote.snapshot_exists(&remote.path) {
                Ok(found) => found,
                Err(e) => {
                    // Unknown counts as absent: worst case is a full transfer.
                    warn!(
                        "parent: cannot check {} on remote: {:#}",
                        remote.path.display(),
                        e
                    );
                    false
                }
            }
        })
    }
}
