//! Snapshots: data model and the manager that creates and enumerates them.
//!
//! On-disk layout (both sides):
//!   <root>/<subvolume>/<subvolume>-<timestamp>/
//!
//! Snapshots are read-only and never mutated; besides being transferred the
//! only thing that ever happens to one is deletion by retention.

use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::btrfs::LocalVolumes;
use crate::config::Subvolume;
use crate::error::SnapshotError;
use crate::remote::RemoteStore;
use crate::timestamp::{Clock, NameCodec, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Local => "local",
            Side::Remote => "remote",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub subvolume: String,
    pub timestamp: Timestamp,
    /// `<subvolume>-<timestamp>`
    pub name: String,
    pub path: PathBuf,
    pub side: Side,
}

impl Snapshot {
    /// Same snapshot as it is (or would be) laid out under `root` on `side`.
    pub fn on_side(&self, side: Side, root: &Path) -> Snapshot {
        Snapshot {
            subvolume: self.subvolume.clone(),
            timestamp: self.timestamp,
            name: self.name.clone(),
            path: root.join(&self.subvolume).join(&self.name),
            side,
        }
    }
}

/// Snapshots of one subvolume on one side, ascending by timestamp.
#[derive(Clone, Debug)]
pub struct SnapshotHistory {
    pub subvolume: String,
    pub side: Side,
    snapshots: Vec<Snapshot>,
}

impl SnapshotHistory {
    pub fn empty(subvolume: &str, side: Side) -> Self {
        Self {
            subvolume: subvolume.to_string(),
            side,
            snapshots: Vec::new(),
        }
    }

    /// Build from directory entry names; anything that does not parse as
    /// `<subvolume>-<timestamp>` is skipped. Duplicate timestamps keep the
    /// first entry.
    pub fn from_entries<I, S>(
        subvolume: &str,
        side: Side,
        dir: &Path,
        entries: I,
        codec: &NameCodec,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshots: Vec<Snapshot> = entries
            .into_iter()
            .filter_map(|e| {
                let name = e.as_ref();
                match codec.parse_snapshot_name(subvolume, name) {
                    Some(ts) => Some(Snapshot {
                        subvolume: subvolume.to_string(),
                        timestamp: ts,
                        name: name.to_string(),
                        path: dir.join(name),
                        side,
                    }),
                    None => {
                        debug!("{} history of {}: ignore entry '{}'", side, subvolume, name);
                        None
                    }
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.timestamp);
        snapshots.dedup_by_key(|s| s.timestamp);
        Self {
            subvolume: subvolume.to_string(),
            side,
            snapshots,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot> {
        self.snapshots.iter()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Snapshots strictly older than `ts`, oldest first.
    pub fn before(&self, ts: Timestamp) -> &[Snapshot] {
        let end = self.snapshots.partition_point(|s| s.timestamp < ts);
        &self.snapshots[..end]
    }

    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.snapshots.iter().map(|s| s.timestamp).collect()
    }
}

impl<'a> IntoIterator for &'a SnapshotHistory {
    type Item = &'a Snapshot;
    type IntoIter = std::slice::Iter<'a, Snapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.iter()
    }
}

pub struct SnapshotManager<'a> {
    local: &'a dyn LocalVolumes,
    remote: &'a dyn RemoteStore,
    codec: &'a NameCodec,
    clock: &'a dyn Clock,
    local_root: &'a Path,
    remote_root: &'a Path,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(
        local: &'a dyn LocalVolumes,
        remote: &'a dyn RemoteStore,
        codec: &'a NameCodec,
        clock: &'a dyn Clock,
        local_root: &'a Path,
        remote_root: &'a Path,
    ) -> Self {
        Self {
            local,
            remote,
            codec,
            clock,
            local_root,
            remote_root,
        }
    }

    pub fn dir(&self, subvolume: &str, side: Side) -> PathBuf {
        match side {
            Side::Local => self.local_root.join(subvolume),
            Side::Remote => self.remote_root.join(subvolume),
        }
    }

    /// Take a read-only snapshot of `sv` at `<local_root>/<name>/<name>-<now>`.
    pub fn create(&self, sv: &Subvolume) -> Result<Snapshot, SnapshotError> {
        if !self.local.is_subvolume(&sv.path) {
            return Err(SnapshotError::NotASubvolume(sv.path.clone()));
        }

        let dir = self.dir(&sv.name, Side::Local);
        self.local
            .ensure_dir(&dir)
            .map_err(|e| SnapshotError::CreationFailed(format!("{:#}", e)))?;

        let ts = self.clock.now();
        // Timestamps must strictly increase per subvolume.
        if let Some(newest) = self.list(&sv.name, Side::Local).latest() {
            if newest.timestamp >= ts {
                return Err(SnapshotError::CreationFailed(format!(
                    "newest local snapshot {} is not older than now ({})",
                    newest.name, ts
                )));
            }
        }

        let name = self.codec.snapshot_name(&sv.name, ts);
        let path = dir.join(&name);
        if self.local.path_exists(&path) {
            return Err(SnapshotError::CreationFailed(format!(
                "{} already exists",
                path.display()
            )));
        }

        info!("snapshot: {} -> {}", sv.path.display(), path.display());
        self.local
            .create_readonly_snapshot(&sv.path, &path)
            .map_err(|e| SnapshotError::CreationFailed(format!("{:#}", e)))?;

        if !self.local.is_subvolume(&path) {
            warn!(
                "snapshot: {} exists but is not a valid subvolume, discarding it",
                path.display()
            );
            // Its name parses, so left behind it would show up in every history.
            if let Err(e) = self.local.remove_entry(&path) {
                warn!("snapshot: cannot remove {}: {:#}", path.display(), e);
            }
            return Err(SnapshotError::VerificationFailed(path));
        }

        Ok(Snapshot {
            subvolume: sv.name.clone(),
            timestamp: ts,
            name,
            path,
            side: Side::Local,
        })
    }

    /// Enumerate snapshots of `subvolume` on `side`. Never fails: listing
    /// errors are logged and yield an empty history.
    pub fn list(&self, subvolume: &str, side: Side) -> SnapshotHistory {
        let dir = self.dir(subvolume, side);
        let listed = match side {
            Side::Local => self.local.list_entries(&dir),
            Side::Remote => self.remote.list_entries(&dir),
        };
        match listed {
            Ok(Some(entries)) => {
                SnapshotHistory::from_entries(subvolume, side, &dir, entries, self.codec)
            }
            Ok(None) => SnapshotHistory::empty(subvolume, side),
            Err(e) => {
                warn!(
                    "list {} snapshots of {} in {}: {:#}",
                    side,
                    subvolume,
                    dir.display(),
                    e
                );
                SnapshotHistory::empty(subvolume, side)
            }
        }
    }
}
