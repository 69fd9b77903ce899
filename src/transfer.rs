//! Snapshot transfer: `btrfs send [-p parent] <snap> | ssh <host> btrfs receive <dir>`.
//!
//! Attempt order:
//!   1. incremental against `parent` (if any),
//!   2. full, if 1 was skipped or failed.
//! Never more than two attempts. Before each attempt a leftover remote
//! directory with the target's name is removed (it can only be a partial
//! ingest, the target is brand new), so re-ingesting into the same path is
//! always safe. The same cleanup runs after a terminal failure. Parent
//! selection only trusts completely received copies, so a residue that
//! survives (e.g. the process was killed) is never used as a parent either.

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::TransferFailed;
use crate::exec::{self, CommandSpec};
use crate::remote::{RemoteStore, SshRemote};
use crate::snapshot::Snapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Incremental,
    Full,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferMode::Incremental => "incremental",
            TransferMode::Full => "full",
        })
    }
}

/// One extraction -> ingestion run. Ok only if both stages succeeded.
pub trait StreamTransport: Send + Sync {
    fn transfer(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        timeout: Duration,
    ) -> Result<()>;
}

/// btrfs send piped into a remote btrfs receive over ssh.
pub struct SendReceive<'a> {
    remote: &'a SshRemote,
    cancel: CancelToken,
}

impl<'a> SendReceive<'a> {
    pub fn new(remote: &'a SshRemote, cancel: CancelToken) -> Self {
        Self { remote, cancel }
    }

    pub fn send_command(snapshot: &Snapshot, parent: Option<&Snapshot>) -> CommandSpec {
        let mut spec = CommandSpec::new("btrfs").arg("send");
        if let Some(p) = parent {
            spec = spec.arg("-p").arg(p.path.display().to_string());
        }
        spec.arg(snapshot.path.display().to_string())
    }
}

impl StreamTransport for SendReceive<'_> {
    fn transfer(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        timeout: Duration,
    ) -> Result<()> {
        let producer = Self::send_command(snapshot, parent);
        let consumer = self.remote.receive_command(remote_dir);
        let report = exec::run_pipe(&producer, &consumer, timeout, &self.cancel)?;
        if report.success() {
            Ok(())
        } else {
            Err(anyhow!("{}", report.describe()))
        }
    }
}

pub struct TransferEngine<'a> {
    transport: &'a dyn StreamTransport,
    remote: &'a dyn RemoteStore,
    cancel: &'a CancelToken,
}

impl<'a> TransferEngine<'a> {
    pub fn new(
        transport: &'a dyn StreamTransport,
        remote: &'a dyn RemoteStore,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            transport,
            remote,
            cancel,
        }
    }

    /// Ship `snapshot` into `remote_dir` (the subvolume's remote directory),
    /// incrementally when `parent` is given, falling back to a full send.
    pub fn send(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        timeout: Duration,
    ) -> Result<TransferMode, TransferFailed> {
        let deadline = Instant::now() + timeout;
        let dest = remote_dir.join(&snapshot.name);

        if let Err(e) = self.ensure_remote_dir(remote_dir) {
            return Err(TransferFailed {
                incremental: None,
                full: format!("{:#}", e),
            });
        }

        let mut incremental_cause = None;
        if let Some(p) = parent {
            info!(
                "transfer: {} incremental from {} -> {}:{}",
                snapshot.name,
                p.name,
                self.remote.endpoint(),
                remote_dir.display()
            );
            match self.attempt(snapshot, Some(p), remote_dir, &dest, deadline) {
                Ok(()) => return Ok(TransferMode::Incremental),
                Err(e) => {
                    let cause = format!("{:#}", e);
                    warn!(
                        "transfer: incremental {} failed, falling back to full: {}",
                        snapshot.name, cause
                    );
                    incremental_cause = Some(cause);
                }
            }
            if self.cancel.is_cancelled() {
                self.discard_partial(&dest);
                return Err(TransferFailed {
                    incremental: incremental_cause,
                    full: "not attempted: run cancelled".to_string(),
                });
            }
        }

        info!(
            "transfer: {} full -> {}:{}",
            snapshot.name,
            self.remote.endpoint(),
            remote_dir.display()
        );
        match self.attempt(snapshot, None, remote_dir, &dest, deadline) {
            Ok(()) => Ok(TransferMode::Full),
            Err(e) => {
                self.discard_partial(&dest);
                Err(TransferFailed {
                    incremental: incremental_cause,
                    full: format!("{:#}", e),
                })
            }
        }
    }

    fn ensure_remote_dir(&self, dir: &Path) -> Result<()> {
        if !self.remote.dir_exists(dir)? {
            self.remote.create_dir_all(dir)?;
        }
        Ok(())
    }

    fn attempt(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        dest: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(anyhow!("transfer time budget exhausted"));
        }
        self.clear_residue(dest)?;
        self.transport.transfer(snapshot, parent, remote_dir, left)
    }

    /// Remove a leftover remote copy of the target before ingesting into it.
    fn clear_residue(&self, dest: &Path) -> Result<()> {
        if self.remote.entry_exists(dest)? {
            warn!("transfer: removing partial remote copy {}", dest.display());
            self.remote
                .delete_subvolume(dest)
                .map_err(|e| anyhow!("cannot clear partial {}: {:#}", dest.display(), e))?;
        }
        Ok(())
    }

    fn discard_partial(&self, dest: &Path) {
        if let Err(e) = self.clear_residue(dest) {
            warn!("transfer: {:#}", e);
        }
    }
}
