//! Error taxonomy.
//!
//! Run-scoped errors (`RunError`) abort the whole run before or between
//! subvolumes. Subvolume-scoped errors (`SnapshotError`, `TransferFailed`)
//! are caught by the orchestrator and folded into a `BackupOutcome`.
//! Prune problems never become errors: they are warnings in a `PruneReport`.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// Missing privilege, missing local toolchain, run lock held by another process.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// Remote unreachable, remote toolchain missing, remote root uncreatable.
    #[error("connectivity check failed: {0}")]
    Connectivity(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("{} is not a btrfs subvolume", .0.display())]
    NotASubvolume(PathBuf),
    #[error("snapshot creation failed: {0}")]
    CreationFailed(String),
    #[error("snapshot at {} did not verify as a subvolume", .0.display())]
    VerificationFailed(PathBuf),
}

/// Both transfer modes were tried (or the incremental one was not applicable)
/// and neither ingested the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailed {
    /// Cause of the incremental attempt; None when no parent was available.
    pub incremental: Option<String>,
    pub full: String,
}

impl fmt::Display for TransferFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.incremental {
            Some(inc) => write!(f, "incremental: {}; full: {}", inc, self.full),
            None => write!(f, "full: {}", self.full),
        }
    }
}

impl std::error::Error for TransferFailed {}

/// Pipeline stage a subvolume failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Snapshot,
    Transfer,
    Deadline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Snapshot => "snapshot",
            Stage::Transfer => "transfer",
            Stage::Deadline => "deadline",
        };
        f.write_str(s)
    }
}
