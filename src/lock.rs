//! Run lock: one backup run per local snapshot root at a time.
//!
//! fs2 advisory exclusive lock on `<local_root>/.snapship.lock`, taken with
//! try-lock (a scheduled run that overlaps a long one fails fast instead of
//! queueing). Released on Drop, and by the kernel if the process dies, so no
//! lock outlives its run.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::RunError;

pub const LOCK_FILE: &str = ".snapship.lock";

pub struct RunLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn lock_file_path(local_root: &Path) -> PathBuf {
    local_root.join(LOCK_FILE)
}

fn open_lock_file(local_root: &Path) -> Result<std::fs::File> {
    fs::create_dir_all(local_root)
        .with_context(|| format!("create local root {}", local_root.display()))?;
    let path = lock_file_path(local_root);
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))
}

/// Take the run lock or report that another run holds it.
pub fn try_acquire_run_lock(local_root: &Path) -> Result<RunLock, RunError> {
    let file = open_lock_file(local_root)
        .map_err(|e| RunError::Precondition(format!("{:#}", e)))?;
    let path = lock_file_path(local_root);
    file.try_lock_exclusive().map_err(|e| {
        RunError::Precondition(format!(
            "another snapship run holds {} ({})",
            path.display(),
            e
        ))
    })?;
    Ok(RunLock { file, path })
}
