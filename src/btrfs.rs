//! Local btrfs operations.
//!
//! `LocalVolumes` is the seam between the backup logic and the host: the real
//! implementation shells out to the `btrfs` tool, tests plug in an in-memory
//! double.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::exec::{self, CommandSpec};

pub trait LocalVolumes: Send + Sync {
    /// Effective uid is root.
    fn privileged(&self) -> bool;
    /// `btrfs` tool available.
    fn toolchain_present(&self) -> bool;
    fn path_exists(&self, path: &Path) -> bool;
    /// Path is the root of a btrfs subvolume (plain directories are not).
    fn is_subvolume(&self, path: &Path) -> bool;
    fn ensure_dir(&self, dir: &Path) -> Result<()>;
    fn create_readonly_snapshot(&self, source: &Path, dest: &Path) -> Result<()>;
    fn delete_subvolume(&self, path: &Path) -> Result<()>;
    /// Remove whatever is at `path`, subvolume or plain directory.
    fn remove_entry(&self, path: &Path) -> Result<()>;
    /// Entry names of `dir`; Ok(None) if the directory does not exist.
    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>>;
}

/// `btrfs`-CLI backed implementation. Each call is bounded by `timeout` and
/// runs to completion even when the run is being cancelled.
#[derive(Clone, Debug)]
pub struct BtrfsCli {
    timeout: Duration,
}

impl BtrfsCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn btrfs<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("btrfs").args(args);
        exec::run(&spec, self.timeout, &CancelToken::new())?.into_stdout(&spec)
    }
}

fn path_arg(p: &Path) -> Result<String> {
    p.to_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("non UTF-8 path {}", p.display()))
}

impl LocalVolumes for BtrfsCli {
    fn privileged(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    fn toolchain_present(&self) -> bool {
        match self.btrfs(["--version"]) {
            Ok(v) => {
                debug!("local toolchain: {}", v.trim());
                true
            }
            Err(e) => {
                debug!("local toolchain missing: {:#}", e);
                false
            }
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_subvolume(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let p = match path_arg(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match self.btrfs(["subvolume".to_string(), "show".to_string(), p]) {
            Ok(_) => true,
            Err(e) => {
                debug!("{} is not a subvolume: {:#}", path.display(), e);
                false
            }
        }
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))
    }

    fn create_readonly_snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
        self.btrfs([
            "subvolume".to_string(),
            "snapshot".to_string(),
            "-r".to_string(),
            path_arg(source)?,
            path_arg(dest)?,
        ])
        .map(|_| ())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        self.btrfs([
            "subvolume".to_string(),
            "delete".to_string(),
            path_arg(path)?,
        ])
        .map(|_| ())
    }

    fn remove_entry(&self, path: &Path) -> Result<()> {
        if self.is_subvolume(path) {
            return self.delete_subvolume(path);
        }
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read dir {}", dir.display())),
        };
        let mut names = Vec::new();
        for ent in rd {
            let ent = ent.with_context(|| format!("read dir entry in {}", dir.display()))?;
            if let Some(n) = ent.file_name().to_str() {
                names.push(n.to_string());
            }
        }
        Ok(Some(names))
    }
}
