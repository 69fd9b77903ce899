// tests/common/mod.rs
//
// In-memory doubles for the host seams (LocalVolumes, RemoteStore,
// StreamTransport) plus helpers to seed snapshot histories.
// Nothing here touches the real filesystem or spawns a process.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use snapship::btrfs::LocalVolumes;
use snapship::remote::RemoteStore;
use snapship::timestamp::ManualClock;
use snapship::transfer::StreamTransport;
use snapship::{BackupConfig, NameCodec, Snapshot, Timestamp};

pub const REMOTE_HOST: &str = "backup@nas.lan";
pub const REMOTE_ROOT: &str = "/mnt/backup";
pub const LOCAL_ROOT: &str = "/.snapshots";

pub fn now() -> Timestamp {
    Timestamp::from_ymd_hms(2024, 5, 1, 3, 0, 0).unwrap()
}

pub fn days_ago(days: u32) -> Timestamp {
    now().minus_days(days)
}

pub fn clock() -> ManualClock {
    ManualClock::new(now())
}

/// Minimal valid config; add subvolumes with `with_subvolume`.
pub fn base_config() -> BackupConfig {
    BackupConfig::default()
        .with_remote(REMOTE_HOST, REMOTE_ROOT)
        .with_local_root(LOCAL_ROOT)
        .with_retention(7, 30)
        .with_log_file(None::<PathBuf>)
        .with_pause_between(Duration::ZERO)
}

pub fn snapshot_name(subvolume: &str, ts: Timestamp) -> String {
    NameCodec::default().snapshot_name(subvolume, ts)
}

pub fn local_snapshot_path(subvolume: &str, ts: Timestamp) -> PathBuf {
    Path::new(LOCAL_ROOT)
        .join(subvolume)
        .join(snapshot_name(subvolume, ts))
}

pub fn remote_snapshot_path(subvolume: &str, ts: Timestamp) -> PathBuf {
    Path::new(REMOTE_ROOT)
        .join(subvolume)
        .join(snapshot_name(subvolume, ts))
}

fn children(dir: &Path, sets: &[&BTreeSet<PathBuf>]) -> Vec<String> {
    let mut out = BTreeSet::new();
    for set in sets {
        for p in set.iter() {
            if p.parent() == Some(dir) {
                if let Some(n) = p.file_name() {
                    out.insert(n.to_string_lossy().into_owned());
                }
            }
        }
    }
    out.into_iter().collect()
}

// ---------------- local ----------------

#[derive(Debug, Default)]
pub struct LocalState {
    pub privileged: bool,
    pub toolchain: bool,
    /// Subvolume roots, sources and snapshots alike.
    pub subvolumes: BTreeSet<PathBuf>,
    /// Plain directories (snapshot dirs, non-subvolume sources).
    pub dirs: BTreeSet<PathBuf>,
    /// Snapshot creation "succeeds" but leaves a non-subvolume behind.
    pub broken_snapshots: bool,
    pub fail_create: bool,
    pub fail_delete: BTreeSet<PathBuf>,
    pub created: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct FakeLocal {
    state: Arc<Mutex<LocalState>>,
}

impl FakeLocal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState {
                privileged: true,
                toolchain: true,
                ..LocalState::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap()
    }

    pub fn add_subvolume<P: Into<PathBuf>>(&self, p: P) -> &Self {
        self.state().subvolumes.insert(p.into());
        self
    }

    pub fn add_dir<P: Into<PathBuf>>(&self, p: P) -> &Self {
        self.state().dirs.insert(p.into());
        self
    }

    pub fn seed_snapshot(&self, subvolume: &str, ts: Timestamp) -> &Self {
        let mut st = self.state();
        st.dirs.insert(Path::new(LOCAL_ROOT).join(subvolume));
        st.subvolumes.insert(local_snapshot_path(subvolume, ts));
        self
    }

    pub fn has(&self, p: &Path) -> bool {
        self.state().subvolumes.contains(p)
    }

    /// Snapshot names currently held for `subvolume`.
    pub fn snapshots_of(&self, subvolume: &str) -> Vec<String> {
        let st = self.state();
        children(&Path::new(LOCAL_ROOT).join(subvolume), &[&st.subvolumes])
    }
}

impl LocalVolumes for FakeLocal {
    fn privileged(&self) -> bool {
        self.state().privileged
    }

    fn toolchain_present(&self) -> bool {
        self.state().toolchain
    }

    fn path_exists(&self, path: &Path) -> bool {
        let st = self.state();
        st.subvolumes.contains(path) || st.dirs.contains(path)
    }

    fn is_subvolume(&self, path: &Path) -> bool {
        self.state().subvolumes.contains(path)
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        self.state().dirs.insert(dir.to_path_buf());
        Ok(())
    }

    fn create_readonly_snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
        let mut st = self.state();
        if st.fail_create {
            bail!("ERROR: cannot snapshot '{}': No space left on device", source.display());
        }
        if !st.subvolumes.contains(source) {
            bail!("ERROR: '{}' is not a subvolume", source.display());
        }
        if st.broken_snapshots {
            st.dirs.insert(dest.to_path_buf());
        } else {
            st.subvolumes.insert(dest.to_path_buf());
        }
        st.created.push(dest.to_path_buf());
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let mut st = self.state();
        if st.fail_delete.contains(path) {
            bail!("ERROR: cannot delete '{}': Device or resource busy", path.display());
        }
        if !st.subvolumes.remove(path) {
            bail!("ERROR: '{}' does not exist", path.display());
        }
        st.deleted.push(path.to_path_buf());
        Ok(())
    }

    fn remove_entry(&self, path: &Path) -> Result<()> {
        let mut st = self.state();
        let was_subvolume = st.subvolumes.remove(path);
        if !was_subvolume && !st.dirs.remove(path) {
            bail!("rm: cannot remove '{}': No such file or directory", path.display());
        }
        st.deleted.push(path.to_path_buf());
        Ok(())
    }

    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        let st = self.state();
        if !st.dirs.contains(dir) {
            return Ok(None);
        }
        Ok(Some(children(dir, &[&st.subvolumes, &st.dirs])))
    }
}

// ---------------- remote ----------------

#[derive(Debug)]
pub struct RemoteState {
    pub reachable: bool,
    pub toolchain: bool,
    pub fs_type: String,
    pub dirs: BTreeSet<PathBuf>,
    /// Completely received snapshots.
    pub snapshots: BTreeSet<PathBuf>,
    /// Half-received copies (no Received UUID yet).
    pub partial: BTreeSet<PathBuf>,
    /// `snapshot_exists` errors for these paths.
    pub unanswerable: BTreeSet<PathBuf>,
    pub fail_delete: BTreeSet<PathBuf>,
    pub fail_list: bool,
    pub deleted: Vec<PathBuf>,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            reachable: true,
            toolchain: true,
            fs_type: "btrfs".to_string(),
            dirs: BTreeSet::from([PathBuf::from(REMOTE_ROOT)]),
            snapshots: BTreeSet::new(),
            partial: BTreeSet::new(),
            unanswerable: BTreeSet::new(),
            fail_delete: BTreeSet::new(),
            fail_list: false,
            deleted: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        let r = Self::new();
        r.state().reachable = false;
        r
    }

    pub fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn seed_snapshot(&self, subvolume: &str, ts: Timestamp) -> &Self {
        let mut st = self.state();
        st.dirs.insert(Path::new(REMOTE_ROOT).join(subvolume));
        st.snapshots.insert(remote_snapshot_path(subvolume, ts));
        self
    }

    /// Half-received copy left by an interrupted earlier run.
    pub fn seed_partial(&self, subvolume: &str, ts: Timestamp) -> &Self {
        let mut st = self.state();
        st.dirs.insert(Path::new(REMOTE_ROOT).join(subvolume));
        st.partial.insert(remote_snapshot_path(subvolume, ts));
        self
    }

    pub fn has(&self, p: &Path) -> bool {
        self.state().snapshots.contains(p)
    }

    pub fn has_partial(&self, p: &Path) -> bool {
        self.state().partial.contains(p)
    }

    pub fn snapshots_of(&self, subvolume: &str) -> Vec<String> {
        let st = self.state();
        children(&Path::new(REMOTE_ROOT).join(subvolume), &[&st.snapshots])
    }

    fn reach(&self) -> Result<MutexGuard<'_, RemoteState>> {
        let st = self.state();
        if !st.reachable {
            return Err(anyhow!(
                "ssh: connect to host nas.lan port 22: Connection timed out"
            ));
        }
        Ok(st)
    }
}

impl RemoteStore for FakeRemote {
    fn endpoint(&self) -> String {
        REMOTE_HOST.to_string()
    }

    fn ping(&self) -> Result<()> {
        self.reach().map(|_| ())
    }

    fn dir_exists(&self, dir: &Path) -> Result<bool> {
        Ok(self.reach()?.dirs.contains(dir))
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        self.reach()?.dirs.insert(dir.to_path_buf());
        Ok(())
    }

    fn toolchain_present(&self) -> Result<bool> {
        Ok(self.reach()?.toolchain)
    }

    fn filesystem_type(&self, _path: &Path) -> Result<String> {
        Ok(self.reach()?.fs_type.clone())
    }

    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        let st = self.reach()?;
        if st.fail_list {
            bail!("ls: cannot open directory '{}': Permission denied", dir.display());
        }
        if !st.dirs.contains(dir) {
            return Ok(None);
        }
        Ok(Some(children(dir, &[&st.snapshots, &st.partial])))
    }

    fn entry_exists(&self, path: &Path) -> Result<bool> {
        let st = self.reach()?;
        Ok(st.snapshots.contains(path) || st.partial.contains(path))
    }

    fn snapshot_exists(&self, path: &Path) -> Result<bool> {
        let st = self.reach()?;
        if st.unanswerable.contains(path) {
            bail!("ssh: Connection reset by peer");
        }
        Ok(st.snapshots.contains(path))
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let mut st = self.reach()?;
        if st.fail_delete.contains(path) {
            bail!("ERROR: cannot delete '{}': Operation not permitted", path.display());
        }
        let was_snapshot = st.snapshots.remove(path);
        if !was_snapshot && !st.partial.remove(path) {
            bail!("ERROR: '{}' does not exist", path.display());
        }
        st.deleted.push(path.to_path_buf());
        Ok(())
    }
}

// ---------------- transport ----------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferCall {
    pub snapshot: String,
    pub parent: Option<String>,
    pub remote_dir: PathBuf,
}

/// Delivers the snapshot into the FakeRemote. An incremental send needs the
/// parent on the remote, as `btrfs receive` does.
#[derive(Debug)]
pub struct FakeTransport {
    remote: FakeRemote,
    pub fail_incremental: Mutex<bool>,
    pub fail_full: Mutex<bool>,
    /// A failing attempt leaves a half-received copy behind.
    pub leave_residue: Mutex<bool>,
    pub calls: Mutex<Vec<TransferCall>>,
}

impl FakeTransport {
    pub fn new(remote: &FakeRemote) -> Self {
        Self {
            remote: remote.clone(),
            fail_incremental: Mutex::new(false),
            fail_full: Mutex::new(false),
            leave_residue: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_incremental(self) -> Self {
        *self.fail_incremental.lock().unwrap() = true;
        self
    }

    pub fn failing_full(self) -> Self {
        *self.fail_full.lock().unwrap() = true;
        self
    }

    pub fn leaving_residue(self) -> Self {
        *self.leave_residue.lock().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().unwrap().clone()
    }

    fn fail(&self, dest: PathBuf, why: &str) -> Result<()> {
        if *self.leave_residue.lock().unwrap() {
            self.remote.state().partial.insert(dest);
        }
        Err(anyhow!("{}", why))
    }
}

impl StreamTransport for FakeTransport {
    fn transfer(
        &self,
        snapshot: &Snapshot,
        parent: Option<&Snapshot>,
        remote_dir: &Path,
        _timeout: Duration,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(TransferCall {
            snapshot: snapshot.name.clone(),
            parent: parent.map(|p| p.name.clone()),
            remote_dir: remote_dir.to_path_buf(),
        });
        let dest = remote_dir.join(&snapshot.name);

        if self.remote.has(&dest) || self.remote.has_partial(&dest) {
            return self.fail(dest, "ERROR: destination exists");
        }
        match parent {
            Some(p) => {
                if *self.fail_incremental.lock().unwrap() {
                    return self.fail(
                        dest,
                        "send exited 1; receive exited 1: ERROR: parent not found",
                    );
                }
                if !self.remote.has(&remote_dir.join(&p.name)) {
                    return self.fail(dest, "receive exited 1: ERROR: cannot find parent subvolume");
                }
            }
            None => {
                if *self.fail_full.lock().unwrap() {
                    return self.fail(dest, "receive exited 1: ERROR: No space left on device");
                }
            }
        }
        self.remote.state().snapshots.insert(dest);
        Ok(())
    }
}
