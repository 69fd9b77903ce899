//! Remote side, reached over ssh.
//!
//! Every remote operation is a single `ssh <opts> <host> -- <quoted command>`
//! invocation with `BatchMode=yes` (never prompts) and a bounded
//! `ConnectTimeout`. ssh itself reports its own failures with exit code 255,
//! which lets us tell "remote said no" apart from "could not ask".
//!
//! These commands are short and bounded by `command_timeout` only; a pending
//! cancellation does not interrupt them, so residue cleanup after an
//! interrupted transfer still reaches the host.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::exec::{self, CmdOutput, CommandSpec, StageStatus};

const SSH_FAILURE: i32 = 255;

pub trait RemoteStore: Send + Sync {
    /// Human-readable endpoint (e.g. `backup@nas.lan`).
    fn endpoint(&self) -> String;
    /// Round trip to the host within the connect timeout.
    fn ping(&self) -> Result<()>;
    fn dir_exists(&self, dir: &Path) -> Result<bool>;
    fn create_dir_all(&self, dir: &Path) -> Result<()>;
    /// Remote `btrfs` tool present.
    fn toolchain_present(&self) -> Result<bool>;
    /// Filesystem type name of the filesystem holding `path`.
    fn filesystem_type(&self, path: &Path) -> Result<String>;
    /// Entry names of `dir`; Ok(None) if the directory does not exist.
    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>>;
    /// Anything at `path`, including a partially received subvolume.
    fn entry_exists(&self, path: &Path) -> Result<bool>;
    /// A completely received snapshot is at `path`.
    fn snapshot_exists(&self, path: &Path) -> Result<bool>;
    fn delete_subvolume(&self, path: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct SshRemote {
    host: String,
    port: Option<u16>,
    identity: Option<PathBuf>,
    sudo: bool,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshRemote {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            port: None,
            identity: None,
            sudo: false,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_sudo(mut self, on: bool) -> Self {
        self.sudo = on;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.connect_timeout = connect;
        self.command_timeout = command;
        self
    }

    /// Wrap `remote` into the local ssh invocation that runs it on the host.
    pub fn ssh_command(&self, remote: &CommandSpec) -> CommandSpec {
        let mut spec = CommandSpec::new("ssh")
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ));
        if let Some(port) = self.port {
            spec = spec.arg("-p").arg(port.to_string());
        }
        if let Some(id) = &self.identity {
            spec = spec.arg("-i").arg(id.display().to_string());
        }
        spec.arg(self.host.clone()).arg("--").arg(remote.to_shell())
    }

    /// Remote command that needs root on the host.
    pub fn privileged(&self, spec: CommandSpec) -> CommandSpec {
        if !self.sudo {
            return spec;
        }
        CommandSpec::new("sudo")
            .arg("-n")
            .arg(spec.program)
            .args(spec.args)
    }

    /// Remote ingestion command for the transfer pipe.
    pub fn receive_command(&self, dir: &Path) -> CommandSpec {
        let recv = self.privileged(
            CommandSpec::new("btrfs")
                .arg("receive")
                .arg(dir.display().to_string()),
        );
        self.ssh_command(&recv)
    }

    fn run_remote(&self, remote: &CommandSpec) -> Result<CmdOutput> {
        let out = exec::run(
            &self.ssh_command(remote),
            self.command_timeout,
            &CancelToken::new(),
        )?;
        match out.status {
            StageStatus::Exited(SSH_FAILURE) => Err(anyhow!(
                "ssh to {} failed: {}",
                self.host,
                out.stderr.trim()
            )),
            StageStatus::Exited(_) => Ok(out),
            ref other => Err(anyhow!(
                "`{}` on {}: {}",
                remote,
                self.host,
                other
            )),
        }
    }

    /// exit 0 -> true, other remote exit -> false, ssh failure -> Err.
    fn test_remote(&self, remote: &CommandSpec) -> Result<bool> {
        Ok(self.run_remote(remote)?.success())
    }

    fn must_succeed(&self, remote: &CommandSpec) -> Result<String> {
        let out = self.run_remote(remote)?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(anyhow!(
                "`{}` on {} failed ({}): {}",
                remote,
                self.host,
                out.status,
                out.stderr.trim()
            ))
        }
    }
}

fn test_dir(dir: &Path) -> CommandSpec {
    CommandSpec::new("test")
        .arg("-d")
        .arg(dir.display().to_string())
}

impl RemoteStore for SshRemote {
    fn endpoint(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }

    fn ping(&self) -> Result<()> {
        self.must_succeed(&CommandSpec::new("true")).map(|_| ())
    }

    fn dir_exists(&self, dir: &Path) -> Result<bool> {
        self.test_remote(&test_dir(dir))
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        let mkdir = self.privileged(
            CommandSpec::new("mkdir")
                .arg("-p")
                .arg(dir.display().to_string()),
        );
        self.must_succeed(&mkdir).map(|_| ())
    }

    fn toolchain_present(&self) -> Result<bool> {
        self.test_remote(&CommandSpec::new("btrfs").arg("--version"))
    }

    fn filesystem_type(&self, path: &Path) -> Result<String> {
        let out = self.must_succeed(
            &CommandSpec::new("stat")
                .args(["-f", "-c", "%T"])
                .arg(path.display().to_string()),
        )?;
        Ok(out.trim().to_string())
    }

    fn list_entries(&self, dir: &Path) -> Result<Option<Vec<String>>> {
        if !self.dir_exists(dir)? {
            return Ok(None);
        }
        let out = self.must_succeed(
            &CommandSpec::new("ls")
                .args(["-1A", "--"])
                .arg(dir.display().to_string()),
        )?;
        Ok(Some(
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    fn entry_exists(&self, path: &Path) -> Result<bool> {
        self.test_remote(
            &CommandSpec::new("test")
                .arg("-e")
                .arg(path.display().to_string()),
        )
    }

    fn snapshot_exists(&self, path: &Path) -> Result<bool> {
        let show = self.privileged(
            CommandSpec::new("btrfs")
                .args(["subvolume", "show"])
                .arg(path.display().to_string()),
        );
        let out = self.run_remote(&show)?;
        Ok(out.success() && received_complete(&out.stdout))
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        let del = self.privileged(
            CommandSpec::new("btrfs")
                .args(["subvolume", "delete"])
                .arg(path.display().to_string()),
        );
        self.must_succeed(&del).map(|_| ())
    }
}

/// `btrfs receive` sets the Received UUID only once the stream was applied
/// completely; an interrupted receive leaves `-`.
fn received_complete(show: &str) -> bool {
    show.lines()
        .filter_map(|l| l.trim().strip_prefix("Received UUID:"))
        .map(str::trim)
        .any(|uuid| !uuid.is_empty() && uuid != "-")
}
