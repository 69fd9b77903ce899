//! Configuration for a snapship run.
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults (`BackupConfig::default()`),
//! - TOML file (`BackupConfig::load(path)`),
//! - environment overrides (`apply_env`).
//!
//! The resolved value is validated once and then treated as immutable: the
//! orchestrator and every component receive `&BackupConfig`.
//!
//! ENV:
//!   SNAPSHIP_REMOTE_HOST / SNAPSHIP_REMOTE_ROOT / SNAPSHIP_LOCAL_ROOT
//!   SNAPSHIP_LOCAL_RETENTION_DAYS / SNAPSHIP_REMOTE_RETENTION_DAYS
//!   SNAPSHIP_LOG_FILE

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RunError;
use crate::snapshot::Side;
use crate::timestamp::{NameCodec, DEFAULT_DATE_FORMAT};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapship/config.toml";

/// One protected subvolume. `name` doubles as directory segment and snapshot prefix.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Subvolume {
    pub name: String,
    pub path: PathBuf,
}

impl Subvolume {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, path: P) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Retention windows in days, applied independently per side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub local_days: u32,
    pub remote_days: u32,
}

impl RetentionPolicy {
    pub fn days(&self, side: Side) -> u32 {
        match side {
            Side::Local => self.local_days,
            Side::Remote => self.remote_days,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            local_days: 7,
            remote_days: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// ssh destination, e.g. `backup@nas.lan`.
    pub remote_host: String,
    pub remote_port: Option<u16>,
    pub ssh_identity: Option<PathBuf>,
    /// Prefix privileged remote commands with `sudo -n`.
    pub remote_sudo: bool,
    pub remote_root: PathBuf,
    pub local_root: PathBuf,
    /// Ordered; names are unique after `validate()`.
    pub subvolumes: Vec<Subvolume>,
    pub date_format: String,
    pub retention: RetentionPolicy,
    pub log_file: Option<PathBuf>,
    /// Optional JSON status document describing the last run.
    pub status_file: Option<PathBuf>,

    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
    pub subvolume_deadline: Duration,
    pub pause_between: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_port: None,
            ssh_identity: None,
            remote_sudo: false,
            remote_root: PathBuf::new(),
            local_root: PathBuf::from("/.snapshots"),
            subvolumes: Vec::new(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            retention: RetentionPolicy::default(),
            log_file: Some(PathBuf::from("/var/log/snapship.log")),
            status_file: None,

            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
            transfer_timeout: Duration::from_secs(6 * 3600),
            subvolume_deadline: Duration::from_secs(12 * 3600),
            pause_between: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    remote_host: Option<String>,
    remote_port: Option<u16>,
    ssh_identity: Option<PathBuf>,
    remote_sudo: Option<bool>,
    remote_root: Option<PathBuf>,
    local_root: Option<PathBuf>,
    date_format: Option<String>,
    local_retention_days: Option<u32>,
    remote_retention_days: Option<u32>,
    log_file: Option<PathBuf>,
    status_file: Option<PathBuf>,
    connect_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    transfer_timeout_secs: Option<u64>,
    subvolume_deadline_secs: Option<u64>,
    pause_between_secs: Option<u64>,
    #[serde(default, rename = "subvolume")]
    subvolumes: Vec<Subvolume>,
}

impl BackupConfig {
    /// Read, merge with env, validate.
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_toml_str(&s)
            .with_context(|| format!("parse config {}", path.display()))?
            .apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document over the defaults. Does not validate.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(s).context("parse TOML config")?;
        let mut cfg = Self::default();

        if let Some(v) = file.remote_host {
            cfg.remote_host = v;
        }
        cfg.remote_port = file.remote_port;
        cfg.ssh_identity = file.ssh_identity;
        if let Some(v) = file.remote_sudo {
            cfg.remote_sudo = v;
        }
        if let Some(v) = file.remote_root {
            cfg.remote_root = v;
        }
        if let Some(v) = file.local_root {
            cfg.local_root = v;
        }
        if let Some(v) = file.date_format {
            cfg.date_format = v;
        }
        if let Some(v) = file.local_retention_days {
            cfg.retention.local_days = v;
        }
        if let Some(v) = file.remote_retention_days {
            cfg.retention.remote_days = v;
        }
        if file.log_file.is_some() {
            cfg.log_file = file.log_file;
        }
        cfg.status_file = file.status_file;

        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
        cfg.connect_timeout = secs(file.connect_timeout_secs, cfg.connect_timeout);
        cfg.command_timeout = secs(file.command_timeout_secs, cfg.command_timeout);
        cfg.transfer_timeout = secs(file.transfer_timeout_secs, cfg.transfer_timeout);
        cfg.subvolume_deadline = secs(file.subvolume_deadline_secs, cfg.subvolume_deadline);
        cfg.pause_between = secs(file.pause_between_secs, cfg.pause_between);

        cfg.subvolumes = file.subvolumes;
        Ok(cfg)
    }

    /// Apply SNAPSHIP_* environment overrides.
    pub fn apply_env(mut self) -> Self {
        fn non_empty(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        if let Some(v) = non_empty("SNAPSHIP_REMOTE_HOST") {
            self.remote_host = v;
        }
        if let Some(v) = non_empty("SNAPSHIP_REMOTE_ROOT") {
            self.remote_root = PathBuf::from(v);
        }
        if let Some(v) = non_empty("SNAPSHIP_LOCAL_ROOT") {
            self.local_root = PathBuf::from(v);
        }
        let days = |name: &str| non_empty(name).and_then(|v| v.parse::<u32>().ok());
        if let Some(n) = days("SNAPSHIP_LOCAL_RETENTION_DAYS") {
            self.retention.local_days = n;
        }
        if let Some(n) = days("SNAPSHIP_REMOTE_RETENTION_DAYS") {
            self.retention.remote_days = n;
        }
        if let Some(v) = non_empty("SNAPSHIP_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        self
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.remote_host.trim().is_empty() {
            return Err(RunError::Config("remote_host is required".into()));
        }
        for (key, p) in [
            ("remote_root", &self.remote_root),
            ("local_root", &self.local_root),
        ] {
            if !p.is_absolute() {
                return Err(RunError::Config(format!(
                    "{} must be an absolute path, got '{}'",
                    key,
                    p.display()
                )));
            }
        }
        if self.subvolumes.is_empty() {
            return Err(RunError::Config(
                "at least one [[subvolume]] is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for sv in &self.subvolumes {
            validate_name(&sv.name)?;
            if !seen.insert(sv.name.as_str()) {
                return Err(RunError::Config(format!(
                    "duplicate subvolume name '{}'",
                    sv.name
                )));
            }
            if !sv.path.is_absolute() {
                return Err(RunError::Config(format!(
                    "subvolume '{}': path must be absolute, got '{}'",
                    sv.name,
                    sv.path.display()
                )));
            }
        }

        NameCodec::new(&self.date_format)?;

        // A zero window would delete the snapshot this very run created.
        for (key, days) in [
            ("local_retention_days", self.retention.local_days),
            ("remote_retention_days", self.retention.remote_days),
        ] {
            if days == 0 {
                return Err(RunError::Config(format!("{} must be > 0", key)));
            }
        }

        for (key, d) in [
            ("connect_timeout_secs", self.connect_timeout),
            ("command_timeout_secs", self.command_timeout),
            ("transfer_timeout_secs", self.transfer_timeout),
            ("subvolume_deadline_secs", self.subvolume_deadline),
        ] {
            if d.is_zero() {
                return Err(RunError::Config(format!("{} must be > 0", key)));
            }
        }
        Ok(())
    }

    /// Codec for `date_format`. Falls back to the default pattern if the
    /// configured one is invalid (only possible for unvalidated configs).
    pub fn name_codec(&self) -> NameCodec {
        NameCodec::new(&self.date_format).unwrap_or_default()
    }

    pub fn local_dir(&self, subvolume: &str) -> PathBuf {
        self.local_root.join(subvolume)
    }

    pub fn remote_dir(&self, subvolume: &str) -> PathBuf {
        self.remote_root.join(subvolume)
    }

    // Fluent setters (builder-style).

    pub fn with_remote<S: Into<String>, P: Into<PathBuf>>(mut self, host: S, root: P) -> Self {
        self.remote_host = host.into();
        self.remote_root = root.into();
        self
    }

    pub fn with_local_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.local_root = root.into();
        self
    }

    pub fn with_subvolume<S: Into<String>, P: Into<PathBuf>>(mut self, name: S, path: P) -> Self {
        self.subvolumes.push(Subvolume::new(name, path));
        self
    }

    pub fn with_retention(mut self, local_days: u32, remote_days: u32) -> Self {
        self.retention = RetentionPolicy {
            local_days,
            remote_days,
        };
        self
    }

    pub fn with_date_format<S: Into<String>>(mut self, fmt: S) -> Self {
        self.date_format = fmt.into();
        self
    }

    pub fn with_log_file<P: Into<PathBuf>>(mut self, p: Option<P>) -> Self {
        self.log_file = p.map(Into::into);
        self
    }

    pub fn with_status_file<P: Into<PathBuf>>(mut self, p: Option<P>) -> Self {
        self.status_file = p.map(Into::into);
        self
    }

    pub fn with_pause_between(mut self, d: Duration) -> Self {
        self.pause_between = d;
        self
    }

    pub fn with_subvolume_deadline(mut self, d: Duration) -> Self {
        self.subvolume_deadline = d;
        self
    }

    pub fn with_transfer_timeout(mut self, d: Duration) -> Self {
        self.transfer_timeout = d;
        self
    }
}

fn validate_name(name: &str) -> Result<(), RunError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        return Err(RunError::Config(format!(
            "invalid subvolume name '{}': must be a single path segment without whitespace",
            name
        )));
    }
    Ok(())
}

impl fmt::Display for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.subvolumes.iter().map(|s| s.name.as_str()).collect();
        write!(
            f,
            "BackupConfig {{ remote: {}{}:{}, local_root: {}, subvolumes: [{}], \
             date_format: {}, retention: local={}d remote={}d, log_file: {} }}",
            self.remote_host,
            self.remote_port
                .map(|p| format!(" (port {})", p))
                .unwrap_or_default(),
            self.remote_root.display(),
            self.local_root.display(),
            names.join(","),
            self.date_format,
            self.retention.local_days,
            self.retention.remote_days,
            self.log_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(stderr only)".to_string()),
        )
    }
}
