//! Pre-flight connectivity check of the remote side.
//!
//! Order: reachability -> remote root (create if absent) -> remote btrfs tool
//! -> filesystem type of the remote root. Only the last one is soft: a failed
//! or unexpected answer is a warning, the first `btrfs receive` is the real test.

use log::{debug, info, warn};
use std::path::Path;

use crate::remote::RemoteStore;

/// `stat -f -c %T` on coreutils that predate the btrfs name.
const BTRFS_MAGIC_NAME: &str = "UNKNOWN (0x9123683e)";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    Degraded(Vec<String>),
    Failed(String),
}

pub struct ConnectivityProbe<'a> {
    remote: &'a dyn RemoteStore,
}

impl<'a> ConnectivityProbe<'a> {
    pub fn new(remote: &'a dyn RemoteStore) -> Self {
        Self { remote }
    }

    pub fn probe(&self, remote_root: &Path) -> ProbeOutcome {
        let endpoint = self.remote.endpoint();
        debug!("probe: {} {}", endpoint, remote_root.display());

        if let Err(e) = self.remote.ping() {
            return ProbeOutcome::Failed(format!("remote {} unreachable: {:#}", endpoint, e));
        }

        match self.remote.dir_exists(remote_root) {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "probe: remote root {} missing on {}, creating it",
                    remote_root.display(),
                    endpoint
                );
                if let Err(e) = self.remote.create_dir_all(remote_root) {
                    return ProbeOutcome::Failed(format!(
                        "cannot create remote root {} on {}: {:#}",
                        remote_root.display(),
                        endpoint,
                        e
                    ));
                }
            }
            Err(e) => {
                return ProbeOutcome::Failed(format!(
                    "cannot inspect remote root {} on {}: {:#}",
                    remote_root.display(),
                    endpoint,
                    e
                ))
            }
        }

        match self.remote.toolchain_present() {
            Ok(true) => {}
            Ok(false) => {
                return ProbeOutcome::Failed(format!("btrfs tool not found on {}", endpoint))
            }
            Err(e) => {
                return ProbeOutcome::Failed(format!(
                    "cannot check btrfs tool on {}: {:#}",
                    endpoint, e
                ))
            }
        }

        let mut warnings = Vec::new();
        match self.remote.filesystem_type(remote_root) {
            Ok(fs) if fs == "btrfs" || fs == BTRFS_MAGIC_NAME => {}
            Ok(fs) => warnings.push(format!(
                "remote root {} reports filesystem '{}', not btrfs; receive will likely fail",
                remote_root.display(),
                fs
            )),
            Err(e) => warnings.push(format!(
                "could not determine filesystem of remote root {}: {:#}",
                remote_root.display(),
                e
            )),
        }

        if warnings.is_empty() {
            ProbeOutcome::Ready
        } else {
            for w in &warnings {
                warn!("probe: {}", w);
            }
            ProbeOutcome::Degraded(warnings)
        }
    }
}
