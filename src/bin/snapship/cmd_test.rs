use anyhow::Result;
use log::{error, info, warn};

use snapship::btrfs::LocalVolumes;
use snapship::timestamp::SystemClock;
use snapship::transfer::SendReceive;
use snapship::{Backend, BackupConfig, Orchestrator};

use crate::util;

/// `--test`: local toolchain plus connectivity probe. Touches no snapshot.
pub fn exec(cfg: &BackupConfig) -> Result<i32> {
    let (local, remote, cancel) = util::hosts(cfg);
    let transport = SendReceive::new(&remote, cancel.clone());
    let clock = SystemClock;
    let backend = Backend {
        local: &local,
        remote: &remote,
        transport: &transport,
        clock: &clock,
    };
    let orch = Orchestrator::new(cfg, backend, cancel);

    println!("config:    {}", cfg);
    if !local.privileged() {
        warn!("not running as root: a real run would refuse to start");
        println!("privilege: not root (backup runs require root)");
    } else {
        println!("privilege: root");
    }

    if let Err(e) = orch.preflight(false) {
        error!("test: {}", e);
        println!("local:     FAILED ({})", e);
        return Ok(1);
    }
    println!("local:     btrfs tool present");

    match orch.check_connectivity() {
        Ok(warnings) if warnings.is_empty() => {
            info!("test: remote ready");
            println!("remote:    ready");
            Ok(0)
        }
        Ok(warnings) => {
            for w in &warnings {
                warn!("test: {}", w);
                println!("remote:    warning: {}", w);
            }
            println!("remote:    usable (degraded)");
            Ok(0)
        }
        Err(e) => {
            error!("test: {}", e);
            println!("remote:    FAILED ({})", e);
            Ok(1)
        }
    }
}
