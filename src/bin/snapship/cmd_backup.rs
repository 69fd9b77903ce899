use anyhow::Result;
use log::{error, info, warn};

use snapship::lock;
use snapship::orchestrator::abort_marker_line;
use snapship::report::StatusReport;
use snapship::timestamp::{Clock, SystemClock};
use snapship::transfer::SendReceive;
use snapship::{Backend, BackupConfig, Orchestrator, RunSummary};

use crate::util;

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
    match orch.run_locked(|| lock::try_acquire_run_lock(&cfg.local_root)) {
        Ok(summary) => {
            report(cfg, &summary);
            Ok(summary.exit_code())
        }
        Err(e) => {
            error!("{}", abort_marker_line(&e));
            if let Some(path) = &cfg.status_file {
                if let Err(we) = StatusReport::aborted(e.to_string(), clock.now()).write_to(path) {
                    warn!("status file: {:#}", we);
                }
            }
            Ok(1)
        }
    }
}

fn report(cfg: &BackupConfig, summary: &RunSummary) {
    for w in &summary.probe_warnings {
        warn!("probe: {}", w);
    }
    info!("{}", summary.marker_line());
    if summary.is_success() {
        info!("Backup completed successfully");
    } else {
        error!("Backup completed with failures");
    }
    if let Some(path) = &cfg.status_file {
        match StatusReport::from_summary(summary).write_to(path) {
            Ok(()) => info!("status: written to {}", path.display()),
            Err(e) => warn!("status file: {:#}", e),
        }
    }
}
