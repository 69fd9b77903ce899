//! Last-run status document (JSON) for monitoring.
//!
//! Written atomically: `<file>.tmp` then rename.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::metrics::MetricsSnapshot;
use crate::orchestrator::{RunSummary, SubvolumeResult};
use crate::timestamp::Timestamp;

#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub success: bool,
    pub started: Option<Timestamp>,
    pub finished: Timestamp,
    /// Set when the run aborted before any subvolume was touched.
    pub aborted: Option<String>,
    pub cancelled: bool,
    pub succeeded: Vec<&'a str>,
    pub failed: Vec<&'a str>,
    pub skipped: Vec<&'a str>,
    pub probe_warnings: &'a [String],
    pub subvolumes: &'a [SubvolumeResult],
    pub metrics: Option<&'a MetricsSnapshot>,
}

impl<'a> StatusReport<'a> {
    pub fn from_summary(s: &'a RunSummary) -> Self {
        Self {
            success: s.is_success(),
            started: Some(s.started),
            finished: s.finished,
            aborted: None,
            cancelled: s.cancelled,
            succeeded: s.succeeded(),
            failed: s.failed(),
            skipped: s.skipped(),
            probe_warnings: &s.probe_warnings,
            subvolumes: &s.results,
            metrics: Some(&s.metrics),
        }
    }

    pub fn aborted(reason: String, at: Timestamp) -> Self {
        Self {
            success: false,
            started: None,
            finished: at,
            aborted: Some(reason),
            cancelled: false,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            probe_warnings: &[],
            subvolumes: &[],
            metrics: None,
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create status dir {}", dir.display()))?;
            }
        }
        let body = serde_json::to_string_pretty(self).context("serialize status report")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body + "\n").with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}
