//! Canonical snapshot timestamps and the snapshot-name codec.
//!
//! Snapshot directories are named `<subvolume>-<timestamp>`, where the
//! timestamp is rendered with a fixed-width strftime pattern
//! (default `%Y%m%d-%H%M%S`). Resolution is one second: sub-second parts are
//! dropped on construction so that format -> parse is exact. Timestamps are
//! UTC: local wall time repeats an hour when daylight saving ends, which would
//! break the strictly-increasing name order.
//!
//! `NameCodec` is the single place that turns names into timestamps and back.
//! Names that only partially match (extra suffix, missing padding, foreign
//! prefix) are rejected, never guessed at.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::sync::Mutex;

use crate::error::RunError;

pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Point in time at second granularity, UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        Timestamp(dt.with_nanosecond(0).unwrap_or(dt))
    }

    pub fn from_ymd_hms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(y, mo, d)
            .and_then(|date| date.and_hms_opt(h, mi, s))
            .map(Timestamp)
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.0
    }

    /// `self - days`, saturating at the earliest representable instant.
    pub fn minus_days(self, days: u32) -> Self {
        self.0
            .checked_sub_signed(Duration::days(i64::from(days)))
            .map(Timestamp)
            .unwrap_or(Timestamp(NaiveDateTime::MIN))
    }

    pub fn plus_seconds(self, secs: i64) -> Self {
        self.0
            .checked_add_signed(Duration::seconds(secs))
            .map(Timestamp)
            .unwrap_or(self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Formats and parses snapshot names for one date format.
#[derive(Clone, Debug)]
pub struct NameCodec {
    format: String,
    width: usize,
}

impl NameCodec {
    /// Build a codec, rejecting formats that are not fixed-width or that lose
    /// information at second resolution.
    pub fn new(format: &str) -> Result<Self, RunError> {
        let format = format.trim();
        if format.is_empty() {
            return Err(RunError::Config("date_format must not be empty".into()));
        }

        // Every field differs between the first two probes and needs padding in
        // the first one. The rest cover each month and weekday name, so
        // `%A`/`%B` style specifiers show up as variable width.
        let mut probes = vec![
            Timestamp::from_ymd_hms(2001, 2, 3, 4, 5, 6),
            Timestamp::from_ymd_hms(2099, 12, 31, 23, 59, 58),
        ];
        for month in 1..=12 {
            for day in 10..=16 {
                probes.push(Timestamp::from_ymd_hms(2001, month, day, 13, 7, 9));
            }
        }
        let mut width = None;
        for probe in probes.into_iter().flatten() {
            let mut rendered = String::new();
            if write!(rendered, "{}", probe.0.format(format)).is_err() {
                return Err(RunError::Config(format!(
                    "date_format '{}' contains an invalid specifier",
                    format
                )));
            }
            let back = NaiveDateTime::parse_from_str(&rendered, format).map_err(|e| {
                RunError::Config(format!(
                    "date_format '{}' cannot be parsed back ('{}'): {}",
                    format, rendered, e
                ))
            })?;
            if back != probe.0 {
                return Err(RunError::Config(format!(
                    "date_format '{}' does not keep second resolution ('{}' parsed as {})",
                    format, rendered, back
                )));
            }
            match width {
                None => width = Some(rendered.len()),
                Some(w) if w != rendered.len() => {
                    return Err(RunError::Config(format!(
                        "date_format '{}' is not fixed-width",
                        format
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            format: format.to_string(),
            width: width.unwrap_or(0),
        })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn format_ts(&self, ts: Timestamp) -> String {
        ts.0.format(&self.format).to_string()
    }

    /// Parse a bare timestamp. Only the canonical rendering is accepted.
    pub fn parse_ts(&self, s: &str) -> Option<Timestamp> {
        if s.len() != self.width {
            return None;
        }
        let dt = NaiveDateTime::parse_from_str(s, &self.format).ok()?;
        let ts = Timestamp::from_naive(dt);
        (self.format_ts(ts) == s).then_some(ts)
    }

    pub fn snapshot_name(&self, subvolume: &str, ts: Timestamp) -> String {
        format!("{}-{}", subvolume, self.format_ts(ts))
    }

    /// Extract the timestamp from `<subvolume>-<timestamp>`; None for anything else.
    pub fn parse_snapshot_name(&self, subvolume: &str, name: &str) -> Option<Timestamp> {
        let rest = name.strip_prefix(subvolume)?.strip_prefix('-')?;
        self.parse_ts(rest)
    }
}

impl Default for NameCodec {
    fn default() -> Self {
        Self {
            format: DEFAULT_DATE_FORMAT.to_string(),
            width: "20010203-040506".len(),
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_naive(Utc::now().naive_utc())
    }
}

/// Settable clock for tests and dry runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, ts: Timestamp) {
        if let Ok(mut g) = self.now.lock() {
            *g = ts;
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut g) = self.now.lock() {
            *g = g.plus_seconds(secs);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        match self.now.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
