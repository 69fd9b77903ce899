//! Logger setup: env_logger, one line per record,
//! `YYYY-MM-DD HH:MM:SS [LEVEL] message`, tee'd to the log file and stderr.
//!
//! Level from RUST_LOG, default info. Example: RUST_LOG=debug snapship --test

use chrono::Local;
use env_logger::{Builder, Env, Target, WriteStyle};
use log::{warn, Level};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub const LINE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_line(ts: &str, level: Level, msg: &std::fmt::Arguments<'_>) -> String {
    format!("{} [{}] {}", ts, level, msg)
}

/// Each record arrives as one complete line; it is written with one
/// `write_all` per sink so lines from different threads never interleave.
struct Tee {
    file: Option<File>,
    stderr: io::Stderr,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(f) = self.file.as_mut() {
            // A full disk must not silence the live stream.
            let _ = f.write_all(buf);
        }
        self.stderr.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
        }
        self.stderr.flush()
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger. Safe to call more than once (later calls are no-ops).
pub fn init(log_file: Option<&Path>) {
    let mut open_err = None;
    let file = match log_file {
        Some(p) => match open_log(p) {
            Ok(f) => Some(f),
            Err(e) => {
                open_err = Some(format!("cannot open log file {}: {}", p.display(), e));
                None
            }
        },
        None => None,
    };

    let tee = Tee {
        file,
        stderr: io::stderr(),
    };

    let installed = Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = Local::now().format(LINE_TS_FORMAT).to_string();
            writeln!(buf, "{}", format_line(&ts, record.level(), record.args()))
        })
        .write_style(WriteStyle::Never)
        .target(Target::Pipe(Box::new(tee)))
        .try_init()
        .is_ok();

    if installed {
        if let Some(e) = open_err {
            warn!("{}; logging to stderr only", e);
        }
    }
}
