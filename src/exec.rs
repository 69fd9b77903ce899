//! External command execution.
//!
//! - `run`: one process, bounded by a timeout, stdout/stderr captured.
//! - `run_pipe`: producer stdout -> consumer stdin (e.g. `btrfs send | ssh .. btrfs receive`).
//!   Both children are waited on in their own thread and the two exit statuses
//!   are combined: the pipe succeeds only if BOTH stages succeed, regardless of
//!   which one exits last. If one stage fails the other is killed so it does
//!   not sit on a half-closed pipe until the timeout.
//!
//! stderr of every child is drained on a helper thread so a chatty child can
//! never block on a full pipe. Once the child is gone its output is collected
//! with a short grace period: a grandchild that inherited the pipe may keep it
//! open long after the child died.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::fmt;
use std::io::Read;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Keep only the tail of stderr in error messages.
const STDERR_TAIL: usize = 2048;
/// How long to wait for output pipes to close after the child has ended.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Program + argv, rendered shell-quoted for logs and for ssh remote commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, a: S) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    /// Single shell word string, safe to hand to `sh -c` / ssh.
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut c = Command::new(&self.program);
        c.args(&self.args);
        c
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// POSIX single-quote quoting; plain words are left as they are.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b));
    if plain {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// How a child process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageStatus {
    Exited(i32),
    /// Terminated by a signal not sent by us.
    Signaled,
    TimedOut,
    Cancelled,
    /// Killed because the other stage of the pipe failed.
    Aborted,
}

impl StageStatus {
    pub fn success(&self) -> bool {
        matches!(self, StageStatus::Exited(0))
    }

    fn from_exit(st: ExitStatus) -> Self {
        match st.code() {
            Some(c) => StageStatus::Exited(c),
            None => StageStatus::Signaled,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Exited(c) => write!(f, "exit {}", c),
            StageStatus::Signaled => f.write_str("killed by signal"),
            StageStatus::TimedOut => f.write_str("timed out"),
            StageStatus::Cancelled => f.write_str("cancelled"),
            StageStatus::Aborted => f.write_str("aborted after peer stage failed"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CmdOutput {
    pub status: StageStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Ok(stdout) on success, otherwise an error naming the command.
    pub fn into_stdout(self, spec: &CommandSpec) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(anyhow!(
                "`{}` failed ({}): {}",
                spec,
                self.status,
                tail(&self.stderr).trim()
            ))
        }
    }
}

/// Outcome of a two-stage pipe.
#[derive(Clone, Debug)]
pub struct PipeReport {
    pub producer: StageStatus,
    pub consumer: StageStatus,
    pub producer_stderr: String,
    pub consumer_stderr: String,
}

impl PipeReport {
    pub fn success(&self) -> bool {
        self.producer.success() && self.consumer.success()
    }

    /// Human-readable cause when `!success()`.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.producer.success() {
            parts.push(format!(
                "producer {}: {}",
                self.producer,
                tail(&self.producer_stderr).trim()
            ));
        }
        if !self.consumer.success() {
            parts.push(format!(
                "consumer {}: {}",
                self.consumer,
                tail(&self.consumer_stderr).trim()
            ));
        }
        if parts.is_empty() {
            "ok".to_string()
        } else {
            parts.join("; ")
        }
    }
}

fn tail(s: &str) -> &str {
    if s.len() <= STDERR_TAIL {
        return s;
    }
    let mut start = s.len() - STDERR_TAIL;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn drain<R: Read + Send + 'static>(r: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = r {
            let _ = r.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Output of a drain thread, or what is known so far (nothing) if the pipe
/// is still held open elsewhere after `DRAIN_GRACE`. The reader thread is
/// left to finish on its own.
fn collect(rx: Receiver<String>) -> String {
    rx.recv_timeout(DRAIN_GRACE).unwrap_or_default()
}

/// Wait for `child` until it exits, the deadline passes, `cancel` fires or
/// `abort` is raised by a peer. The child is killed in the last three cases.
fn wait_bounded(
    child: &mut Child,
    deadline: Instant,
    cancel: &CancelToken,
    abort: Option<&AtomicBool>,
) -> Result<StageStatus> {
    loop {
        if let Some(st) = child.try_wait().context("wait for child")? {
            return Ok(StageStatus::from_exit(st));
        }
        let verdict = if cancel.is_cancelled() {
            Some(StageStatus::Cancelled)
        } else if abort.map(|a| a.load(Ordering::SeqCst)).unwrap_or(false) {
            Some(StageStatus::Aborted)
        } else if Instant::now() >= deadline {
            Some(StageStatus::TimedOut)
        } else {
            None
        };
        if let Some(v) = verdict {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(v);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run one command to completion within `timeout`.
pub fn run(spec: &CommandSpec, timeout: Duration, cancel: &CancelToken) -> Result<CmdOutput> {
    debug!("exec: {}", spec);
    let mut child = spec
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn `{}`", spec))?;

    let out_h = drain::<ChildStdout>(child.stdout.take());
    let err_h = drain::<ChildStderr>(child.stderr.take());
    let status = wait_bounded(&mut child, Instant::now() + timeout, cancel, None)?;
    let stdout = collect(out_h);
    let stderr = collect(err_h);
    debug!("exec: {} -> {}", spec, status);

    Ok(CmdOutput {
        status,
        stdout,
        stderr,
    })
}

/// Run `producer | consumer` and join both exit statuses.
pub fn run_pipe(
    producer: &CommandSpec,
    consumer: &CommandSpec,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<PipeReport> {
    debug!("exec pipe: {} | {}", producer, consumer);
    let mut prod = producer
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn `{}`", producer))?;

    let prod_out = match prod.stdout.take() {
        Some(o) => o,
        None => {
            let _ = prod.kill();
            let _ = prod.wait();
            return Err(anyhow!("capture stdout of `{}`", producer));
        }
    };

    let mut cons = match consumer
        .to_command()
        .stdin(Stdio::from(prod_out))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            let _ = prod.kill();
            let _ = prod.wait();
            return Err(anyhow!("spawn `{}`: {}", consumer, e));
        }
    };

    let prod_err = drain::<ChildStderr>(prod.stderr.take());
    let cons_err = drain::<ChildStderr>(cons.stderr.take());

    let deadline = Instant::now() + timeout;
    let abort = AtomicBool::new(false);
    let abort = &abort;
    // A failing side raises `abort` so the other one is killed.
    let wait_side = move |child: &mut Child| -> Result<StageStatus> {
        let st = wait_bounded(child, deadline, cancel, Some(abort));
        match &st {
            Ok(s) if s.success() => {}
            _ => abort.store(true, Ordering::SeqCst),
        }
        st
    };

    let (p_status, c_status) = thread::scope(|s| {
        let p = s.spawn(move || wait_side(&mut prod));
        let c = s.spawn(move || wait_side(&mut cons));
        let p = p.join().unwrap_or_else(|_| Err(anyhow!("producer wait thread panicked")));
        let c = c.join().unwrap_or_else(|_| Err(anyhow!("consumer wait thread panicked")));
        (p, c)
    });

    let report = PipeReport {
        producer: p_status?,
        consumer: c_status?,
        producer_stderr: collect(prod_err),
        consumer_stderr: collect(cons_err),
    };
    debug!(
        "exec pipe: producer {}, consumer {}",
        report.producer, report.consumer
    );
    Ok(report)
}
