//! Spawns the test process, drains its output, and enforces the deadline.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use testwrap_contracts::{EXIT_PASS, EXIT_SIGNAL_BASE, EXIT_TIMEOUT};

use crate::env::EnvironmentSet;
use crate::error::{Result, WrapperError};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Lower bound on how long the readers get to reach EOF once the test is gone.
const DRAIN_GRACE_MIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed { exit_code: i32 },
    Signaled { signal: i32 },
    TimedOut,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed { .. } => "failed",
            Outcome::Signaled { .. } => "signaled",
            Outcome::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Exit code, or `128 + signal` when the child was killed by a signal.
    pub exit_status: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// The wrapper's own exit code for this result. Test exit codes pass through
    /// untouched; only timeouts and signals map to reserved values.
    pub fn wrapper_exit_code(&self) -> u8 {
        match self.outcome {
            Outcome::Passed => EXIT_PASS,
            Outcome::Failed { exit_code } => u8::try_from(exit_code & 0xff)
                .ok()
                .filter(|c| *c != 0)
                .unwrap_or(1),
            Outcome::Signaled { signal } => {
                u8::try_from(EXIT_SIGNAL_BASE + signal).unwrap_or(u8::MAX)
            }
            Outcome::TimedOut => EXIT_TIMEOUT,
        }
    }
}

/// A fully composed process to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub program: &'a Path,
    pub args: Vec<&'a OsStr>,
    pub env: &'a EnvironmentSet,
    pub cwd: Option<&'a Path>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
}

/// Absolute path of an existing, executable test binary.
pub fn resolve_executable(exe: &Path) -> Result<PathBuf> {
    let abs = std::fs::canonicalize(exe).map_err(|source| WrapperError::LaunchError {
        program: exe.to_path_buf(),
        source,
    })?;
    let meta = std::fs::metadata(&abs).map_err(|source| WrapperError::LaunchError {
        program: abs.clone(),
        source,
    })?;
    if !meta.is_file() {
        return Err(WrapperError::LaunchError {
            program: abs,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(WrapperError::LaunchError {
                program: abs,
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "file is not executable",
                ),
            });
        }
    }
    Ok(abs)
}

pub fn launch(spec: &LaunchSpec<'_>) -> Result<ExecutionResult> {
    let mut cmd = Command::new(spec.program);
    cmd.args(&spec.args);
    cmd.env_clear();
    cmd.envs(spec.env.iter());
    if let Some(dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| WrapperError::LaunchError {
        program: spec.program.to_path_buf(),
        source,
    })?;
    tracing::debug!(
        pid = child.id(),
        program = %spec.program.display(),
        argc = spec.args.len(),
        "spawned test process"
    );

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WrapperError::io("take stdout", std::io::ErrorKind::BrokenPipe.into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WrapperError::io("take stderr", std::io::ErrorKind::BrokenPipe.into()))?;

    let cap = spec.max_output_bytes;
    let captured = Drains::default();
    let (done_tx, done_rx) = mpsc::channel();
    spawn_drain(Stream::Stdout, stdout, cap, Arc::clone(&captured.stdout), done_tx.clone());
    spawn_drain(Stream::Stderr, stderr, cap, Arc::clone(&captured.stderr), done_tx);

    let waited = wait_with_deadline(&mut child, spec.timeout, spec.kill_grace);
    // Descendants that outlive the test would hold the pipes open.
    signal_group(&mut child, Signal::Kill);
    let (status, timed_out) = waited?;
    let duration = start.elapsed();

    captured.wait(&done_rx, spec.kill_grace.max(DRAIN_GRACE_MIN))?;
    let (stdout_bytes, stdout_truncated) = captured.take(Stream::Stdout)?;
    let (stderr_bytes, stderr_truncated) = captured.take(Stream::Stderr)?;

    let (outcome, exit_status) = classify(status, timed_out);
    tracing::debug!(
        outcome = outcome.as_str(),
        exit_status,
        duration_ms = duration.as_millis() as u64,
        "test process finished"
    );

    Ok(ExecutionResult {
        outcome,
        exit_status,
        stdout_lines: split_lines(&stdout_bytes),
        stderr_lines: split_lines(&stderr_bytes),
        stdout_truncated,
        stderr_truncated,
        duration,
    })
}

fn classify(status: ExitStatus, timed_out: bool) -> (Outcome, i32) {
    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    let exit_status = match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| EXIT_SIGNAL_BASE + s).unwrap_or(1),
    };

    let outcome = if timed_out {
        Outcome::TimedOut
    } else if let Some(signal) = exit_signal {
        Outcome::Signaled { signal }
    } else if exit_status == 0 {
        Outcome::Passed
    } else {
        Outcome::Failed {
            exit_code: exit_status,
        }
    };
    (outcome, exit_status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
}

/// Signals the child's process group, then the child itself.
fn signal_group(child: &mut Child, signal: Signal) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(child.id()) else {
            return;
        };
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            let _ = libc::kill(-pid, sig);
        }
        if signal == Signal::Kill {
            let _ = child.kill();
        } else {
            unsafe {
                let _ = libc::kill(pid, sig);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = child.kill();
    }
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<(ExitStatus, bool)> {
    let try_wait = |child: &mut Child| {
        child
            .try_wait()
            .map_err(|e| WrapperError::io("wait for test process", e))
    };

    let deadline = Instant::now().checked_add(timeout.max(Duration::from_millis(1)));
    loop {
        if let Some(status) = try_wait(child)? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(
        pid = child.id(),
        timeout_ms = timeout.as_millis() as u64,
        "test exceeded its timeout, sending SIGTERM"
    );
    signal_group(child, Signal::Term);

    let hard = Instant::now().checked_add(kill_grace);
    loop {
        if let Some(status) = try_wait(child)? {
            return Ok((status, true));
        }
        if hard.map_or(true, |h| Instant::now() >= h) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pid = child.id(), "test ignored SIGTERM, sending SIGKILL");
    signal_group(child, Signal::Kill);
    let status = child
        .wait()
        .map_err(|e| WrapperError::io("wait for test process after kill", e))?;
    Ok((status, true))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Output buffers shared with the reader threads.
#[derive(Debug, Default)]
struct Drains {
    stdout: Arc<Mutex<Captured>>,
    stderr: Arc<Mutex<Captured>>,
}

impl Drains {
    fn buffer(&self, stream: Stream) -> &Mutex<Captured> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    /// Waits up to `grace` for both readers to reach EOF. A reader still blocked
    /// after that (a detached descendant holds the pipe) is abandoned and its
    /// stream is marked truncated.
    fn wait(&self, done: &Receiver<(Stream, std::io::Result<()>)>, grace: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(grace);
        let mut pending = vec![Stream::Stdout, Stream::Stderr];
        while let Some(&first) = pending.first() {
            let remaining = deadline.map_or(grace, |d| d.saturating_duration_since(Instant::now()));
            match done.recv_timeout(remaining) {
                Ok((stream, res)) => {
                    res.map_err(|e| WrapperError::io(format!("read test {}", stream.as_str()), e))?;
                    pending.retain(|s| *s != stream);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        streams = ?pending.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                        grace_ms = grace.as_millis() as u64,
                        "test output still open after the test finished, abandoning readers"
                    );
                    for stream in pending {
                        lock_captured(self.buffer(stream), stream)?.truncated = true;
                    }
                    return Ok(());
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WrapperError::io(
                        format!("read test {}", first.as_str()),
                        std::io::Error::other("output reader thread panicked"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn take(&self, stream: Stream) -> Result<(Vec<u8>, bool)> {
        let mut c = lock_captured(self.buffer(stream), stream)?;
        Ok((std::mem::take(&mut c.bytes), c.truncated))
    }
}

fn lock_captured(buf: &Mutex<Captured>, stream: Stream) -> Result<MutexGuard<'_, Captured>> {
    buf.lock().map_err(|_| {
        WrapperError::io(
            format!("read test {}", stream.as_str()),
            std::io::Error::other("output buffer poisoned"),
        )
    })
}

fn spawn_drain<R: Read + Send + 'static>(
    stream: Stream,
    reader: R,
    cap: usize,
    sink: Arc<Mutex<Captured>>,
    done: Sender<(Stream, std::io::Result<()>)>,
) {
    std::thread::spawn(move || {
        let res = drain_capped(reader, cap, &sink);
        let _ = done.send((stream, res));
    });
}

/// Appends everything read to `sink`, keeping at most `cap` bytes. The pipe is
/// always drained.
fn drain_capped<R: Read>(mut reader: R, cap: usize, sink: &Mutex<Captured>) -> std::io::Result<()> {
    let mut tmp = [0u8; 8192];
    loop {
        let n = match reader.read(&mut tmp) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(());
        }

        let mut c = sink
            .lock()
            .map_err(|_| std::io::Error::other("output buffer poisoned"))?;
        if c.truncated {
            continue;
        }
        let remaining = cap.saturating_sub(c.bytes.len());
        if n <= remaining {
            c.bytes.extend_from_slice(&tmp[..n]);
        } else {
            c.bytes.extend_from_slice(&tmp[..remaining]);
            c.truncated = true;
        }
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}
