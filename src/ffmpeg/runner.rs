//! External process spawning with bounded waits and per-run cancellation.
//!
//! Spawns a tool as a child process, drains stdout and stderr on background threads
//! (parsing FFmpeg progress on the way), and polls the child until it exits, the
//! deadline passes, or the owning run is cancelled.
//!
//! On unix each tool gets its own process group so a kill also reaches anything it
//! spawned (yt-dlp's ffmpeg post-processing, shell wrappers).

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::progress::parse_ffmpeg_progress;
use crate::error::AppError;

/// Sentinel for "duration not yet known". AtomicU64 cannot hold Option<f64>,
/// so we encode duration as f64 bits; u64::MAX means "not yet known".
const NONE_DURATION_BITS: u64 = u64::MAX;

const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);
/// Keep only the last N bytes of each stream to avoid unbounded memory growth.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a killed tool's stream readers get to drain before they are detached.
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Cancellation handle shared by everything one pipeline run spawns.
/// Holds at most one child at a time since a run is sequential.
#[derive(Default)]
pub struct RunControl {
    active: Mutex<Option<Child>>,
    cancelled: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills the in-flight child, if any, and marks the run as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut guard = self.active.lock();
        if let Some(mut child) = guard.take() {
            log::info!(
                target: "circle_cut::ffmpeg::runner",
                "Terminating child process {}",
                child.id()
            );
            terminate(&mut child);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> Result<(), AppError> {
        if self.is_cancelled() {
            Err(AppError::aborted())
        } else {
            Ok(())
        }
    }
}

pub struct RunOptions<'a> {
    pub control: &'a RunControl,
    pub timeout: Option<Duration>,
    /// Known media duration so progress can be computed before FFmpeg prints one.
    pub duration_secs: Option<f64>,
    pub progress_callback: Option<ProgressCallback>,
}

impl<'a> RunOptions<'a> {
    pub fn new(control: &'a RunControl) -> Self {
        Self {
            control,
            timeout: None,
            duration_secs: None,
            progress_callback: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn progress(mut self, duration_secs: f64, callback: Option<ProgressCallback>) -> Self {
        self.duration_secs = Some(duration_secs);
        self.progress_callback = callback;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

struct ReadStreamConfig {
    capture: Arc<Mutex<Vec<u8>>>,
    duration: Arc<AtomicU64>,
    progress_callback: Option<ProgressCallback>,
}

fn read_stream<R: std::io::Read + Send + 'static>(
    reader: R,
    config: ReadStreamConfig,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let bits = config.duration.load(Ordering::Relaxed);
        let mut current_duration = (bits != NONE_DURATION_BITS).then(|| f64::from_bits(bits));
        let mut last_emit = Instant::now();
        let mut last_progress = 0.0_f64;
        let mut stream_reader = BufReader::new(reader);
        let mut line_buf = Vec::with_capacity(256);
        while stream_reader.read_until(b'\n', &mut line_buf).unwrap_or(0) > 0 {
            {
                let mut guard = config.capture.lock();
                guard.extend_from_slice(&line_buf);
                if guard.len() > MAX_CAPTURE_BYTES {
                    let excess = guard.len() - MAX_CAPTURE_BYTES;
                    guard.drain(..excess);
                }
            }
            if let Some(ref cb) = config.progress_callback {
                let line = String::from_utf8_lossy(&line_buf);
                let (progress, d) =
                    parse_ffmpeg_progress(line.trim_end_matches(['\n', '\r']), current_duration);
                if let Some(new_dur) = d {
                    current_duration = Some(new_dur);
                    config.duration.store(new_dur.to_bits(), Ordering::Relaxed);
                }
                if let Some(p) = progress {
                    let now = Instant::now();
                    if now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL
                        || (p - last_progress).abs() >= 0.05
                        || p >= 1.0
                    {
                        last_emit = now;
                        last_progress = p;
                        cb(p);
                    }
                }
            }
            line_buf.clear();
        }
    })
}

/// Kills the child together with its process group and reaps it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Ok(pgid) = i32::try_from(child.id()) {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                log::debug!(
                    target: "circle_cut::ffmpeg::runner",
                    "killpg({}) failed: {}",
                    pgid,
                    e
                );
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Joins a reader unless it is still blocked after `deadline`, in which case it is left
/// to finish on its own. A stray descendant holding the pipe must not stall the caller.
fn join_reader(handle: thread::JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                target: "circle_cut::ffmpeg::runner",
                "Output reader still busy after kill; detaching it"
            );
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}

fn tool_name(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned())
}

/// Spawns `program` and waits for it. Returns the captured output whatever the exit status.
fn spawn_and_wait(
    program: &Path,
    args: &[String],
    opts: &RunOptions<'_>,
) -> Result<ToolOutput, AppError> {
    opts.control.ensure_active()?;
    let tool = tool_name(program);
    log::debug!(
        target: "circle_cut::ffmpeg::runner",
        "Spawning {}: {} {}",
        tool,
        program.display(),
        args.join(" ")
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::ToolUnavailable(format!(
                "{} not found at '{}'. Verify the installation or configure its full path.",
                tool,
                program.display()
            ))
        } else {
            AppError::tool_failed(&tool, -1, format!("Failed to spawn {}: {}", tool, e))
        }
    })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(AppError::tool_failed(&tool, -1, "Failed to capture output"));
    };

    let duration = Arc::new(AtomicU64::new(
        opts.duration_secs
            .filter(|&d| d > 0.0)
            .map(f64::to_bits)
            .unwrap_or(NONE_DURATION_BITS),
    ));
    let stdout_buffer = Arc::new(Mutex::new(Vec::new()));
    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
    let stdout_handle = read_stream(
        stdout,
        ReadStreamConfig {
            capture: Arc::clone(&stdout_buffer),
            duration: Arc::clone(&duration),
            progress_callback: opts.progress_callback.clone(),
        },
    );
    let stderr_handle = read_stream(
        stderr,
        ReadStreamConfig {
            capture: Arc::clone(&stderr_buffer),
            duration: Arc::clone(&duration),
            progress_callback: None,
        },
    );

    {
        let mut guard = opts.control.active.lock();
        *guard = Some(child);
    }
    // cancel() may have raced the registration above; it would have found no child.
    if opts.control.is_cancelled() {
        opts.control.cancel();
    }

    let deadline = opts.timeout.map(|t| Instant::now() + t);
    let waited = wait_for_exit(opts.control, deadline);

    if matches!(waited, WaitOutcome::Exited(_)) {
        let _ = stdout_handle.join();
        let _ = stderr_handle.join();
    } else {
        let drain_until = Instant::now() + READER_DRAIN_GRACE;
        join_reader(stdout_handle, drain_until);
        join_reader(stderr_handle, drain_until);
    }

    let status = match waited {
        WaitOutcome::Exited(status) => status,
        WaitOutcome::Aborted => {
            log::warn!(
                target: "circle_cut::ffmpeg::runner",
                "{} was terminated by cancellation",
                tool
            );
            return Err(AppError::aborted());
        }
        WaitOutcome::TimedOut => {
            let timeout = opts.timeout.unwrap_or_default();
            log::error!(
                target: "circle_cut::ffmpeg::runner",
                "{} timed out after {:?}, killed",
                tool,
                timeout
            );
            return Err(AppError::Timeout { tool, timeout });
        }
        WaitOutcome::Failed(e) => return Err(e.into()),
    };

    let stdout = String::from_utf8_lossy(&stdout_buffer.lock()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buffer.lock()).into_owned();
    Ok(ToolOutput {
        code: status.code().unwrap_or(-1),
        success: status.success(),
        stdout,
        stderr,
    })
}

enum WaitOutcome {
    Exited(ExitStatus),
    Aborted,
    TimedOut,
    Failed(std::io::Error),
}

fn wait_for_exit(control: &RunControl, deadline: Option<Instant>) -> WaitOutcome {
    loop {
        {
            let mut guard = control.active.lock();
            let Some(child) = guard.as_mut() else {
                return WaitOutcome::Aborted;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    guard.take();
                    return WaitOutcome::Exited(status);
                }
                Ok(None) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        if let Some(mut child) = guard.take() {
                            terminate(&mut child);
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
                Err(e) => {
                    if let Some(mut child) = guard.take() {
                        terminate(&mut child);
                    }
                    return WaitOutcome::Failed(e);
                }
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs a tool and requires a zero exit status.
pub fn run_tool(
    program: &Path,
    args: &[String],
    opts: &RunOptions<'_>,
) -> Result<ToolOutput, AppError> {
    let output = spawn_and_wait(program, args, opts)?;
    if output.success {
        log::debug!(
            target: "circle_cut::ffmpeg::runner",
            "{} completed successfully",
            tool_name(program)
        );
        return Ok(output);
    }
    let err_preview = output
        .stderr
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .join("; ");
    log::error!(
        target: "circle_cut::ffmpeg::runner",
        "{} failed (code={}): {}",
        tool_name(program),
        output.code,
        err_preview
    );
    Err(AppError::tool_failed(
        tool_name(program),
        output.code,
        output.stderr,
    ))
}

/// Runs a tool for its diagnostic text only; the exit status is not checked.
pub fn run_tool_diagnostic(
    program: &Path,
    args: &[String],
    opts: &RunOptions<'_>,
) -> Result<ToolOutput, AppError> {
    spawn_and_wait(program, args, opts)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let control = RunControl::new();
        let out = run_tool(
            &sh(),
            &script("echo out; echo err 1>&2"),
            &RunOptions::new(&control),
        )
        .expect("run");
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(out.success);
    }

    #[test]
    fn non_zero_exit_is_tool_failed() {
        let control = RunControl::new();
        let err = run_tool(&sh(), &script("echo boom 1>&2; exit 3"), &RunOptions::new(&control))
            .unwrap_err();
        match err {
            AppError::ToolFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected ToolFailed, got {other:?}"),
        }
    }

    #[test]
    fn diagnostic_mode_ignores_exit_status() {
        let control = RunControl::new();
        let out = run_tool_diagnostic(
            &sh(),
            &script("echo 'Duration: 00:00:05.00' 1>&2; exit 1"),
            &RunOptions::new(&control),
        )
        .expect("run");
        assert!(!out.success);
        assert!(out.stderr.contains("Duration"));
    }

    #[test]
    fn missing_binary_is_tool_unavailable() {
        let control = RunControl::new();
        let err = run_tool(
            Path::new("/nonexistent/bin/ffmpeg"),
            &[],
            &RunOptions::new(&control),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ToolUnavailable(_)));
    }

    #[test]
    fn timeout_kills_child() {
        let control = RunControl::new();
        let started = Instant::now();
        let err = run_tool(
            &sh(),
            &script("exec sleep 5"),
            &RunOptions::new(&control).timeout(Duration::from_millis(200)),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_is_bounded_when_tool_spawns_children() {
        let control = RunControl::new();
        let started = Instant::now();
        let err = run_tool(
            &sh(),
            &script("sleep 6; true"),
            &RunOptions::new(&control).timeout(Duration::from_millis(200)),
        )
        .unwrap_err();
        match err {
            AppError::Timeout { tool, timeout } => {
                assert_eq!(tool, "sh");
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn cancel_is_bounded_when_tool_spawns_children() {
        let control = Arc::new(RunControl::new());
        let canceller = Arc::clone(&control);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });
        let started = Instant::now();
        let err = run_tool(&sh(), &script("sleep 6; true"), &RunOptions::new(&control))
            .unwrap_err();
        handle.join().expect("join");
        assert!(matches!(err, AppError::Aborted));
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn cancel_terminates_in_flight_child() {
        let control = Arc::new(RunControl::new());
        let canceller = Arc::clone(&control);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });
        let err = run_tool(&sh(), &script("exec sleep 5"), &RunOptions::new(&control))
            .unwrap_err();
        handle.join().expect("join");
        assert!(matches!(err, AppError::Aborted));
        assert!(control.is_cancelled());
    }

    #[test]
    fn cancelled_control_refuses_to_spawn() {
        let control = RunControl::new();
        control.cancel();
        let err = run_tool(&sh(), &script("true"), &RunOptions::new(&control)).unwrap_err();
        assert!(matches!(err, AppError::Aborted));
    }

    #[test]
    fn progress_callback_receives_out_time() {
        let control = RunControl::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ProgressCallback = Arc::new(move |p| sink.lock().push(p));
        run_tool(
            &sh(),
            &script("echo out_time_ms=5000000; echo out_time_ms=10000000"),
            &RunOptions::new(&control).progress(10.0, Some(cb)),
        )
        .expect("run");
        let seen = seen.lock();
        assert_eq!(seen.last().copied(), Some(1.0));
    }
}
