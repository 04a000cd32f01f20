//! Subprocess invocation with streamed capture and watchdogs.
//!
//! Every external tool call is an argv vector; nothing is ever joined into
//! a shell string. Stdout and stderr are drained on their own threads into
//! on-disk logs, bounded head+tail ring buffers, and an optional per-line
//! sink, so arbitrarily verbose tools cannot exhaust memory. A monitor
//! loop enforces a total timeout, a no-output watchdog, and cooperative
//! cancellation, escalating from a soft kill to a hard kill after a grace
//! period.

use crate::{Result, ToolError};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reported for timed-out invocations.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Machine-ish output.
    Stdout,
    /// Human diagnostics.
    Stderr,
}

impl StreamKind {
    /// Lowercase name for logs and event records.
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Cooperative cancellation token shared across workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Bounded line buffer keeping the head and tail of a stream.
#[derive(Debug)]
pub struct RingBuffer {
    head: Vec<String>,
    tail: std::collections::VecDeque<String>,
    max_head: usize,
    max_tail: usize,
    total: u64,
}

impl RingBuffer {
    fn new(max_head: usize, max_tail: usize) -> Self {
        RingBuffer {
            head: Vec::new(),
            tail: std::collections::VecDeque::new(),
            max_head,
            max_tail,
            total: 0,
        }
    }

    fn push(&mut self, line: &str) {
        self.total += 1;
        if self.head.len() < self.max_head {
            self.head.push(line.to_string());
            return;
        }
        if self.tail.len() == self.max_tail {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// Total lines seen, including dropped ones.
    pub fn total_lines(&self) -> u64 {
        self.total
    }

    /// Render the captured head and tail, marking the elision.
    pub fn render(&self) -> String {
        let mut out = self.head.join("\n");
        let dropped = self.total as i64 - self.head.len() as i64 - self.tail.len() as i64;
        if dropped > 0 {
            out.push_str(&format!("\n... [{dropped} lines elided] ...\n"));
        } else if !self.tail.is_empty() && !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        out
    }
}

/// Options for one tool invocation.
#[derive(Default)]
pub struct RunOptions {
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Total wall-clock limit.
    pub timeout: Option<Duration>,
    /// Kill the child when no output arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Grace between the soft and hard kill.
    pub kill_grace: Duration,
    /// Stream stdout to this file.
    pub stdout_path: Option<PathBuf>,
    /// Stream stderr to this file.
    pub stderr_path: Option<PathBuf>,
    /// Extra environment entries for the child.
    pub env: Vec<(String, String)>,
    /// Cancellation token checked by the monitor loop.
    pub cancel: Option<CancelToken>,
    /// Lines kept verbatim at the head of each ring buffer.
    pub capture_head: usize,
    /// Lines kept at the tail of each ring buffer.
    pub capture_tail: usize,
}

impl RunOptions {
    /// Defaults: 100 head + 400 tail lines, 10 s kill grace.
    pub fn new() -> Self {
        RunOptions {
            kill_grace: Duration::from_secs(10),
            capture_head: 100,
            capture_tail: 400,
            ..Default::default()
        }
    }
}

/// Captured result of a tool invocation.
#[derive(Debug)]
pub struct CommandOutput {
    /// The argv vector that ran.
    pub command: Vec<String>,
    /// Exit code; 124 on timeout, -1 on signal death.
    pub returncode: i32,
    /// Head+tail of stdout.
    pub stdout: String,
    /// Head+tail of stderr.
    pub stderr: String,
    /// Total timeout fired.
    pub timed_out: bool,
    /// No-output watchdog fired.
    pub idle_timed_out: bool,
    /// Cancellation token was set during the run.
    pub cancelled: bool,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl CommandOutput {
    /// True when the tool exited zero without interference.
    pub fn success(&self) -> bool {
        self.returncode == 0 && !self.timed_out && !self.idle_timed_out && !self.cancelled
    }
}

/// Resolve an executable prefix for a tool command.
///
/// When the last token is a script (`.py` suffix) and no interpreter is
/// already present, the current interpreter name is prepended; wrapper
/// tokens supplied by the user stay in front untouched.
pub fn resolve_script_prefix(argv: &[String], interpreter: &str) -> Vec<String> {
    if argv.is_empty() {
        return Vec::new();
    }
    let last = &argv[argv.len() - 1];
    let is_script = PathBuf::from(last)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("py"))
        .unwrap_or(false);
    if !is_script {
        return argv.to_vec();
    }
    let has_interpreter = argv[..argv.len() - 1].iter().any(|token| {
        let name = PathBuf::from(token)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        name.starts_with("python") || name == "py" || name == "py.exe"
    });
    if has_interpreter {
        return argv.to_vec();
    }
    let mut resolved = argv[..argv.len() - 1].to_vec();
    resolved.push(interpreter.to_string());
    resolved.push(last.clone());
    resolved
}

#[cfg(unix)]
fn soft_kill(child: &Child) {
    // SIGTERM first; the hard kill below is SIGKILL.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn soft_kill(_child: &Child) {}

fn terminate(child: &mut Child, grace: Duration) {
    soft_kill(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run an argv vector, draining both streams concurrently.
///
/// `on_line` sees every line of both streams in arrival order with its
/// 1-based line number within the stream.
pub fn run_command(
    argv: &[String],
    opts: &RunOptions,
    mut on_line: Option<&mut (dyn FnMut(StreamKind, u64, &str) + Send)>,
) -> Result<CommandOutput> {
    if argv.is_empty() {
        return Err(ToolError::InvalidCommand("empty command vector".into()));
    }
    let start = Instant::now();
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    debug!(command = ?argv, "launching tool");
    let mut child = command.spawn()?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let last_output = Arc::new(Mutex::new(Instant::now()));
    let stdout_ring = Mutex::new(RingBuffer::new(opts.capture_head, opts.capture_tail));
    let stderr_ring = Mutex::new(RingBuffer::new(opts.capture_head, opts.capture_tail));
    let line_sink: Mutex<Option<&mut (dyn FnMut(StreamKind, u64, &str) + Send)>> =
        Mutex::new(on_line.take());

    let mut timed_out = false;
    let mut idle_timed_out = false;
    let mut cancelled = false;
    let mut returncode = -1;

    std::thread::scope(|scope| {
        fn drain<'scope, 'env>(
            scope: &'scope std::thread::Scope<'scope, 'env>,
            last_output: &'env Arc<Mutex<Instant>>,
            sink: &'env Mutex<Option<&mut (dyn FnMut(StreamKind, u64, &str) + Send)>>,
            pipe: Option<Box<dyn std::io::Read + Send>>,
            kind: StreamKind,
            log_path: Option<&'env PathBuf>,
            ring: &'env Mutex<RingBuffer>,
        ) {
            let last_output = Arc::clone(last_output);
            let mut log = log_path.map(|path| {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                File::create(path)
            });
            scope.spawn(move || {
                let Some(pipe) = pipe else { return };
                let reader = BufReader::new(pipe);
                let mut line_no = 0u64;
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    line_no += 1;
                    *last_output.lock().unwrap() = Instant::now();
                    if let Some(Ok(file)) = log.as_mut() {
                        let _ = writeln!(file, "{line}");
                    }
                    ring.lock().unwrap().push(&line);
                    if let Some(callback) = sink.lock().unwrap().as_mut() {
                        callback(kind, line_no, &line);
                    }
                }
            });
        }
        drain(
            scope,
            &last_output,
            &line_sink,
            stdout_pipe.map(|p| Box::new(p) as Box<dyn std::io::Read + Send>),
            StreamKind::Stdout,
            opts.stdout_path.as_ref(),
            &stdout_ring,
        );
        drain(
            scope,
            &last_output,
            &line_sink,
            stderr_pipe.map(|p| Box::new(p) as Box<dyn std::io::Read + Send>),
            StreamKind::Stderr,
            opts.stderr_path.as_ref(),
            &stderr_ring,
        );

        // Monitor loop: poll exit, enforce timeouts and cancellation.
        returncode = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(err) => {
                    warn!("try_wait failed: {err}");
                    break -1;
                }
            }
            if let Some(cancel) = &opts.cancel {
                if cancel.is_cancelled() {
                    cancelled = true;
                    terminate(&mut child, opts.kill_grace);
                    break TIMEOUT_EXIT_CODE;
                }
            }
            if let Some(limit) = opts.timeout {
                if start.elapsed() > limit {
                    timed_out = true;
                    warn!(?limit, "tool exceeded total timeout");
                    terminate(&mut child, opts.kill_grace);
                    break TIMEOUT_EXIT_CODE;
                }
            }
            if let Some(idle) = opts.idle_timeout {
                let quiet = last_output.lock().unwrap().elapsed();
                if quiet > idle {
                    idle_timed_out = true;
                    warn!(?idle, "tool produced no output within the watchdog window");
                    terminate(&mut child, opts.kill_grace);
                    break TIMEOUT_EXIT_CODE;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        };
    });

    Ok(CommandOutput {
        command: argv.to_vec(),
        returncode,
        stdout: stdout_ring.into_inner().unwrap().render(),
        stderr: stderr_ring.into_inner().unwrap().render(),
        timed_out,
        idle_timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}
