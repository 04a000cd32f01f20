//! Per-tile invocation of the mesh-generation backend.
//!
//! One [`RunnerJob`] turns into: stage the tile DEM, patch the backend
//! config, launch the runner with both streams captured and parsed into
//! events, and restore the config on every exit path. Recognized
//! transient failures walk the retry ladder; each attempt gets its own
//! logs, events, and config diff under `<output>/runner_logs/`.

use crate::events::{
    classify_line, AttemptEvents, EventKind, RunnerEvent, TileEventLog, EVENTS_SCHEMA_VERSION,
};
use crate::stage::stage_tile_dem;
use crate::{Result, RunnerError};
use demgrid_tiles::Tile;
use demgrid_tools::{
    config_diff, patch_config, resolve_script_prefix, run_command, CancelToken, RunOptions,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Cap on recorded milestone events per attempt.
const MAX_EVENTS_PER_ATTEMPT: usize = 10_000;

/// A per-tile backend invocation request.
#[derive(Debug, Clone)]
pub struct RunnerJob {
    /// Tile to build.
    pub tile: Tile,
    /// Normalized tile DEM to stage and pass to the runner.
    pub dem_path: PathBuf,
    /// Build output directory (logs land under `runner_logs/`).
    pub output_dir: PathBuf,
    /// Backend root holding `Elevation_data/` and the global config.
    pub backend_root: PathBuf,
    /// Runner argv vector; wrapper prefixes are preserved as-is.
    pub runner_cmd: Vec<String>,
    /// Extra arguments appended to the runner command.
    pub extra_args: Vec<String>,
    /// Config keys patched into the backend's global config.
    pub config_updates: BTreeMap<String, String>,
    /// Keep the patched config after the run instead of restoring.
    pub persist_config: bool,
    /// Skip staging the DEM (it is already in place).
    pub skip_dem_stage: bool,
    /// Repository source root prepended to the interpreter module path.
    pub source_root: Option<PathBuf>,
    /// Total timeout per attempt.
    pub timeout: Option<Duration>,
    /// No-output watchdog per attempt.
    pub idle_timeout: Option<Duration>,
    /// Grace between soft and hard kill.
    pub kill_grace: Duration,
    /// Cooperative cancellation token.
    pub cancel: Option<CancelToken>,
}

impl RunnerJob {
    /// Job with defaults for one tile.
    pub fn new(
        tile: Tile,
        dem_path: PathBuf,
        output_dir: PathBuf,
        backend_root: PathBuf,
        runner_cmd: Vec<String>,
    ) -> Self {
        RunnerJob {
            tile,
            dem_path,
            output_dir,
            backend_root,
            runner_cmd,
            extra_args: Vec::new(),
            config_updates: BTreeMap::new(),
            persist_config: false,
            skip_dem_stage: false,
            source_root: None,
            timeout: None,
            idle_timeout: None,
            kill_grace: Duration::from_secs(10),
            cancel: None,
        }
    }
}

/// Terminal status of a per-tile runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// Backend succeeded (possibly after retries).
    Ok,
    /// Recognized transient failure and the ladder ran dry.
    TransientExhausted,
    /// Unrecognized non-zero exit.
    Fatal,
    /// Killed by total or idle timeout on the final attempt.
    TimedOut,
    /// Cancellation token fired.
    Cancelled,
}

/// Record of one attempt within a tile invocation.
#[derive(Debug)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// The argv vector that ran.
    pub command: Vec<String>,
    /// Exit code (124 on timeout).
    pub returncode: i32,
    /// Config ladder adjustments applied on this attempt.
    pub ladder_updates: BTreeMap<String, String>,
    /// Milestone events captured from both streams.
    pub events: Vec<RunnerEvent>,
    /// Attempt was killed by a timeout.
    pub timed_out: bool,
}

/// Full outcome of a per-tile runner invocation.
#[derive(Debug)]
pub struct RunnerOutcome {
    /// Tile that was built.
    pub tile: Tile,
    /// Terminal status.
    pub status: RunnerStatus,
    /// All attempts in order.
    pub attempts: Vec<AttemptRecord>,
    /// Where the DEM was staged, when staging ran.
    pub staged_dem: Option<PathBuf>,
    /// The final invocation command.
    pub final_command: Vec<String>,
}

impl RunnerOutcome {
    /// Exit code of the last attempt.
    pub fn last_returncode(&self) -> i32 {
        self.attempts.last().map(|a| a.returncode).unwrap_or(-1)
    }
}

fn runner_logs_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("runner_logs")
}

fn attempt_suffix(attempt: u32) -> String {
    if attempt <= 1 {
        String::new()
    } else {
        format!(".attempt{attempt}")
    }
}

/// The retry ladder: progressively relaxed triangulation parameters.
///
/// Entries are filtered against the currently configured minimum angle so
/// a retry never raises it.
fn retry_ladder(base_min_angle: Option<f64>) -> Vec<BTreeMap<String, String>> {
    let mut ladder = Vec::new();
    for angle in [5.0f64, 0.0] {
        if base_min_angle.map(|base| angle < base).unwrap_or(true) {
            let mut updates = BTreeMap::new();
            updates.insert("min_angle".to_string(), format!("{angle}"));
            ladder.push(updates);
        }
    }
    // Last rung: relax the area criterion as well.
    let mut updates = BTreeMap::new();
    updates.insert("min_angle".to_string(), "0".to_string());
    updates.insert("curvature_tol".to_string(), "3.0".to_string());
    ladder.push(updates);
    ladder
}

fn base_min_angle(job: &RunnerJob) -> Option<f64> {
    if let Some(value) = job.config_updates.get("min_angle") {
        return value.parse().ok();
    }
    let config_path = job.backend_root.join("Ortho4XP.cfg");
    demgrid_tools::read_config_values(&config_path)
        .ok()
        .and_then(|values| values.get("min_angle").and_then(|v| v.parse().ok()))
}

fn has_triangle_failure(events: &[RunnerEvent]) -> bool {
    events.iter().any(|e| e.kind == EventKind::TriangleFail)
}

fn build_argv(job: &RunnerJob) -> Vec<String> {
    // Same contract as every other tool call: a bare script gets the
    // interpreter prefixed, wrapper tokens stay in front untouched.
    let mut argv = resolve_script_prefix(&job.runner_cmd, "python3");
    argv.push("--tile".to_string());
    argv.push(job.tile.to_string());
    argv.push("--dem".to_string());
    argv.push(job.dem_path.to_string_lossy().into_owned());
    argv.push("--output".to_string());
    argv.push(job.output_dir.to_string_lossy().into_owned());
    argv.extend(job.extra_args.iter().cloned());
    argv
}

fn runner_env(job: &RunnerJob) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(source_root) = &job.source_root {
        let existing = std::env::var("PYTHONPATH").unwrap_or_default();
        let source = source_root.to_string_lossy().into_owned();
        let sep = if cfg!(windows) { ";" } else { ":" };
        let merged = if existing.is_empty() {
            source
        } else if existing.split(sep).any(|entry| entry == source) {
            existing
        } else {
            format!("{source}{sep}{existing}")
        };
        env.push(("PYTHONPATH".to_string(), merged));
    }
    env
}

fn check_cancelled(job: &RunnerJob) -> Result<()> {
    if job
        .cancel
        .as_ref()
        .map(CancelToken::is_cancelled)
        .unwrap_or(false)
    {
        return Err(RunnerError::Cancelled);
    }
    Ok(())
}

struct AttemptOutput {
    returncode: i32,
    events: Vec<RunnerEvent>,
    command: Vec<String>,
    timed_out: bool,
    cancelled: bool,
}

fn run_attempt(
    job: &RunnerJob,
    attempt: u32,
    updates: &BTreeMap<String, String>,
) -> Result<AttemptOutput> {
    let log_dir = runner_logs_dir(&job.output_dir);
    std::fs::create_dir_all(&log_dir)?;
    let suffix = attempt_suffix(attempt);
    let tile = job.tile;

    let config_path = job.backend_root.join("Ortho4XP.cfg");
    let guard = if updates.is_empty() {
        None
    } else {
        Some(patch_config(&config_path, updates)?)
    };

    // Preserve the patched per-tile config for provenance before running.
    if let Some(guard) = &guard {
        let diff = config_diff(guard.snapshot().original(), &config_path)?;
        let payload = json!({ "diff": diff });
        std::fs::write(
            log_dir.join(format!("{tile}{suffix}.config.json")),
            serde_json::to_string_pretty(&payload)?,
        )?;
    }

    let mut events: Vec<RunnerEvent> = Vec::new();
    let mut sink = |stream, line_no, line: &str| {
        if events.len() >= MAX_EVENTS_PER_ATTEMPT {
            return;
        }
        let event = classify_line(stream, line_no, line);
        if event.kind != EventKind::Generic {
            events.push(event);
        }
    };

    let mut opts = RunOptions::new();
    opts.cwd = Some(job.backend_root.clone());
    opts.timeout = job.timeout;
    opts.idle_timeout = job.idle_timeout;
    opts.kill_grace = job.kill_grace;
    opts.stdout_path = Some(log_dir.join(format!("{tile}{suffix}.stdout.log")));
    opts.stderr_path = Some(log_dir.join(format!("{tile}{suffix}.stderr.log")));
    opts.env = runner_env(job);
    opts.cancel = job.cancel.clone();

    let argv = build_argv(job);
    let output = run_command(&argv, &opts, Some(&mut sink))?;

    // Restoration is guaranteed on every exit path above: the guard's Drop
    // rewrites (or deletes) the config even if run_command errored.
    if let Some(guard) = guard {
        if job.persist_config {
            guard.persist();
        } else {
            guard.restore().map_err(RunnerError::Tool)?;
        }
    }

    let run_log = log_dir.join(format!("{tile}{suffix}.run.log"));
    std::fs::write(
        &run_log,
        format!(
            "command: {}\nreturncode: {}\ntimed_out: {}\nidle_timed_out: {}\nduration_s: {:.3}\n--- stdout (head+tail) ---\n{}\n--- stderr (head+tail) ---\n{}\n",
            output.command.join(" "),
            output.returncode,
            output.timed_out,
            output.idle_timed_out,
            output.duration.as_secs_f64(),
            output.stdout,
            output.stderr,
        ),
    )?;

    Ok(AttemptOutput {
        returncode: output.returncode,
        events,
        command: output.command,
        timed_out: output.timed_out || output.idle_timed_out,
        cancelled: output.cancelled,
    })
}

/// Run the backend for one tile, walking the retry ladder on recognized
/// transient failures.
pub fn run_tile(job: &RunnerJob) -> Result<RunnerOutcome> {
    if job.runner_cmd.is_empty() {
        return Err(RunnerError::RunnerNotConfigured);
    }
    check_cancelled(job)?;

    let staged_dem = if job.skip_dem_stage {
        None
    } else {
        let staged = stage_tile_dem(&job.backend_root, job.tile, &job.dem_path)?;
        let log_dir = runner_logs_dir(&job.output_dir);
        std::fs::create_dir_all(&log_dir)?;
        std::fs::write(
            log_dir.join(format!("{}.staged.json", job.tile)),
            serde_json::to_string_pretty(&json!({ "staged_dem": staged }))?,
        )?;
        Some(staged)
    };

    let base_angle = base_min_angle(job);
    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut attempt_no = 1u32;

    check_cancelled(job)?;
    let first = run_attempt(job, attempt_no, &job.config_updates)?;
    let mut final_command = first.command.clone();
    let mut cancelled = first.cancelled;
    let mut last_timed_out = first.timed_out;
    let mut last_returncode = first.returncode;
    let mut retryable = has_triangle_failure(&first.events);
    attempts.push(AttemptRecord {
        attempt: attempt_no,
        command: first.command,
        returncode: first.returncode,
        ladder_updates: BTreeMap::new(),
        events: first.events,
        timed_out: first.timed_out,
    });

    if last_returncode != 0 && !cancelled && (retryable || last_timed_out) {
        for rung in retry_ladder(base_angle) {
            if last_returncode == 0 {
                break;
            }
            if check_cancelled(job).is_err() {
                cancelled = true;
                break;
            }
            attempt_no += 1;
            warn!(
                tile = %job.tile,
                attempt = attempt_no,
                updates = ?rung,
                "retrying backend with relaxed triangulation parameters"
            );
            let mut updates = job.config_updates.clone();
            updates.extend(rung.clone());
            let output = run_attempt(job, attempt_no, &updates)?;
            cancelled = cancelled || output.cancelled;
            last_timed_out = output.timed_out;
            last_returncode = output.returncode;
            retryable = retryable || has_triangle_failure(&output.events);
            final_command = output.command.clone();
            attempts.push(AttemptRecord {
                attempt: attempt_no,
                command: output.command,
                returncode: output.returncode,
                ladder_updates: rung,
                events: output.events,
                timed_out: output.timed_out,
            });
            if cancelled {
                break;
            }
        }
    }

    let status = if cancelled {
        RunnerStatus::Cancelled
    } else if last_returncode == 0 {
        RunnerStatus::Ok
    } else if last_timed_out {
        RunnerStatus::TimedOut
    } else if retryable {
        RunnerStatus::TransientExhausted
    } else {
        RunnerStatus::Fatal
    };
    if status == RunnerStatus::Ok {
        info!(tile = %job.tile, attempts = attempts.len(), "backend build succeeded");
    }

    // Persist the full event stream across attempts.
    let event_log = TileEventLog {
        schema_version: EVENTS_SCHEMA_VERSION.to_string(),
        runner: job
            .runner_cmd
            .first()
            .cloned()
            .unwrap_or_else(|| "runner".to_string()),
        tile: job.tile.to_string(),
        attempts: attempts
            .iter()
            .map(|a| AttemptEvents {
                events: a.events.clone(),
            })
            .collect(),
    };
    let log_dir = runner_logs_dir(&job.output_dir);
    std::fs::create_dir_all(&log_dir)?;
    std::fs::write(
        log_dir.join(format!("{}.events.json", job.tile)),
        serde_json::to_string_pretty(&event_log)?,
    )?;

    Ok(RunnerOutcome {
        tile: job.tile,
        status,
        attempts,
        staged_dem,
        final_command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn base_job(dir: &TempDir, runner: PathBuf) -> RunnerJob {
        let dem = dir.path().join("+47+008.tif");
        std::fs::write(&dem, b"dem").unwrap();
        let backend_root = dir.path().join("ortho");
        std::fs::create_dir_all(&backend_root).unwrap();
        RunnerJob::new(
            "+47+008".parse().unwrap(),
            dem,
            dir.path().join("out"),
            backend_root,
            vec![runner.to_string_lossy().into_owned()],
        )
    }

    #[test]
    fn test_successful_run_stages_and_logs() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "runner.sh", "echo 'Step 1 : vectors'\necho 'Step 3 : done'\nexit 0\n");
        let job = base_job(&dir, runner);
        let outcome = run_tile(&job).unwrap();
        assert_eq!(outcome.status, RunnerStatus::Ok);
        assert_eq!(outcome.attempts.len(), 1);
        let staged = outcome.staged_dem.unwrap();
        assert!(staged.ends_with("Elevation_data/+40+000/N47E008.tif"));
        let log_dir = dir.path().join("out/runner_logs");
        assert!(log_dir.join("+47+008.stdout.log").exists());
        assert!(log_dir.join("+47+008.events.json").exists());
        assert!(log_dir.join("+47+008.run.log").exists());
        let events: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(log_dir.join("+47+008.events.json")).unwrap())
                .unwrap();
        assert_eq!(events["attempts"][0]["events"][0]["kind"], "step1");
    }

    #[test]
    fn test_retry_ladder_recovers_from_tiny_triangles() {
        let dir = TempDir::new().unwrap();
        // Fails with a triangulation diagnostic until min_angle drops below 6.
        let cfg = dir.path().join("ortho/Ortho4XP.cfg");
        let runner = write_script(
            dir.path(),
            "flaky.sh",
            &format!(
                "angle=$(grep '^min_angle=' {cfg} 2>/dev/null | cut -d= -f2)\n\
                 angle=${{angle:-20}}\n\
                 if [ \"${{angle%%.*}}\" -lt 6 ]; then echo 'Step 3 : ok'; exit 0; fi\n\
                 echo 'Triangle4XP: tiny triangles detected' >&2\nexit 1\n",
                cfg = cfg.display()
            ),
        );
        let job = base_job(&dir, runner);
        let outcome = run_tile(&job).unwrap();
        assert_eq!(outcome.status, RunnerStatus::Ok);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].returncode, 1);
        assert!(has_triangle_failure(&outcome.attempts[0].events));
        assert_eq!(outcome.attempts[1].returncode, 0);
        assert_eq!(
            outcome.attempts[1].ladder_updates.get("min_angle").unwrap(),
            "5"
        );
        // Config was restored after the run.
        assert!(!cfg.exists());
    }

    #[test]
    fn test_fatal_failure_does_not_retry() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "broken.sh", "echo 'unrelated crash' >&2\nexit 7\n");
        let job = base_job(&dir, runner);
        let outcome = run_tile(&job).unwrap();
        assert_eq!(outcome.status, RunnerStatus::Fatal);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.last_returncode(), 7);
    }

    #[test]
    fn test_config_restored_to_absence_after_failure() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "fail.sh", "exit 1\n");
        let mut job = base_job(&dir, runner);
        job.config_updates
            .insert("mesh_zl".to_string(), "17".to_string());
        let cfg = job.backend_root.join("Ortho4XP.cfg");
        assert!(!cfg.exists());
        let outcome = run_tile(&job).unwrap();
        assert_eq!(outcome.status, RunnerStatus::Fatal);
        // The file was absent before the run; it must be absent after.
        assert!(!cfg.exists());
        // The per-attempt config diff was preserved for provenance.
        assert!(dir
            .path()
            .join("out/runner_logs/+47+008.config.json")
            .exists());
    }

    #[test]
    fn test_persist_config_keeps_patch() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "ok.sh", "exit 0\n");
        let mut job = base_job(&dir, runner);
        job.persist_config = true;
        job.config_updates
            .insert("mesh_zl".to_string(), "18".to_string());
        run_tile(&job).unwrap();
        let cfg = job.backend_root.join("Ortho4XP.cfg");
        let values = demgrid_tools::read_config_values(&cfg).unwrap();
        assert_eq!(values.get("mesh_zl").unwrap(), "18");
    }

    #[test]
    fn test_script_runner_gets_interpreter_prefix() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "noop.sh", "exit 0\n");
        let mut job = base_job(&dir, runner);
        // A bare .py runner must be invoked through the interpreter, with
        // wrapper tokens kept in front of it.
        job.runner_cmd = vec![
            "wrapper".to_string(),
            "/opt/runner/mesh_runner.py".to_string(),
        ];
        let argv = build_argv(&job);
        assert_eq!(argv[0], "wrapper");
        assert_eq!(argv[1], "python3");
        assert_eq!(argv[2], "/opt/runner/mesh_runner.py");
        assert!(argv
            .windows(2)
            .any(|w| w[0] == "--tile" && w[1] == "+47+008"));
        // An already-prefixed command is left alone.
        job.runner_cmd = vec![
            "python3".to_string(),
            "/opt/runner/mesh_runner.py".to_string(),
        ];
        let argv = build_argv(&job);
        assert_eq!(&argv[..2], ["python3", "/opt/runner/mesh_runner.py"]);
    }

    #[test]
    fn test_wrapper_prefix_preserved_in_command() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "echoargs.sh", "echo \"$@\"\nexit 0\n");
        let mut job = base_job(&dir, runner.clone());
        job.runner_cmd = vec![
            runner.to_string_lossy().into_owned(),
            "--wrapper-flag".to_string(),
        ];
        let outcome = run_tile(&job).unwrap();
        assert_eq!(outcome.final_command[1], "--wrapper-flag");
        assert!(outcome
            .final_command
            .windows(2)
            .any(|w| w[0] == "--tile" && w[1] == "+47+008"));
    }

    #[test]
    fn test_cancellation_before_invocation() {
        let dir = TempDir::new().unwrap();
        let runner = write_script(dir.path(), "never.sh", "exit 0\n");
        let mut job = base_job(&dir, runner);
        let cancel = CancelToken::new();
        cancel.cancel();
        job.cancel = Some(cancel);
        assert!(matches!(run_tile(&job), Err(RunnerError::Cancelled)));
    }
}
