//! The per-tile build scheduler.
//!
//! A bounded pool of worker threads drives each tile through the full
//! pipeline: cache lookup, normalize on miss, stage + invoke the backend,
//! then a validation pass and optional XP12 enrichment. Per-tile failures
//! are values in the report, never panics or early exits; only
//! invalid-input class errors abort the build as a whole.

use crate::density::{backend_config_for_preset, estimate_triangles, triangle_limits_for_preset};
use crate::enrich::{
    enrich_dsf_rasters, find_reference_dsf, inventory_dsf_rasters, EnrichmentStatus,
};
use crate::options::{BuildOptions, ResumeMode};
use crate::provenance::build_provenance;
use crate::report::{
    exit_code_for, load_report, timestamp, write_json_atomic, BackendInfo, BuildConfigLock,
    BuildPlan, BuildReport, PlanCommands, PlanInputs, TileReport, TileStatus, SCHEMA_VERSION,
};
use crate::validate::{validate_tiles, ValidationMode, ValidationSettings};
use crate::{BuildError, Result};
use demgrid_dem::{
    inspect_dem, CacheVerify, CoverageMetrics, DemStack, NormalizationCache, Normalizer,
};
use demgrid_runner::{run_tile as run_backend_tile, RunnerJob, RunnerStatus};
use demgrid_tiles::Tile;
use demgrid_tools::{CancelToken, ToolPaths};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Everything a build run needs.
pub struct BuildInput {
    /// Tiles to build.
    pub tiles: Vec<Tile>,
    /// DEM source paths (stack layers when `dem_stack` is set).
    pub dem_paths: Vec<PathBuf>,
    /// Prioritized stack input, if any.
    pub dem_stack: Option<DemStack>,
    /// Build output directory.
    pub output_dir: PathBuf,
    /// Build options.
    pub options: BuildOptions,
    /// External tool commands.
    pub tools: ToolPaths,
    /// Cancellation token observed at every step boundary.
    pub cancel: CancelToken,
}

/// Finished build: the written plan and report plus the exit code.
pub struct BuildOutcome {
    /// The pre-run plan as written.
    pub plan: BuildPlan,
    /// The post-run report as written.
    pub report: BuildReport,
    /// Orchestrator exit code (0/2/3, or 10 when cancelled).
    pub exit_code: i32,
    /// The run was cancelled.
    pub cancelled: bool,
}

fn backend_info() -> BackendInfo {
    BackendInfo {
        name: "ortho4xp".to_string(),
        version: "1.40".to_string(),
    }
}

struct TileWorkOutput {
    entry: TileReport,
    coverage: Option<CoverageMetrics>,
}

struct WorkerContext<'a> {
    input: &'a BuildInput,
    normalizer: Option<&'a Normalizer>,
    cache: &'a NormalizationCache,
    cache_verify: CacheVerify,
    runner_cmd: &'a [String],
    backend_config: BTreeMap<String, String>,
    /// Set when `continue_on_error` is off and a tile has failed; stops
    /// the producer from handing out further tiles.
    halt: &'a AtomicBool,
}

fn resolve_prepared_dem(input: &BuildInput, tile: Tile) -> Option<PathBuf> {
    if let Some(path) = input.options.tile_dem_paths.get(&tile.to_string()) {
        return Some(path.clone());
    }
    if input.dem_paths.len() == 1 {
        return Some(input.dem_paths[0].clone());
    }
    None
}

fn normalize_step(
    ctx: &WorkerContext<'_>,
    tile: Tile,
    entry: &mut TileReport,
) -> (Option<PathBuf>, Option<CoverageMetrics>) {
    let Some(normalizer) = ctx.normalizer else {
        // Normalization disabled: the tile DEM is already prepared.
        let path = resolve_prepared_dem(ctx.input, tile);
        if path.is_none() {
            entry.messages.push("no prepared DEM for tile".to_string());
            entry.mark_error();
        }
        return (path, None);
    };
    let key = match normalizer.cache_key_inputs(tile).key() {
        Ok(key) => key,
        Err(err) => {
            entry.messages.push(format!("cache key failed: {err}"));
            entry.mark_error();
            return (None, None);
        }
    };
    let tile_name = tile.to_string();
    if let Some(hit) = ctx.cache.lookup(&key, &tile_name, ctx.cache_verify) {
        entry
            .metrics
            .insert("cache".to_string(), json!({ "hit": true, "key": key }));
        return (Some(hit.path), Some(hit.coverage));
    }
    let artifact = ctx
        .input
        .output_dir
        .join("normalized")
        .join("tiles")
        .join(&tile_name)
        .join(format!("{tile_name}.tif"));
    match normalizer.normalize_tile(tile, &artifact) {
        Ok((result, metrics)) => {
            if let Err(err) = ctx
                .cache
                .store(&key, &tile_name, &artifact, result.nodata, &metrics)
            {
                // Cache trouble is recoverable: the artifact itself is fine.
                warn!(tile = %tile_name, "cache store failed: {err}");
            }
            entry
                .metrics
                .insert("cache".to_string(), json!({ "hit": false, "key": key }));
            (Some(result.path), Some(metrics))
        }
        Err(err) => {
            entry.messages.push(format!("Normalization failed: {err}"));
            entry.mark_error();
            (None, None)
        }
    }
}

fn triangle_step(ctx: &WorkerContext<'_>, dem_path: &PathBuf, entry: &mut TileReport) {
    let options = &ctx.input.options;
    let (default_warn, default_max) = triangle_limits_for_preset(&options.density)
        .unwrap_or((1_500_000, 5_000_000));
    let warn_limit = options.triangle_warn.unwrap_or(default_warn);
    let max_limit = options.triangle_max.unwrap_or(default_max);
    let Ok(info) = inspect_dem(dem_path) else {
        return;
    };
    let estimate = estimate_triangles(&info);
    entry.metrics.insert(
        "triangles".to_string(),
        json!({
            "estimated": estimate,
            "width": info.width,
            "height": info.height,
            "warn": warn_limit,
            "max": max_limit,
            "source": "dem-grid",
        }),
    );
    if estimate > max_limit && !options.allow_triangle_overage {
        entry.messages.push(format!(
            "triangle estimate {estimate} exceeds max {max_limit}"
        ));
        entry.mark_error();
    } else if estimate > warn_limit {
        entry.messages.push(format!(
            "triangle estimate {estimate} exceeds warn {warn_limit}"
        ));
        entry.mark_warning();
    }
}

fn runner_step(
    ctx: &WorkerContext<'_>,
    tile: Tile,
    dem_path: &PathBuf,
    entry: &mut TileReport,
) {
    if ctx.runner_cmd.is_empty() {
        entry
            .messages
            .push("runner not configured; backend skipped".to_string());
        if entry.status == TileStatus::Ok {
            entry.status = TileStatus::Skipped;
        }
        return;
    }
    let options = &ctx.input.options;
    let backend_root = options
        .backend_root
        .clone()
        .expect("validated: backend root present when runner configured");
    let mut job = RunnerJob::new(
        tile,
        dem_path.clone(),
        ctx.input.output_dir.clone(),
        backend_root,
        ctx.runner_cmd.to_vec(),
    );
    job.extra_args = options.extra_runner_args.clone();
    job.config_updates = ctx.backend_config.clone();
    job.persist_config = options.persist_config;
    job.skip_dem_stage = options.skip_dem_stage;
    job.source_root = options.source_root.clone();
    job.timeout = options.runner_timeout_secs.map(Duration::from_secs);
    job.idle_timeout = options.runner_idle_timeout_secs.map(Duration::from_secs);
    job.cancel = Some(ctx.input.cancel.clone());

    match run_backend_tile(&job) {
        Ok(outcome) => {
            entry.metrics.insert(
                "runner".to_string(),
                json!({
                    "command": outcome.final_command,
                    "attempts": outcome.attempts.len(),
                    "staged_dem": outcome.staged_dem,
                    "returncode": outcome.last_returncode(),
                }),
            );
            match outcome.status {
                RunnerStatus::Ok => {
                    if outcome.attempts.len() > 1 {
                        entry.messages.push(format!(
                            "backend succeeded after {} attempts",
                            outcome.attempts.len()
                        ));
                    }
                }
                RunnerStatus::TransientExhausted => {
                    entry
                        .messages
                        .push("backend retry ladder exhausted".to_string());
                    entry.mark_error();
                }
                RunnerStatus::TimedOut => {
                    entry.messages.push("backend timed out".to_string());
                    entry.mark_error();
                }
                RunnerStatus::Fatal => {
                    entry.messages.push(format!(
                        "backend failed with exit code {}",
                        outcome.last_returncode()
                    ));
                    entry.mark_error();
                }
                RunnerStatus::Cancelled => {
                    entry.messages.push("backend cancelled".to_string());
                    entry.status = TileStatus::Skipped;
                }
            }
        }
        Err(demgrid_runner::RunnerError::Cancelled) => {
            entry.messages.push("cancelled before backend run".to_string());
            entry.status = TileStatus::Skipped;
        }
        Err(err) => {
            entry.messages.push(format!("backend invocation failed: {err}"));
            entry.mark_error();
        }
    }
}

fn process_tile(ctx: &WorkerContext<'_>, tile: Tile) -> TileWorkOutput {
    let mut entry = TileReport::new(&tile.to_string());
    if ctx.input.cancel.is_cancelled() {
        entry.messages.push("cancelled".to_string());
        entry.status = TileStatus::Skipped;
        return TileWorkOutput {
            entry,
            coverage: None,
        };
    }
    let (dem_path, coverage) = normalize_step(ctx, tile, &mut entry);
    if let Some(metrics) = &coverage {
        entry.metrics.insert(
            "coverage".to_string(),
            serde_json::to_value(metrics).unwrap_or_default(),
        );
    }
    if let Some(dem_path) = &dem_path {
        if entry.status != TileStatus::Error {
            triangle_step(ctx, dem_path, &mut entry);
        }
        if entry.status != TileStatus::Error && !ctx.input.cancel.is_cancelled() {
            runner_step(ctx, tile, dem_path, &mut entry);
        } else if ctx.input.cancel.is_cancelled() && entry.status == TileStatus::Ok {
            entry.messages.push("cancelled".to_string());
            entry.status = TileStatus::Skipped;
        }
    }
    if entry.status == TileStatus::Error && !ctx.input.options.continue_on_error {
        ctx.halt.store(true, Ordering::Relaxed);
    }
    TileWorkOutput { entry, coverage }
}

fn apply_coverage_thresholds(
    options: &BuildOptions,
    coverage: &BTreeMap<String, CoverageMetrics>,
    report: &mut BuildReport,
) {
    let Some(min_coverage) = options.coverage_min else {
        return;
    };
    for entry in &mut report.tiles {
        let Some(metrics) = coverage.get(&entry.tile) else {
            continue;
        };
        if metrics.coverage_before >= min_coverage {
            continue;
        }
        let message = format!(
            "{}: coverage_before {:.2}% below {:.2}%",
            entry.tile,
            metrics.coverage_before * 100.0,
            min_coverage * 100.0
        );
        entry.messages.push(message.clone());
        if options.coverage_hard_fail {
            entry.mark_error();
            report.errors.push(message);
        } else {
            entry.mark_warning();
            report.warnings.push(message);
        }
    }
}

fn enrichment_pass(input: &BuildInput, report: &mut BuildReport) {
    let options = &input.options;
    if !options.enrich_xp12 {
        return;
    }
    let dsftool = input.tools.dsftool.argv().to_vec();
    let reference_root = options
        .global_scenery
        .clone()
        .expect("validated: enrichment requires a reference root");
    if dsftool.is_empty() {
        let message = "XP12 enrichment requires a DSFTool command".to_string();
        for entry in &mut report.tiles {
            entry.messages.push(message.clone());
            entry.mark_error();
        }
        report.errors.push(message);
        return;
    }
    let timeout = options.runner_timeout_secs.map(Duration::from_secs);
    for entry in &mut report.tiles {
        if entry.status == TileStatus::Error || entry.status == TileStatus::Skipped {
            continue;
        }
        let Ok(tile) = entry.tile.parse::<Tile>() else {
            continue;
        };
        let dsf = demgrid_tiles::dsf_path(&input.output_dir, tile);
        if !dsf.exists() {
            entry
                .messages
                .push("DSF output not found; XP12 enrichment skipped".to_string());
            entry.mark_warning();
            continue;
        }
        let inventory_dir = input.output_dir.join("xp12").join(&entry.tile).join("inventory");
        if let Ok(summary) = inventory_dsf_rasters(&dsftool, &dsf, &inventory_dir, timeout, 0) {
            entry.metrics.insert(
                "xp12_rasters".to_string(),
                json!({
                    "soundscape_present": summary.soundscape_present,
                    "season_raster_count": summary.season_raster_count,
                    "season_raster_expected": summary.season_raster_expected,
                    "rasters": summary.raster_names,
                }),
            );
        }
        let Some(reference) = find_reference_dsf(&reference_root, tile) else {
            let message = "reference scenery DSF not found".to_string();
            entry.messages.push(message.clone());
            if options.xp12_strict {
                entry.mark_error();
                report.errors.push(format!("{}: {message}", entry.tile));
            } else {
                entry.mark_warning();
                report.warnings.push(format!("{}: {message}", entry.tile));
            }
            continue;
        };
        let work_dir = input.output_dir.join("xp12").join(&entry.tile);
        match enrich_dsf_rasters(&dsftool, &dsf, &reference, &work_dir, timeout, 0) {
            Ok(result) => {
                entry.metrics.insert(
                    "xp12_enrichment".to_string(),
                    json!({
                        "status": match result.status {
                            EnrichmentStatus::Enriched => "enriched",
                            EnrichmentStatus::NoOp => "no-op",
                            EnrichmentStatus::Failed => "failed",
                        },
                        "missing": result.missing,
                        "added": result.added,
                        "backup_path": result.backup_path,
                        "enriched_text_path": result.enriched_text_path,
                        "reference_dsf": reference,
                        "error": result.error,
                    }),
                );
                match result.status {
                    EnrichmentStatus::Failed => {
                        entry.messages.push(format!(
                            "XP12 enrichment failed: {}",
                            result.error.unwrap_or_default()
                        ));
                        entry.mark_error();
                        report
                            .errors
                            .push(format!("{}: XP12 enrichment failed", entry.tile));
                    }
                    EnrichmentStatus::NoOp => {
                        entry
                            .messages
                            .push("XP12 rasters already present".to_string());
                    }
                    EnrichmentStatus::Enriched => {
                        entry.messages.push(format!(
                            "XP12 rasters enriched: {}",
                            result.added.join(", ")
                        ));
                    }
                }
            }
            Err(err) => {
                entry.messages.push(format!("XP12 enrichment failed: {err}"));
                entry.mark_error();
            }
        }
    }
}

/// Run a full build: plan, normalize, invoke, validate, enrich, report.
pub fn run_build(input: &BuildInput) -> Result<BuildOutcome> {
    let options = &input.options;
    options.validate(&input.tiles, &input.dem_paths)?;
    if let Some(stack) = &input.dem_stack {
        stack.validate(options.dst_nodata)?;
    }
    let runner_cmd = input.tools.runner.argv().to_vec();
    if !runner_cmd.is_empty() && options.backend_root.is_none() {
        return Err(BuildError::InvalidInput(
            "backend root is required when a runner is configured".into(),
        ));
    }

    let tile_names: Vec<String> = input.tiles.iter().map(Tile::to_string).collect();
    let options_value = serde_json::to_value(options)?;
    let (provenance, provenance_warnings) = build_provenance(
        options,
        &input.dem_paths,
        &runner_cmd,
        input.tools.dsftool.argv(),
    )?;

    let plan = BuildPlan {
        schema_version: SCHEMA_VERSION.to_string(),
        created_at: timestamp(options.stable_metadata),
        inputs: PlanInputs {
            dems: input
                .dem_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            dem_stack: input
                .dem_stack
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        },
        tiles: tile_names.clone(),
        backend: backend_info(),
        commands: PlanCommands {
            runner: runner_cmd.clone(),
            dsftool: input.tools.dsftool.argv().to_vec(),
        },
        options: options_value.clone(),
        provenance: Some(provenance.clone()),
    };
    write_json_atomic(&input.output_dir.join("build_plan.json"), &plan)?;
    let lock = BuildConfigLock {
        schema_version: SCHEMA_VERSION.to_string(),
        created_at: timestamp(options.stable_metadata),
        options: options_value,
    };
    write_json_atomic(&input.output_dir.join("build_config.lock.json"), &lock)?;

    let mut report = BuildReport {
        schema_version: SCHEMA_VERSION.to_string(),
        created_at: timestamp(options.stable_metadata),
        backend: backend_info(),
        tiles: Vec::new(),
        artifacts: BTreeMap::new(),
        warnings: provenance_warnings,
        errors: Vec::new(),
        provenance: Some(provenance),
    };
    report.artifacts.insert(
        "scenery_dir".to_string(),
        json!(input.output_dir.to_string_lossy()),
    );

    if options.dry_run {
        for tile in &tile_names {
            let mut entry = TileReport::new(tile);
            entry.status = TileStatus::Skipped;
            entry.messages.push("dry run".to_string());
            report.tiles.push(entry);
        }
        report
            .warnings
            .push("Dry run enabled; no backend invoked".to_string());
        write_json_atomic(&input.output_dir.join("build_report.json"), &report)?;
        return Ok(BuildOutcome {
            plan,
            report,
            exit_code: 0,
            cancelled: false,
        });
    }

    // Resume: reuse entries for tiles already reported ok.
    let prior = match options.resume {
        ResumeMode::Off => None,
        _ => load_report(&input.output_dir.join("build_report.json")),
    };
    let mut reused: Vec<TileReport> = Vec::new();
    let mut work_tiles: Vec<Tile> = Vec::new();
    let mut revalidate: Vec<Tile> = Vec::new();
    for tile in &input.tiles {
        let prior_entry = prior
            .as_ref()
            .and_then(|report| report.tile(&tile.to_string()))
            .filter(|entry| entry.status == TileStatus::Ok);
        match (options.resume, prior_entry) {
            (ResumeMode::Resume, Some(entry)) => {
                // Idempotent marker: repeated resume runs converge on the
                // same report bytes.
                let mut entry = entry.clone();
                entry.metrics.insert("resumed".to_string(), json!(true));
                reused.push(entry);
            }
            (ResumeMode::ValidateOnly, Some(entry)) => {
                reused.push(entry.clone());
                revalidate.push(*tile);
            }
            _ => work_tiles.push(*tile),
        }
    }
    if !reused.is_empty() {
        info!(reused = reused.len(), "resuming from prior build report");
    }

    let normalizer = if options.normalize && !work_tiles.is_empty() {
        let normalize_options = options.normalize_options(&input.tiles)?;
        Some(match &input.dem_stack {
            Some(stack) => Normalizer::from_stack(stack, normalize_options)?,
            None => Normalizer::from_paths(&input.dem_paths, normalize_options)?,
        })
    } else {
        None
    };
    let cache = NormalizationCache::new(input.output_dir.join("normalized").join("cache"));
    let cache_verify = if options.cache_verify == "content-hash" {
        CacheVerify::ContentHash
    } else {
        CacheVerify::Fingerprint
    };
    let halt = AtomicBool::new(false);
    let ctx = WorkerContext {
        input,
        normalizer: normalizer.as_ref(),
        cache: &cache,
        cache_verify,
        runner_cmd: &runner_cmd,
        backend_config: backend_config_for_preset(&options.density)?,
        halt: &halt,
    };

    let workers = options.resolve_workers(work_tiles.len());
    let results: Mutex<Vec<(Tile, TileWorkOutput)>> = Mutex::new(Vec::new());
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Tile>(workers + 2);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let ctx = &ctx;
            let results = &results;
            scope.spawn(move || {
                while let Ok(tile) = job_rx.recv() {
                    let output = process_tile(ctx, tile);
                    results.lock().unwrap().push((tile, output));
                }
            });
        }
        drop(job_rx);
        for tile in &work_tiles {
            // Stop handing out new tiles once cancellation or a halting
            // failure fires; queued sends block rather than buffer
            // unboundedly.
            if input.cancel.is_cancelled() || halt.load(Ordering::Relaxed) {
                break;
            }
            if job_tx.send(*tile).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    let mut outputs = results.into_inner().unwrap();
    outputs.sort_by_key(|(tile, _)| *tile);
    let mut coverage: BTreeMap<String, CoverageMetrics> = BTreeMap::new();
    let mut entries: Vec<(Tile, TileReport)> = Vec::new();
    let mut seen: std::collections::BTreeSet<Tile> = std::collections::BTreeSet::new();
    for (tile, output) in outputs {
        if let Some(metrics) = output.coverage {
            coverage.insert(tile.to_string(), metrics);
        }
        seen.insert(tile);
        entries.push((tile, output.entry));
    }
    // Tiles never scheduled (cancellation or halt) are reported skipped.
    let skip_reason = if halt.load(Ordering::Relaxed) {
        "halted after earlier failure"
    } else {
        "cancelled"
    };
    for tile in &work_tiles {
        if !seen.contains(tile) {
            let mut entry = TileReport::new(&tile.to_string());
            entry.status = TileStatus::Skipped;
            entry.messages.push(skip_reason.to_string());
            entries.push((*tile, entry));
        }
    }
    for tile in revalidate {
        if let Some(entry) = reused.iter().find(|entry| entry.tile == tile.to_string()) {
            entries.push((tile, entry.clone()));
        }
    }

    // Validation pass on its own bounded pool.
    let validation_mode: ValidationMode = options.validation.parse()?;
    let validation_workers = if options.validation_workers > 0 {
        options.validation_workers
    } else {
        workers
    };
    let settings = ValidationSettings {
        mode: validation_mode,
        dsftool: input.tools.dsftool.argv().to_vec(),
        timeout: options.runner_timeout_secs.map(Duration::from_secs),
        retries: 0,
        allow_bounds_warning: options.allow_bounds_warning,
        workers: validation_workers,
    };
    if !input.cancel.is_cancelled() {
        validate_tiles(&settings, &input.output_dir, &mut entries)?;
    }

    let revalidated: std::collections::BTreeSet<String> = entries
        .iter()
        .map(|(_, entry)| entry.tile.clone())
        .collect();
    report.tiles = reused
        .into_iter()
        .filter(|entry| !revalidated.contains(&entry.tile))
        .chain(entries.into_iter().map(|(_, entry)| entry))
        .collect();
    report
        .tiles
        .sort_by(|a, b| a.tile.cmp(&b.tile));

    if !input.cancel.is_cancelled() {
        enrichment_pass(input, &mut report);
    }
    apply_coverage_thresholds(options, &coverage, &mut report);

    let dsf_paths: Vec<String> = report
        .tiles
        .iter()
        .filter(|entry| entry.status != TileStatus::Error)
        .filter_map(|entry| entry.tile.parse::<Tile>().ok())
        .map(|tile| {
            demgrid_tiles::dsf_path(&input.output_dir, tile)
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    report
        .artifacts
        .insert("dsf_paths".to_string(), json!(dsf_paths));
    for entry in &report.tiles {
        if entry.status == TileStatus::Error {
            report.errors.push(format!("{}: build failed", entry.tile));
        }
    }

    let cancelled = input.cancel.is_cancelled();
    if cancelled {
        report.errors.push("build cancelled".to_string());
    }
    write_json_atomic(&input.output_dir.join("build_report.json"), &report)?;

    let exit_code = if cancelled { 10 } else { exit_code_for(&report) };
    Ok(BuildOutcome {
        plan,
        report,
        exit_code,
        cancelled,
    })
}
