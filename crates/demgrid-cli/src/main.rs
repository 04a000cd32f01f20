//! demgrid command-line interface.
//!
//! Exit codes: 0 success, 1 invalid inputs, 2 at least one tile failed,
//! 3 all tiles failed, 10 cancellation.

use clap::{Args, Parser, Subcommand};
use demgrid_build::{
    run_build, run_patch, validate_tiles, BuildError, BuildInput, BuildOptions, ResumeMode,
    TileReport, ValidationMode, ValidationSettings,
};
use demgrid_dem::{inspect_dem, load_dem_stack, NormalizationCache};
use demgrid_tiles::{tiles_for_bounds, Tile};
use demgrid_tools::{CancelToken, ToolPaths};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "demgrid", version, about = "Build X-Plane 12 base-mesh DSF tiles from DEM rasters")]
struct Cli {
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce log output to warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    /// Tool paths JSON file (defaults to discovery).
    #[arg(long, global = true)]
    tool_paths: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize DEMs and build DSF tiles through the backend.
    Build(BuildArgs),
    /// Apply a DEM patch plan on top of an existing build.
    Patch(PatchArgs),
    /// Validate DSFs in an existing build tree.
    Validate(ValidateArgs),
    /// Evict old normalization cache entries.
    Clean(CleanArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// DEM input file (repeatable).
    #[arg(long = "dem")]
    dems: Vec<PathBuf>,
    /// DEM stack definition JSON (alternative to --dem).
    #[arg(long)]
    dem_stack: Option<PathBuf>,
    /// Tile to build, like +47+008 (repeatable; inferred from DEM bounds
    /// when omitted).
    #[arg(long = "tile")]
    tiles: Vec<String>,
    /// Output directory.
    #[arg(long)]
    output: PathBuf,
    /// Backend root holding Elevation_data and the global config.
    #[arg(long)]
    backend_root: Option<PathBuf>,
    /// Target CRS for normalized tiles.
    #[arg(long, default_value = "EPSG:4326")]
    target_crs: String,
    /// Resampling kernel: nearest, bilinear, cubic, average, lanczos.
    #[arg(long, default_value = "bilinear")]
    resampling: String,
    /// Destination nodata value (accepts `nan`).
    #[arg(long)]
    dst_nodata: Option<f64>,
    /// Target resolution in meters per pixel.
    #[arg(long)]
    target_resolution: Option<f64>,
    /// Fill strategy: none, constant, interpolate, fallback.
    #[arg(long, default_value = "none")]
    fill_strategy: String,
    /// Constant fill value.
    #[arg(long, default_value_t = 0.0)]
    fill_value: f64,
    /// Fallback DEM for fallback fill (repeatable).
    #[arg(long = "fallback-dem")]
    fallback_dems: Vec<PathBuf>,
    /// Mosaic strategy: full, virtual, per-tile.
    #[arg(long, default_value = "full")]
    mosaic_strategy: String,
    /// Artifact compression: none, lzw, deflate.
    #[arg(long, default_value = "none")]
    compression: String,
    /// Density preset: low, medium, high, ultra.
    #[arg(long, default_value = "medium")]
    density: String,
    /// Worker threads (0 = auto).
    #[arg(long, default_value_t = 0)]
    workers: usize,
    /// Stop scheduling new tiles after the first failure.
    #[arg(long)]
    halt_on_error: bool,
    /// Minimum acceptable coverage before fill, 0..=1.
    #[arg(long)]
    coverage_min: Option<f64>,
    /// Fail tiles below the coverage minimum instead of warning.
    #[arg(long)]
    coverage_hard_fail: bool,
    /// Validation mode: none, bounds, roundtrip.
    #[arg(long, default_value = "bounds")]
    validation: String,
    /// Validation worker threads (0 = follow --workers).
    #[arg(long, default_value_t = 0)]
    validation_workers: usize,
    /// Report bounds mismatches as warnings.
    #[arg(long)]
    allow_bounds_warning: bool,
    /// Enrich DSFs with XP12 rasters from a reference scenery tree.
    #[arg(long)]
    enrich_xp12: bool,
    /// Missing reference tiles fail instead of warning.
    #[arg(long)]
    xp12_strict: bool,
    /// Reference scenery root for enrichment.
    #[arg(long)]
    global_scenery: Option<PathBuf>,
    /// Per-attempt runner timeout in seconds.
    #[arg(long)]
    runner_timeout: Option<u64>,
    /// Runner no-output watchdog in seconds.
    #[arg(long)]
    runner_idle_timeout: Option<u64>,
    /// Keep patched backend config after the run.
    #[arg(long)]
    persist_config: bool,
    /// Extra runner argument (repeatable).
    #[arg(long = "runner-arg")]
    runner_args: Vec<String>,
    /// Resume mode: off, resume, validate-only.
    #[arg(long, default_value = "off")]
    resume: String,
    /// Provenance level: basic, strict.
    #[arg(long, default_value = "basic")]
    provenance: String,
    /// Deterministic plan/report output (no timestamps).
    #[arg(long)]
    stable_metadata: bool,
    /// Cache verification: fingerprint, content-hash.
    #[arg(long, default_value = "fingerprint")]
    cache_verify: String,
    /// Plan only; do not normalize or run the backend.
    #[arg(long)]
    dry_run: bool,
    /// Repository source root exported to the runner's module path.
    #[arg(long)]
    source_root: Option<PathBuf>,
}

#[derive(Args)]
struct PatchArgs {
    /// Existing build directory.
    #[arg(long)]
    build_dir: PathBuf,
    /// Patch plan JSON.
    #[arg(long)]
    plan: PathBuf,
    /// Output directory for the patched tree.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Build output directory containing `Earth nav data/`.
    #[arg(long)]
    output: PathBuf,
    /// Tile to validate (repeatable).
    #[arg(long = "tile", required = true)]
    tiles: Vec<String>,
    /// Validation mode: bounds, roundtrip.
    #[arg(long, default_value = "bounds")]
    mode: String,
    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Report bounds mismatches as warnings.
    #[arg(long)]
    allow_bounds_warning: bool,
}

#[derive(Args)]
struct CleanArgs {
    /// Build output directory.
    #[arg(long)]
    output: PathBuf,
    /// Cache entries to keep (newest first).
    #[arg(long, default_value_t = 64)]
    keep: usize,
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::EnvFilter;
    let level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_tiles(names: &[String]) -> Result<Vec<Tile>, BuildError> {
    names
        .iter()
        .map(|name| {
            name.parse::<Tile>()
                .map_err(|err| BuildError::InvalidInput(err.to_string()))
        })
        .collect()
}

/// Infer the tile set from the union of the DEM bounds.
fn infer_tiles(dem_paths: &[PathBuf]) -> Result<Vec<Tile>, BuildError> {
    let mut union: Option<(f64, f64, f64, f64)> = None;
    for path in dem_paths {
        let info = inspect_dem(path)?;
        if info.crs.as_deref() != Some("EPSG:4326") {
            return Err(BuildError::InvalidInput(format!(
                "tile inference requires EPSG:4326 DEMs; pass --tile explicitly for {}",
                path.display()
            )));
        }
        let b = info.bounds;
        union = Some(match union {
            None => b,
            Some(u) => (u.0.min(b.0), u.1.min(b.1), u.2.max(b.2), u.3.max(b.3)),
        });
    }
    let union =
        union.ok_or_else(|| BuildError::InvalidInput("no DEM inputs provided".into()))?;
    Ok(tiles_for_bounds(union)?)
}

fn run_build_command(cli: &Cli, args: &BuildArgs) -> Result<i32, BuildError> {
    let tools = ToolPaths::discover(cli.tool_paths.as_deref())?;
    let dem_stack = args
        .dem_stack
        .as_ref()
        .map(|path| load_dem_stack(path))
        .transpose()?;
    let dem_paths: Vec<PathBuf> = match &dem_stack {
        Some(stack) => stack.layers.iter().map(|layer| layer.path.clone()).collect(),
        None => args.dems.clone(),
    };
    if dem_paths.is_empty() {
        return Err(BuildError::InvalidInput(
            "at least one --dem or a --dem-stack is required".into(),
        ));
    }
    let tiles = if args.tiles.is_empty() {
        infer_tiles(&dem_paths)?
    } else {
        parse_tiles(&args.tiles)?
    };
    let resume = match args.resume.as_str() {
        "off" => ResumeMode::Off,
        "resume" => ResumeMode::Resume,
        "validate-only" => ResumeMode::ValidateOnly,
        other => {
            return Err(BuildError::InvalidInput(format!(
                "unknown resume mode: {other}"
            )))
        }
    };
    let options = BuildOptions {
        target_crs: args.target_crs.clone(),
        resampling: args.resampling.clone(),
        dst_nodata: args.dst_nodata,
        target_resolution_m: args.target_resolution,
        fill_strategy: args.fill_strategy.clone(),
        fill_value: args.fill_value,
        fallback_dems: args.fallback_dems.clone(),
        mosaic_strategy: args.mosaic_strategy.clone(),
        compression: args.compression.clone(),
        density: args.density.clone(),
        workers: args.workers,
        continue_on_error: !args.halt_on_error,
        coverage_min: args.coverage_min,
        coverage_hard_fail: args.coverage_hard_fail,
        validation: args.validation.clone(),
        validation_workers: args.validation_workers,
        allow_bounds_warning: args.allow_bounds_warning,
        enrich_xp12: args.enrich_xp12,
        xp12_strict: args.xp12_strict,
        global_scenery: args.global_scenery.clone(),
        backend_root: args.backend_root.clone(),
        runner_timeout_secs: args.runner_timeout,
        runner_idle_timeout_secs: args.runner_idle_timeout,
        persist_config: args.persist_config,
        extra_runner_args: args.runner_args.clone(),
        resume,
        provenance_level: args.provenance.clone(),
        stable_metadata: args.stable_metadata,
        cache_verify: args.cache_verify.clone(),
        dry_run: args.dry_run,
        source_root: args.source_root.clone(),
        ..Default::default()
    };
    let input = BuildInput {
        tiles,
        dem_paths,
        dem_stack,
        output_dir: args.output.clone(),
        options,
        tools,
        cancel: CancelToken::new(),
    };
    let outcome = run_build(&input)?;
    println!(
        "{}",
        serde_json::json!({
            "report": input.output_dir.join("build_report.json"),
            "tiles": outcome.report.tiles.len(),
            "errors": outcome.report.errors.len(),
            "exit_code": outcome.exit_code,
        })
    );
    Ok(outcome.exit_code)
}

fn run_patch_command(cli: &Cli, args: &PatchArgs) -> Result<i32, BuildError> {
    let tools = ToolPaths::discover(cli.tool_paths.as_deref())?;
    let (report, outcome) = run_patch(
        &args.build_dir,
        &args.plan,
        args.output.as_deref(),
        tools,
        CancelToken::new(),
    )?;
    println!(
        "{}",
        serde_json::json!({
            "patched_tiles": report.tiles,
            "output_dir": report.output_dir,
            "exit_code": outcome.exit_code,
        })
    );
    Ok(outcome.exit_code)
}

fn run_validate_command(cli: &Cli, args: &ValidateArgs) -> Result<i32, BuildError> {
    let tools = ToolPaths::discover(cli.tool_paths.as_deref())?;
    if tools.dsftool.is_empty() {
        return Err(BuildError::InvalidInput(
            "DSF validation requires a configured DSFTool".into(),
        ));
    }
    let mode: ValidationMode = args.mode.parse()?;
    let tiles = parse_tiles(&args.tiles)?;
    let mut entries: Vec<(Tile, TileReport)> = tiles
        .iter()
        .map(|tile| (*tile, TileReport::new(&tile.to_string())))
        .collect();
    let settings = ValidationSettings {
        mode,
        dsftool: tools.dsftool.argv().to_vec(),
        timeout: None,
        retries: 0,
        allow_bounds_warning: args.allow_bounds_warning,
        workers: args.workers,
    };
    validate_tiles(&settings, &args.output, &mut entries)?;
    let mut failed = 0usize;
    for (_, entry) in &entries {
        if entry.status == demgrid_build::TileStatus::Error {
            failed += 1;
        }
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(if failed == 0 {
        0
    } else if failed == entries.len() {
        3
    } else {
        2
    })
}

fn run_clean_command(args: &CleanArgs) -> Result<i32, BuildError> {
    let cache = NormalizationCache::new(args.output.join("normalized").join("cache"));
    let removed = cache.clean(args.keep)?;
    println!("{}", serde_json::json!({ "removed_entries": removed }));
    Ok(0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    let result = match &cli.command {
        Command::Build(args) => run_build_command(&cli, args),
        Command::Patch(args) => run_patch_command(&cli, args),
        Command::Validate(args) => run_validate_command(&cli, args),
        Command::Clean(args) => run_clean_command(args),
    };
    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(BuildError::InvalidInput(message)) => {
            error!("invalid input: {message}");
            ExitCode::from(1)
        }
        Err(BuildError::Cancelled) => ExitCode::from(10),
        Err(err) => {
            error!("build failed: {err}");
            ExitCode::from(1)
        }
    }
}
