//! End-to-end build tests with fake runner and DSFTool scripts.

use demgrid_build::{run_build, BuildInput, BuildOptions, ResumeMode, TileStatus};
use demgrid_dem::{write_geotiff, RasterGrid, TiffCompression};
use demgrid_tiles::CrsDef;
use demgrid_tools::{CancelToken, ToolPaths};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn wgs84() -> CrsDef {
    CrsDef::from_authority("EPSG:4326").unwrap()
}

fn write_dem(path: &Path, bounds: (f64, f64, f64, f64), size: usize, value: f32) {
    let grid = RasterGrid::from_data(
        size,
        size,
        bounds,
        wgs84(),
        Some(-9999.0),
        vec![value; size * size],
    )
    .unwrap();
    write_geotiff(path, &grid, TiffCompression::None).unwrap();
}

fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_path_buf()
}

/// Fake runner: creates the expected DSF under the output tree.
///
/// Works for tiles in the `+40+000` bucket only, which covers the tiles
/// used in these tests.
fn fake_runner(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("fake_runner.sh"),
        r#"tile=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --tile) tile=$2; shift 2;;
    --output) out=$2; shift 2;;
    *) shift;;
  esac
done
echo "Step 1 : assembling vector data"
echo "Step 2 : building mesh"
echo "Step 3 : building DSF"
mkdir -p "$out/Earth nav data/+40+000"
printf 'DSF' > "$out/Earth nav data/+40+000/$tile.dsf"
exit 0
"#,
    )
}

/// Fake DSFTool: emits +47+008 bounds on dsf2text, copies on text2dsf.
fn fake_dsftool(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("fake_dsftool.sh"),
        r#"mode=$1
src=$2
dst=$3
if [ "$mode" = "--dsf2text" ]; then
  printf 'PROPERTY sim/west 8\nPROPERTY sim/south 47\nPROPERTY sim/east 9\nPROPERTY sim/north 48\n' > "$dst"
else
  printf 'DSF' > "$dst"
fi
exit 0
"#,
    )
}

fn tools_with(runner: Option<PathBuf>, dsftool: Option<PathBuf>) -> ToolPaths {
    let to_cmd = |path: Option<PathBuf>| {
        demgrid_tools::ToolCommand(
            path.map(|p| vec![p.to_string_lossy().into_owned()])
                .unwrap_or_default(),
        )
    };
    ToolPaths {
        runner: to_cmd(runner),
        dsftool: to_cmd(dsftool),
        ..Default::default()
    }
}

fn build_input(dir: &TempDir, tiles: &[&str], options: BuildOptions) -> BuildInput {
    let dem = dir.path().join("source.tif");
    if !dem.exists() {
        write_dem(&dem, (7.0, 46.0, 10.0, 49.0), 60, 420.0);
    }
    BuildInput {
        tiles: tiles.iter().map(|name| name.parse().unwrap()).collect(),
        dem_paths: vec![dem],
        dem_stack: None,
        output_dir: dir.path().join("out"),
        options,
        tools: ToolPaths::default(),
        cancel: CancelToken::new(),
    }
}

fn fast_options() -> BuildOptions {
    BuildOptions {
        validation: "none".to_string(),
        target_resolution_m: Some(5000.0),
        backend_root: None,
        stable_metadata: true,
        ..Default::default()
    }
}

#[test]
fn test_full_build_with_runner() {
    let dir = TempDir::new().unwrap();
    let runner = fake_runner(dir.path());
    let mut input = build_input(&dir, &["+47+008", "+47+009"], fast_options());
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), None);

    let outcome = run_build(&input).unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.report.tiles.len(), 2);
    for entry in &outcome.report.tiles {
        assert_eq!(entry.status, TileStatus::Ok, "tile {}: {:?}", entry.tile, entry.messages);
        assert!(entry.metrics.contains_key("coverage"));
        assert!(entry.metrics.contains_key("runner"));
    }
    // Artifacts and documents are in place.
    assert!(dir.path().join("out/build_plan.json").exists());
    assert!(dir.path().join("out/build_config.lock.json").exists());
    assert!(dir.path().join("out/build_report.json").exists());
    assert!(dir
        .path()
        .join("out/Earth nav data/+40+000/+47+008.dsf")
        .exists());
    assert!(dir
        .path()
        .join("out/normalized/tiles/+47+008/+47+008.tif")
        .exists());
    assert!(dir
        .path()
        .join("out/runner_logs/+47+008.events.json")
        .exists());
}

#[test]
fn test_bounds_validation_with_fake_dsftool() {
    let dir = TempDir::new().unwrap();
    let runner = fake_runner(dir.path());
    let dsftool = fake_dsftool(dir.path());
    let mut options = fast_options();
    options.validation = "bounds".to_string();
    let mut input = build_input(&dir, &["+47+008"], options);
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), Some(dsftool));

    let outcome = run_build(&input).unwrap();
    assert_eq!(outcome.exit_code, 0, "errors: {:?}", outcome.report.errors);
    let entry = &outcome.report.tiles[0];
    assert_eq!(entry.status, TileStatus::Ok, "{:?}", entry.messages);
    assert!(entry.metrics.contains_key("dsf_bounds"));
}

#[test]
fn test_bounds_mismatch_is_error() {
    let dir = TempDir::new().unwrap();
    let runner = fake_runner(dir.path());
    let dsftool = fake_dsftool(dir.path());
    let mut options = fast_options();
    options.validation = "bounds".to_string();
    // The fake tool always reports +47+008 bounds; +48+009 must mismatch.
    let mut input = build_input(&dir, &["+48+009"], options);
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), Some(dsftool));

    let outcome = run_build(&input).unwrap();
    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.report.tiles[0].status, TileStatus::Error);
}

#[test]
fn test_resume_skips_ok_tiles() {
    let dir = TempDir::new().unwrap();
    let runner = fake_runner(dir.path());
    let mut input = build_input(&dir, &["+47+008"], fast_options());
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), None);

    let first = run_build(&input).unwrap();
    assert_eq!(first.exit_code, 0);

    input.options.resume = ResumeMode::Resume;
    let second = run_build(&input).unwrap();
    assert_eq!(second.exit_code, 0);
    let entry = &second.report.tiles[0];
    assert_eq!(entry.metrics.get("resumed"), Some(&serde_json::json!(true)));
}

#[test]
fn test_idempotent_resume_reports_match() {
    let dir = TempDir::new().unwrap();
    let runner = fake_runner(dir.path());
    let mut input = build_input(&dir, &["+47+008"], fast_options());
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), None);

    run_build(&input).unwrap();
    input.options.resume = ResumeMode::Resume;
    let second = run_build(&input).unwrap();
    let report_after_second = std::fs::read_to_string(dir.path().join("out/build_report.json")).unwrap();
    let third = run_build(&input).unwrap();
    let report_after_third = std::fs::read_to_string(dir.path().join("out/build_report.json")).unwrap();
    // Deterministic mode plus resume: repeat runs settle to a fixed point.
    assert_eq!(report_after_second, report_after_third);
    assert_eq!(second.exit_code, third.exit_code);
}

#[test]
fn test_parallel_results_match_serial() {
    let tiles = ["+47+007", "+47+008", "+47+009"];
    let mut reports = Vec::new();
    for workers in [1usize, 3] {
        let dir = TempDir::new().unwrap();
        let runner = fake_runner(dir.path());
        let mut options = fast_options();
        options.workers = workers;
        let mut input = build_input(&dir, &tiles, options);
        input.options.backend_root = Some(dir.path().join("ortho"));
        std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
        input.tools = tools_with(Some(runner), None);
        let outcome = run_build(&input).unwrap();
        let summary: Vec<(String, TileStatus)> = outcome
            .report
            .tiles
            .iter()
            .map(|entry| (entry.tile.clone(), entry.status))
            .collect();
        reports.push((outcome.exit_code, summary));
    }
    assert_eq!(reports[0], reports[1]);
}

#[test]
fn test_dry_run_writes_plan_only() {
    let dir = TempDir::new().unwrap();
    let mut options = fast_options();
    options.dry_run = true;
    let input = build_input(&dir, &["+47+008"], options);
    let outcome = run_build(&input).unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.report.tiles[0].status, TileStatus::Skipped);
    assert!(dir.path().join("out/build_plan.json").exists());
    assert!(!dir.path().join("out/normalized").exists());
}

#[test]
fn test_cancellation_reports_exit_10() {
    let dir = TempDir::new().unwrap();
    let input = build_input(&dir, &["+47+008", "+47+009"], fast_options());
    input.cancel.cancel();
    let outcome = run_build(&input).unwrap();
    assert_eq!(outcome.exit_code, 10);
    assert!(outcome.cancelled);
    for entry in &outcome.report.tiles {
        assert_eq!(entry.status, TileStatus::Skipped);
    }
}

#[test]
fn test_runner_failure_isolated_per_tile() {
    let dir = TempDir::new().unwrap();
    // Fails for +47+009 only.
    let runner = write_script(
        &dir.path().join("partial.sh"),
        r#"tile=""
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --tile) tile=$2; shift 2;;
    --output) out=$2; shift 2;;
    *) shift;;
  esac
done
if [ "$tile" = "+47+009" ]; then
  echo "unrecoverable crash" >&2
  exit 9
fi
mkdir -p "$out/Earth nav data/+40+000"
printf 'DSF' > "$out/Earth nav data/+40+000/$tile.dsf"
exit 0
"#,
    );
    let mut input = build_input(&dir, &["+47+008", "+47+009"], fast_options());
    input.options.backend_root = Some(dir.path().join("ortho"));
    std::fs::create_dir_all(dir.path().join("ortho")).unwrap();
    input.tools = tools_with(Some(runner), None);

    let outcome = run_build(&input).unwrap();
    // One tile failed, one succeeded: partial failure exit code.
    assert_eq!(outcome.exit_code, 2);
    let ok = outcome.report.tile("+47+008").unwrap();
    let failed = outcome.report.tile("+47+009").unwrap();
    assert_eq!(ok.status, TileStatus::Ok);
    assert_eq!(failed.status, TileStatus::Error);
}

#[test]
fn test_invalid_input_fails_before_tiles() {
    let dir = TempDir::new().unwrap();
    let mut options = fast_options();
    options.coverage_hard_fail = true; // requires coverage_min
    let input = build_input(&dir, &["+47+008"], options);
    assert!(run_build(&input).is_err());
}
