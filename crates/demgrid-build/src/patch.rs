//! Patch rebuilds: apply localized DEM edits to selected tiles and rerun
//! only those tiles against the existing build.

use crate::options::{BuildOptions, ResumeMode};
use crate::report::write_json_atomic;
use crate::scheduler::{run_build, BuildInput, BuildOutcome};
use crate::{BuildError, Result};
use demgrid_dem::{
    apply_aoi_mask, clip_tile, is_nodata, load_aoi, read_geotiff, write_geotiff, warp_to_crs,
    Resampling, Sampler, TiffCompression,
};
use demgrid_tiles::Tile;
use demgrid_tools::{CancelToken, ToolPaths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// One patch entry: a tile plus the DEM override to blend in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Tile to patch.
    pub tile: String,
    /// Patch DEM path.
    #[serde(alias = "path")]
    pub dem: PathBuf,
    /// Optional AOI restricting where the patch applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aoi: Option<PathBuf>,
    /// Patch nodata override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
}

/// A patch plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchPlan {
    /// Document schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Patch entries.
    pub patches: Vec<PatchEntry>,
}

fn default_schema_version() -> String {
    "1".to_string()
}

/// Parse and validate a patch plan from JSON.
pub fn load_patch_plan(path: &Path) -> Result<PatchPlan> {
    let text = std::fs::read_to_string(path)?;
    let plan: PatchPlan = serde_json::from_str(&text)?;
    if plan.patches.is_empty() {
        return Err(BuildError::InvalidInput(
            "patch plan requires a non-empty patches list".into(),
        ));
    }
    for entry in &plan.patches {
        entry
            .tile
            .parse::<Tile>()
            .map_err(|err| BuildError::InvalidInput(format!("patch entry: {err}")))?;
    }
    Ok(plan)
}

/// Report written next to a patched build tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchReport {
    /// Patch plan schema version.
    pub schema_version: String,
    /// The build the patch was applied on top of.
    pub base_build_dir: String,
    /// The patch plan file.
    pub patch_plan: String,
    /// Affected tiles.
    pub tiles: Vec<String>,
    /// Patched normalized artifacts, keyed by tile.
    pub patched_tile_paths: BTreeMap<String, String>,
    /// The patched build tree.
    pub output_dir: String,
}

/// Blend a patch tile over a base tile: patch wins wherever it has data.
fn overlay_patch(
    base_path: &Path,
    patch_path: &Path,
    output_path: &Path,
    compression: TiffCompression,
) -> Result<PathBuf> {
    let mut base = read_geotiff(base_path)?;
    let patch = read_geotiff(patch_path)?;
    if base.data().len() != patch.data().len() {
        return Err(BuildError::InvalidInput(format!(
            "patch grid shape does not match base tile: {} vs {}",
            patch.data().len(),
            base.data().len()
        )));
    }
    let patch_nodata = patch.nodata().or(base.nodata());
    for index in 0..base.data().len() {
        let value = patch.data()[index];
        if is_nodata(value, patch_nodata) {
            continue;
        }
        if patch_nodata.is_none() && value.is_nan() {
            continue;
        }
        base.data_mut()[index] = value;
    }
    write_geotiff(output_path, &base, compression)?;
    Ok(output_path.to_path_buf())
}

/// Prepare one patch tile on the base tile's grid.
fn prepare_patch_tile(
    entry: &PatchEntry,
    base_tile_path: &Path,
    work_dir: &Path,
    resampling: Resampling,
) -> Result<PathBuf> {
    let tile: Tile = entry.tile.parse()?;
    let base = read_geotiff(base_tile_path)?;
    let patch_nodata = entry.nodata.or(base.nodata());
    let source = read_geotiff(&entry.dem)?;
    let warped = if source.crs().same_as(base.crs()) {
        source
    } else {
        warp_to_crs(&source, base.crs(), None, resampling, patch_nodata)?
    };
    let mut patch_tile = clip_tile(
        &warped,
        tile,
        Some(base.resolution()),
        resampling,
        patch_nodata,
    )?;
    if let Some(aoi_path) = &entry.aoi {
        let nodata = patch_nodata.ok_or_else(|| {
            BuildError::InvalidInput(format!(
                "patch for {} has an AOI mask but no resolvable nodata value",
                entry.tile
            ))
        })?;
        let aoi = load_aoi(aoi_path, None).map_err(BuildError::Dem)?;
        apply_aoi_mask(&mut patch_tile, &aoi, nodata)?;
    }
    let path = work_dir
        .join("patch_tiles")
        .join(&entry.tile)
        .join(format!("{}.tif", entry.tile));
    write_geotiff(&path, &patch_tile, TiffCompression::None)?;
    Ok(path)
}

/// Apply a patch plan and rebuild only the affected tiles.
///
/// The patched tree is written into `output_dir` (default:
/// `<build_dir>/patches/<plan-stem>`); the base build is left untouched.
pub fn run_patch(
    build_dir: &Path,
    patch_plan_path: &Path,
    output_dir: Option<&Path>,
    tools: ToolPaths,
    cancel: CancelToken,
) -> Result<(PatchReport, BuildOutcome)> {
    let base_plan_path = build_dir.join("build_plan.json");
    let base_plan: crate::report::BuildPlan = serde_json::from_str(
        &std::fs::read_to_string(&base_plan_path).map_err(|_| {
            BuildError::InvalidInput(format!("missing build_plan.json in {}", build_dir.display()))
        })?,
    )?;
    let mut options: BuildOptions = serde_json::from_value(base_plan.options.clone())?;
    let plan = load_patch_plan(patch_plan_path)?;
    let plan_stem = patch_plan_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "patch".to_string());
    let output_dir = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| build_dir.join("patches").join(&plan_stem));
    let work_dir = output_dir.join("patch_work");
    let resampling: Resampling = options.resampling.parse().map_err(BuildError::Dem)?;
    let compression: TiffCompression = options.compression.parse().map_err(BuildError::Dem)?;

    let mut tiles = Vec::new();
    let mut patched: BTreeMap<String, PathBuf> = BTreeMap::new();
    for entry in &plan.patches {
        let tile: Tile = entry.tile.parse()?;
        tiles.push(tile);
        let base_tile_path = build_dir
            .join("normalized")
            .join("tiles")
            .join(&entry.tile)
            .join(format!("{}.tif", entry.tile));
        if !base_tile_path.exists() {
            return Err(BuildError::InvalidInput(format!(
                "base tile DEM not found for {}: {}",
                entry.tile,
                base_tile_path.display()
            )));
        }
        // The patch DEM acts as the highest-priority layer over the
        // existing normalized artifact.
        let patch_tile = prepare_patch_tile(entry, &base_tile_path, &work_dir, resampling)?;
        let patched_path = output_dir
            .join("normalized")
            .join("tiles")
            .join(&entry.tile)
            .join(format!("{}.tif", entry.tile));
        overlay_patch(&base_tile_path, &patch_tile, &patched_path, compression)?;
        patched.insert(entry.tile.clone(), patched_path);
    }
    info!(tiles = tiles.len(), "patched tiles prepared");

    options.normalize = false;
    options.resume = ResumeMode::Off;
    options.dry_run = false;
    options.tile_dem_paths = patched.clone();

    let dem_paths: Vec<PathBuf> = base_plan.inputs.dems.iter().map(PathBuf::from).collect();
    let input = BuildInput {
        tiles,
        dem_paths,
        dem_stack: None,
        output_dir: output_dir.clone(),
        options,
        tools,
        cancel,
    };
    let outcome = run_build(&input)?;

    let report = PatchReport {
        schema_version: plan.schema_version.clone(),
        base_build_dir: build_dir.to_string_lossy().into_owned(),
        patch_plan: patch_plan_path.to_string_lossy().into_owned(),
        tiles: plan.patches.iter().map(|entry| entry.tile.clone()).collect(),
        patched_tile_paths: patched
            .iter()
            .map(|(tile, path)| (tile.clone(), path.to_string_lossy().into_owned()))
            .collect(),
        output_dir: output_dir.to_string_lossy().into_owned(),
    };
    write_json_atomic(&output_dir.join("patch_report.json"), &report)?;
    Ok((report, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use demgrid_dem::RasterGrid;
    use demgrid_tiles::CrsDef;
    use tempfile::TempDir;

    fn wgs84() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    #[test]
    fn test_load_patch_plan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(
            &path,
            r#"{"schema_version": "1", "patches": [{"tile": "+47+008", "dem": "fix.tif", "nodata": -32768}]}"#,
        )
        .unwrap();
        let plan = load_patch_plan(&path).unwrap();
        assert_eq!(plan.patches.len(), 1);
        assert_eq!(plan.patches[0].nodata, Some(-32768.0));
    }

    #[test]
    fn test_invalid_tile_in_plan_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"patches": [{"tile": "47+008", "dem": "x.tif"}]}"#).unwrap();
        assert!(load_patch_plan(&path).is_err());
    }

    #[test]
    fn test_overlay_patch_wins_where_valid() {
        let dir = TempDir::new().unwrap();
        let base = RasterGrid::from_data(
            4,
            4,
            (8.0, 47.0, 9.0, 48.0),
            wgs84(),
            Some(-9999.0),
            vec![100.0; 16],
        )
        .unwrap();
        let mut patch_data = vec![-9999.0f32; 16];
        patch_data[5] = 250.0;
        let patch = RasterGrid::from_data(
            4,
            4,
            (8.0, 47.0, 9.0, 48.0),
            wgs84(),
            Some(-9999.0),
            patch_data,
        )
        .unwrap();
        let base_path = dir.path().join("base.tif");
        let patch_path = dir.path().join("patch.tif");
        write_geotiff(&base_path, &base, TiffCompression::None).unwrap();
        write_geotiff(&patch_path, &patch, TiffCompression::None).unwrap();

        let out = dir.path().join("patched.tif");
        overlay_patch(&base_path, &patch_path, &out, TiffCompression::None).unwrap();
        let merged = read_geotiff(&out).unwrap();
        assert_eq!(merged.get(1, 1), 250.0);
        assert_eq!(merged.get(0, 0), 100.0);
    }
}
