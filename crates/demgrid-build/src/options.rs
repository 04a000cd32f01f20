//! Build options and up-front input validation.

use crate::provenance::PROVENANCE_LEVELS;
use crate::{BuildError, Result};
use demgrid_dem::{
    BackendProfile, FillStrategy, MosaicStrategy, NormalizeOptions, Resampling, TiffCompression,
};
use demgrid_tiles::{validate_target_crs, Tile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Resume behavior when a prior build report exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeMode {
    /// Ignore any prior report.
    #[default]
    Off,
    /// Skip tiles already reported `ok`.
    Resume,
    /// Re-validate previously built tiles without rebuilding.
    ValidateOnly,
}

/// Full option set for one build, serializable into the config lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Target CRS for normalized tiles.
    pub target_crs: String,
    /// Resampling kernel name.
    pub resampling: String,
    /// Destination nodata request.
    pub dst_nodata: Option<f64>,
    /// Target resolution in meters, converted per tile latitude.
    pub target_resolution_m: Option<f64>,
    /// Fill strategy name.
    pub fill_strategy: String,
    /// Constant fill value.
    pub fill_value: f64,
    /// Fallback DEMs for fallback fill.
    pub fallback_dems: Vec<PathBuf>,
    /// Mosaic strategy name.
    pub mosaic_strategy: String,
    /// Artifact compression name.
    pub compression: String,
    /// Density preset.
    pub density: String,
    /// Worker threads; 0 selects conservative auto-sizing.
    pub workers: usize,
    /// Record per-tile errors instead of failing the whole build.
    pub continue_on_error: bool,
    /// Minimum acceptable coverage before fill, 0..=1.
    pub coverage_min: Option<f64>,
    /// Treat coverage below the minimum as an error instead of a warning.
    pub coverage_hard_fail: bool,
    /// Validation mode name (`none`, `bounds`, `roundtrip`).
    pub validation: String,
    /// Worker threads for the validation pass; 0 follows `workers`.
    pub validation_workers: usize,
    /// Report bounds mismatches as warnings instead of errors.
    pub allow_bounds_warning: bool,
    /// Enrich DSFs with XP12 rasters from a reference scenery tree.
    pub enrich_xp12: bool,
    /// Missing reference tiles fail the tile instead of warning.
    pub xp12_strict: bool,
    /// Reference scenery root for enrichment.
    pub global_scenery: Option<PathBuf>,
    /// Backend root (holds `Elevation_data/` and the global config).
    pub backend_root: Option<PathBuf>,
    /// Per-attempt runner timeout in seconds.
    pub runner_timeout_secs: Option<u64>,
    /// Runner no-output watchdog in seconds.
    pub runner_idle_timeout_secs: Option<u64>,
    /// Keep patched backend config after the run.
    pub persist_config: bool,
    /// Skip staging DEMs into the backend tree.
    pub skip_dem_stage: bool,
    /// Extra arguments appended to the runner command.
    pub extra_runner_args: Vec<String>,
    /// Resume behavior.
    pub resume: ResumeMode,
    /// Provenance level (`basic` or `strict`).
    pub provenance_level: String,
    /// Deterministic outputs: no timestamps in plan/report.
    pub stable_metadata: bool,
    /// Cache verification (`fingerprint` or `content-hash`).
    pub cache_verify: String,
    /// Plan only; skip normalization and backend execution.
    pub dry_run: bool,
    /// Normalize inputs; `false` means tile DEMs are already prepared.
    pub normalize: bool,
    /// Pre-normalized tile DEMs, keyed by tile name.
    pub tile_dem_paths: BTreeMap<String, PathBuf>,
    /// Repository source root exported to the runner's module path.
    pub source_root: Option<PathBuf>,
    /// Triangle warning threshold override.
    pub triangle_warn: Option<u64>,
    /// Triangle hard limit override.
    pub triangle_max: Option<u64>,
    /// Demote triangle overage to a warning.
    pub allow_triangle_overage: bool,
    /// Pinned tool versions file.
    pub pinned_versions_path: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            target_crs: "EPSG:4326".to_string(),
            resampling: "bilinear".to_string(),
            dst_nodata: None,
            target_resolution_m: None,
            fill_strategy: "none".to_string(),
            fill_value: 0.0,
            fallback_dems: Vec::new(),
            mosaic_strategy: "full".to_string(),
            compression: "none".to_string(),
            density: "medium".to_string(),
            workers: 0,
            continue_on_error: true,
            coverage_min: None,
            coverage_hard_fail: false,
            validation: "bounds".to_string(),
            validation_workers: 0,
            allow_bounds_warning: false,
            enrich_xp12: false,
            xp12_strict: false,
            global_scenery: None,
            backend_root: None,
            runner_timeout_secs: None,
            runner_idle_timeout_secs: None,
            persist_config: false,
            skip_dem_stage: false,
            extra_runner_args: Vec::new(),
            resume: ResumeMode::Off,
            provenance_level: "basic".to_string(),
            stable_metadata: false,
            cache_verify: "fingerprint".to_string(),
            dry_run: false,
            normalize: true,
            tile_dem_paths: BTreeMap::new(),
            source_root: None,
            triangle_warn: None,
            triangle_max: None,
            allow_triangle_overage: false,
            pinned_versions_path: None,
        }
    }
}

/// Mean meters-per-degree conversion for a tile set's latitudes.
fn resolution_degrees(resolution_m: f64, tiles: &[Tile]) -> (f64, f64) {
    const METERS_PER_DEG_LAT: f64 = 111_320.0;
    let mean_lat = if tiles.is_empty() {
        0.0
    } else {
        tiles
            .iter()
            .map(|tile| tile.lat() as f64 + 0.5)
            .sum::<f64>()
            / tiles.len() as f64
    };
    let mut meters_per_deg_lon = METERS_PER_DEG_LAT * mean_lat.to_radians().cos();
    if meters_per_deg_lon <= 0.0 {
        meters_per_deg_lon = METERS_PER_DEG_LAT;
    }
    (
        resolution_m / meters_per_deg_lon,
        resolution_m / METERS_PER_DEG_LAT,
    )
}

impl BuildOptions {
    /// Validate the options against the tile set and DEM inputs.
    ///
    /// Everything caught here is `InvalidInput`: it fails the build before
    /// any tile work starts.
    pub fn validate(&self, tiles: &[Tile], dem_paths: &[PathBuf]) -> Result<()> {
        if tiles.is_empty() {
            return Err(BuildError::InvalidInput("no tiles requested".into()));
        }
        validate_target_crs(&self.target_crs)?;
        self.resampling
            .parse::<Resampling>()
            .map_err(BuildError::Dem)?;
        self.fill_strategy
            .parse::<FillStrategy>()
            .map_err(BuildError::Dem)?;
        self.mosaic_strategy
            .parse::<MosaicStrategy>()
            .map_err(BuildError::Dem)?;
        self.compression
            .parse::<TiffCompression>()
            .map_err(BuildError::Dem)?;
        if !PROVENANCE_LEVELS.contains(&self.provenance_level.as_str()) {
            return Err(BuildError::InvalidInput(format!(
                "provenance_level must be one of {PROVENANCE_LEVELS:?}"
            )));
        }
        if !["none", "bounds", "roundtrip"].contains(&self.validation.as_str()) {
            return Err(BuildError::InvalidInput(format!(
                "unknown validation mode: {}",
                self.validation
            )));
        }
        if !["fingerprint", "content-hash"].contains(&self.cache_verify.as_str()) {
            return Err(BuildError::InvalidInput(format!(
                "unknown cache verification mode: {}",
                self.cache_verify
            )));
        }
        if let Some(coverage) = self.coverage_min {
            if !(0.0..=1.0).contains(&coverage) {
                return Err(BuildError::InvalidInput(
                    "coverage_min must be between 0 and 1".into(),
                ));
            }
        } else if self.coverage_hard_fail {
            return Err(BuildError::InvalidInput(
                "coverage_hard_fail requires coverage_min".into(),
            ));
        }
        if let Some(resolution) = self.target_resolution_m {
            if resolution <= 0.0 {
                return Err(BuildError::InvalidInput(
                    "target resolution must be positive".into(),
                ));
            }
        }
        if !self.dry_run {
            for path in dem_paths {
                if !path.exists() {
                    return Err(BuildError::InvalidInput(format!(
                        "DEM not found: {}",
                        path.display()
                    )));
                }
            }
        }
        if !self.normalize {
            let complete = !self.tile_dem_paths.is_empty()
                && tiles
                    .iter()
                    .all(|tile| self.tile_dem_paths.contains_key(&tile.to_string()));
            if !complete {
                if dem_paths.len() != 1 {
                    return Err(BuildError::InvalidInput(
                        "skipping normalization requires exactly one DEM path or a complete per-tile DEM map"
                            .into(),
                    ));
                }
            }
        }
        if self.enrich_xp12 && self.global_scenery.is_none() {
            return Err(BuildError::InvalidInput(
                "XP12 enrichment requires a reference scenery root".into(),
            ));
        }
        Ok(())
    }

    /// Lower these options into DEM normalization options for a tile set.
    pub fn normalize_options(&self, tiles: &[Tile]) -> Result<NormalizeOptions> {
        Ok(NormalizeOptions {
            target_crs: self.target_crs.clone(),
            resampling: self.resampling.parse().map_err(BuildError::Dem)?,
            dst_nodata: self.dst_nodata,
            resolution: self
                .target_resolution_m
                .map(|meters| resolution_degrees(meters, tiles)),
            fill_strategy: self.fill_strategy.parse().map_err(BuildError::Dem)?,
            fill_value: self.fill_value,
            fallback_dem_paths: self.fallback_dems.clone(),
            backend_profile: Some(BackendProfile::ortho4xp()),
            mosaic_strategy: self.mosaic_strategy.parse().map_err(BuildError::Dem)?,
            compression: self.compression.parse().map_err(BuildError::Dem)?,
        })
    }

    /// Resolved worker count for the tile scheduler.
    ///
    /// Explicit counts are clamped to the tile count; `0` auto-sizes to
    /// the available cores, capped because tile work is I/O heavy.
    pub fn resolve_workers(&self, tile_count: usize) -> usize {
        const IO_CAP: usize = 8;
        if tile_count == 0 {
            return 1;
        }
        if self.workers > 0 {
            return self.workers.min(tile_count);
        }
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cores.min(IO_CAP).min(tile_count).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiles(names: &[&str]) -> Vec<Tile> {
        names.iter().map(|name| name.parse().unwrap()).collect()
    }

    #[test]
    fn test_default_options_validate() {
        let options = BuildOptions {
            dry_run: true,
            ..Default::default()
        };
        options
            .validate(&tiles(&["+47+008"]), &[PathBuf::from("missing.tif")])
            .unwrap();
    }

    #[test]
    fn test_missing_dem_rejected_outside_dry_run() {
        let options = BuildOptions::default();
        let err = options
            .validate(&tiles(&["+47+008"]), &[PathBuf::from("missing.tif")])
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidInput(_)));
    }

    #[test]
    fn test_projected_target_rejected() {
        let options = BuildOptions {
            target_crs: "EPSG:32632".to_string(),
            dry_run: true,
            ..Default::default()
        };
        assert!(options.validate(&tiles(&["+47+008"]), &[]).is_err());
    }

    #[test]
    fn test_coverage_guardrails() {
        let options = BuildOptions {
            coverage_min: Some(1.5),
            dry_run: true,
            ..Default::default()
        };
        assert!(options.validate(&tiles(&["+47+008"]), &[]).is_err());
        let options = BuildOptions {
            coverage_hard_fail: true,
            dry_run: true,
            ..Default::default()
        };
        assert!(options.validate(&tiles(&["+47+008"]), &[]).is_err());
    }

    #[test]
    fn test_normalize_false_requires_single_dem_or_tile_map() {
        let mut options = BuildOptions {
            normalize: false,
            dry_run: true,
            ..Default::default()
        };
        let two_dems = vec![PathBuf::from("a.tif"), PathBuf::from("b.tif")];
        assert!(options.validate(&tiles(&["+47+008"]), &two_dems).is_err());
        // A complete tile map makes multi-DEM acceptable: the tiles are
        // interpreted as already prepared.
        options
            .tile_dem_paths
            .insert("+47+008".to_string(), PathBuf::from("+47+008.tif"));
        options.validate(&tiles(&["+47+008"]), &two_dems).unwrap();
    }

    #[test]
    fn test_resolution_conversion_shrinks_longitude_at_altitude() {
        let (res_lon, res_lat) = resolution_degrees(30.0, &tiles(&["+60+010"]));
        assert!(res_lon > res_lat);
        let (eq_lon, eq_lat) = resolution_degrees(30.0, &tiles(&["+00+010"]));
        assert!((eq_lon - eq_lat).abs() / eq_lat < 0.01);
    }

    #[test]
    fn test_resolve_workers() {
        let auto = BuildOptions::default();
        assert!(auto.resolve_workers(100) >= 1);
        assert!(auto.resolve_workers(100) <= 8);
        assert_eq!(auto.resolve_workers(1), 1);
        let fixed = BuildOptions {
            workers: 4,
            ..Default::default()
        };
        assert_eq!(fixed.resolve_workers(2), 2);
        assert_eq!(fixed.resolve_workers(100), 4);
    }
}
