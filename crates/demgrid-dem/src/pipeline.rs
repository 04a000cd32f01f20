//! Per-tile normalization: warp sources once, then clip/blend/fill each
//! tile into a canonical artifact.
//!
//! A [`Normalizer`] is built once per run from either a flat list of DEM
//! paths or a prioritized [`DemStack`]; workers then call
//! [`Normalizer::normalize_tile`] concurrently (the prepared sources are
//! immutable, so sharing through an `Arc` is safe).

use crate::aoi::{apply_aoi_mask, load_aoi, Aoi};
use crate::cache::{
    fingerprint_paths, nodata_policy_string, CacheKeyInputs, SourceFingerprint, CACHE_VERSION,
};
use crate::coverage::{coverage_of, CoverageMetrics};
use crate::fill::{fill_constant, fill_fallback, fill_interpolate, FillStrategy};
use crate::geotiff::{read_geotiff, write_geotiff, TiffCompression};
use crate::grid::{RasterGrid, Resampling, Sampler};
use crate::mask::is_nodata;
use crate::mosaic::{MosaicStrategy, VirtualMosaic};
use crate::profile::{apply_backend_profile, BackendProfile};
use crate::stack::DemStack;
use crate::tiling::{clip_tile, TileResult};
use crate::warp::warp_to_crs;
use crate::{DemError, Result};
use demgrid_tiles::{validate_target_crs, CrsDef, Tile};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Options controlling a normalization pass.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Target CRS authority string; must be geographic.
    pub target_crs: String,
    /// Resampling kernel.
    pub resampling: Resampling,
    /// Destination nodata sentinel request.
    pub dst_nodata: Option<f64>,
    /// Target resolution in degrees per pixel, or source-derived.
    pub resolution: Option<(f64, f64)>,
    /// Fill strategy for voids.
    pub fill_strategy: FillStrategy,
    /// Constant used by the constant fill strategy.
    pub fill_value: f64,
    /// Fallback DEMs for the fallback fill strategy.
    pub fallback_dem_paths: Vec<PathBuf>,
    /// Backend profile constraints, if any.
    pub backend_profile: Option<BackendProfile>,
    /// Multi-source merge strategy.
    pub mosaic_strategy: MosaicStrategy,
    /// Artifact compression.
    pub compression: TiffCompression,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions {
            target_crs: "EPSG:4326".to_string(),
            resampling: Resampling::Bilinear,
            dst_nodata: None,
            resolution: None,
            fill_strategy: FillStrategy::None,
            fill_value: 0.0,
            fallback_dem_paths: Vec::new(),
            backend_profile: None,
            mosaic_strategy: MosaicStrategy::Full,
            compression: TiffCompression::None,
        }
    }
}

struct PreparedLayer {
    grid: RasterGrid,
    nodata: Option<f64>,
    aoi: Option<Aoi>,
}

enum PreparedSources {
    /// Flat multi-DEM input, merged by mosaic strategy.
    Mosaic(MosaicKind),
    /// Prioritized stack, blended per tile.
    Stack(Vec<PreparedLayer>),
}

enum MosaicKind {
    Full(RasterGrid),
    Virtual(VirtualMosaic),
    PerTile(VirtualMosaic),
}

/// Prepared normalization state shared across tile workers.
pub struct Normalizer {
    sources: PreparedSources,
    fallback: Option<VirtualMosaic>,
    target: CrsDef,
    effective_nodata: Option<f64>,
    opts: NormalizeOptions,
    key_inputs: KeyInputsTemplate,
}

struct KeyInputsTemplate {
    sources: Vec<SourceFingerprint>,
    fallback_sources: Vec<SourceFingerprint>,
    aoi_sources: Vec<SourceFingerprint>,
    stack: Option<serde_json::Value>,
}

fn load_and_warp(
    path: &Path,
    target: &CrsDef,
    opts: &NormalizeOptions,
    dst_nodata: Option<f64>,
) -> Result<RasterGrid> {
    let grid = read_geotiff(path)?;
    if grid.crs().same_as(target) {
        // Keep the declared sentinel; remapping happens at tile level.
        return Ok(grid);
    }
    debug!(
        path = %path.display(),
        from = %grid.crs().authority,
        to = %target.authority,
        "warping source to target CRS"
    );
    warp_to_crs(&grid, target, opts.resolution, opts.resampling, dst_nodata)
}

fn resolve_effective_nodata(
    opts: &NormalizeOptions,
    target: &CrsDef,
    stack: Option<&DemStack>,
) -> Result<Option<f64>> {
    let mut effective = opts.dst_nodata;
    if let Some(profile) = &opts.backend_profile {
        if profile.crs != target.authority {
            return Err(DemError::InvalidInput(format!(
                "target CRS {} must match backend profile CRS {}",
                target.authority, profile.crs
            )));
        }
        if profile.nodata.is_some() {
            effective = profile.nodata;
        }
    }
    if effective.is_none() {
        if let Some(stack) = stack {
            effective = stack.layers.iter().find_map(|layer| layer.nodata);
        }
    }
    Ok(effective)
}

impl Normalizer {
    /// Prepare a normalizer from a flat list of DEM paths.
    pub fn from_paths(dem_paths: &[PathBuf], opts: NormalizeOptions) -> Result<Self> {
        if dem_paths.is_empty() {
            return Err(DemError::InvalidInput(
                "at least one DEM path is required".into(),
            ));
        }
        let target = validate_target_crs(&opts.target_crs)?;
        let effective_nodata = resolve_effective_nodata(&opts, &target, None)?;
        let grids = dem_paths
            .iter()
            .map(|path| load_and_warp(path, &target, &opts, effective_nodata))
            .collect::<Result<Vec<_>>>()?;
        let mosaic = VirtualMosaic::new(grids)?;
        let kind = match opts.mosaic_strategy {
            MosaicStrategy::Full if mosaic.source_count() > 1 => {
                MosaicKind::Full(mosaic.materialize(opts.resampling, effective_nodata)?)
            }
            MosaicStrategy::Full => MosaicKind::Virtual(mosaic),
            MosaicStrategy::Virtual => MosaicKind::Virtual(mosaic),
            MosaicStrategy::PerTile => MosaicKind::PerTile(mosaic),
        };
        let fallback = Self::prepare_fallback(&opts, &target, effective_nodata)?;
        let key_inputs = KeyInputsTemplate {
            sources: fingerprint_paths(dem_paths, false)?,
            fallback_sources: fingerprint_paths(&opts.fallback_dem_paths, false)?,
            aoi_sources: Vec::new(),
            stack: None,
        };
        Ok(Normalizer {
            sources: PreparedSources::Mosaic(kind),
            fallback,
            target,
            effective_nodata,
            opts,
            key_inputs,
        })
    }

    /// Prepare a normalizer from a prioritized DEM stack.
    pub fn from_stack(stack: &DemStack, opts: NormalizeOptions) -> Result<Self> {
        let target = validate_target_crs(&opts.target_crs)?;
        let effective_nodata = resolve_effective_nodata(&opts, &target, Some(stack))?;
        stack.validate(effective_nodata)?;
        let mut layers = Vec::new();
        let mut aoi_paths = Vec::new();
        for layer in stack.sorted_layers() {
            let layer_nodata = layer.nodata.or(effective_nodata);
            let grid = load_and_warp(&layer.path, &target, &opts, layer_nodata)?;
            let aoi = match &layer.aoi {
                Some(path) => {
                    aoi_paths.push(path.clone());
                    let aoi = load_aoi(path, None)?;
                    for warning in &aoi.warnings {
                        warn!(layer = %layer.path.display(), "{warning}");
                    }
                    Some(aoi)
                }
                None => None,
            };
            layers.push(PreparedLayer {
                nodata: layer_nodata.or(grid.nodata()),
                grid,
                aoi,
            });
        }
        let fallback = Self::prepare_fallback(&opts, &target, effective_nodata)?;
        let dem_paths: Vec<PathBuf> = stack.layers.iter().map(|l| l.path.clone()).collect();
        let key_inputs = KeyInputsTemplate {
            sources: fingerprint_paths(&dem_paths, false)?,
            fallback_sources: fingerprint_paths(&opts.fallback_dem_paths, false)?,
            aoi_sources: fingerprint_paths(&aoi_paths, false)?,
            stack: Some(serde_json::to_value(stack)?),
        };
        Ok(Normalizer {
            sources: PreparedSources::Stack(layers),
            fallback,
            target,
            effective_nodata,
            opts,
            key_inputs,
        })
    }

    fn prepare_fallback(
        opts: &NormalizeOptions,
        target: &CrsDef,
        effective_nodata: Option<f64>,
    ) -> Result<Option<VirtualMosaic>> {
        if opts.fill_strategy != FillStrategy::Fallback && opts.fallback_dem_paths.is_empty() {
            return Ok(None);
        }
        if opts.fill_strategy == FillStrategy::Fallback && opts.fallback_dem_paths.is_empty() {
            return Err(DemError::InvalidInput(
                "fallback fill requires fallback DEMs".into(),
            ));
        }
        let grids = opts
            .fallback_dem_paths
            .iter()
            .map(|path| load_and_warp(path, target, opts, effective_nodata))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(VirtualMosaic::new(grids)?))
    }

    /// Effective nodata policy after profile resolution.
    pub fn effective_nodata(&self) -> Option<f64> {
        self.effective_nodata
    }

    /// Cache key inputs for one tile of this normalization pass.
    pub fn cache_key_inputs(&self, tile: Tile) -> CacheKeyInputs {
        CacheKeyInputs {
            version: CACHE_VERSION,
            sources: self.key_inputs.sources.clone(),
            fallback_sources: self.key_inputs.fallback_sources.clone(),
            aoi_sources: self.key_inputs.aoi_sources.clone(),
            target_crs: self.target.authority.clone(),
            resolution: self.opts.resolution,
            resampling: self.opts.resampling.name().to_string(),
            nodata_policy: nodata_policy_string(self.effective_nodata),
            fill_strategy: self.opts.fill_strategy.name().to_string(),
            fill_value: self.opts.fill_value,
            mosaic_strategy: self.opts.mosaic_strategy.name().to_string(),
            compression: self.opts.compression.name().to_string(),
            stack: self.key_inputs.stack.clone(),
            tile: tile.to_string(),
        }
    }

    fn clip_sources(&self, tile: Tile) -> Result<RasterGrid> {
        match &self.sources {
            PreparedSources::Mosaic(MosaicKind::Full(grid)) => clip_tile(
                grid,
                tile,
                self.opts.resolution,
                self.opts.resampling,
                self.effective_nodata,
            ),
            PreparedSources::Mosaic(MosaicKind::Virtual(mosaic)) => clip_tile(
                mosaic,
                tile,
                self.opts.resolution,
                self.opts.resampling,
                self.effective_nodata,
            ),
            PreparedSources::Mosaic(MosaicKind::PerTile(mosaic)) => {
                let restricted = mosaic.intersecting(tile.bounds());
                if restricted.source_count() == 0 {
                    // Nothing intersects; clip the empty union anyway so the
                    // caller gets an all-nodata tile with correct shape.
                    return clip_tile(
                        mosaic,
                        tile,
                        self.opts.resolution,
                        self.opts.resampling,
                        self.effective_nodata,
                    );
                }
                clip_tile(
                    &restricted,
                    tile,
                    self.opts.resolution,
                    self.opts.resampling,
                    self.effective_nodata,
                )
            }
            PreparedSources::Stack(layers) => self.blend_stack(tile, layers),
        }
    }

    fn blend_stack(&self, tile: Tile, layers: &[PreparedLayer]) -> Result<RasterGrid> {
        let mut canvas: Option<RasterGrid> = None;
        for layer in layers {
            let mut layer_tile = clip_tile(
                &layer.grid,
                tile,
                self.opts.resolution,
                self.opts.resampling,
                layer.nodata,
            )?;
            if let Some(aoi) = &layer.aoi {
                // validate() guaranteed a sentinel exists for masked layers.
                let nodata = layer
                    .nodata
                    .ok_or_else(|| DemError::AoiWithoutNodata(PathBuf::new()))?;
                apply_aoi_mask(&mut layer_tile, aoi, nodata)?;
            }
            canvas = Some(match canvas {
                None => layer_tile,
                Some(mut base) => {
                    // Overlay where the higher-priority layer has data.
                    let layer_nodata = layer_tile.nodata();
                    for index in 0..base.data().len() {
                        let value = layer_tile.data()[index];
                        if is_nodata(value, layer_nodata) {
                            continue;
                        }
                        if layer_nodata.is_none() && value.is_nan() {
                            // NaN without a sentinel means no coverage.
                            continue;
                        }
                        base.data_mut()[index] = value;
                    }
                    base
                }
            });
        }
        let mut blended = canvas
            .ok_or_else(|| DemError::Normalization(format!("no stack layers for tile {tile}")))?;
        if self.effective_nodata.is_some() && blended.nodata() != self.effective_nodata {
            // Unify the header sentinel; cell values already use per-layer
            // sentinels that match it by construction.
            blended.set_nodata(self.effective_nodata);
        }
        Ok(blended)
    }

    fn apply_fill(&self, grid: &mut RasterGrid) -> Result<usize> {
        let filled = match self.opts.fill_strategy {
            FillStrategy::None => 0,
            FillStrategy::Constant => fill_constant(grid, self.opts.fill_value).filled_pixels,
            FillStrategy::Interpolate => {
                let result = fill_interpolate(grid);
                let mut filled = result.filled_pixels;
                if result.nodata_pixels_after > 0 {
                    if let Some(fallback) = &self.fallback {
                        // Large holes fall through to the fallback DEM.
                        filled += fill_fallback(grid, fallback)?.filled_pixels;
                    }
                }
                filled
            }
            FillStrategy::Fallback => {
                let fallback = self.fallback.as_ref().ok_or_else(|| {
                    DemError::InvalidInput("fallback fill requires fallback DEMs".into())
                })?;
                fill_fallback(grid, fallback)?.filled_pixels
            }
        };
        Ok(filled)
    }

    /// Normalize one tile and write its artifact.
    pub fn normalize_tile(
        &self,
        tile: Tile,
        output_path: &Path,
    ) -> Result<(TileResult, CoverageMetrics)> {
        let start = Instant::now();
        let mut grid = self.clip_sources(tile)?;
        let before = coverage_of(&grid);
        let filled = self.apply_fill(&mut grid)?;
        if let Some(profile) = &self.opts.backend_profile {
            apply_backend_profile(&mut grid, profile)?;
        }
        let after = coverage_of(&grid);
        write_geotiff(output_path, &grid, self.opts.compression)?;
        let metrics = CoverageMetrics {
            total_pixels: before.total_pixels,
            nodata_pixels_before: before.nodata_pixels,
            nodata_pixels_after: after.nodata_pixels,
            coverage_before: before.valid_ratio,
            coverage_after: after.valid_ratio,
            filled_pixels: filled,
            strategy: self.opts.fill_strategy.name().to_string(),
            normalize_seconds: start.elapsed().as_secs_f64(),
        };
        let result = TileResult {
            tile,
            path: output_path.to_path_buf(),
            bounds: tile.bounds(),
            resolution: grid.resolution(),
            nodata: grid.nodata(),
        };
        Ok((result, metrics))
    }
}
