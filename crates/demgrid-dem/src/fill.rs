//! Fill strategies for nodata voids in tile grids.
//!
//! Every strategy works through the central nodata mask helper, so NaN
//! sentinels behave exactly like value sentinels. The contract: after any
//! strategy other than `none`, no masked cells remain unless the strategy
//! itself reports leftovers (interpolation with voids larger than its
//! search reach, or a fallback that also has gaps there).

use crate::grid::{RasterGrid, Resampling, Sampler};
use crate::mask::is_nodata;
use crate::{DemError, Result};
use std::str::FromStr;

/// Upper bound on dilation passes for interpolation fill.
const MAX_DILATION_PASSES: usize = 128;

/// Which fill strategy to apply to masked cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillStrategy {
    /// Leave voids alone; coverage warnings are still emitted downstream.
    #[default]
    None,
    /// Overwrite voids with a constant.
    Constant,
    /// Nearest-valid iterative dilation.
    Interpolate,
    /// Sample a fallback DEM at masked positions.
    Fallback,
}

impl FillStrategy {
    /// Canonical lowercase name recorded in build plans.
    pub fn name(&self) -> &'static str {
        match self {
            FillStrategy::None => "none",
            FillStrategy::Constant => "constant",
            FillStrategy::Interpolate => "interpolate",
            FillStrategy::Fallback => "fallback",
        }
    }
}

impl FromStr for FillStrategy {
    type Err = DemError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(FillStrategy::None),
            "constant" => Ok(FillStrategy::Constant),
            "interpolate" => Ok(FillStrategy::Interpolate),
            "fallback" => Ok(FillStrategy::Fallback),
            other => Err(DemError::UnknownName {
                kind: "fill strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of a fill pass over one grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResult {
    /// Cells repaired by the strategy.
    pub filled_pixels: usize,
    /// Cells still masked afterwards.
    pub nodata_pixels_after: usize,
}

fn masked_cells(grid: &RasterGrid) -> Vec<usize> {
    let nodata = grid.nodata();
    grid.data()
        .iter()
        .enumerate()
        .filter(|(_, &v)| is_nodata(v, nodata))
        .map(|(i, _)| i)
        .collect()
}

/// Set every masked cell to a constant value.
pub fn fill_constant(grid: &mut RasterGrid, value: f64) -> FillResult {
    let masked = masked_cells(grid);
    let fill = value as f32;
    for &index in &masked {
        grid.data_mut()[index] = fill;
    }
    let after = masked_cells(grid).len();
    FillResult {
        filled_pixels: masked.len() - after,
        nodata_pixels_after: after,
    }
}

/// Fill voids by iterative dilation from valid neighbours.
///
/// Each pass assigns every still-masked cell the mean of its valid
/// 8-neighbours; passes repeat until the grid is stable or the pass limit
/// is hit, so small voids close quickly while oceanic holes are left for a
/// fallback strategy.
pub fn fill_interpolate(grid: &mut RasterGrid) -> FillResult {
    let nodata = grid.nodata();
    let width = grid.width() as i64;
    let height = grid.height() as i64;
    let mut remaining = masked_cells(grid);
    let before = remaining.len();
    let mut passes = 0;
    while !remaining.is_empty() && passes < MAX_DILATION_PASSES {
        passes += 1;
        let snapshot = grid.data().to_vec();
        let mut still_masked = Vec::new();
        for &index in &remaining {
            let row = index as i64 / width;
            let col = index as i64 % width;
            let mut acc = 0.0f64;
            let mut count = 0usize;
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nc = col + dx;
                    let nr = row + dy;
                    if nc < 0 || nr < 0 || nc >= width || nr >= height {
                        continue;
                    }
                    let value = snapshot[(nr * width + nc) as usize];
                    if !is_nodata(value, nodata) {
                        acc += value as f64;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                grid.data_mut()[index] = (acc / count as f64) as f32;
            } else {
                still_masked.push(index);
            }
        }
        if still_masked.len() == remaining.len() {
            break;
        }
        remaining = still_masked;
    }
    FillResult {
        filled_pixels: before - remaining.len(),
        nodata_pixels_after: remaining.len(),
    }
}

/// Fill voids by sampling a fallback DEM at the masked positions.
///
/// The fallback is sampled in the grid's own CRS at each masked pixel
/// center, so it can be any resolution and coverage; positions the
/// fallback also misses stay masked.
pub fn fill_fallback(grid: &mut RasterGrid, fallback: &dyn Sampler) -> Result<FillResult> {
    if !fallback.crs().same_as(grid.crs()) {
        return Err(DemError::Normalization(format!(
            "fallback CRS {} does not match tile CRS {}",
            fallback.crs().authority,
            grid.crs().authority
        )));
    }
    let masked = masked_cells(grid);
    let before = masked.len();
    let width = grid.width();
    let mut remaining = 0usize;
    for &index in &masked {
        let col = index % width;
        let row = index / width;
        let (x, y) = grid.pixel_center(col, row);
        match fallback.sample_point(x, y, Resampling::Bilinear) {
            Some(value) => grid.data_mut()[index] = value,
            None => remaining += 1,
        }
    }
    Ok(FillResult {
        filled_pixels: before - remaining,
        nodata_pixels_after: remaining,
    })
}
