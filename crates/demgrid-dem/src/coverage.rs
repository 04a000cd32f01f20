//! Coverage statistics for nodata analysis.

use crate::geotiff::read_geotiff;
use crate::grid::RasterGrid;
use crate::mask::count_nodata;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Coverage statistics for a single raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageStats {
    /// Fraction of valid (non-nodata) pixels, 1.0 when empty.
    pub valid_ratio: f64,
    /// Total pixel count.
    pub total_pixels: usize,
    /// Masked pixel count.
    pub nodata_pixels: usize,
}

/// Per-tile coverage metrics recorded across a normalization pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageMetrics {
    /// Total pixel count of the tile artifact.
    pub total_pixels: usize,
    /// Masked pixels before fill.
    pub nodata_pixels_before: usize,
    /// Masked pixels remaining after fill.
    pub nodata_pixels_after: usize,
    /// Valid ratio before fill.
    pub coverage_before: f64,
    /// Valid ratio after fill.
    pub coverage_after: f64,
    /// Pixels the fill strategy repaired.
    pub filled_pixels: usize,
    /// Fill strategy name.
    pub strategy: String,
    /// Wall-clock seconds spent normalizing the tile.
    #[serde(default)]
    pub normalize_seconds: f64,
}

/// Zero-I/O coverage from a grid already in memory.
pub fn coverage_of(grid: &RasterGrid) -> CoverageStats {
    let total = grid.width() * grid.height();
    let nodata = count_nodata(grid.data(), grid.nodata());
    CoverageStats {
        valid_ratio: if total == 0 {
            1.0
        } else {
            (total - nodata) as f64 / total as f64
        },
        total_pixels: total,
        nodata_pixels: nodata,
    }
}

/// Coverage of an artifact on disk, with an optional sentinel override.
pub fn coverage_of_file(path: &Path, nodata_override: Option<f64>) -> Result<CoverageStats> {
    let mut grid = read_geotiff(path)?;
    if let Some(nodata) = nodata_override {
        grid.set_nodata(Some(nodata));
    }
    Ok(coverage_of(&grid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use demgrid_tiles::CrsDef;

    #[test]
    fn test_coverage_of_grid() {
        let crs = CrsDef::from_authority("EPSG:4326").unwrap();
        let data = vec![1.0, -9999.0, 3.0, -9999.0];
        let grid =
            RasterGrid::from_data(2, 2, (0.0, 0.0, 2.0, 2.0), crs, Some(-9999.0), data).unwrap();
        let stats = coverage_of(&grid);
        assert_eq!(stats.total_pixels, 4);
        assert_eq!(stats.nodata_pixels, 2);
        assert!((stats.valid_ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_coverage_with_nan_nodata() {
        let crs = CrsDef::from_authority("EPSG:4326").unwrap();
        let data = vec![1.0, f32::NAN, 3.0, 4.0];
        let grid =
            RasterGrid::from_data(2, 2, (0.0, 0.0, 2.0, 2.0), crs, Some(f64::NAN), data).unwrap();
        let stats = coverage_of(&grid);
        assert_eq!(stats.nodata_pixels, 1);
        assert!((stats.valid_ratio - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_no_nodata_means_full_coverage() {
        let crs = CrsDef::from_authority("EPSG:4326").unwrap();
        let grid =
            RasterGrid::from_data(2, 2, (0.0, 0.0, 2.0, 2.0), crs, None, vec![f32::NAN; 4])
                .unwrap();
        assert_eq!(coverage_of(&grid).valid_ratio, 1.0);
    }
}
