//! Mosaic strategies for multi-source DEM inputs.
//!
//! All sources feeding a mosaic share a CRS (the pipeline warps them
//! first). Overlaps resolve first-listed-wins, matching the merge order of
//! the inputs.

use crate::grid::{RasterGrid, Resampling, Sampler};
use crate::{DemError, Result};
use demgrid_tiles::{Bounds, CrsDef};
use std::str::FromStr;

/// How multiple DEM sources are merged before tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MosaicStrategy {
    /// Materialize one merged grid up front. Simple, memory-hungry.
    #[default]
    Full,
    /// Keep sources separate and merge lazily per sample.
    Virtual,
    /// Merge only the sources intersecting each tile, never the full union.
    PerTile,
}

impl MosaicStrategy {
    /// Canonical lowercase name recorded in build plans.
    pub fn name(&self) -> &'static str {
        match self {
            MosaicStrategy::Full => "full",
            MosaicStrategy::Virtual => "virtual",
            MosaicStrategy::PerTile => "per-tile",
        }
    }
}

impl FromStr for MosaicStrategy {
    type Err = DemError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "full" => Ok(MosaicStrategy::Full),
            "virtual" => Ok(MosaicStrategy::Virtual),
            "per-tile" => Ok(MosaicStrategy::PerTile),
            other => Err(DemError::UnknownName {
                kind: "mosaic strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Lazily merged view over a list of same-CRS sources.
///
/// Sampling asks each source in listed order and takes the first valid
/// answer, so earlier sources shadow later ones where they overlap.
#[derive(Debug, Clone)]
pub struct VirtualMosaic {
    sources: Vec<RasterGrid>,
    crs: CrsDef,
    nodata: Option<f64>,
    resolution: (f64, f64),
}

impl VirtualMosaic {
    /// Build a virtual mosaic from pre-warped sources.
    pub fn new(sources: Vec<RasterGrid>) -> Result<Self> {
        let first = sources
            .first()
            .ok_or_else(|| DemError::InvalidInput("at least one DEM source is required".into()))?;
        let crs = first.crs().clone();
        for source in &sources {
            if !source.crs().same_as(&crs) {
                return Err(DemError::Normalization(format!(
                    "mosaic sources disagree on CRS: {} vs {}",
                    crs.authority,
                    source.crs().authority
                )));
            }
        }
        // The finest source resolution drives default tiling resolution.
        let resolution = sources
            .iter()
            .map(|s| s.resolution())
            .fold((f64::INFINITY, f64::INFINITY), |acc, res| {
                (acc.0.min(res.0), acc.1.min(res.1))
            });
        let nodata = sources.iter().find_map(|s| s.nodata());
        Ok(VirtualMosaic {
            sources,
            crs,
            nodata,
            resolution,
        })
    }

    /// Union of all source bounds.
    pub fn bounds(&self) -> Bounds {
        self.sources
            .iter()
            .map(|s| s.bounds())
            .fold((f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY), |acc, b| {
                (acc.0.min(b.0), acc.1.min(b.1), acc.2.max(b.2), acc.3.max(b.3))
            })
    }

    /// Restrict to the sources intersecting the given bounds.
    ///
    /// This is the per-tile merge: sources that cannot contribute to a tile
    /// never get sampled.
    pub fn intersecting(&self, bounds: Bounds) -> VirtualMosaic {
        let sources: Vec<RasterGrid> = self
            .sources
            .iter()
            .filter(|s| {
                let b = s.bounds();
                b.0 < bounds.2 && b.2 > bounds.0 && b.1 < bounds.3 && b.3 > bounds.1
            })
            .cloned()
            .collect();
        VirtualMosaic {
            sources,
            crs: self.crs.clone(),
            nodata: self.nodata,
            resolution: self.resolution,
        }
    }

    /// Number of sources in the mosaic.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Materialize the mosaic into one grid covering the union bounds.
    pub fn materialize(&self, kernel: Resampling, dst_nodata: Option<f64>) -> Result<RasterGrid> {
        let bounds = self.bounds();
        let (res_x, res_y) = self.resolution;
        let width = (((bounds.2 - bounds.0) / res_x).ceil() as usize).max(1);
        let height = (((bounds.3 - bounds.1) / res_y).ceil() as usize).max(1);
        crate::warp::warp_into(self, &self.crs, bounds, width, height, kernel, dst_nodata)
    }
}

impl Sampler for VirtualMosaic {
    fn crs(&self) -> &CrsDef {
        &self.crs
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn resolution(&self) -> (f64, f64) {
        self.resolution
    }

    fn sample_point(&self, x: f64, y: f64, kernel: Resampling) -> Option<f32> {
        self.sources
            .iter()
            .find_map(|source| source.sample_point(x, y, kernel))
    }

    fn sample_average(&self, x: f64, y: f64, half_x: f64, half_y: f64) -> Option<f32> {
        self.sources
            .iter()
            .find_map(|source| source.sample_average(x, y, half_x, half_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgs84() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    fn constant_grid(bounds: Bounds, value: f32) -> RasterGrid {
        RasterGrid::from_data(10, 10, bounds, wgs84(), Some(-9999.0), vec![value; 100]).unwrap()
    }

    #[test]
    fn test_first_listed_wins_on_overlap() {
        let mosaic = VirtualMosaic::new(vec![
            constant_grid((0.0, 0.0, 2.0, 2.0), 100.0),
            constant_grid((1.0, 0.0, 3.0, 2.0), 200.0),
        ])
        .unwrap();
        // Overlap zone takes the first source.
        assert_eq!(mosaic.sample_point(1.5, 1.0, Resampling::Nearest), Some(100.0));
        // Non-overlapping area falls through to the second.
        assert_eq!(mosaic.sample_point(2.5, 1.0, Resampling::Nearest), Some(200.0));
        assert_eq!(mosaic.bounds(), (0.0, 0.0, 3.0, 2.0));
    }

    #[test]
    fn test_nodata_gap_falls_through() {
        let mut top = constant_grid((0.0, 0.0, 2.0, 2.0), 100.0);
        for v in top.data_mut() {
            *v = -9999.0;
        }
        let mosaic = VirtualMosaic::new(vec![top, constant_grid((0.0, 0.0, 2.0, 2.0), 200.0)]).unwrap();
        assert_eq!(mosaic.sample_point(1.0, 1.0, Resampling::Nearest), Some(200.0));
    }

    #[test]
    fn test_intersecting_filters_sources() {
        let mosaic = VirtualMosaic::new(vec![
            constant_grid((0.0, 0.0, 1.0, 1.0), 1.0),
            constant_grid((5.0, 5.0, 6.0, 6.0), 2.0),
        ])
        .unwrap();
        let restricted = mosaic.intersecting((0.25, 0.25, 0.75, 0.75));
        assert_eq!(restricted.source_count(), 1);
    }

    #[test]
    fn test_materialize_merges() {
        let mosaic = VirtualMosaic::new(vec![
            constant_grid((0.0, 0.0, 1.0, 1.0), 10.0),
            constant_grid((1.0, 0.0, 2.0, 1.0), 20.0),
        ])
        .unwrap();
        let merged = mosaic.materialize(Resampling::Nearest, None).unwrap();
        assert_eq!(merged.bounds(), (0.0, 0.0, 2.0, 1.0));
        assert_eq!(merged.sample_point(0.5, 0.5, Resampling::Nearest), Some(10.0));
        assert_eq!(merged.sample_point(1.5, 0.5, Resampling::Nearest), Some(20.0));
    }

    #[test]
    fn test_mixed_crs_rejected() {
        let utm = CrsDef::from_authority("EPSG:32632").unwrap();
        let projected =
            RasterGrid::from_data(2, 2, (0.0, 0.0, 2.0, 2.0), utm, None, vec![0.0; 4]).unwrap();
        let result = VirtualMosaic::new(vec![constant_grid((0.0, 0.0, 1.0, 1.0), 1.0), projected]);
        assert!(result.is_err());
    }
}
