//! Backend-specific DEM profile constraints.

use crate::grid::RasterGrid;
use crate::mask::is_nodata;
use crate::{DemError, Result};

/// Expected DEM profile for a mesh-generation backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendProfile {
    /// Backend name.
    pub name: String,
    /// CRS the backend expects tile DEMs in.
    pub crs: String,
    /// Nodata sentinel the backend expects.
    pub nodata: Option<f64>,
    /// Whether the backend refuses DEMs with voids.
    pub require_full_coverage: bool,
}

impl BackendProfile {
    /// The Ortho4XP profile: EPSG:4326 tiles with `-32768` voids.
    pub fn ortho4xp() -> Self {
        BackendProfile {
            name: "ortho4xp".to_string(),
            crs: "EPSG:4326".to_string(),
            nodata: Some(-32768.0),
            require_full_coverage: false,
        }
    }

    /// Look up a profile by backend name.
    pub fn for_backend(name: &str) -> Option<Self> {
        match name {
            "ortho4xp" => Some(Self::ortho4xp()),
            _ => None,
        }
    }
}

/// Remap a grid's nodata sentinel to the backend's expectation.
///
/// Used as the fallback when the sentinel could not be applied during the
/// warp itself; rewrites masked cells in place and updates the header
/// value. Fails when the profile requires full coverage and voids remain.
pub fn apply_backend_profile(grid: &mut RasterGrid, profile: &BackendProfile) -> Result<usize> {
    if grid.crs().authority != profile.crs {
        return Err(DemError::Normalization(format!(
            "tile CRS {} does not match backend CRS {}",
            grid.crs().authority,
            profile.crs
        )));
    }
    let src_nodata = grid.nodata();
    let dst_nodata = profile.nodata.or(src_nodata);
    let mut remapped = 0usize;
    if let (Some(target), Some(_)) = (profile.nodata, src_nodata) {
        if src_nodata != profile.nodata {
            let replacement = target as f32;
            for value in grid.data_mut() {
                if is_nodata(*value, src_nodata) {
                    *value = replacement;
                    remapped += 1;
                }
            }
        }
    }
    grid.set_nodata(dst_nodata);
    if profile.require_full_coverage {
        let voids = crate::mask::count_nodata(grid.data(), grid.nodata());
        if voids > 0 {
            return Err(DemError::Normalization(format!(
                "backend {} requires void-free DEMs, found {voids} masked cells",
                profile.name
            )));
        }
    }
    Ok(remapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use demgrid_tiles::CrsDef;

    fn wgs84() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    #[test]
    fn test_remap_nan_to_backend_sentinel() {
        let data = vec![1.0, f32::NAN, 3.0, 4.0];
        let mut grid = RasterGrid::from_data(
            2,
            2,
            (0.0, 0.0, 2.0, 2.0),
            wgs84(),
            Some(f64::NAN),
            data,
        )
        .unwrap();
        let remapped = apply_backend_profile(&mut grid, &BackendProfile::ortho4xp()).unwrap();
        assert_eq!(remapped, 1);
        assert_eq!(grid.nodata(), Some(-32768.0));
        assert_eq!(grid.get(1, 0), -32768.0);
    }

    #[test]
    fn test_full_coverage_requirement() {
        let mut profile = BackendProfile::ortho4xp();
        profile.require_full_coverage = true;
        let data = vec![1.0, -32768.0, 3.0, 4.0];
        let mut grid = RasterGrid::from_data(
            2,
            2,
            (0.0, 0.0, 2.0, 2.0),
            wgs84(),
            Some(-32768.0),
            data,
        )
        .unwrap();
        assert!(apply_backend_profile(&mut grid, &profile).is_err());
    }

    #[test]
    fn test_crs_mismatch_rejected() {
        let utm = CrsDef::from_authority("EPSG:32632").unwrap();
        let mut grid =
            RasterGrid::from_data(1, 1, (0.0, 0.0, 1.0, 1.0), utm, None, vec![0.0]).unwrap();
        assert!(apply_backend_profile(&mut grid, &BackendProfile::ortho4xp()).is_err());
    }
}
