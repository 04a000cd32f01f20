//! Clipping DEM sources into 1x1 degree tile artifacts.

use crate::geotiff::{write_geotiff, TiffCompression};
use crate::grid::{RasterGrid, Resampling, Sampler};
use crate::warp::warp_into;
use crate::{DemError, Result};
use demgrid_tiles::{Bounds, Tile};
use std::path::{Path, PathBuf};

/// Result of writing a DEM tile.
///
/// `nodata` is the sentinel actually written into the artifact header, not
/// the caller's request.
#[derive(Debug, Clone)]
pub struct TileResult {
    /// The tile this artifact covers.
    pub tile: Tile,
    /// Artifact location on disk.
    pub path: PathBuf,
    /// Tile bounds in EPSG:4326 degrees.
    pub bounds: Bounds,
    /// Pixel size in degrees.
    pub resolution: (f64, f64),
    /// Effective nodata sentinel written to the dataset.
    pub nodata: Option<f64>,
}

/// Warp a source into a tile window without writing it out.
///
/// The source must already live in a geographic CRS; the pixel grid is
/// `ceil(extent / resolution)` in each axis, so a resolution that does not
/// divide one degree still covers the whole tile.
pub fn clip_tile(
    src: &dyn Sampler,
    tile: Tile,
    resolution: Option<(f64, f64)>,
    kernel: Resampling,
    dst_nodata: Option<f64>,
) -> Result<RasterGrid> {
    if !src.crs().geographic {
        return Err(DemError::Normalization(format!(
            "tile clipping requires a geographic source, got {}",
            src.crs().authority
        )));
    }
    let bounds = tile.bounds();
    let (res_x, res_y) = match resolution {
        Some(res) => res,
        None => src.resolution(),
    };
    let width = (((bounds.2 - bounds.0) / res_x).ceil() as usize).max(1);
    let height = (((bounds.3 - bounds.1) / res_y).ceil() as usize).max(1);
    warp_into(src, src.crs(), bounds, width, height, kernel, dst_nodata)
}

/// Clip and resample a DEM source into a tile GeoTIFF on disk.
pub fn write_tile_dem(
    src: &dyn Sampler,
    tile: Tile,
    output_path: &Path,
    resolution: Option<(f64, f64)>,
    kernel: Resampling,
    dst_nodata: Option<f64>,
    compression: TiffCompression,
) -> Result<TileResult> {
    let grid = clip_tile(src, tile, resolution, kernel, dst_nodata)?;
    write_geotiff(output_path, &grid, compression)?;
    Ok(TileResult {
        tile,
        path: output_path.to_path_buf(),
        bounds: tile.bounds(),
        resolution: grid.resolution(),
        nodata: grid.nodata(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geotiff::read_geotiff;
    use demgrid_tiles::CrsDef;
    use tempfile::TempDir;

    fn wgs84() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    fn source_grid() -> RasterGrid {
        // 3x3 degrees around +47+008 at 0.1 degree pixels.
        let width = 30;
        let height = 30;
        let data: Vec<f32> = (0..width * height).map(|v| v as f32).collect();
        RasterGrid::from_data(
            width,
            height,
            (7.0, 46.0, 10.0, 49.0),
            wgs84(),
            Some(-9999.0),
            data,
        )
        .unwrap()
    }

    #[test]
    fn test_write_tile_dem_effective_nodata_from_source() {
        let dir = TempDir::new().unwrap();
        let tile: Tile = "+47+008".parse().unwrap();
        let path = dir.path().join("+47+008.tif");
        let src = source_grid();
        let result = write_tile_dem(
            &src,
            tile,
            &path,
            None,
            Resampling::Bilinear,
            None,
            TiffCompression::None,
        )
        .unwrap();
        // No destination nodata was requested, so the source value is what
        // actually lands in the header, and the result must echo it.
        assert_eq!(result.nodata, Some(-9999.0));
        let written = read_geotiff(&path).unwrap();
        assert_eq!(written.nodata(), Some(-9999.0));
        assert_eq!(result.bounds, (8.0, 47.0, 9.0, 48.0));
    }

    #[test]
    fn test_write_tile_dem_explicit_nodata() {
        let dir = TempDir::new().unwrap();
        let tile: Tile = "+47+008".parse().unwrap();
        let path = dir.path().join("tile.tif");
        let result = write_tile_dem(
            &source_grid(),
            tile,
            &path,
            Some((0.1, 0.1)),
            Resampling::Nearest,
            Some(-32768.0),
            TiffCompression::None,
        )
        .unwrap();
        assert_eq!(result.nodata, Some(-32768.0));
        let written = read_geotiff(&path).unwrap();
        assert_eq!(written.nodata(), Some(-32768.0));
        assert_eq!(written.width(), 10);
        assert_eq!(written.height(), 10);
    }

    #[test]
    fn test_ceil_pixel_grid() {
        let tile: Tile = "+47+008".parse().unwrap();
        // 0.3 degrees per pixel does not divide 1 degree; expect ceil(1/0.3) = 4.
        let grid = clip_tile(
            &source_grid(),
            tile,
            Some((0.3, 0.3)),
            Resampling::Nearest,
            None,
        )
        .unwrap();
        assert_eq!(grid.width(), 4);
        assert_eq!(grid.height(), 4);
    }

    #[test]
    fn test_projected_source_rejected() {
        let utm = CrsDef::from_authority("EPSG:32632").unwrap();
        let src =
            RasterGrid::from_data(2, 2, (0.0, 0.0, 2.0, 2.0), utm, None, vec![0.0; 4]).unwrap();
        let tile: Tile = "+47+008".parse().unwrap();
        assert!(clip_tile(&src, tile, None, Resampling::Nearest, None).is_err());
    }
}
