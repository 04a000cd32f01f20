//! Reprojection and resampling of raster grids.

use crate::grid::{RasterGrid, Resampling, Sampler};
use crate::Result;
use demgrid_tiles::{transform_bounds, transform_point, Bounds, CrsDef};

/// Warp a source into a destination grid of the given shape.
///
/// Every destination pixel center is inverse-projected into the source CRS
/// and sampled with the requested kernel. Cells without coverage receive
/// the effective nodata sentinel (`dst_nodata`, falling back to the
/// source's); with neither declared they become NaN.
pub fn warp_into(
    src: &dyn Sampler,
    dst_crs: &CrsDef,
    dst_bounds: Bounds,
    width: usize,
    height: usize,
    kernel: Resampling,
    dst_nodata: Option<f64>,
) -> Result<RasterGrid> {
    let nodata = dst_nodata.or(src.nodata());
    let mut dst = RasterGrid::filled(width, height, dst_bounds, dst_crs.clone(), nodata);
    let same_crs = src.crs().same_as(dst_crs);
    let res_x = (dst_bounds.2 - dst_bounds.0) / width as f64;
    let res_y = (dst_bounds.3 - dst_bounds.1) / height as f64;
    // Footprint of one destination pixel in source units, for averaging.
    let (half_x, half_y) = if same_crs {
        (res_x / 2.0, res_y / 2.0)
    } else {
        let (src_res_x, src_res_y) = src.resolution();
        let scale = scale_between(dst_crs, src.crs(), dst_bounds)?;
        (
            (res_x * scale.0 / 2.0).max(src_res_x / 2.0),
            (res_y * scale.1 / 2.0).max(src_res_y / 2.0),
        )
    };
    for row in 0..height {
        let y = dst_bounds.3 - (row as f64 + 0.5) * res_y;
        for col in 0..width {
            let x = dst_bounds.0 + (col as f64 + 0.5) * res_x;
            let (sx, sy) = if same_crs {
                (x, y)
            } else {
                transform_point(dst_crs, src.crs(), x, y)?
            };
            let sampled = match kernel {
                Resampling::Average => src.sample_average(sx, sy, half_x, half_y),
                other => src.sample_point(sx, sy, other),
            };
            if let Some(value) = sampled {
                dst.set(col, row, value);
            }
        }
    }
    Ok(dst)
}

/// Approximate unit scale between two CRSs over an area of interest.
fn scale_between(from: &CrsDef, to: &CrsDef, bounds: Bounds) -> Result<(f64, f64)> {
    let projected = transform_bounds(from, to, bounds, 3)?;
    let dx = (projected.2 - projected.0) / (bounds.2 - bounds.0).max(f64::EPSILON);
    let dy = (projected.3 - projected.1) / (bounds.3 - bounds.1).max(f64::EPSILON);
    Ok((dx.abs(), dy.abs()))
}

/// Reproject a whole grid to a target CRS.
///
/// The output covers the transformed source envelope. Resolution defaults
/// to whatever preserves the source pixel counts over the new envelope.
pub fn warp_to_crs(
    src: &RasterGrid,
    dst_crs: &CrsDef,
    resolution: Option<(f64, f64)>,
    kernel: Resampling,
    dst_nodata: Option<f64>,
) -> Result<RasterGrid> {
    if src.crs().same_as(dst_crs) && resolution.is_none() && dst_nodata.is_none() {
        return Ok(src.clone());
    }
    let dst_bounds = transform_bounds(src.crs(), dst_crs, src.bounds(), 21)?;
    let (width, height) = match resolution {
        Some((res_x, res_y)) => (
            (((dst_bounds.2 - dst_bounds.0) / res_x).ceil() as usize).max(1),
            (((dst_bounds.3 - dst_bounds.1) / res_y).ceil() as usize).max(1),
        ),
        None => (src.width().max(1), src.height().max(1)),
    };
    warp_into(src, dst_crs, dst_bounds, width, height, kernel, dst_nodata)
}
