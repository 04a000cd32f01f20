//! In-memory raster grid with geographic sampling.
//!
//! A [`RasterGrid`] is a single-band f32 raster with axis-aligned bounds in
//! its CRS. Row zero is the northern edge, matching GeoTIFF convention.
//! Sampling works in CRS coordinates against pixel centers; every kernel is
//! nodata-aware and renormalizes its weights over the valid neighbourhood.

use crate::mask::is_nodata;
use crate::{DemError, Result};
use demgrid_tiles::{Bounds, CrsDef};
use std::str::FromStr;

/// Resampling kernels supported by the warp and tiling paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Nearest pixel center.
    Nearest,
    /// Weighted average of the 2x2 neighbourhood.
    Bilinear,
    /// Catmull-Rom over a 4x4 neighbourhood.
    Cubic,
    /// Box average over the destination pixel footprint.
    Average,
    /// Lanczos (a = 3) over a 6x6 neighbourhood.
    Lanczos,
}

impl Resampling {
    /// Canonical lowercase name, as recorded in build plans.
    pub fn name(&self) -> &'static str {
        match self {
            Resampling::Nearest => "nearest",
            Resampling::Bilinear => "bilinear",
            Resampling::Cubic => "cubic",
            Resampling::Average => "average",
            Resampling::Lanczos => "lanczos",
        }
    }

    /// Default kernel by resampling direction: averaging when shrinking,
    /// bilinear when growing.
    pub fn default_for(upsampling: bool) -> Resampling {
        if upsampling {
            Resampling::Bilinear
        } else {
            Resampling::Average
        }
    }
}

impl FromStr for Resampling {
    type Err = DemError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            "cubic" => Ok(Resampling::Cubic),
            "average" => Ok(Resampling::Average),
            "lanczos" => Ok(Resampling::Lanczos),
            other => Err(DemError::UnknownName {
                kind: "resampling kernel",
                value: other.to_string(),
            }),
        }
    }
}

/// Anything per-tile warps can sample: a single grid or a virtual mosaic.
pub trait Sampler {
    /// CRS the sampler's coordinates live in.
    fn crs(&self) -> &CrsDef;
    /// Nodata sentinel of the source, if any.
    fn nodata(&self) -> Option<f64>;
    /// Pixel size in CRS units.
    fn resolution(&self) -> (f64, f64);
    /// Point sample with the given kernel; `None` when outside coverage or
    /// only nodata contributes.
    fn sample_point(&self, x: f64, y: f64, kernel: Resampling) -> Option<f32>;
    /// Box average over a half-extent footprint centred on `(x, y)`.
    fn sample_average(&self, x: f64, y: f64, half_x: f64, half_y: f64) -> Option<f32>;
}

/// Single-band in-memory raster.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    width: usize,
    height: usize,
    bounds: Bounds,
    crs: CrsDef,
    nodata: Option<f64>,
    data: Vec<f32>,
}

impl RasterGrid {
    /// Create a grid from raw row-major data (row 0 = north).
    pub fn from_data(
        width: usize,
        height: usize,
        bounds: Bounds,
        crs: CrsDef,
        nodata: Option<f64>,
        data: Vec<f32>,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(DemError::Normalization(format!(
                "raster data length {} does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(RasterGrid {
            width,
            height,
            bounds,
            crs,
            nodata,
            data,
        })
    }

    /// Allocate a grid filled with the nodata sentinel (or NaN without one).
    pub fn filled(
        width: usize,
        height: usize,
        bounds: Bounds,
        crs: CrsDef,
        nodata: Option<f64>,
    ) -> Self {
        let fill = nodata.unwrap_or(f64::NAN) as f32;
        RasterGrid {
            width,
            height,
            bounds,
            crs,
            nodata,
            data: vec![fill; width * height],
        }
    }

    /// Grid width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Bounds in CRS units.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// CRS of the grid.
    pub fn crs(&self) -> &CrsDef {
        &self.crs
    }

    /// Nodata sentinel, if declared.
    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Replace the nodata sentinel without touching cell values.
    pub fn set_nodata(&mut self, nodata: Option<f64>) {
        self.nodata = nodata;
    }

    /// Raw band data, row-major from the north edge.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable band data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Cell value at `(col, row)`.
    #[inline]
    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.data[row * self.width + col]
    }

    /// Set the cell value at `(col, row)`.
    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        self.data[row * self.width + col] = value;
    }

    /// True when the cell holds the nodata sentinel.
    #[inline]
    pub fn is_masked(&self, col: usize, row: usize) -> bool {
        is_nodata(self.get(col, row), self.nodata)
    }

    /// CRS coordinates of a pixel center.
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        let (res_x, res_y) = self.resolution();
        let x = self.bounds.0 + (col as f64 + 0.5) * res_x;
        let y = self.bounds.3 - (row as f64 + 0.5) * res_y;
        (x, y)
    }

    /// Fractional pixel coordinates of a CRS point, relative to pixel
    /// centers (so `(0.0, 0.0)` is the center of the north-west pixel).
    fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let (res_x, res_y) = self.resolution();
        let col = (x - self.bounds.0) / res_x - 0.5;
        let row = (self.bounds.3 - y) / res_y - 0.5;
        (col, row)
    }

    #[inline]
    fn valid_at(&self, col: i64, row: i64) -> Option<f32> {
        if col < 0 || row < 0 || col >= self.width as i64 || row >= self.height as i64 {
            return None;
        }
        let value = self.get(col as usize, row as usize);
        if is_nodata(value, self.nodata) {
            None
        } else {
            Some(value)
        }
    }

    /// Weighted sum over a window, skipping invalid cells and renormalizing.
    fn kernel_sample<F>(&self, col: f64, row: f64, radius: i64, weight: F) -> Option<f32>
    where
        F: Fn(f64) -> f64,
    {
        let base_col = col.floor() as i64;
        let base_row = row.floor() as i64;
        let mut acc = 0.0f64;
        let mut total = 0.0f64;
        for dy in (1 - radius)..=radius {
            let sample_row = base_row + dy;
            let wy = weight(row - sample_row as f64);
            if wy == 0.0 {
                continue;
            }
            for dx in (1 - radius)..=radius {
                let sample_col = base_col + dx;
                let wx = weight(col - sample_col as f64);
                if wx == 0.0 {
                    continue;
                }
                if let Some(value) = self.valid_at(sample_col, sample_row) {
                    acc += value as f64 * wx * wy;
                    total += wx * wy;
                }
            }
        }
        if total.abs() < 1e-12 {
            None
        } else {
            Some((acc / total) as f32)
        }
    }
}

fn triangle_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.0 - t
    } else {
        0.0
    }
}

/// Catmull-Rom cubic weight.
fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

/// Lanczos kernel with a = 3.
fn lanczos_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1e-12 {
        return 1.0;
    }
    if t >= 3.0 {
        return 0.0;
    }
    let pt = std::f64::consts::PI * t;
    3.0 * pt.sin() * (pt / 3.0).sin() / (pt * pt)
}

impl Sampler for RasterGrid {
    fn crs(&self) -> &CrsDef {
        &self.crs
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn resolution(&self) -> (f64, f64) {
        (
            (self.bounds.2 - self.bounds.0) / self.width as f64,
            (self.bounds.3 - self.bounds.1) / self.height as f64,
        )
    }

    fn sample_point(&self, x: f64, y: f64, kernel: Resampling) -> Option<f32> {
        let (col, row) = self.geo_to_pixel(x, y);
        if col < -0.5
            || row < -0.5
            || col > self.width as f64 - 0.5
            || row > self.height as f64 - 0.5
        {
            return None;
        }
        match kernel {
            Resampling::Nearest => {
                let c = col.round().clamp(0.0, self.width as f64 - 1.0) as i64;
                let r = row.round().clamp(0.0, self.height as f64 - 1.0) as i64;
                self.valid_at(c, r)
            }
            Resampling::Bilinear | Resampling::Average => {
                self.kernel_sample(col, row, 1, triangle_weight)
            }
            Resampling::Cubic => self.kernel_sample(col, row, 2, cubic_weight),
            Resampling::Lanczos => self.kernel_sample(col, row, 3, lanczos_weight),
        }
    }

    fn sample_average(&self, x: f64, y: f64, half_x: f64, half_y: f64) -> Option<f32> {
        let (min_col, max_row) = self.geo_to_pixel(x - half_x, y - half_y);
        let (max_col, min_row) = self.geo_to_pixel(x + half_x, y + half_y);
        let start_col = min_col.round().max(0.0) as i64;
        let end_col = max_col.round().min(self.width as f64 - 1.0) as i64;
        let start_row = min_row.round().max(0.0) as i64;
        let end_row = max_row.round().min(self.height as f64 - 1.0) as i64;
        if start_col > end_col || start_row > end_row {
            return self.sample_point(x, y, Resampling::Bilinear);
        }
        let mut acc = 0.0f64;
        let mut count = 0usize;
        for row in start_row..=end_row {
            for col in start_col..=end_col {
                if let Some(value) = self.valid_at(col, row) {
                    acc += value as f64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            None
        } else {
            Some((acc / count as f64) as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crs() -> CrsDef {
        CrsDef::from_authority("EPSG:4326").unwrap()
    }

    fn small_grid() -> RasterGrid {
        // 2x2 grid over (0,0)-(2,2); row 0 is the north row.
        RasterGrid::from_data(
            2,
            2,
            (0.0, 0.0, 2.0, 2.0),
            crs(),
            Some(-9999.0),
            vec![10.0, 20.0, 30.0, 40.0],
        )
        .unwrap()
    }

    #[test]
    fn test_pixel_center_orientation() {
        let grid = small_grid();
        assert_eq!(grid.pixel_center(0, 0), (0.5, 1.5));
        assert_eq!(grid.pixel_center(1, 1), (1.5, 0.5));
    }

    #[test]
    fn test_nearest_sampling() {
        let grid = small_grid();
        assert_eq!(grid.sample_point(0.5, 1.5, Resampling::Nearest), Some(10.0));
        assert_eq!(grid.sample_point(1.5, 0.5, Resampling::Nearest), Some(40.0));
        assert_eq!(grid.sample_point(5.0, 5.0, Resampling::Nearest), None);
    }

    #[test]
    fn test_bilinear_center_is_mean() {
        let grid = small_grid();
        let value = grid.sample_point(1.0, 1.0, Resampling::Bilinear).unwrap();
        assert!((value - 25.0).abs() < 1e-5);
    }

    #[test]
    fn test_bilinear_skips_nodata_neighbours() {
        let mut grid = small_grid();
        grid.set(0, 0, -9999.0);
        // Center sample renormalizes over the three valid corners.
        let value = grid.sample_point(1.0, 1.0, Resampling::Bilinear).unwrap();
        assert!((value - 30.0).abs() < 1e-5);
    }

    #[test]
    fn test_all_nodata_sample_is_none() {
        let mut grid = small_grid();
        for v in grid.data_mut() {
            *v = -9999.0;
        }
        assert_eq!(grid.sample_point(1.0, 1.0, Resampling::Bilinear), None);
        assert_eq!(grid.sample_average(1.0, 1.0, 1.0, 1.0), None);
    }

    #[test]
    fn test_average_over_footprint() {
        let grid = small_grid();
        let value = grid.sample_average(1.0, 1.0, 1.0, 1.0).unwrap();
        assert!((value - 25.0).abs() < 1e-5);
    }

    #[test]
    fn test_resampling_names_roundtrip() {
        for kernel in [
            Resampling::Nearest,
            Resampling::Bilinear,
            Resampling::Cubic,
            Resampling::Average,
            Resampling::Lanczos,
        ] {
            assert_eq!(kernel.name().parse::<Resampling>().unwrap(), kernel);
        }
        assert!("gauss".parse::<Resampling>().is_err());
    }
}
