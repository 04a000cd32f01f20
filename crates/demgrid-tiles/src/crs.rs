//! Axis-order-safe CRS transforms backed by proj4rs.
//!
//! All public entry points take and return coordinates in traditional GIS
//! order (x = easting/longitude, y = northing/latitude) regardless of what
//! the authority definition declares. proj4rs works in radians for
//! geographic CRSs, so conversions happen at the boundary here and nowhere
//! else.

use crate::tile::Bounds;
use crate::{Result, TileError};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

/// A resolved CRS definition: authority string plus proj4 parameters.
#[derive(Debug, Clone)]
pub struct CrsDef {
    /// Authority form, e.g. `EPSG:4326`.
    pub authority: String,
    /// proj4 parameter string fed to proj4rs.
    pub proj_string: String,
    /// True when coordinates are degrees (lon/lat).
    pub geographic: bool,
}

impl CrsDef {
    /// Resolve a CRS from an `EPSG:<code>` authority string.
    ///
    /// Supported codes: 4326 and 4258 (geographic), 3857 (web mercator),
    /// and the UTM grids 32601-32660 / 32701-32760.
    pub fn from_authority(value: &str) -> Result<Self> {
        let upper = value.trim().to_ascii_uppercase();
        let code: u32 = upper
            .strip_prefix("EPSG:")
            .and_then(|rest| rest.parse().ok())
            .ok_or_else(|| TileError::UnknownCrs(value.to_string()))?;
        let (proj_string, geographic) = match code {
            4326 => ("+proj=longlat +datum=WGS84 +no_defs".to_string(), true),
            4258 => ("+proj=longlat +ellps=GRS80 +no_defs".to_string(), true),
            3857 => (
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +no_defs"
                    .to_string(),
                false,
            ),
            32601..=32660 => (
                format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600),
                false,
            ),
            32701..=32760 => (
                format!("+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs", code - 32700),
                false,
            ),
            _ => return Err(TileError::UnknownCrs(value.to_string())),
        };
        Ok(CrsDef {
            authority: format!("EPSG:{code}"),
            proj_string,
            geographic,
        })
    }

    fn proj(&self) -> Result<Proj> {
        Proj::from_proj_string(&self.proj_string)
            .map_err(|err| TileError::Projection(format!("{}: {err:?}", self.authority)))
    }

    /// Compare two CRS definitions by authority code.
    pub fn same_as(&self, other: &CrsDef) -> bool {
        self.authority == other.authority
    }
}

/// Fail fast when the requested target CRS cannot host the tile grid.
///
/// Tile bounds arithmetic is integer-degree only, so any projected target
/// produces silently-wrong tiles. Rejecting here keeps the error structured
/// and ahead of any per-tile work.
pub fn validate_target_crs(value: &str) -> Result<CrsDef> {
    let def = CrsDef::from_authority(value)?;
    if !def.geographic {
        return Err(TileError::UnsupportedTargetCrs(def.authority));
    }
    Ok(def)
}

/// Transform a single point between CRSs, x/y order in, x/y order out.
pub fn transform_point(src: &CrsDef, dst: &CrsDef, x: f64, y: f64) -> Result<(f64, f64)> {
    if src.same_as(dst) {
        return Ok((x, y));
    }
    let src_proj = src.proj()?;
    let dst_proj = dst.proj()?;
    let mut point = if src.geographic {
        (x.to_radians(), y.to_radians(), 0.0)
    } else {
        (x, y, 0.0)
    };
    transform(&src_proj, &dst_proj, &mut point)
        .map_err(|err| TileError::Projection(format!("{err:?}")))?;
    if dst.geographic {
        Ok((point.0.to_degrees(), point.1.to_degrees()))
    } else {
        Ok((point.0, point.1))
    }
}

/// Transform bounding coordinates between CRSs.
///
/// The edges are densified so that curved projections do not clip the true
/// envelope; the result is the axis-aligned hull of all transformed edge
/// samples.
pub fn transform_bounds(src: &CrsDef, dst: &CrsDef, bounds: Bounds, densify: usize) -> Result<Bounds> {
    if src.same_as(dst) {
        return Ok(bounds);
    }
    let (min_x, min_y, max_x, max_y) = bounds;
    let steps = densify.max(1) + 1;
    let mut out_min_x = f64::INFINITY;
    let mut out_min_y = f64::INFINITY;
    let mut out_max_x = f64::NEG_INFINITY;
    let mut out_max_y = f64::NEG_INFINITY;
    let mut push = |x: f64, y: f64| -> Result<()> {
        let (tx, ty) = transform_point(src, dst, x, y)?;
        out_min_x = out_min_x.min(tx);
        out_min_y = out_min_y.min(ty);
        out_max_x = out_max_x.max(tx);
        out_max_y = out_max_y.max(ty);
        Ok(())
    };
    for index in 0..=steps {
        let t = index as f64 / steps as f64;
        let x = min_x + (max_x - min_x) * t;
        let y = min_y + (max_y - min_y) * t;
        push(x, min_y)?;
        push(x, max_y)?;
        push(min_x, y)?;
        push(max_x, y)?;
    }
    Ok((out_min_x, out_min_y, out_max_x, out_max_y))
}
