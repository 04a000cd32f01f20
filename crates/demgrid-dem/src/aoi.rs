//! AOI polygon loading and raster masking.
//!
//! AOIs arrive as GeoJSON (`Polygon`, `MultiPolygon`, `Feature`, or
//! `FeatureCollection`). A polygon without an embedded CRS is assumed to be
//! EPSG:4326; anything else is transformed before masking.

use crate::grid::RasterGrid;
use crate::{DemError, Result};
use demgrid_tiles::{transform_point, CrsDef};
use serde_json::Value;
use std::path::Path;

/// One polygon ring set: an outer ring plus optional holes.
#[derive(Debug, Clone)]
pub struct AoiPolygon {
    /// Outer boundary, closed or open.
    pub outer: Vec<(f64, f64)>,
    /// Interior holes.
    pub holes: Vec<Vec<(f64, f64)>>,
}

/// Loaded AOI geometry with resolved CRS.
#[derive(Debug, Clone)]
pub struct Aoi {
    /// Polygons in the AOI's CRS.
    pub polygons: Vec<AoiPolygon>,
    /// Resolved CRS of the coordinates.
    pub crs: CrsDef,
    /// Warnings produced while resolving the CRS.
    pub warnings: Vec<String>,
}

fn ring_from_json(value: &Value) -> Option<Vec<(f64, f64)>> {
    let coords = value.as_array()?;
    let mut ring = Vec::with_capacity(coords.len());
    for point in coords {
        let pair = point.as_array()?;
        ring.push((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?));
    }
    Some(ring)
}

fn polygon_from_rings(value: &Value) -> Option<AoiPolygon> {
    let rings = value.as_array()?;
    let mut iter = rings.iter();
    let outer = ring_from_json(iter.next()?)?;
    let holes = iter.filter_map(ring_from_json).collect();
    Some(AoiPolygon { outer, holes })
}

fn collect_polygons(geometry: &Value, out: &mut Vec<AoiPolygon>) {
    match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => {
            if let Some(polygon) = geometry.get("coordinates").and_then(polygon_from_rings) {
                out.push(polygon);
            }
        }
        Some("MultiPolygon") => {
            if let Some(parts) = geometry.get("coordinates").and_then(Value::as_array) {
                out.extend(parts.iter().filter_map(polygon_from_rings));
            }
        }
        Some("Feature") => {
            if let Some(inner) = geometry.get("geometry") {
                collect_polygons(inner, out);
            }
        }
        Some("FeatureCollection") => {
            if let Some(features) = geometry.get("features").and_then(Value::as_array) {
                for feature in features {
                    collect_polygons(feature, out);
                }
            }
        }
        _ => {}
    }
}

fn embedded_crs(root: &Value) -> Option<String> {
    let crs = root.get("crs")?;
    if let Some(name) = crs
        .get("properties")
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
    {
        return Some(name.to_string());
    }
    crs.as_str().map(str::to_string)
}

/// Load AOI polygons from a GeoJSON file.
pub fn load_aoi(path: &Path, explicit_crs: Option<&str>) -> Result<Aoi> {
    let text = std::fs::read_to_string(path)?;
    let root: Value = serde_json::from_str(&text)?;
    let mut polygons = Vec::new();
    collect_polygons(&root, &mut polygons);
    if polygons.is_empty() {
        return Err(DemError::InvalidInput(format!(
            "no polygon geometries found in {}",
            path.display()
        )));
    }
    let mut warnings = Vec::new();
    let embedded = embedded_crs(&root);
    let authority = match (explicit_crs, embedded) {
        (Some(explicit), Some(found)) => {
            if !explicit.eq_ignore_ascii_case(&found) {
                warnings.push(format!(
                    "AOI CRS mismatch: embedded {found} differs from requested {explicit}"
                ));
            }
            explicit.to_string()
        }
        (Some(explicit), None) => explicit.to_string(),
        (None, Some(found)) => found,
        (None, None) => "EPSG:4326".to_string(),
    };
    Ok(Aoi {
        polygons,
        crs: CrsDef::from_authority(&authority)?,
        warnings,
    })
}

fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    // Even-odd ray casting; the ring may or may not repeat its first point.
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl Aoi {
    /// True when the point (in the AOI's CRS) lies inside the AOI.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons.iter().any(|polygon| {
            ring_contains(&polygon.outer, x, y)
                && !polygon.holes.iter().any(|hole| ring_contains(hole, x, y))
        })
    }

    /// Reproject the polygons into another CRS.
    pub fn to_crs(&self, dst: &CrsDef) -> Result<Aoi> {
        if self.crs.same_as(dst) {
            return Ok(self.clone());
        }
        let mut polygons = Vec::with_capacity(self.polygons.len());
        for polygon in &self.polygons {
            let project = |ring: &[(f64, f64)]| -> Result<Vec<(f64, f64)>> {
                ring.iter()
                    .map(|&(x, y)| Ok(transform_point(&self.crs, dst, x, y)?))
                    .collect()
            };
            polygons.push(AoiPolygon {
                outer: project(&polygon.outer)?,
                holes: polygon
                    .holes
                    .iter()
                    .map(|hole| project(hole))
                    .collect::<Result<_>>()?,
            });
        }
        Ok(Aoi {
            polygons,
            crs: dst.clone(),
            warnings: self.warnings.clone(),
        })
    }
}

/// Mask a grid against an AOI: pixel centers outside become nodata.
///
/// The grid must carry a nodata sentinel; the stack loader enforces that
/// before any tile work starts.
pub fn apply_aoi_mask(grid: &mut RasterGrid, aoi: &Aoi, nodata: f64) -> Result<usize> {
    let aoi = aoi.to_crs(grid.crs())?;
    let sentinel = nodata as f32;
    let mut masked = 0usize;
    for row in 0..grid.height() {
        for col in 0..grid.width() {
            let (x, y) = grid.pixel_center(col, row);
            if !aoi.contains(x, y) {
                grid.set(col, row, sentinel);
                masked += 1;
            }
        }
    }
    Ok(masked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_geojson(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    const SQUARE: &str = r#"{
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]]]
    }"#;

    #[test]
    fn test_load_bare_polygon_defaults_to_wgs84() {
        let dir = TempDir::new().unwrap();
        let path = write_geojson(&dir, "aoi.geojson", SQUARE);
        let aoi = load_aoi(&path, None).unwrap();
        assert_eq!(aoi.crs.authority, "EPSG:4326");
        assert_eq!(aoi.polygons.len(), 1);
        assert!(aoi.contains(2.0, 2.0));
        assert!(!aoi.contains(5.0, 2.0));
    }

    #[test]
    fn test_load_feature_collection() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            r#"{{"type": "FeatureCollection", "features": [{{"type": "Feature", "properties": {{}}, "geometry": {SQUARE}}}]}}"#
        );
        let path = write_geojson(&dir, "fc.geojson", &body);
        let aoi = load_aoi(&path, None).unwrap();
        assert_eq!(aoi.polygons.len(), 1);
    }

    #[test]
    fn test_polygon_hole_excluded() {
        let dir = TempDir::new().unwrap();
        let body = r#"{
            "type": "Polygon",
            "coordinates": [
                [[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]],
                [[1.0, 1.0], [3.0, 1.0], [3.0, 3.0], [1.0, 3.0], [1.0, 1.0]]
            ]
        }"#;
        let path = write_geojson(&dir, "hole.geojson", body);
        let aoi = load_aoi(&path, None).unwrap();
        assert!(aoi.contains(0.5, 0.5));
        assert!(!aoi.contains(2.0, 2.0));
    }

    #[test]
    fn test_no_polygons_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_geojson(&dir, "point.geojson", r#"{"type": "Point", "coordinates": [0, 0]}"#);
        assert!(load_aoi(&path, None).is_err());
    }

    #[test]
    fn test_apply_aoi_mask() {
        let dir = TempDir::new().unwrap();
        let path = write_geojson(&dir, "aoi.geojson", SQUARE);
        let aoi = load_aoi(&path, None).unwrap();
        let crs = CrsDef::from_authority("EPSG:4326").unwrap();
        // 8x8 grid over (0,0)-(8,8); the AOI covers the south-west quarter.
        let mut grid = RasterGrid::from_data(
            8,
            8,
            (0.0, 0.0, 8.0, 8.0),
            crs,
            Some(-9999.0),
            vec![1.0f32; 64],
        )
        .unwrap();
        let masked = apply_aoi_mask(&mut grid, &aoi, -9999.0).unwrap();
        assert_eq!(masked, 48);
        // Inside: south-west corner pixel center (0.5, 7.5 row -> y=0.5).
        assert_eq!(grid.get(0, 7), 1.0);
        // Outside: north-east corner.
        assert_eq!(grid.get(7, 0), -9999.0);
    }
}
