//! Tile identifiers and the 10x10 degree bucket grid.

use crate::{Result, TileError};
use std::fmt;
use std::str::FromStr;

/// Geographic bounds as `(min_lon, min_lat, max_lon, max_lat)` in degrees.
pub type Bounds = (f64, f64, f64, f64);

/// A 1x1 degree scenery tile identified by its south-west corner.
///
/// The canonical on-disk encoding is `+DD+DDD`: sign-prefixed two-digit
/// latitude followed by sign-prefixed three-digit longitude. Parsing and
/// formatting round-trip for every tile in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    lat: i32,
    lon: i32,
}

impl Tile {
    /// Create a tile from its south-west corner coordinates.
    pub fn new(lat: i32, lon: i32) -> Result<Self> {
        if !(-90..=89).contains(&lat) || !(-180..=179).contains(&lon) {
            return Err(TileError::OutOfRange { lat, lon });
        }
        Ok(Tile { lat, lon })
    }

    /// South-west corner latitude in degrees.
    pub fn lat(&self) -> i32 {
        self.lat
    }

    /// South-west corner longitude in degrees.
    pub fn lon(&self) -> i32 {
        self.lon
    }

    /// Bounds in EPSG:4326 degrees: `(lon, lat, lon + 1, lat + 1)`.
    pub fn bounds(&self) -> Bounds {
        (
            self.lon as f64,
            self.lat as f64,
            (self.lon + 1) as f64,
            (self.lat + 1) as f64,
        )
    }

    /// The 10x10 degree bucket containing this tile.
    ///
    /// Uses floor division so negative coordinates land in the correct
    /// south-west bucket corner (`-3` belongs to `-10`, not `0`).
    pub fn bucket(&self) -> Bucket {
        Bucket {
            lat: self.lat.div_euclid(10) * 10,
            lon: self.lon.div_euclid(10) * 10,
        }
    }

    /// The cardinal-letter name used for staged elevation files (`N47E008`).
    pub fn hgt_name(&self) -> String {
        let lat_prefix = if self.lat >= 0 { 'N' } else { 'S' };
        let lon_prefix = if self.lon >= 0 { 'E' } else { 'W' };
        format!(
            "{}{:02}{}{:03}",
            lat_prefix,
            self.lat.abs(),
            lon_prefix,
            self.lon.abs()
        )
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+03}{:+04}", self.lat, self.lon)
    }
}

impl FromStr for Tile {
    type Err = TileError;

    fn from_str(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() != 7 {
            return Err(TileError::InvalidTileName(name.to_string()));
        }
        let lat_sign = bytes[0];
        let lon_sign = bytes[3];
        if !matches!(lat_sign, b'+' | b'-') || !matches!(lon_sign, b'+' | b'-') {
            return Err(TileError::InvalidTileName(name.to_string()));
        }
        if !bytes[1..3].iter().all(u8::is_ascii_digit)
            || !bytes[4..7].iter().all(u8::is_ascii_digit)
        {
            return Err(TileError::InvalidTileName(name.to_string()));
        }
        let lat: i32 = name[0..3]
            .parse()
            .map_err(|_| TileError::InvalidTileName(name.to_string()))?;
        let lon: i32 = name[3..7]
            .parse()
            .map_err(|_| TileError::InvalidTileName(name.to_string()))?;
        Tile::new(lat, lon)
    }
}

/// A 10x10 degree bucket folder, named like a tile at multiples of ten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    lat: i32,
    lon: i32,
}

impl Bucket {
    /// South-west corner latitude of the bucket.
    pub fn lat(&self) -> i32 {
        self.lat
    }

    /// South-west corner longitude of the bucket.
    pub fn lon(&self) -> i32 {
        self.lon
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+03}{:+04}", self.lat, self.lon)
    }
}

/// All tiles intersecting the given bounds.
///
/// Bounds are interpreted in EPSG:4326 degrees. Edges exactly on an integer
/// degree do not pull in the neighbouring tile.
pub fn tiles_for_bounds(bounds: Bounds) -> Result<Vec<Tile>> {
    let (min_lon, min_lat, max_lon, max_lat) = bounds;
    let start_lat = min_lat.floor() as i32;
    let end_lat = (max_lat.ceil() as i32) - 1;
    let start_lon = min_lon.floor() as i32;
    let end_lon = (max_lon.ceil() as i32) - 1;
    let mut tiles = Vec::new();
    for lat in start_lat..=end_lat {
        for lon in start_lon..=end_lon {
            tiles.push(Tile::new(lat, lon)?);
        }
    }
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_roundtrip() {
        for name in ["+47+008", "-03+017", "+00-001", "-90-180", "+89+179"] {
            let tile: Tile = name.parse().expect("valid tile");
            assert_eq!(tile.to_string(), name);
        }
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for name in ["47+008", "+47008", "+4a+008", "+47+08", "+47+0088", "", "+90+000", "+47+180"] {
            assert!(name.parse::<Tile>().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_bounds() {
        let tile: Tile = "+47+008".parse().unwrap();
        assert_eq!(tile.bounds(), (8.0, 47.0, 9.0, 48.0));
        let tile: Tile = "-03+017".parse().unwrap();
        assert_eq!(tile.bounds(), (17.0, -3.0, 18.0, -2.0));
    }

    #[test]
    fn test_bucket_floor_division_on_negatives() {
        let tile: Tile = "-03+017".parse().unwrap();
        assert_eq!(tile.bucket().to_string(), "-10+010");
        let tile: Tile = "-10-001".parse().unwrap();
        assert_eq!(tile.bucket().to_string(), "-10-010");
        let tile: Tile = "+47+008".parse().unwrap();
        assert_eq!(tile.bucket().to_string(), "+40+000");
    }

    #[test]
    fn test_bucket_contains_tile() {
        for name in ["+47+008", "-03+017", "-90-180", "+89+179"] {
            let tile: Tile = name.parse().unwrap();
            let bucket = tile.bucket();
            assert!(bucket.lat() <= tile.lat() && tile.lat() < bucket.lat() + 10);
            assert!(bucket.lon() <= tile.lon() && tile.lon() < bucket.lon() + 10);
        }
    }

    #[test]
    fn test_hgt_name() {
        let tile: Tile = "+47+008".parse().unwrap();
        assert_eq!(tile.hgt_name(), "N47E008");
        let tile: Tile = "-03-072".parse().unwrap();
        assert_eq!(tile.hgt_name(), "S03W072");
    }

    #[test]
    fn test_tiles_for_bounds() {
        let tiles = tiles_for_bounds((7.5, 46.5, 9.5, 47.5)).unwrap();
        let names: Vec<String> = tiles.iter().map(Tile::to_string).collect();
        assert_eq!(names, ["+46+007", "+46+008", "+46+009", "+47+007", "+47+008", "+47+009"]);
    }

    #[test]
    fn test_tiles_for_exact_degree_bounds() {
        let tiles = tiles_for_bounds((8.0, 47.0, 9.0, 48.0)).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].to_string(), "+47+008");
    }
}
