//! Scenery path algebra for DSF and staged elevation files.

use crate::tile::Tile;
use std::path::{Path, PathBuf};

/// Expected DSF path beneath a scenery root.
///
/// Always `<root>/Earth nav data/<bucket>/<tile>.dsf`.
pub fn dsf_path(root: &Path, tile: Tile) -> PathBuf {
    root.join("Earth nav data")
        .join(tile.bucket().to_string())
        .join(format!("{tile}.dsf"))
}

/// Expected staged elevation path beneath an Ortho4XP-style root.
///
/// Elevation files use the cardinal-letter name (`N47E008`) plus the suffix
/// of the staged DEM, e.g. `<root>/Elevation_data/+40+000/N47E008.tif`.
pub fn elevation_data_path(root: &Path, tile: Tile, suffix: &str) -> PathBuf {
    root.join("Elevation_data")
        .join(tile.bucket().to_string())
        .join(format!("{}{}", tile.hgt_name(), suffix))
}

/// Recover the tile from a DSF path, if the filename is a tile name.
pub fn tile_from_dsf_path(path: &Path) -> Option<Tile> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsf_path_uses_bucket() {
        let tile: Tile = "-03+017".parse().unwrap();
        let path = dsf_path(Path::new("/out"), tile);
        assert_eq!(
            path,
            Path::new("/out/Earth nav data/-10+010/-03+017.dsf")
        );
    }

    #[test]
    fn test_elevation_path_uses_hgt_name() {
        let tile: Tile = "+47+008".parse().unwrap();
        let path = elevation_data_path(Path::new("/ortho"), tile, ".tif");
        assert_eq!(
            path,
            Path::new("/ortho/Elevation_data/+40+000/N47E008.tif")
        );
    }

    #[test]
    fn test_tile_from_dsf_path() {
        let path = Path::new("/out/Earth nav data/+40+000/+47+008.dsf");
        assert_eq!(tile_from_dsf_path(path).unwrap().to_string(), "+47+008");
        assert!(tile_from_dsf_path(Path::new("/out/readme.txt")).is_none());
    }
}
