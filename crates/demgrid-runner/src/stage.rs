//! Staging normalized tile DEMs into the backend's elevation folder.

use crate::{Result, RunnerError};
use demgrid_tiles::{elevation_data_path, Tile};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Copy a tile DEM into the backend's `Elevation_data/<bucket>/` folder.
///
/// Every stale file sharing the tile's cardinal-letter stem is removed
/// first, whatever its extension; a `.hgt` left over from an earlier run
/// must not shadow the freshly staged `.tif`.
pub fn stage_tile_dem(backend_root: &Path, tile: Tile, dem_path: &Path) -> Result<PathBuf> {
    if !dem_path.is_file() {
        return Err(RunnerError::DemNotFound(dem_path.to_path_buf()));
    }
    let suffix = dem_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let destination = elevation_data_path(backend_root, tile, &suffix);
    let parent = destination
        .parent()
        .expect("elevation path always has a parent");
    std::fs::create_dir_all(parent)?;
    let stem_prefix = format!("{}.", tile.hgt_name());
    for entry in std::fs::read_dir(parent)?.flatten() {
        let path = entry.path();
        if path == destination {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&stem_prefix) && path.is_file() {
            debug!(stale = %path.display(), "removing stale staged DEM");
            std::fs::remove_file(&path)?;
        }
    }
    std::fs::copy(dem_path, &destination)?;
    Ok(destination)
}
