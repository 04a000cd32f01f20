//! Error types for DEM raster processing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when normalizing DEM data.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a raster.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF codec error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// GeoTIFF is missing georeferencing tags or has inconsistent metadata.
    #[error("Invalid GeoTIFF {path}: {reason}")]
    InvalidGeoTiff {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// DEM does not declare a CRS and one is required.
    #[error("DEM is missing a CRS: {0}")]
    MissingCrs(PathBuf),

    /// Tile or CRS level failure.
    #[error(transparent)]
    Tile(#[from] demgrid_tiles::TileError),

    /// Caller input rejected before any tile work started.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A stack layer declares an AOI but no nodata value is resolvable.
    #[error("Stack layer {0} has an AOI mask but no resolvable nodata value")]
    AoiWithoutNodata(PathBuf),

    /// Unknown resampling kernel, fill strategy, or mosaic strategy name.
    #[error("Unknown {kind}: {value}")]
    UnknownName {
        /// What category the name belongs to.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// JSON parse failure in a stack or cache document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache entry exists but is partial or does not match its metadata.
    #[error("Cache entry inconsistent: {0}")]
    CacheInconsistency(String),

    /// Warp, mosaic, or fill failed for a tile.
    #[error("Normalization failed: {0}")]
    Normalization(String),
}

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
