//! Error types for tile and CRS operations.

use thiserror::Error;

/// Errors raised by tile parsing and CRS transforms.
#[derive(Debug, Error)]
pub enum TileError {
    /// Tile name does not match the `[+-]DD[+-]DDD` shape or is out of range.
    #[error("Invalid tile name: {0}")]
    InvalidTileName(String),

    /// Latitude outside [-90, 89] or longitude outside [-180, 179].
    #[error("Tile coordinates out of range: lat {lat}, lon {lon}")]
    OutOfRange {
        /// Requested latitude.
        lat: i32,
        /// Requested longitude.
        lon: i32,
    },

    /// CRS string could not be resolved to a known definition.
    #[error("Unknown CRS: {0}")]
    UnknownCrs(String),

    /// Target CRS is projected; the tile grid is geographic-degrees only.
    #[error("Unsupported target CRS {0}: tile grids require a geographic CRS (EPSG:4326 or EPSG:4258)")]
    UnsupportedTargetCrs(String),

    /// Projection machinery rejected the definition or the coordinates.
    #[error("Projection error: {0}")]
    Projection(String),
}
