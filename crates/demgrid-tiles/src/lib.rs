//! # demgrid-tiles
//!
//! Tile naming, scenery path algebra, and CRS transforms for the demgrid
//! build pipeline.
//!
//! X-Plane scenery is organized in 1x1 degree tiles named after their
//! south-west corner (`+47+008`), grouped into 10x10 degree bucket folders
//! (`+40+000`). Every path to a DSF or staged elevation file in the rest of
//! the workspace is built through this crate; nothing else splices tile
//! strings by hand.
//!
//! ## Example
//!
//! ```
//! use demgrid_tiles::Tile;
//!
//! let tile: Tile = "+47+008".parse()?;
//! assert_eq!(tile.bucket().to_string(), "+40+000");
//! assert_eq!(tile.bounds(), (8.0, 47.0, 9.0, 48.0));
//! # Ok::<(), demgrid_tiles::TileError>(())
//! ```

mod crs;
mod error;
mod paths;
mod tile;

pub use crs::{transform_bounds, transform_point, validate_target_crs, CrsDef};
pub use error::TileError;
pub use paths::{dsf_path, elevation_data_path, tile_from_dsf_path};
pub use tile::{tiles_for_bounds, Bounds, Bucket, Tile};

/// Result type for tile operations.
pub type Result<T> = std::result::Result<T, TileError>;
