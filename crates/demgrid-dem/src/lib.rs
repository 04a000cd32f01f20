//! # demgrid-dem
//!
//! DEM raster normalization for the demgrid build pipeline.
//!
//! This crate turns heterogeneous elevation inputs into canonical per-tile
//! GeoTIFF artifacts: sources are decoded, warped to the geographic target
//! CRS, merged (flat mosaic or prioritized stack with AOI masks), clipped
//! into 1x1 degree tile grids, void-filled, remapped to the backend's
//! nodata profile, and written with full georeferencing tags. A
//! content-addressed cache keyed on inputs plus options lets repeat builds
//! skip all of it.
//!
//! ## Example
//!
//! ```no_run
//! use demgrid_dem::{NormalizeOptions, Normalizer};
//! use std::path::{Path, PathBuf};
//!
//! let normalizer = Normalizer::from_paths(
//!     &[PathBuf::from("srtm_38_03.tif")],
//!     NormalizeOptions::default(),
//! )?;
//! let tile: demgrid_tiles::Tile = "+47+008".parse()?;
//! let (result, metrics) = normalizer.normalize_tile(tile, Path::new("+47+008.tif"))?;
//! println!("coverage {:.1}%, nodata {:?}", metrics.coverage_after * 100.0, result.nodata);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod aoi;
mod cache;
mod coverage;
mod error;
mod fill;
mod geotiff;
mod grid;
mod mask;
mod mosaic;
mod pipeline;
mod profile;
mod stack;
mod tiling;
mod warp;

pub use aoi::{apply_aoi_mask, load_aoi, Aoi, AoiPolygon};
pub use cache::{
    fingerprint_paths, nodata_policy_string, CacheEntry, CacheKeyInputs, CacheVerify,
    CachedArtifact, NormalizationCache, SourceFingerprint, CACHE_VERSION,
};
pub use coverage::{coverage_of, coverage_of_file, CoverageMetrics, CoverageStats};
pub use error::DemError;
pub use fill::{fill_constant, fill_fallback, fill_interpolate, FillResult, FillStrategy};
pub use geotiff::{
    inspect_dem, read_geotiff, read_geotiff_with_crs, write_geotiff, DemInfo, TiffCompression,
};
pub use grid::{RasterGrid, Resampling, Sampler};
pub use mask::{count_nodata, is_nodata};
pub use mosaic::{MosaicStrategy, VirtualMosaic};
pub use pipeline::{NormalizeOptions, Normalizer};
pub use profile::{apply_backend_profile, BackendProfile};
pub use stack::{load_dem_stack, DemLayer, DemStack};
pub use tiling::{clip_tile, write_tile_dem, TileResult};
pub use warp::{warp_into, warp_to_crs};

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
