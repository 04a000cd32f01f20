//! Error types for build orchestration.

use thiserror::Error;

/// Errors raised while planning or running a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// I/O failure on plans, reports, or artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// DEM normalization failure that is not tile-isolated.
    #[error(transparent)]
    Dem(#[from] demgrid_dem::DemError),

    /// Tile or CRS failure.
    #[error(transparent)]
    Tile(#[from] demgrid_tiles::TileError),

    /// Tool plumbing failure.
    #[error(transparent)]
    Tool(#[from] demgrid_tools::ToolError),

    /// Runner orchestration failure.
    #[error(transparent)]
    Runner(#[from] demgrid_runner::RunnerError),

    /// Inputs rejected before any tile ran.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The build was cancelled.
    #[error("Build cancelled")]
    Cancelled,
}

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
