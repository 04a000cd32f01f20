//! Error types for runner orchestration.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while driving the mesh-generation backend.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// I/O failure staging files or writing logs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tool invocation plumbing failed.
    #[error(transparent)]
    Tool(#[from] demgrid_tools::ToolError),

    /// JSON serialization of logs or events failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runner command vector is missing or empty.
    #[error("Runner command not configured")]
    RunnerNotConfigured,

    /// Tile DEM to stage does not exist.
    #[error("Tile DEM not found: {0}")]
    DemNotFound(PathBuf),

    /// Cancellation was requested before or during the run.
    #[error("Run cancelled")]
    Cancelled,
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
