//! Error types for external tool plumbing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised when driving external tools.
#[derive(Debug, Error)]
pub enum ToolError {
    /// I/O failure launching or talking to a process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Empty or unresolvable command vector.
    #[error("Invalid tool command: {0}")]
    InvalidCommand(String),

    /// Tool exited non-zero after all retries.
    #[error("{tool} failed with exit code {code}: {detail}")]
    CommandFailed {
        /// Tool name for the message.
        tool: String,
        /// Exit code (124 when timed out).
        code: i32,
        /// Trailing stderr or a hint.
        detail: String,
    },

    /// JSON parse failure in a tool paths file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Zip archive error.
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Archive suffix not recognized.
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),

    /// Archive member would escape the extraction destination.
    #[error("Archive member escapes destination: {0}")]
    UnsafeArchivePath(String),
}

/// Result type for tool operations.
pub type Result<T> = std::result::Result<T, ToolError>;
