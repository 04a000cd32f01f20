//! # demgrid-tools
//!
//! External tool plumbing for the demgrid build pipeline: a uniform
//! argv-vector subprocess contract with streamed capture and watchdogs,
//! DSFTool wrappers, backend config patch/restore behind a process-wide
//! lock, tool path discovery, and traversal-safe archive extraction.

mod backend_config;
mod command;
mod dsftool;
mod error;
mod extract;
mod tool_paths;

pub use backend_config::{
    config_diff, parse_config_values, patch_config, read_config_values, ConfigDiffEntry,
    ConfigGuard, ConfigSnapshot,
};
pub use command::{
    resolve_script_prefix, run_command, CancelToken, CommandOutput, RingBuffer, RunOptions,
    StreamKind, TIMEOUT_EXIT_CODE,
};
pub use dsftool::{
    dsf_is_7z, dsf_to_text, dsftool_7z_hint, dsftool_version, roundtrip_dsf, run_dsftool,
    text_to_dsf, DsftoolResult,
};
pub use error::ToolError;
pub use extract::extract_archive;
pub use tool_paths::{ToolCommand, ToolPaths, ENV_TOOL_PATHS};

/// Result type for tool operations.
pub type Result<T> = std::result::Result<T, ToolError>;
