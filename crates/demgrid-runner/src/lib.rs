//! # demgrid-runner
//!
//! Per-tile orchestration of the external mesh-generation backend: DEM
//! staging with stale-file cleanup, global config patch and guaranteed
//! restore, argv construction that preserves wrapper prefixes, streamed
//! output capture parsed into structured milestone events, and a retry
//! ladder for recognized transient triangulation failures.

mod error;
mod events;
mod orchestrator;
mod stage;

pub use error::RunnerError;
pub use events::{
    classify_line, AttemptEvents, EventKind, RunnerEvent, TileEventLog, EVENTS_SCHEMA_VERSION,
};
pub use orchestrator::{run_tile, AttemptRecord, RunnerJob, RunnerOutcome, RunnerStatus};
pub use stage::stage_tile_dem;

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
