//! # demgrid-build
//!
//! Build orchestration for demgrid: input validation, the bounded-pool
//! tile scheduler with resume and cancellation, DSF validation, XP12
//! raster enrichment, plan/lock/report writing with provenance, and
//! patch rebuilds over an existing build tree.

mod density;
mod enrich;
mod error;
mod options;
mod patch;
mod provenance;
mod report;
mod scheduler;
mod validate;

pub use density::{
    backend_config_for_preset, estimate_triangles, triangle_limits_for_preset, DENSITY_PRESETS,
};
pub use enrich::{
    enrich_dsf_rasters, find_reference_dsf, inventory_dsf_rasters, parse_raster_names,
    summarize_rasters, EnrichmentResult, EnrichmentStatus, RasterSummary, XP12_SEASON_EXPECTED,
};
pub use error::BuildError;
pub use options::{BuildOptions, ResumeMode};
pub use patch::{load_patch_plan, run_patch, PatchEntry, PatchPlan, PatchReport};
pub use provenance::{
    build_provenance, load_pinned_versions, version_matches, ENV_PINNED_VERSIONS,
    PROVENANCE_LEVELS,
};
pub use report::{
    exit_code_for, load_report, timestamp, write_json_atomic, BackendInfo, BuildConfigLock,
    BuildPlan, BuildReport, PlanCommands, PlanInputs, TileReport, TileStatus, SCHEMA_VERSION,
};
pub use scheduler::{run_build, BuildInput, BuildOutcome};
pub use validate::{
    compare_bounds, expected_bounds, parse_bounds, parse_properties, validate_tiles, DsfBounds,
    ValidationMode, ValidationSettings,
};

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
