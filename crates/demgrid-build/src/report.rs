//! Build plan, config lock, and build report documents.
//!
//! All three are JSON with a `schema_version`, written atomically via a
//! temp file plus rename. Deterministic mode omits `created_at` and every
//! other non-input-derived timestamp; maps are `BTreeMap` throughout so
//! key order is stable.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema version shared by plan, lock, and report documents.
pub const SCHEMA_VERSION: &str = "1.1";

/// Per-tile terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileStatus {
    /// Built and validated.
    Ok,
    /// Built with warnings.
    Warning,
    /// Failed.
    Error,
    /// Not attempted (dry run, resume hit, or upstream failure).
    Skipped,
}

/// One tile's entry in the build report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileReport {
    /// Tile id.
    pub tile: String,
    /// Terminal status.
    pub status: TileStatus,
    /// Human-readable messages in emission order.
    #[serde(default)]
    pub messages: Vec<String>,
    /// Structured metrics (coverage, validation, runner command, ...).
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl TileReport {
    /// Fresh entry with `ok` status.
    pub fn new(tile: &str) -> Self {
        TileReport {
            tile: tile.to_string(),
            status: TileStatus::Ok,
            messages: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Demote `ok` to `warning`, leaving `error` untouched.
    pub fn mark_warning(&mut self) {
        if self.status == TileStatus::Ok {
            self.status = TileStatus::Warning;
        }
    }

    /// Force status to `error`.
    pub fn mark_error(&mut self) {
        self.status = TileStatus::Error;
    }
}

/// Backend identity echoed into plans and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend name.
    pub name: String,
    /// Targeted backend version.
    pub version: String,
}

/// Resolved external tool commands as argv vectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanCommands {
    /// Runner command.
    #[serde(default)]
    pub runner: Vec<String>,
    /// DSFTool command.
    #[serde(default)]
    pub dsftool: Vec<String>,
}

/// Pre-run build plan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Document schema version.
    pub schema_version: String,
    /// Creation timestamp; omitted in deterministic mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Input DEMs and stack descriptor.
    pub inputs: PlanInputs,
    /// Tiles to build.
    pub tiles: Vec<String>,
    /// Backend identity.
    pub backend: BackendInfo,
    /// Resolved tool command vectors.
    pub commands: PlanCommands,
    /// Full option snapshot.
    pub options: serde_json::Value,
    /// Provenance block (fingerprints, versions, drift).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<serde_json::Value>,
}

/// Inputs block of the build plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanInputs {
    /// DEM source paths.
    pub dems: Vec<String>,
    /// DEM stack descriptor, when stacked input is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dem_stack: Option<serde_json::Value>,
}

/// Post-run build report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Document schema version.
    pub schema_version: String,
    /// Creation timestamp; omitted in deterministic mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Backend identity.
    pub backend: BackendInfo,
    /// Per-tile entries.
    pub tiles: Vec<TileReport>,
    /// Artifact pointers (scenery dir, DSF paths, event logs).
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
    /// Build-level warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Build-level errors.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Provenance block, mirrored from the plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<serde_json::Value>,
}

impl BuildReport {
    /// Entry for a tile, if present.
    pub fn tile(&self, tile: &str) -> Option<&TileReport> {
        self.tiles.iter().find(|entry| entry.tile == tile)
    }
}

/// Locked, replayable merge of CLI and config-file inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfigLock {
    /// Document schema version.
    pub schema_version: String,
    /// Creation timestamp; omitted in deterministic mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Normalized option snapshot for exact replay.
    pub options: serde_json::Value,
}

/// Write a JSON document atomically (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    use std::io::Write;
    writeln!(tmp)?;
    tmp.persist(path)
        .map_err(|err| std::io::Error::from(err.error))?;
    Ok(())
}

/// Read a build report, if one exists.
pub fn load_report(path: &Path) -> Option<BuildReport> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Current UTC timestamp unless deterministic mode suppresses it.
pub fn timestamp(stable_metadata: bool) -> Option<String> {
    if stable_metadata {
        None
    } else {
        Some(chrono::Utc::now().to_rfc3339())
    }
}

/// Orchestrator exit code for a finished build.
///
/// `0` success, `2` at least one tile failed, `3` all tiles failed.
pub fn exit_code_for(report: &BuildReport) -> i32 {
    let total = report.tiles.len();
    let failed = report
        .tiles
        .iter()
        .filter(|tile| tile.status == TileStatus::Error)
        .count();
    if failed == 0 {
        0
    } else if failed == total && total > 0 {
        3
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_report(statuses: &[TileStatus]) -> BuildReport {
        BuildReport {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: None,
            backend: BackendInfo {
                name: "ortho4xp".to_string(),
                version: "1.40".to_string(),
            },
            tiles: statuses
                .iter()
                .enumerate()
                .map(|(index, status)| {
                    let mut entry = TileReport::new(&format!("+4{index}+008"));
                    entry.status = *status;
                    entry
                })
                .collect(),
            artifacts: BTreeMap::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            provenance: None,
        }
    }

    #[test]
    fn test_atomic_write_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/build_report.json");
        let report = sample_report(&[TileStatus::Ok]);
        write_json_atomic(&path, &report).unwrap();
        let loaded = load_report(&path).unwrap();
        assert_eq!(loaded.tiles.len(), 1);
        assert_eq!(loaded.tiles[0].status, TileStatus::Ok);
    }

    #[test]
    fn test_deterministic_mode_omits_created_at() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        let mut report = sample_report(&[TileStatus::Ok]);
        report.created_at = timestamp(true);
        write_json_atomic(&path, &report).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("created_at"));
        // Two deterministic writes are byte-identical.
        let path2 = dir.path().join("report2.json");
        write_json_atomic(&path2, &report).unwrap();
        assert_eq!(text, std::fs::read_to_string(&path2).unwrap());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&sample_report(&[TileStatus::Ok, TileStatus::Warning])), 0);
        assert_eq!(exit_code_for(&sample_report(&[TileStatus::Ok, TileStatus::Error])), 2);
        assert_eq!(exit_code_for(&sample_report(&[TileStatus::Error, TileStatus::Error])), 3);
    }

    #[test]
    fn test_status_transitions() {
        let mut entry = TileReport::new("+47+008");
        entry.mark_warning();
        assert_eq!(entry.status, TileStatus::Warning);
        entry.mark_error();
        assert_eq!(entry.status, TileStatus::Error);
        // Error never demotes back to warning.
        entry.mark_warning();
        assert_eq!(entry.status, TileStatus::Error);
    }
}
