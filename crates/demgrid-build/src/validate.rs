//! DSF validation: bounds extraction and structural roundtrips.

use crate::report::{TileReport, TileStatus};
use crate::{BuildError, Result};
use demgrid_tiles::{dsf_path, Tile};
use demgrid_tools::{dsf_to_text, text_to_dsf};
use rayon::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Validation modes for built DSFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Skip validation.
    None,
    /// Extract the header properties and verify the tile bounds.
    #[default]
    Bounds,
    /// Convert DSF to text and back, then verify bounds.
    Roundtrip,
}

impl FromStr for ValidationMode {
    type Err = BuildError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(ValidationMode::None),
            "bounds" => Ok(ValidationMode::Bounds),
            "roundtrip" => Ok(ValidationMode::Roundtrip),
            other => Err(BuildError::InvalidInput(format!(
                "unknown validation mode: {other}"
            ))),
        }
    }
}

/// Geographic bounds parsed from a DSF properties section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DsfBounds {
    /// West edge in degrees.
    pub west: f64,
    /// South edge in degrees.
    pub south: f64,
    /// East edge in degrees.
    pub east: f64,
    /// North edge in degrees.
    pub north: f64,
}

/// Extract `PROPERTY` lines from DSFTool text output.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if !line.starts_with("PROPERTY") {
            continue;
        }
        let mut parts = line.splitn(3, char::is_whitespace);
        parts.next();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            properties.insert(key.to_string(), value.trim().to_string());
        }
    }
    properties
}

/// Parse the four tile-bound properties.
pub fn parse_bounds(properties: &BTreeMap<String, String>) -> Result<DsfBounds> {
    let get = |key: &str| -> Result<f64> {
        properties
            .get(key)
            .ok_or_else(|| BuildError::InvalidInput(format!("missing DSF property {key}")))?
            .parse()
            .map_err(|_| BuildError::InvalidInput(format!("invalid DSF property {key}")))
    };
    Ok(DsfBounds {
        west: get("sim/west")?,
        south: get("sim/south")?,
        east: get("sim/east")?,
        north: get("sim/north")?,
    })
}

/// Expected DSF bounds for a tile.
pub fn expected_bounds(tile: Tile) -> DsfBounds {
    let (west, south, east, north) = tile.bounds();
    DsfBounds {
        west,
        south,
        east,
        north,
    }
}

/// Compare bounds within a tolerance; returns mismatch messages.
pub fn compare_bounds(expected: DsfBounds, actual: DsfBounds, tolerance: f64) -> Vec<String> {
    let mut mismatches = Vec::new();
    let mut check = |name: &str, want: f64, got: f64| {
        if (want - got).abs() > tolerance {
            mismatches.push(format!("{name} expected {want}, got {got}"));
        }
    };
    check("west", expected.west, actual.west);
    check("south", expected.south, actual.south);
    check("east", expected.east, actual.east);
    check("north", expected.north, actual.north);
    mismatches
}

/// Settings for one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    /// Validation mode.
    pub mode: ValidationMode,
    /// DSFTool argv vector.
    pub dsftool: Vec<String>,
    /// DSFTool timeout.
    pub timeout: Option<Duration>,
    /// DSFTool retries.
    pub retries: u32,
    /// Report bounds mismatches as warnings instead of errors.
    pub allow_bounds_warning: bool,
    /// Worker threads for the pass.
    pub workers: usize,
}

fn validate_one(
    settings: &ValidationSettings,
    output_dir: &Path,
    tile: Tile,
    entry: &mut TileReport,
) {
    if settings.mode == ValidationMode::None {
        return;
    }
    let dsf = dsf_path(output_dir, tile);
    if !dsf.exists() {
        entry
            .messages
            .push("DSF output not found; validation failed".to_string());
        entry.mark_error();
        return;
    }
    if settings.dsftool.is_empty() {
        entry
            .messages
            .push("DSFTool not configured; DSF validation skipped".to_string());
        entry.mark_warning();
        return;
    }
    let work_dir = output_dir.join("dsf_validation").join(tile.to_string());
    if let Err(err) = std::fs::create_dir_all(&work_dir) {
        entry.messages.push(format!("validation setup failed: {err}"));
        entry.mark_error();
        return;
    }
    let text_path = work_dir.join(format!("{tile}.txt"));
    if let Err(err) = dsf_to_text(
        &settings.dsftool,
        &dsf,
        &text_path,
        settings.timeout,
        settings.retries,
    ) {
        entry.messages.push(err.to_string());
        entry.mark_error();
        return;
    }
    if settings.mode == ValidationMode::Roundtrip {
        let rebuilt = work_dir.join(format!("{tile}.roundtrip.dsf"));
        if let Err(err) = text_to_dsf(
            &settings.dsftool,
            &text_path,
            &rebuilt,
            settings.timeout,
            settings.retries,
        ) {
            entry.messages.push(err.to_string());
            entry.mark_error();
            return;
        }
        let intact = std::fs::metadata(&rebuilt).map(|m| m.len() > 0).unwrap_or(false);
        if !intact {
            entry
                .messages
                .push("roundtrip produced an empty DSF".to_string());
            entry.mark_error();
            return;
        }
        entry
            .metrics
            .insert("dsf_roundtrip".to_string(), json!({ "status": "ok" }));
    }
    let text = match std::fs::read_to_string(&text_path) {
        Ok(text) => text,
        Err(err) => {
            entry.messages.push(format!("cannot read DSF text: {err}"));
            entry.mark_error();
            return;
        }
    };
    let properties = parse_properties(&text);
    let actual = match parse_bounds(&properties) {
        Ok(bounds) => bounds,
        Err(err) => {
            entry.messages.push(format!("DSF bounds parse failed: {err}"));
            entry.mark_error();
            return;
        }
    };
    let expected = expected_bounds(tile);
    let mismatches = compare_bounds(expected, actual, 1e-6);
    entry.metrics.insert(
        "dsf_bounds".to_string(),
        json!({
            "expected": { "west": expected.west, "south": expected.south, "east": expected.east, "north": expected.north },
            "actual": { "west": actual.west, "south": actual.south, "east": actual.east, "north": actual.north },
            "mismatches": mismatches,
        }),
    );
    if !mismatches.is_empty() {
        entry
            .messages
            .push(format!("DSF bounds mismatch: {}", mismatches.join(", ")));
        if settings.allow_bounds_warning {
            entry.mark_warning();
        } else {
            entry.mark_error();
        }
    }
}

/// Validate a set of tiles in parallel on a bounded pool.
pub fn validate_tiles(
    settings: &ValidationSettings,
    output_dir: &Path,
    entries: &mut [(Tile, TileReport)],
) -> Result<()> {
    if settings.mode == ValidationMode::None {
        return Ok(());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.workers.max(1))
        .build()
        .map_err(|err| BuildError::InvalidInput(format!("validation pool: {err}")))?;
    pool.install(|| {
        entries.par_iter_mut().for_each(|(tile, entry)| {
            if entry.status == TileStatus::Error || entry.status == TileStatus::Skipped {
                return;
            }
            validate_one(settings, output_dir, *tile, entry);
        });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
A
800
DSF2TEXT

PROPERTY sim/west 8
PROPERTY sim/south 47
PROPERTY sim/east 9
PROPERTY sim/north 48
PROPERTY sim/planet earth
";

    #[test]
    fn test_parse_properties() {
        let properties = parse_properties(SAMPLE);
        assert_eq!(properties.get("sim/west").unwrap(), "8");
        assert_eq!(properties.get("sim/planet").unwrap(), "earth");
    }

    #[test]
    fn test_parse_and_compare_bounds() {
        let properties = parse_properties(SAMPLE);
        let bounds = parse_bounds(&properties).unwrap();
        let tile: Tile = "+47+008".parse().unwrap();
        assert!(compare_bounds(expected_bounds(tile), bounds, 1e-6).is_empty());
        let wrong: Tile = "+46+008".parse().unwrap();
        let mismatches = compare_bounds(expected_bounds(wrong), bounds, 1e-6);
        assert_eq!(mismatches.len(), 2);
    }

    #[test]
    fn test_missing_bounds_property() {
        let properties = parse_properties("PROPERTY sim/west 8\n");
        assert!(parse_bounds(&properties).is_err());
    }

    #[test]
    fn test_validation_mode_parse() {
        assert_eq!("bounds".parse::<ValidationMode>().unwrap(), ValidationMode::Bounds);
        assert_eq!("none".parse::<ValidationMode>().unwrap(), ValidationMode::None);
        assert!("full".parse::<ValidationMode>().is_err());
    }

    #[test]
    fn test_missing_dsf_marks_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = ValidationSettings {
            mode: ValidationMode::Bounds,
            dsftool: vec!["true".to_string()],
            timeout: None,
            retries: 0,
            allow_bounds_warning: false,
            workers: 1,
        };
        let tile: Tile = "+47+008".parse().unwrap();
        let mut entries = vec![(tile, TileReport::new("+47+008"))];
        validate_tiles(&settings, dir.path(), &mut entries).unwrap();
        assert_eq!(entries[0].1.status, TileStatus::Error);
    }
}
