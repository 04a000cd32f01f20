//! Density presets and triangle-count guardrails.

use crate::{BuildError, Result};
use demgrid_dem::DemInfo;
use std::collections::BTreeMap;

/// Mesh density presets exposed to users.
pub const DENSITY_PRESETS: [&str; 4] = ["low", "medium", "high", "ultra"];

/// Backend config values for a density preset.
pub fn backend_config_for_preset(preset: &str) -> Result<BTreeMap<String, String>> {
    let (curvature_tol, mesh_zl) = match preset {
        "low" => (3.0, 16),
        "medium" => (2.0, 17),
        "high" => (1.0, 18),
        "ultra" => (0.5, 19),
        other => {
            return Err(BuildError::InvalidInput(format!(
                "unknown density preset: {other}"
            )))
        }
    };
    let mut config = BTreeMap::new();
    config.insert("curvature_tol".to_string(), format!("{curvature_tol}"));
    config.insert("mesh_zl".to_string(), format!("{mesh_zl}"));
    Ok(config)
}

/// Triangle warning and hard limits per density preset.
pub fn triangle_limits_for_preset(preset: &str) -> Result<(u64, u64)> {
    match preset {
        "low" => Ok((1_000_000, 3_000_000)),
        "medium" => Ok((1_500_000, 5_000_000)),
        "high" => Ok((2_500_000, 7_500_000)),
        "ultra" => Ok((4_000_000, 12_000_000)),
        other => Err(BuildError::InvalidInput(format!(
            "unknown density preset: {other}"
        ))),
    }
}

/// Upper-bound triangle estimate from the tile DEM grid.
///
/// Two triangles per interior grid cell; the mesher will do better, so
/// this is a conservative guardrail, not a prediction.
pub fn estimate_triangles(info: &DemInfo) -> u64 {
    let cols = info.width.saturating_sub(1) as u64;
    let rows = info.height.saturating_sub(1) as u64;
    cols * rows * 2
}
