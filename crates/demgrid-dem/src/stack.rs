//! DEM stack definitions: priority-ordered layers with AOI masks.

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Single DEM layer entry in a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemLayer {
    /// DEM file path.
    #[serde(alias = "dem")]
    pub path: PathBuf,
    /// Blend priority; higher priority overwrites where it has data.
    #[serde(default)]
    pub priority: i32,
    /// Optional AOI polygon restricting where the layer applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aoi: Option<PathBuf>,
    /// Per-layer nodata sentinel override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
}

/// Ordered set of DEM layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemStack {
    /// Layers in input order.
    pub layers: Vec<DemLayer>,
}

impl DemStack {
    /// Layers sorted ascending by priority (lowest first, so later
    /// overlays win).
    pub fn sorted_layers(&self) -> Vec<DemLayer> {
        let mut layers = self.layers.clone();
        layers.sort_by_key(|layer| layer.priority);
        layers
    }

    /// Plan-time validation: any layer with an AOI must have a resolvable
    /// nodata sentinel, either its own or the global default.
    pub fn validate(&self, default_nodata: Option<f64>) -> Result<()> {
        if self.layers.is_empty() {
            return Err(DemError::InvalidInput(
                "DEM stack requires a non-empty layers list".into(),
            ));
        }
        for layer in &self.layers {
            if layer.aoi.is_some() && layer.nodata.or(default_nodata).is_none() {
                return Err(DemError::AoiWithoutNodata(layer.path.clone()));
            }
        }
        Ok(())
    }
}

/// Parse a DEM stack definition from JSON.
pub fn load_dem_stack(path: &Path) -> Result<DemStack> {
    let text = std::fs::read_to_string(path)?;
    let stack: DemStack = serde_json::from_str(&text)?;
    if stack.layers.is_empty() {
        return Err(DemError::InvalidInput(
            "DEM stack requires a non-empty layers list".into(),
        ));
    }
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_stack() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.json");
        std::fs::write(
            &path,
            r#"{"layers": [
                {"path": "base.tif", "priority": 0},
                {"dem": "detail.tif", "priority": 10, "aoi": "city.geojson", "nodata": -32768}
            ]}"#,
        )
        .unwrap();
        let stack = load_dem_stack(&path).unwrap();
        assert_eq!(stack.layers.len(), 2);
        assert_eq!(stack.layers[1].path, PathBuf::from("detail.tif"));
        assert_eq!(stack.layers[1].nodata, Some(-32768.0));
    }

    #[test]
    fn test_sorted_layers_ascending() {
        let stack = DemStack {
            layers: vec![
                DemLayer {
                    path: "high.tif".into(),
                    priority: 5,
                    aoi: None,
                    nodata: None,
                },
                DemLayer {
                    path: "low.tif".into(),
                    priority: -1,
                    aoi: None,
                    nodata: None,
                },
            ],
        };
        let sorted = stack.sorted_layers();
        assert_eq!(sorted[0].path, PathBuf::from("low.tif"));
        assert_eq!(sorted[1].path, PathBuf::from("high.tif"));
    }

    #[test]
    fn test_aoi_requires_nodata() {
        let stack = DemStack {
            layers: vec![DemLayer {
                path: "masked.tif".into(),
                priority: 0,
                aoi: Some("aoi.geojson".into()),
                nodata: None,
            }],
        };
        assert!(matches!(
            stack.validate(None),
            Err(DemError::AoiWithoutNodata(_))
        ));
        // A global default sentinel satisfies the invariant.
        assert!(stack.validate(Some(-32768.0)).is_ok());
    }

    #[test]
    fn test_empty_stack_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"layers": []}"#).unwrap();
        assert!(load_dem_stack(&path).is_err());
    }
}
