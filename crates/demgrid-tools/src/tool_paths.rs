//! Tool discovery configuration.
//!
//! External tools are configured as argv vectors in a JSON file; single
//! strings are accepted and promoted to one-element vectors. Discovery
//! order: explicit path, `DEMGRID_TOOL_PATHS` env var, then
//! `tools/tool_paths.json` under the working directory.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the tool paths file.
pub const ENV_TOOL_PATHS: &str = "DEMGRID_TOOL_PATHS";

/// Argv vector that also deserializes from a bare string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ToolCommand(pub Vec<String>);

impl ToolCommand {
    /// True when no command is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The argv slice.
    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ToolCommand {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(single) => ToolCommand(vec![single]),
            Repr::Many(many) => ToolCommand(many),
        })
    }
}

/// Configured external tool commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    /// DSFTool command.
    pub dsftool: ToolCommand,
    /// DDSTool command.
    pub ddstool: ToolCommand,
    /// Mesh-generation runner command.
    pub runner: ToolCommand,
    /// 7z executable command.
    pub sevenzip: ToolCommand,
}

impl ToolPaths {
    /// Load from an explicit file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load using the discovery order; absent everywhere yields defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(env_path) = std::env::var(ENV_TOOL_PATHS) {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Self::load(&path);
            }
        }
        let cwd_candidate = PathBuf::from("tools").join("tool_paths.json");
        if cwd_candidate.exists() {
            return Self::load(&cwd_candidate);
        }
        Ok(ToolPaths::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_argv_vectors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tool_paths.json");
        std::fs::write(
            &path,
            r#"{
                "dsftool": ["/opt/xptools/DSFTool"],
                "runner": ["python3", "/opt/runner/mesh_runner.py"],
                "sevenzip": "7z"
            }"#,
        )
        .unwrap();
        let tools = ToolPaths::load(&path).unwrap();
        assert_eq!(tools.dsftool.argv(), ["/opt/xptools/DSFTool"]);
        assert_eq!(tools.runner.argv(), ["python3", "/opt/runner/mesh_runner.py"]);
        // Bare strings promote to one-element vectors.
        assert_eq!(tools.sevenzip.argv(), ["7z"]);
        assert!(tools.ddstool.is_empty());
    }

    #[test]
    fn test_discover_defaults_when_missing() {
        let tools = ToolPaths::discover(None).unwrap();
        let _ = tools; // no panic, defaults are acceptable
    }
}
