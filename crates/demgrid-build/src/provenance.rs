//! Provenance blocks for build plans and reports.
//!
//! Basic mode fingerprints inputs by size and mtime; strict mode adds
//! SHA-256 digests and probes tool versions. Pinned versions, when
//! configured, produce a drift list instead of hard failures.

use crate::options::BuildOptions;
use crate::Result;
use demgrid_dem::SourceFingerprint;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming a pinned-versions JSON file.
pub const ENV_PINNED_VERSIONS: &str = "DEMGRID_PINNED_VERSIONS";

/// Provenance levels accepted by the options.
pub const PROVENANCE_LEVELS: [&str; 2] = ["basic", "strict"];

fn file_fingerprint(path: &Path, strict: bool) -> Value {
    match SourceFingerprint::from_path(path, strict) {
        Ok(fingerprint) => serde_json::to_value(fingerprint).unwrap_or(Value::Null),
        Err(err) => json!({ "path": path.to_string_lossy(), "error": err.to_string() }),
    }
}

/// Load pinned versions from an explicit path or the environment.
pub fn load_pinned_versions(
    explicit: Option<&Path>,
) -> (BTreeMap<String, String>, Option<String>) {
    let candidate: Option<PathBuf> = explicit.map(Path::to_path_buf).or_else(|| {
        std::env::var(ENV_PINNED_VERSIONS)
            .ok()
            .map(PathBuf::from)
    });
    let Some(path) = candidate else {
        return (BTreeMap::new(), None);
    };
    let source = Some(path.to_string_lossy().into_owned());
    let Ok(text) = std::fs::read_to_string(&path) else {
        return (BTreeMap::new(), source);
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&text) {
        Ok(map) => (map, source),
        Err(_) => (BTreeMap::new(), source),
    }
}

fn parse_version(value: &str) -> Option<Vec<u32>> {
    let digits: Vec<u32> = value
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .take(3)
        .filter_map(|part| part.parse().ok())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Compare a pinned spec (`X.Y` exact prefix, `X.Y+` minimum) against an
/// observed version. `None` when either side is unparseable.
pub fn version_matches(pinned: &str, observed: &str) -> Option<bool> {
    if let Some(minimum) = pinned.strip_suffix('+') {
        let minimum = parse_version(minimum)?;
        let observed = parse_version(observed)?;
        return Some(observed >= minimum);
    }
    let pinned_version = parse_version(pinned)?;
    let observed_version = parse_version(observed)?;
    Some(observed_version.get(..pinned_version.len()) == Some(&pinned_version[..]))
}

fn command_info(command: &[String]) -> Option<Value> {
    if command.is_empty() {
        return None;
    }
    let mut info = json!({ "command": command });
    for token in command.iter().rev() {
        let candidate = PathBuf::from(token);
        if candidate.exists() {
            info["resolved_path"] = Value::from(candidate.to_string_lossy().into_owned());
            break;
        }
    }
    Some(info)
}

/// Build the provenance block and any drift warnings.
pub fn build_provenance(
    options: &BuildOptions,
    dem_paths: &[PathBuf],
    runner_cmd: &[String],
    dsftool_cmd: &[String],
) -> Result<(Value, Vec<String>)> {
    let strict = options.provenance_level == "strict";

    let mut inputs = json!({
        "dems": dem_paths.iter().map(|p| file_fingerprint(p, strict)).collect::<Vec<_>>(),
    });
    if !options.fallback_dems.is_empty() {
        inputs["fallback_dems"] = options
            .fallback_dems
            .iter()
            .map(|p| file_fingerprint(p, strict))
            .collect::<Vec<_>>()
            .into();
    }

    let mut tools = serde_json::Map::new();
    if let Some(info) = command_info(runner_cmd) {
        tools.insert("runner".to_string(), info);
    }
    if let Some(mut info) = command_info(dsftool_cmd) {
        if strict {
            if let Some((major, minor, patch)) = demgrid_tools::dsftool_version(dsftool_cmd) {
                info["version"] = Value::from(format!("{major}.{minor}.{patch}"));
            }
        }
        tools.insert("dsftool".to_string(), info);
    }

    let environment = json!({
        "demgrid_version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    });

    let mut provenance = json!({
        "level": options.provenance_level,
        "stable_metadata": options.stable_metadata,
        "inputs": inputs,
        "tools": Value::Object(tools),
        "environment": environment,
        "assumptions": { "vertical_units": "meters", "vertical_datum": "recorded, not transformed" },
    });

    let mut warnings = Vec::new();
    let (pinned, source) = load_pinned_versions(options.pinned_versions_path.as_deref());
    if !pinned.is_empty() {
        let mut observed: BTreeMap<String, String> = BTreeMap::new();
        observed.insert("demgrid".to_string(), env!("CARGO_PKG_VERSION").to_string());
        if let Some(version) = provenance["tools"]["dsftool"]["version"].as_str() {
            observed.insert("dsftool".to_string(), version.to_string());
        }
        let mut mismatches = Vec::new();
        let mut missing = Vec::new();
        for (tool, spec) in &pinned {
            match observed.get(tool) {
                None => missing.push(json!({ "tool": tool, "pinned": spec })),
                Some(actual) => {
                    if version_matches(spec, actual) == Some(false) {
                        if strict {
                            warnings.push(format!(
                                "Pinned version mismatch: {tool} expected {spec}, found {actual}"
                            ));
                        }
                        mismatches.push(json!({
                            "tool": tool,
                            "pinned": spec,
                            "observed": actual,
                        }));
                    }
                }
            }
        }
        provenance["pinned_versions"] = serde_json::to_value(&pinned)?;
        if let Some(source) = source {
            provenance["pinned_versions_source"] = Value::from(source);
        }
        provenance["version_drift"] = json!({
            "observed": observed,
            "mismatches": mismatches,
            "missing": missing,
        });
    }

    Ok((provenance, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_version_matches() {
        assert_eq!(version_matches("1.4", "1.40"), Some(false));
        assert_eq!(version_matches("1.4", "1.4.2"), Some(true));
        assert_eq!(version_matches("2.2+", "2.3"), Some(true));
        assert_eq!(version_matches("2.2+", "2.1"), Some(false));
        assert_eq!(version_matches("garbage", "also"), None);
    }

    #[test]
    fn test_basic_provenance_has_fingerprints() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        std::fs::write(&dem, b"bytes").unwrap();
        let options = BuildOptions::default();
        let (provenance, warnings) =
            build_provenance(&options, &[dem], &["runner".to_string()], &[]).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(provenance["level"], "basic");
        let dems = provenance["inputs"]["dems"].as_array().unwrap();
        assert_eq!(dems.len(), 1);
        assert!(dems[0]["size"].as_u64().unwrap() > 0);
        // Basic mode never hashes.
        assert!(dems[0].get("sha256").is_none());
    }

    #[test]
    fn test_strict_provenance_hashes_inputs() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.tif");
        std::fs::write(&dem, b"bytes").unwrap();
        let options = BuildOptions {
            provenance_level: "strict".to_string(),
            ..Default::default()
        };
        let (provenance, _) = build_provenance(&options, &[dem], &[], &[]).unwrap();
        let dems = provenance["inputs"]["dems"].as_array().unwrap();
        assert!(dems[0]["sha256"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn test_pinned_version_drift() {
        let dir = TempDir::new().unwrap();
        let pins = dir.path().join("pins.json");
        std::fs::write(&pins, r#"{"demgrid": "99.0", "dsftool": "2.2+"}"#).unwrap();
        let options = BuildOptions {
            pinned_versions_path: Some(pins),
            provenance_level: "strict".to_string(),
            ..Default::default()
        };
        let (provenance, warnings) = build_provenance(&options, &[], &[], &[]).unwrap();
        let drift = &provenance["version_drift"];
        assert_eq!(drift["mismatches"].as_array().unwrap().len(), 1);
        assert_eq!(drift["missing"].as_array().unwrap().len(), 1);
        assert_eq!(warnings.len(), 1);
    }
}
