//! Patch and restore of the backend's global config file.
//!
//! Ortho4XP reads a single `Ortho4XP.cfg` at its root, so concurrent tile
//! workers must serialize every patch/run/restore cycle through one
//! process-wide lock. The snapshot distinguishes "file was absent" from
//! "file was empty": restoring an absent snapshot deletes the file.

use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

static CONFIG_LOCK: Mutex<()> = Mutex::new(());

const SENSITIVE_TOKENS: [&str; 6] = ["key", "token", "secret", "pass", "auth", "license"];

/// Parse `key=value` lines, ignoring comments and blanks.
pub fn parse_config_values(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for raw_line in text.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((content, _comment)) = line.split_once('#') {
            line = content.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(
            key.trim().to_string(),
            value.trim().trim_matches(|c| c == '"' || c == '\'').to_string(),
        );
    }
    values
}

/// Read `key=value` pairs from a config file; absent file reads empty.
pub fn read_config_values(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(parse_config_values(&std::fs::read_to_string(path)?))
}

/// Snapshot of the config file taken before patching.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    path: PathBuf,
    /// `None` records that the file did not exist.
    original: Option<String>,
}

impl ConfigSnapshot {
    /// The config path this snapshot belongs to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Original file content; `None` when the file was absent.
    pub fn original(&self) -> Option<&str> {
        self.original.as_deref()
    }

    /// Restore the file to the snapshot state, deleting it when the
    /// snapshot recorded absence.
    pub fn restore(&self) -> Result<()> {
        match &self.original {
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
            }
            Some(content) => {
                std::fs::write(&self.path, content)?;
            }
        }
        Ok(())
    }
}

/// Patched config state that restores itself when dropped.
///
/// Holds the process-wide config lock for its entire lifetime, so only one
/// worker can have the backend config patched at a time.
pub struct ConfigGuard<'a> {
    snapshot: ConfigSnapshot,
    persist: bool,
    restored: bool,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> ConfigGuard<'a> {
    /// The snapshot taken before patching.
    pub fn snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Keep the patched file instead of restoring on drop.
    pub fn persist(mut self) {
        self.persist = true;
    }

    /// Restore explicitly, surfacing errors instead of swallowing them.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.snapshot.restore()
    }
}

impl Drop for ConfigGuard<'_> {
    fn drop(&mut self) {
        if self.restored || self.persist {
            return;
        }
        if let Err(err) = self.snapshot.restore() {
            tracing::error!(
                path = %self.snapshot.path.display(),
                "config restore failed: {err}"
            );
        }
    }
}

/// Patch `key=value` entries into the config, returning a restoring guard.
///
/// Existing keys are rewritten in place; new keys append at the end. The
/// returned guard restores the snapshot on drop unless persisted.
pub fn patch_config(
    path: &Path,
    updates: &BTreeMap<String, String>,
) -> Result<ConfigGuard<'static>> {
    let lock = CONFIG_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let original = if path.exists() {
        Some(std::fs::read_to_string(path)?)
    } else {
        None
    };
    let snapshot = ConfigSnapshot {
        path: path.to_path_buf(),
        original: original.clone(),
    };
    let mut lines: Vec<String> = original
        .as_deref()
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default();
    let mut remaining = updates.clone();
    for line in lines.iter_mut() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') || !stripped.contains('=') {
            continue;
        }
        let key = stripped.split('=').next().unwrap_or("").trim().to_string();
        if let Some(value) = remaining.remove(&key) {
            *line = format!("{key}={value}");
        }
    }
    for (key, value) in remaining {
        lines.push(format!("{key}={value}"));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, lines.join("\n") + "\n")?;
    debug!(path = %path.display(), keys = updates.len(), "patched backend config");
    Ok(ConfigGuard {
        snapshot,
        persist: false,
        restored: false,
        _lock: lock,
    })
}

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_TOKENS.iter().any(|token| lower.contains(token))
}

/// One changed config key, with sensitive values redacted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConfigDiffEntry {
    /// Prior value, `None` when the key was new.
    pub before: Option<String>,
    /// Patched value.
    pub after: String,
}

/// Diff the original snapshot against the current file content.
pub fn config_diff(
    original: Option<&str>,
    path: &Path,
) -> Result<BTreeMap<String, ConfigDiffEntry>> {
    let old_values = parse_config_values(original.unwrap_or(""));
    let new_values = read_config_values(path)?;
    let mut diff = BTreeMap::new();
    for (key, after) in new_values {
        let before = old_values.get(&key).cloned();
        if before.as_deref() == Some(after.as_str()) {
            continue;
        }
        if is_sensitive(&key) {
            diff.insert(
                key,
                ConfigDiffEntry {
                    before: before.map(|_| "<redacted>".to_string()),
                    after: "<redacted>".to_string(),
                },
            );
        } else {
            diff.insert(key, ConfigDiffEntry { before, after });
        }
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn updates(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_config_values() {
        let values = parse_config_values(
            "# comment\nmin_angle=10\ncurv_tol = 2.0 # inline\nquoted=\"yes\"\njunk line\n",
        );
        assert_eq!(values.get("min_angle").unwrap(), "10");
        assert_eq!(values.get("curv_tol").unwrap(), "2.0");
        assert_eq!(values.get("quoted").unwrap(), "yes");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_patch_rewrites_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Ortho4XP.cfg");
        std::fs::write(&path, "min_angle=20\nmesh_zl=17\n").unwrap();
        let guard = patch_config(&path, &updates(&[("min_angle", "5"), ("new_key", "1")])).unwrap();
        let patched = read_config_values(&path).unwrap();
        assert_eq!(patched.get("min_angle").unwrap(), "5");
        assert_eq!(patched.get("mesh_zl").unwrap(), "17");
        assert_eq!(patched.get("new_key").unwrap(), "1");
        guard.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "min_angle=20\nmesh_zl=17\n");
    }

    #[test]
    fn test_restore_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Ortho4XP.cfg");
        std::fs::write(&path, "a=1\n").unwrap();
        {
            let _guard = patch_config(&path, &updates(&[("a", "2")])).unwrap();
            assert_eq!(read_config_values(&path).unwrap().get("a").unwrap(), "2");
        }
        assert_eq!(read_config_values(&path).unwrap().get("a").unwrap(), "1");
    }

    #[test]
    fn test_absent_file_restores_to_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Ortho4XP.cfg");
        {
            let _guard = patch_config(&path, &updates(&[("a", "1")])).unwrap();
            assert!(path.exists());
        }
        // The snapshot recorded absence, so restore deletes the file.
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_skips_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Ortho4XP.cfg");
        let guard = patch_config(&path, &updates(&[("a", "1")])).unwrap();
        guard.persist();
        assert!(path.exists());
    }

    #[test]
    fn test_config_diff_redacts_sensitive_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg");
        std::fs::write(&path, "api_key=hunter2\nmin_angle=5\n").unwrap();
        let diff = config_diff(Some("min_angle=20\n"), &path).unwrap();
        assert_eq!(diff.get("api_key").unwrap().after, "<redacted>");
        assert_eq!(diff.get("min_angle").unwrap().after, "5");
        assert_eq!(diff.get("min_angle").unwrap().before.as_deref(), Some("20"));
    }
}
