//! Content-addressed cache of normalized tile artifacts.
//!
//! Cache keys hash the ordered source fingerprints, the normalization
//! options, and the tile id. Entries live under
//! `<cache_root>/<key-prefix>/<tile>/` and are write-once: stores go
//! through a temp file plus rename so concurrent readers never observe a
//! partial artifact. There are no back-pointers from entries to build
//! outputs; the key is the only coupling.

use crate::coverage::CoverageMetrics;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Cache format version; bumping invalidates every prior entry.
pub const CACHE_VERSION: u32 = 3;

/// How stored artifacts are re-checked on lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheVerify {
    /// Compare size and mtime of the cached artifact (default).
    #[default]
    Fingerprint,
    /// Recompute the artifact's content hash.
    ContentHash,
}

/// File metadata used to validate cache inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFingerprint {
    /// Resolved path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: u128,
    /// SHA-256 of the content, present in strict provenance mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    let mut buffer = [0u8; 1024 * 64];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl SourceFingerprint {
    /// Fingerprint a file, optionally hashing its content.
    pub fn from_path(path: &Path, compute_sha256: bool) -> Result<Self> {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let meta = fs::metadata(&resolved)?;
        let mtime_ns = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let sha256 = if compute_sha256 {
            Some(sha256_file(&resolved)?)
        } else {
            None
        };
        Ok(SourceFingerprint {
            path: resolved.to_string_lossy().into_owned(),
            size: meta.len(),
            mtime_ns,
            sha256,
        })
    }

    fn matches(&self, other: &SourceFingerprint, validate_hashes: bool) -> bool {
        if self.path != other.path || self.size != other.size || self.mtime_ns != other.mtime_ns {
            return false;
        }
        if validate_hashes {
            match (&self.sha256, &other.sha256) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        } else {
            true
        }
    }
}

/// Fingerprint a path collection, sorted by path for stable hashing.
pub fn fingerprint_paths(paths: &[PathBuf], compute_sha256: bool) -> Result<Vec<SourceFingerprint>> {
    let mut fingerprints = paths
        .iter()
        .map(|path| SourceFingerprint::from_path(path, compute_sha256))
        .collect::<Result<Vec<_>>>()?;
    fingerprints.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(fingerprints)
}

/// Everything a cache key is derived from.
///
/// Field order is fixed and serialization is canonical, so identical
/// inputs hash identically across runs and hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheKeyInputs {
    /// Cache format version.
    pub version: u32,
    /// Ordered fingerprints of the primary DEM sources.
    pub sources: Vec<SourceFingerprint>,
    /// Ordered fingerprints of fallback DEM sources.
    pub fallback_sources: Vec<SourceFingerprint>,
    /// Ordered fingerprints of AOI files referenced by the inputs.
    pub aoi_sources: Vec<SourceFingerprint>,
    /// Target CRS authority string.
    pub target_crs: String,
    /// Target resolution in CRS units, if fixed.
    pub resolution: Option<(f64, f64)>,
    /// Resampling kernel name.
    pub resampling: String,
    /// Destination nodata policy (stringified so NaN stays stable).
    pub nodata_policy: String,
    /// Fill strategy name.
    pub fill_strategy: String,
    /// Constant fill value.
    pub fill_value: f64,
    /// Mosaic strategy name.
    pub mosaic_strategy: String,
    /// Compression name.
    pub compression: String,
    /// Stack layer descriptor, when normalizing a stack.
    pub stack: Option<serde_json::Value>,
    /// Tile id this key addresses.
    pub tile: String,
}

impl CacheKeyInputs {
    /// Stable hex cache key for these inputs.
    pub fn key(&self) -> Result<String> {
        let payload = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Stringify a nodata policy so `None`, values, and NaN all key distinctly.
pub fn nodata_policy_string(nodata: Option<f64>) -> String {
    match nodata {
        None => "source".to_string(),
        Some(value) if value.is_nan() => "nan".to_string(),
        Some(value) => format!("{value}"),
    }
}

/// Metadata persisted next to a cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Full cache key of the entry.
    pub key: String,
    /// Tile id.
    pub tile: String,
    /// Artifact filename inside the entry directory.
    pub artifact: String,
    /// Fingerprint of the artifact at store time.
    pub artifact_fingerprint: SourceFingerprint,
    /// Content hash of the artifact at store time.
    pub artifact_sha256: String,
    /// Effective nodata written to the artifact.
    pub nodata: Option<f64>,
    /// Coverage metrics captured at normalization time.
    pub coverage: CoverageMetrics,
}

/// A cache hit: the artifact plus its recorded metrics.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
    /// Path to the cached tile GeoTIFF.
    pub path: PathBuf,
    /// Effective nodata of the artifact.
    pub nodata: Option<f64>,
    /// Coverage metrics from the original normalization.
    pub coverage: CoverageMetrics,
}

/// Content-addressed normalization cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct NormalizationCache {
    root: PathBuf,
}

impl NormalizationCache {
    /// Open (or lazily create) a cache at the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        NormalizationCache { root: root.into() }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str, tile: &str) -> PathBuf {
        self.root.join(&key[..key.len().min(12)]).join(tile)
    }

    /// Look up a cached artifact for the given key.
    pub fn lookup(&self, key: &str, tile: &str, verify: CacheVerify) -> Option<CachedArtifact> {
        let dir = self.entry_dir(key, tile);
        let meta_path = dir.join("entry.json");
        let text = fs::read_to_string(&meta_path).ok()?;
        let entry: CacheEntry = serde_json::from_str(&text).ok()?;
        if entry.key != key || entry.tile != tile {
            return None;
        }
        let artifact = dir.join(&entry.artifact);
        if !artifact.is_file() {
            return None;
        }
        match verify {
            CacheVerify::Fingerprint => {
                let current = SourceFingerprint::from_path(&artifact, false).ok()?;
                if !current.matches(&entry.artifact_fingerprint, false) {
                    return None;
                }
            }
            CacheVerify::ContentHash => {
                let digest = sha256_file(&artifact).ok()?;
                if digest != entry.artifact_sha256 {
                    return None;
                }
            }
        }
        Some(CachedArtifact {
            path: artifact,
            nodata: entry.nodata,
            coverage: entry.coverage,
        })
    }

    /// Store an artifact under the given key.
    ///
    /// The artifact is copied via a temp file and persisted into place,
    /// then the metadata follows the same way; readers either see a
    /// complete entry or none.
    pub fn store(
        &self,
        key: &str,
        tile: &str,
        artifact_path: &Path,
        nodata: Option<f64>,
        coverage: &CoverageMetrics,
    ) -> Result<PathBuf> {
        let dir = self.entry_dir(key, tile);
        fs::create_dir_all(&dir)?;
        let file_name = artifact_path
            .file_name()
            .ok_or_else(|| DemError::CacheInconsistency("artifact has no filename".into()))?;
        let dest = dir.join(file_name);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::copy(&mut fs::File::open(artifact_path)?, &mut tmp)?;
        tmp.persist(&dest)
            .map_err(|err| std::io::Error::from(err.error))?;
        let entry = CacheEntry {
            key: key.to_string(),
            tile: tile.to_string(),
            artifact: file_name.to_string_lossy().into_owned(),
            artifact_fingerprint: SourceFingerprint::from_path(&dest, false)?,
            artifact_sha256: sha256_file(&dest)?,
            nodata,
            coverage: coverage.clone(),
        };
        let mut meta_tmp = tempfile::NamedTempFile::new_in(&dir)?;
        meta_tmp.write_all(serde_json::to_string_pretty(&entry)?.as_bytes())?;
        meta_tmp
            .persist(dir.join("entry.json"))
            .map_err(|err| std::io::Error::from(err.error))?;
        Ok(dest)
    }

    /// Remove the oldest entries beyond `keep_entries`, by directory mtime.
    ///
    /// Best-effort LRU; never runs automatically during a build.
    pub fn clean(&self, keep_entries: usize) -> Result<usize> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let prefixes = match fs::read_dir(&self.root) {
            Ok(iter) => iter,
            Err(_) => return Ok(0),
        };
        for prefix in prefixes.flatten() {
            if !prefix.path().is_dir() {
                continue;
            }
            for tile_dir in fs::read_dir(prefix.path())?.flatten() {
                let path = tile_dir.path();
                if !path.is_dir() {
                    continue;
                }
                let mtime = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(UNIX_EPOCH);
                entries.push((mtime, path));
            }
        }
        if entries.len() <= keep_entries {
            return Ok(0);
        }
        entries.sort_by_key(|(mtime, _)| *mtime);
        let excess = entries.len() - keep_entries;
        let mut removed = 0;
        for (_, path) in entries.into_iter().take(excess) {
            if fs::remove_dir_all(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
