//! XP12 raster enrichment: merge soundscape/season/bathymetry rasters
//! from a reference scenery tree into freshly built DSFs.
//!
//! The merge round-trips through DSFTool's text form. Raster definitions
//! are `RASTER_DEF`/`RASTER_DATA` line groups tied together by an index;
//! sidecar `.raw` files are named after the text file DSFTool reads, so
//! every sidecar is copied to match the *enriched* text's basename before
//! the text2dsf pass. Sidecars named after the pre-enrichment text would
//! be silently ignored by the tool.

use crate::Result;
use demgrid_tiles::{dsf_path, Tile};
use demgrid_tools::{dsf_to_text, text_to_dsf};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// XP12 global scenery ships eight season rasters per tile.
pub const XP12_SEASON_EXPECTED: usize = 8;

const SEASON_TOKENS: [&str; 6] = ["season", "spring", "summer", "autumn", "fall", "winter"];
const SOUND_TOKENS: [&str; 2] = ["sound", "soundscape"];
const BOUND_PROPERTIES: [&str; 4] = ["sim/west", "sim/south", "sim/east", "sim/north"];

/// Summary of raster layers found in a DSF.
#[derive(Debug, Clone)]
pub struct RasterSummary {
    /// Raster names in definition order.
    pub raster_names: Vec<String>,
    /// A soundscape raster is present.
    pub soundscape_present: bool,
    /// Number of season rasters found.
    pub season_raster_count: usize,
    /// Number of season rasters XP12 expects.
    pub season_raster_expected: usize,
}

/// Terminal status of an enrichment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentStatus {
    /// Rasters were merged and the DSF was recompiled.
    Enriched,
    /// Nothing was missing.
    NoOp,
    /// The attempt failed; the tile keeps its unenriched DSF.
    Failed,
}

/// Result of an XP12 raster enrichment attempt.
#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    /// Terminal status.
    pub status: EnrichmentStatus,
    /// Raster names that were missing from the target.
    pub missing: Vec<String>,
    /// Raster names actually added.
    pub added: Vec<String>,
    /// Backup of the original DSF, when one was made.
    pub backup_path: Option<PathBuf>,
    /// The merged text file handed to text2dsf.
    pub enriched_text_path: Option<PathBuf>,
    /// Failure detail.
    pub error: Option<String>,
}

impl EnrichmentResult {
    fn failed(error: String) -> Self {
        EnrichmentResult {
            status: EnrichmentStatus::Failed,
            missing: Vec::new(),
            added: Vec::new(),
            backup_path: None,
            enriched_text_path: None,
            error: Some(error),
        }
    }
}

/// One raster definition block: the def line plus its data lines.
#[derive(Debug, Clone)]
struct RasterBlock {
    name: String,
    index: i64,
    lines: Vec<String>,
}

fn quoted_name(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let rest = &line[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn block_index(tokens: &[&str]) -> Option<i64> {
    tokens.get(1)?.parse().ok()
}

/// Extract raster names from DSFTool text output.
pub fn parse_raster_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen = BTreeSet::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || !line.to_ascii_lowercase().contains("raster") {
            continue;
        }
        let name = quoted_name(line).or_else(|| {
            line.split_whitespace()
                .skip(1)
                .map(|token| token.trim_matches(',').to_string())
                .find(|token| {
                    !token.starts_with('#')
                        && !token.to_ascii_lowercase().starts_with("raster")
                        && token.chars().any(|c| c.is_ascii_alphabetic())
                })
        });
        if let Some(name) = name {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
    }
    names
}

fn extract_raster_blocks(text: &str) -> Vec<RasterBlock> {
    let mut blocks: Vec<RasterBlock> = Vec::new();
    let mut by_index: BTreeMap<i64, usize> = BTreeMap::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = tokens.first().map(|t| t.to_ascii_lowercase()) else {
            continue;
        };
        if keyword == "raster_def" {
            let Some(index) = block_index(&tokens) else {
                continue;
            };
            let name = quoted_name(line).or_else(|| {
                tokens
                    .iter()
                    .skip(2)
                    .map(|token| token.trim_matches(',').to_string())
                    .find(|token| token.chars().any(|c| c.is_ascii_alphabetic()))
            });
            let Some(name) = name else { continue };
            by_index.insert(index, blocks.len());
            blocks.push(RasterBlock {
                name,
                index,
                lines: vec![raw_line.to_string()],
            });
        } else if keyword.starts_with("raster_") {
            if let Some(index) = block_index(&tokens) {
                if let Some(&slot) = by_index.get(&index) {
                    blocks[slot].lines.push(raw_line.to_string());
                }
            }
        }
    }
    blocks
}

fn is_xp12_raster(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SOUND_TOKENS
        .iter()
        .chain(SEASON_TOKENS.iter())
        .any(|token| lower.contains(token))
}

/// Summarize raster names against XP12 expectations.
pub fn summarize_rasters(names: &[String]) -> RasterSummary {
    let soundscape_present = names.iter().any(|name| {
        let lower = name.to_ascii_lowercase();
        SOUND_TOKENS.iter().any(|token| lower.contains(token))
    });
    let season_raster_count = names
        .iter()
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            SEASON_TOKENS.iter().any(|token| lower.contains(token))
        })
        .count();
    RasterSummary {
        raster_names: names.to_vec(),
        soundscape_present,
        season_raster_count,
        season_raster_expected: XP12_SEASON_EXPECTED,
    }
}

/// List raster layers in a DSF via DSFTool.
pub fn inventory_dsf_rasters(
    dsftool: &[String],
    dsf: &Path,
    work_dir: &Path,
    timeout: Option<Duration>,
    retries: u32,
) -> Result<RasterSummary> {
    std::fs::create_dir_all(work_dir)?;
    let stem = dsf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tile".to_string());
    let text_path = work_dir.join(format!("{stem}.txt"));
    dsf_to_text(dsftool, dsf, &text_path, timeout, retries)?;
    let text = std::fs::read_to_string(&text_path)?;
    Ok(summarize_rasters(&parse_raster_names(&text)))
}

/// Locate the reference DSF for a tile by its bucket path.
///
/// Deterministic lookup only; the reference tree is never scanned.
pub fn find_reference_dsf(reference_root: &Path, tile: Tile) -> Option<PathBuf> {
    let candidate = dsf_path(reference_root, tile);
    candidate.is_file().then_some(candidate)
}

fn rewrite_block_index(lines: &[String], new_index: i64) -> Vec<String> {
    lines
        .iter()
        .map(|raw_line| {
            let mut tokens: Vec<String> =
                raw_line.split_whitespace().map(str::to_string).collect();
            if tokens.len() > 1
                && tokens[0].to_ascii_lowercase().starts_with("raster_")
                && tokens[1].parse::<i64>().is_ok()
            {
                tokens[1] = new_index.to_string();
                tokens.join(" ")
            } else {
                raw_line.clone()
            }
        })
        .collect()
}

fn list_sidecars(text_path: &Path) -> Vec<PathBuf> {
    let Some(parent) = text_path.parent() else {
        return Vec::new();
    };
    let Some(base) = text_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Vec::new();
    };
    let mut sidecars: Vec<PathBuf> = std::fs::read_dir(parent)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.starts_with(&format!("{base}.")) && name.ends_with(".raw")
        })
        .collect();
    sidecars.sort();
    sidecars
}

/// Copy sidecars so they match the destination text's basename.
///
/// Index remapping renames `.N.raw` segments for blocks whose index moved
/// during the merge.
fn copy_sidecars_for(
    source_text: &Path,
    dest_text: &Path,
    index_map: &BTreeMap<i64, i64>,
) -> Result<usize> {
    let source_base = source_text
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest_base = dest_text
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut copied = 0;
    for sidecar in list_sidecars(source_text) {
        let name = sidecar
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = &name[source_base.len()..];
        let mut dest_suffix = suffix.to_string();
        for (old, new) in index_map {
            let old_segment = format!(".{old}.");
            let new_segment = format!(".{new}.");
            if dest_suffix.contains(&old_segment) {
                dest_suffix = dest_suffix.replace(&old_segment, &new_segment);
            }
        }
        let dest = dest_text.with_file_name(format!("{dest_base}{dest_suffix}"));
        if dest.exists() {
            continue;
        }
        std::fs::copy(&sidecar, &dest)?;
        copied += 1;
    }
    Ok(copied)
}

fn insertion_point(lines: &[String]) -> usize {
    let mut insert_at = lines.len();
    let raster_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.trim().to_ascii_lowercase().starts_with("raster_"))
        .map(|(index, _)| index)
        .collect();
    if let Some(&last) = raster_lines.last() {
        insert_at = last + 1;
    } else {
        let property_lines: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.trim().to_ascii_lowercase().starts_with("property"))
            .map(|(index, _)| index)
            .collect();
        if let Some(&last) = property_lines.last() {
            insert_at = last + 1;
        }
    }
    // Never insert past a bounds property; the tool wants them last-ish.
    let bound_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            let mut parts = trimmed.split_whitespace();
            parts.next().map(|t| t.eq_ignore_ascii_case("property")) == Some(true)
                && parts
                    .next()
                    .map(|key| BOUND_PROPERTIES.contains(&key.trim_matches('"')))
                    .unwrap_or(false)
        })
        .map(|(index, _)| index)
        .collect();
    if let Some(&first_bound) = bound_lines.first() {
        insert_at = insert_at.min(first_bound);
    }
    insert_at
}

/// Enrich one tile's DSF with XP12 rasters from a reference DSF.
pub fn enrich_dsf_rasters(
    dsftool: &[String],
    dsf: &Path,
    reference_dsf: &Path,
    work_dir: &Path,
    timeout: Option<Duration>,
    retries: u32,
) -> Result<EnrichmentResult> {
    std::fs::create_dir_all(work_dir)?;
    let stem = dsf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tile".to_string());
    let target_text = work_dir.join(format!("{stem}.txt"));
    let reference_stem = reference_dsf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reference".to_string());
    let reference_text = work_dir.join(format!("{reference_stem}.reference.txt"));
    let enriched_text = work_dir.join(format!("{stem}.enriched.txt"));
    let enriched_dsf = work_dir.join(format!("{stem}.enriched.dsf"));

    if let Err(err) = dsf_to_text(dsftool, dsf, &target_text, timeout, retries) {
        return Ok(EnrichmentResult::failed(err.to_string()));
    }
    if let Err(err) = dsf_to_text(dsftool, reference_dsf, &reference_text, timeout, retries) {
        return Ok(EnrichmentResult::failed(err.to_string()));
    }

    let target = std::fs::read_to_string(&target_text)?;
    let reference = std::fs::read_to_string(&reference_text)?;
    let target_blocks = extract_raster_blocks(&target);
    let reference_blocks = extract_raster_blocks(&reference);
    let target_names: BTreeSet<String> =
        parse_raster_names(&target).into_iter().collect();

    let missing_blocks: Vec<&RasterBlock> = reference_blocks
        .iter()
        .filter(|block| !target_names.contains(&block.name) && is_xp12_raster(&block.name))
        .collect();
    let missing: Vec<String> = missing_blocks.iter().map(|b| b.name.clone()).collect();
    if missing.is_empty() {
        debug!(dsf = %dsf.display(), "all XP12 rasters already present");
        return Ok(EnrichmentResult {
            status: EnrichmentStatus::NoOp,
            missing: Vec::new(),
            added: Vec::new(),
            backup_path: None,
            enriched_text_path: None,
            error: None,
        });
    }

    // Renumber incoming blocks that collide with indices already in use.
    let mut used: BTreeSet<i64> = target_blocks.iter().map(|b| b.index).collect();
    let mut next_index = used.iter().max().map(|&max| max + 1).unwrap_or(0);
    let mut index_map: BTreeMap<i64, i64> = BTreeMap::new();
    let mut insert_lines: Vec<String> = Vec::new();
    for block in &missing_blocks {
        let mut index = block.index;
        if used.contains(&index) {
            index = next_index;
            next_index += 1;
            index_map.insert(block.index, index);
        }
        used.insert(index);
        insert_lines.extend(rewrite_block_index(&block.lines, index));
    }

    let mut lines: Vec<String> = target.lines().map(str::to_string).collect();
    let at = insertion_point(&lines);
    lines.splice(at..at, insert_lines);
    std::fs::write(&enriched_text, lines.join("\n") + "\n")?;

    // Sidecars must track the file text2dsf is invoked with: both the
    // target's own rasters and the newly merged reference rasters get
    // copies named `<stem>.enriched.txt.<layer>.raw`.
    let no_remap = BTreeMap::new();
    copy_sidecars_for(&target_text, &enriched_text, &no_remap)?;
    copy_sidecars_for(&reference_text, &enriched_text, &index_map)?;

    if let Err(err) = text_to_dsf(dsftool, &enriched_text, &enriched_dsf, timeout, retries) {
        return Ok(EnrichmentResult {
            status: EnrichmentStatus::Failed,
            missing: missing.clone(),
            added: Vec::new(),
            backup_path: None,
            enriched_text_path: Some(enriched_text),
            error: Some(err.to_string()),
        });
    }

    let backup = dsf.with_extension("original.dsf");
    if !backup.exists() {
        std::fs::copy(dsf, &backup)?;
    }
    std::fs::copy(&enriched_dsf, dsf)?;
    info!(dsf = %dsf.display(), added = ?missing, "DSF enriched with XP12 rasters");
    Ok(EnrichmentResult {
        status: EnrichmentStatus::Enriched,
        added: missing.clone(),
        missing,
        backup_path: Some(backup),
        enriched_text_path: Some(enriched_text),
        error: None,
    })
}
