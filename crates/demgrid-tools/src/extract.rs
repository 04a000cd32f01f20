//! Safe archive extraction for tool installs.
//!
//! Archive members are adversarial input. Every member path is resolved
//! against the canonicalized destination and accepted only when it is a
//! strict descendant under the filesystem's component-wise parent
//! relation; string-prefix checks are exactly what this module refuses to
//! do (`/tmp/root` is a prefix of `/tmp/root2` but not an ancestor).
//! Validation runs over the whole archive before any member is written,
//! so a rejected archive leaves nothing behind.

use crate::{Result, ToolError};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Resolve a member path against the destination, rejecting escapes.
fn safe_member_path(dest_real: &Path, member: &Path) -> Result<PathBuf> {
    let mut resolved = dest_real.to_path_buf();
    for component in member.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::UnsafeArchivePath(
                    member.to_string_lossy().into_owned(),
                ));
            }
        }
    }
    // Component-wise ancestry, not string comparison.
    if !resolved.starts_with(dest_real) || resolved == dest_real {
        return Err(ToolError::UnsafeArchivePath(
            member.to_string_lossy().into_owned(),
        ));
    }
    Ok(resolved)
}

fn extract_zip(archive_path: &Path, dest_real: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    // Validate every member before writing anything.
    let mut targets = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let member = PathBuf::from(entry.name());
        targets.push(safe_member_path(dest_real, &member)?);
    }
    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let target = &targets[index];
        if entry.is_dir() {
            std::fs::create_dir_all(target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(target)?;
        std::io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode));
        }
        written.push(target.clone());
    }
    Ok(written)
}

fn extract_tar_gz(archive_path: &Path, dest_real: &Path) -> Result<Vec<PathBuf>> {
    // First pass validates every member path.
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let entry = entry?;
        let member = entry.path()?.into_owned();
        safe_member_path(dest_real, &member)?;
    }
    // Second pass extracts; reopen since tar streams are single-shot.
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = entry.path()?.into_owned();
        let target = safe_member_path(dest_real, &member)?;
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        written.push(target);
    }
    Ok(written)
}

/// Extract a `.zip`, `.tar.gz`, or `.tgz` archive into a destination.
///
/// Returns the extracted file paths. Any member that would escape the
/// destination aborts the whole extraction before a single write.
pub fn extract_archive(archive_path: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(destination)?;
    let dest_real = destination.canonicalize()?;
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let written = if name.ends_with(".zip") {
        extract_zip(archive_path, &dest_real)?
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive_path, &dest_real)?
    } else {
        return Err(ToolError::UnsupportedArchive(archive_path.to_path_buf()));
    };
    info!(
        archive = %archive_path.display(),
        files = written.len(),
        "archive extracted"
    );
    Ok(written)
}
