//! Thin wrapper around DSFTool invocations.

use crate::command::{resolve_script_prefix, run_command, CommandOutput, RunOptions};
use crate::{Result, ToolError};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// 7z container magic; DSFs shipped with XP12 global scenery use it.
const DSF_7Z_SIGNATURE: [u8; 6] = [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
const MIN_7Z_VERSION: (u32, u32) = (2, 2);

/// Result of a DSFTool run.
#[derive(Debug)]
pub struct DsftoolResult {
    /// The argv vector that ran.
    pub command: Vec<String>,
    /// Tool exit code.
    pub returncode: i32,
    /// Captured stdout (head+tail).
    pub stdout: String,
    /// Captured stderr (head+tail).
    pub stderr: String,
}

impl From<CommandOutput> for DsftoolResult {
    fn from(output: CommandOutput) -> Self {
        DsftoolResult {
            command: output.command,
            returncode: output.returncode,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Run DSFTool with the given arguments, retrying transient failures.
pub fn run_dsftool(
    tool_cmd: &[String],
    args: &[String],
    timeout: Option<Duration>,
    retries: u32,
) -> Result<DsftoolResult> {
    if tool_cmd.is_empty() {
        return Err(ToolError::InvalidCommand("DSFTool command is required".into()));
    }
    let mut argv = resolve_script_prefix(tool_cmd, "python3");
    argv.extend(args.iter().cloned());
    let mut opts = RunOptions::new();
    opts.timeout = timeout;
    let mut last = None;
    for _attempt in 0..=retries {
        let output = run_command(&argv, &opts, None)?;
        let done = output.returncode == 0;
        last = Some(output);
        if done {
            break;
        }
    }
    Ok(last.expect("at least one attempt ran").into())
}

/// Probe the DSFTool version, if it reports one.
pub fn dsftool_version(tool_cmd: &[String]) -> Option<(u32, u32, u32)> {
    let result = run_dsftool(
        tool_cmd,
        &["--version".to_string()],
        Some(Duration::from_secs(30)),
        0,
    )
    .ok()?;
    if result.returncode != 0 {
        return None;
    }
    let combined = format!("{}\n{}", result.stdout, result.stderr);
    parse_version(&combined)
}

fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    for token in text.split_whitespace() {
        let mut parts = token.split('.');
        let major = parts.next()?.trim_matches(|c: char| !c.is_ascii_digit());
        if major.is_empty() {
            continue;
        }
        if let (Ok(major), Some(minor)) = (major.parse::<u32>(), parts.next()) {
            if let Ok(minor) = minor
                .trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u32>()
            {
                let patch = parts
                    .next()
                    .and_then(|p| p.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
                    .unwrap_or(0);
                return Some((major, minor, patch));
            }
        }
    }
    None
}

/// True when the file starts with the 7z container signature.
pub fn dsf_is_7z(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut header = [0u8; 6];
    match file.read_exact(&mut header) {
        Ok(()) => header == DSF_7Z_SIGNATURE,
        Err(_) => false,
    }
}

/// Remediation hint when a DSF is 7z-compressed and the tool is too old.
pub fn dsftool_7z_hint(tool_cmd: &[String], dsf_path: &Path) -> Option<String> {
    if !dsf_is_7z(dsf_path) {
        return None;
    }
    match dsftool_version(tool_cmd) {
        None => Some("DSF appears 7z-compressed; use DSFTool 2.2+ or decompress first".to_string()),
        Some((major, minor, _)) if (major, minor) < MIN_7Z_VERSION => Some(format!(
            "DSFTool {major}.{minor} cannot read 7z-compressed DSFs; use 2.2+ or decompress first"
        )),
        Some(_) => None,
    }
}

fn check_result(tool: &str, result: &DsftoolResult, hint: Option<&str>) -> Result<()> {
    if result.returncode == 0 {
        return Ok(());
    }
    let mut detail = result.stderr.trim().to_string();
    if detail.is_empty() {
        detail = "unknown error".to_string();
    }
    if let Some(hint) = hint {
        detail = format!("{detail} ({hint})");
    }
    Err(ToolError::CommandFailed {
        tool: tool.to_string(),
        code: result.returncode,
        detail,
    })
}

/// Convert a DSF to its text form.
pub fn dsf_to_text(
    tool_cmd: &[String],
    dsf_path: &Path,
    text_path: &Path,
    timeout: Option<Duration>,
    retries: u32,
) -> Result<()> {
    let hint = dsftool_7z_hint(tool_cmd, dsf_path);
    if let Some(hint) = &hint {
        if hint.contains("cannot read") {
            return Err(ToolError::CommandFailed {
                tool: "DSFTool dsf2text".to_string(),
                code: 1,
                detail: hint.clone(),
            });
        }
    }
    let result = run_dsftool(
        tool_cmd,
        &[
            "--dsf2text".to_string(),
            dsf_path.to_string_lossy().into_owned(),
            text_path.to_string_lossy().into_owned(),
        ],
        timeout,
        retries,
    )?;
    check_result("DSFTool dsf2text", &result, hint.as_deref())
}

/// Compile a DSF text file back into a binary DSF.
pub fn text_to_dsf(
    tool_cmd: &[String],
    text_path: &Path,
    dsf_path: &Path,
    timeout: Option<Duration>,
    retries: u32,
) -> Result<()> {
    let result = run_dsftool(
        tool_cmd,
        &[
            "--text2dsf".to_string(),
            text_path.to_string_lossy().into_owned(),
            dsf_path.to_string_lossy().into_owned(),
        ],
        timeout,
        retries,
    )?;
    check_result("DSFTool text2dsf", &result, None)
}

/// Round-trip a DSF through text and back as a structural smoke test.
pub fn roundtrip_dsf(
    tool_cmd: &[String],
    dsf_path: &Path,
    work_dir: &Path,
    timeout: Option<Duration>,
    retries: u32,
) -> Result<()> {
    std::fs::create_dir_all(work_dir)?;
    let stem = dsf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tile".to_string());
    let text_path = work_dir.join(format!("{stem}.txt"));
    let rebuilt = work_dir.join(
        dsf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rebuilt.dsf".to_string()),
    );
    dsf_to_text(tool_cmd, dsf_path, &text_path, timeout, retries)?;
    text_to_dsf(tool_cmd, &text_path, &rebuilt, timeout, retries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("DSFTool 2.2.0"), Some((2, 2, 0)));
        assert_eq!(parse_version("version 2.1"), Some((2, 1, 0)));
        assert_eq!(parse_version("no digits here"), None);
    }

    #[test]
    fn test_dsf_is_7z() {
        let dir = TempDir::new().unwrap();
        let sevenz = dir.path().join("compressed.dsf");
        std::fs::write(&sevenz, [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c, 0x00]).unwrap();
        assert!(dsf_is_7z(&sevenz));
        let plain = dir.path().join("plain.dsf");
        std::fs::write(&plain, b"XPLNEDSF").unwrap();
        assert!(!dsf_is_7z(&plain));
        assert!(!dsf_is_7z(&dir.path().join("missing.dsf")));
    }

    #[test]
    fn test_run_dsftool_with_fake_tool() {
        // A stand-in script that echoes its arguments.
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("fake_dsftool.sh");
        std::fs::write(&tool, "#!/bin/sh\necho \"$@\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let result = run_dsftool(
            &[tool.to_string_lossy().into_owned()],
            &["--dsf2text".to_string(), "a".to_string(), "b".to_string()],
            Some(Duration::from_secs(10)),
            0,
        )
        .unwrap();
        assert_eq!(result.returncode, 0);
        assert!(result.stdout.contains("--dsf2text a b"));
    }

    #[test]
    fn test_retries_rerun_failures() {
        let dir = TempDir::new().unwrap();
        // Fails until a marker file exists, then succeeds; one retry lands it.
        let marker = dir.path().join("marker");
        let tool = dir.path().join("flaky.sh");
        std::fs::write(
            &tool,
            format!(
                "#!/bin/sh\nif [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi\n",
                m = marker.display()
            ),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let result = run_dsftool(
            &[tool.to_string_lossy().into_owned()],
            &[],
            Some(Duration::from_secs(10)),
            1,
        )
        .unwrap();
        assert_eq!(result.returncode, 0);
    }
}
