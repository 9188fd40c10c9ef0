//! Preflight checks run before a transaction touches the filesystem.
//!
//! Missing host tools and insufficient free space are caught here so they
//! surface as clear errors instead of failing halfway through a snapshot.

use anyhow::{bail, Result};
use nix::sys::statvfs::statvfs;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::EngineError;
use crate::process::Cmd;

/// Host tools the deployment engine shells out to.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("btrfs", "btrfs-progs"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("findmnt", "util-linux"),
    ("mktemp", "coreutils"),
    ("chroot", "coreutils"),
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    Cmd::new("which")
        .arg(cmd)
        .allow_fail()
        .run()
        .map(|o| o.success)
        .unwrap_or(false)
}

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

/// Total size of all regular files under `path`, in bytes.
pub fn calculate_dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// Require at least `required_bytes` of free space on the filesystem
/// holding `path`.
pub fn check_free_space(path: &Path, required_bytes: u64) -> Result<()> {
    let stat = statvfs(path)?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;

    if available < required_bytes {
        return Err(EngineError::Env(format!(
            "insufficient disk space on {}: required {:.2} MB, available {:.2} MB",
            path.display(),
            required_bytes as f64 / 1024.0 / 1024.0,
            available as f64 / 1024.0 / 1024.0
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn command_exists_finds_ls() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn missing_tool_reported_with_package() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn dir_size_counts_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(calculate_dir_size(temp.path()).unwrap(), 150);
    }

    #[test]
    fn free_space_zero_requirement_passes() {
        let temp = TempDir::new().unwrap();
        check_free_space(temp.path(), 0).unwrap();
    }
}
