//! Package-management work inside a chroot.
//!
//! Each step is a separate argv run through `chroot`; there is no shell in
//! between, so package names and paths never pass through quoting. The first
//! non-zero exit aborts the sequence.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::process::Cmd;

/// The package-level intent of a deployment transaction.
#[derive(Debug, Clone)]
pub enum PackageWork {
    /// First-time provisioning.
    Initial,
    /// Full system upgrade.
    Upgrade,
    Install(String),
    Remove(String),
    /// New identity for unchanged content.
    DeployOnly,
}

/// Runs commands inside a mounted chroot workspace.
pub struct ChrootCmd {
    root: PathBuf,
}

impl ChrootCmd {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Run one step; non-zero exit becomes a `Chroot` error naming the stage.
    pub fn run_step(&self, stage: &str, argv: &[&str]) -> Result<()> {
        let out = Cmd::new("chroot")
            .arg_path(&self.root)
            .args(argv)
            .allow_fail()
            .run()
            .map_err(|e| EngineError::Chroot {
                stage: stage.to_string(),
                detail: e.to_string(),
            })?;
        if !out.success {
            return Err(EngineError::Chroot {
                stage: stage.to_string(),
                detail: out.stderr_str().trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Run one step and return its stdout.
    pub fn capture(&self, stage: &str, argv: &[&str]) -> Result<Vec<u8>> {
        let out = Cmd::new("chroot")
            .arg_path(&self.root)
            .args(argv)
            .allow_fail()
            .run()
            .map_err(|e| EngineError::Chroot {
                stage: stage.to_string(),
                detail: e.to_string(),
            })?;
        if !out.success {
            return Err(EngineError::Chroot {
                stage: stage.to_string(),
                detail: out.stderr_str().trim().to_string(),
            }
            .into());
        }
        Ok(out.stdout)
    }
}

/// Steps run before the package listing is dumped: metadata refresh and the
/// actual package change.
pub fn pre_dump_steps(work: &PackageWork) -> Vec<(String, Vec<String>)> {
    let step = |stage: &str, argv: &[&str]| {
        (
            stage.to_string(),
            argv.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    };

    match work {
        PackageWork::Initial => vec![
            step("apt-update", &["apt-get", "update"]),
            step(
                "plymouth-reinstall",
                &["apt-get", "install", "--reinstall", "-y", "plymouth"],
            ),
            step("plymouth-manual", &["apt-mark", "manual", "plymouth"]),
        ],
        PackageWork::Upgrade => vec![
            step("apt-update", &["apt-get", "update"]),
            step(
                "dist-upgrade",
                &[
                    "apt-get",
                    "dist-upgrade",
                    "-y",
                    "-o",
                    "Dpkg::Options::=--force-confdef",
                    "-o",
                    "Dpkg::Options::=--force-confold",
                ],
            ),
            step("autoremove", &["apt-get", "autoremove", "-y"]),
        ],
        PackageWork::Install(pkg) => vec![
            step("apt-update", &["apt-get", "update"]),
            step("install", &["apt-get", "install", "-y", pkg]),
            step("autoremove", &["apt-get", "autoremove", "-y"]),
        ],
        PackageWork::Remove(pkg) => vec![
            step("apt-update", &["apt-get", "update"]),
            step("remove", &["apt-get", "remove", "-y", pkg]),
            step("autoremove", &["apt-get", "autoremove", "-y"]),
        ],
        PackageWork::DeployOnly => vec![],
    }
}

/// Steps run after the dump: initramfs regeneration for works that may have
/// changed the installed set.
pub fn post_dump_steps(work: &PackageWork) -> Vec<(String, Vec<String>)> {
    match work {
        PackageWork::DeployOnly => vec![],
        _ => vec![(
            "initramfs".to_string(),
            vec![
                "update-initramfs".to_string(),
                "-u".to_string(),
                "-k".to_string(),
                "all".to_string(),
            ],
        )],
    }
}

/// Argv of the installed-package dump, captured and written host-side.
pub const DUMP_ARGV: &[&str] = &["dpkg", "-l"];

/// Argv of the bootloader-config generator run after the engine's entries
/// are in place.
pub const GRUB_ARGV: &[&str] = &["update-grub"];
