//! Mount management for the top-level subvolume and chroot workspaces.
//!
//! A chroot workspace is the chosen deployment subvolume mounted at a fresh
//! temp directory with the host pseudo-filesystems bound into it. Teardown
//! happens in reverse mount order and is guaranteed on all exit paths: the
//! success path calls [`ChrootMount::teardown`] so unmount failures are
//! reportable, and the drop guard unwinds whatever is left otherwise.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::process::Cmd;

/// Filesystem type of the mount backing `/`.
pub fn root_fstype() -> Result<String> {
    let out = Cmd::new("findmnt")
        .args(["-no", "FSTYPE", "/"])
        .error_msg("Failed to query root filesystem type")
        .run()?;
    Ok(out.stdout_str().trim().to_string())
}

/// Block device backing `/`, with any `[subvol]` decoration removed.
pub fn root_source() -> Result<String> {
    let out = Cmd::new("findmnt")
        .args(["-no", "SOURCE", "/"])
        .error_msg("Failed to resolve root device")
        .run()?;
    let source = out.stdout_str();
    let device = strip_subvol_decoration(source.trim());
    if device.is_empty() {
        return Err(EngineError::Mount {
            stage: "resolve-device",
            detail: "findmnt returned an empty source".to_string(),
        }
        .into());
    }
    Ok(device.to_string())
}

/// `findmnt SOURCE` reports btrfs subvolume mounts as `/dev/sda2[/subvol]`.
pub(crate) fn strip_subvol_decoration(source: &str) -> &str {
    match source.find('[') {
        Some(idx) => &source[..idx],
        None => source,
    }
}

pub fn is_mountpoint(path: &Path) -> bool {
    Cmd::new("findmnt")
        .args(["-no", "TARGET"])
        .arg_path(path)
        .allow_fail()
        .run()
        .map(|o| o.success)
        .unwrap_or(false)
}

/// Mount the filesystem top (`subvol=/`) at the configured top mount.
/// Idempotent.
pub fn ensure_top_mounted(config: &EngineConfig) -> Result<()> {
    if is_mountpoint(&config.top_mount) {
        return Ok(());
    }

    fs::create_dir_all(&config.top_mount)
        .with_context(|| format!("creating {}", config.top_mount.display()))?;

    let device = root_source()?;
    let out = Cmd::new("mount")
        .arg(&device)
        .arg_path(&config.top_mount)
        .args(["-o", "subvol=/"])
        .allow_fail()
        .run()?;
    if !out.success {
        return Err(EngineError::Mount {
            stage: "top-level",
            detail: out.stderr_str().trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// A mounted chroot workspace. Unmounts itself on drop.
#[derive(Debug)]
pub struct ChrootMount {
    root: PathBuf,
    /// Inner mount targets in setup order; torn down in reverse.
    mounts: Vec<PathBuf>,
    active: bool,
}

impl ChrootMount {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Explicit teardown for the success path.
    pub fn teardown(mut self) -> Result<()> {
        self.unmount_all()
    }

    fn unmount_all(&mut self) -> Result<()> {
        self.active = false;
        let mut first_err: Option<anyhow::Error> = None;

        let mut targets: Vec<PathBuf> = self.mounts.drain(..).rev().collect();
        targets.push(self.root.clone());

        for target in targets {
            let failure = match Cmd::new("umount").arg_path(&target).allow_fail().run() {
                Ok(out) if !out.success => Some(out.stderr_str().trim().to_string()),
                Err(e) => Some(e.to_string()),
                _ => None,
            };
            if let Some(detail) = failure {
                if first_err.is_none() {
                    first_err = Some(
                        EngineError::Mount {
                            stage: "umount",
                            detail: format!("{}: {}", target.display(), detail),
                        }
                        .into(),
                    );
                }
            }
        }
        let _ = fs::remove_dir(&self.root);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ChrootMount {
    fn drop(&mut self) {
        if self.active {
            let _ = self.unmount_all();
        }
    }
}

/// Mount the subvolume `subvol` (path relative to the filesystem top) at a
/// fresh temp directory and bind the host pseudo-filesystems into it.
pub fn prepare_chroot(subvol: &str) -> Result<ChrootMount> {
    let out = Cmd::new("mktemp")
        .args(["-d", "--tmpdir", "hammer-chroot.XXXXXX"])
        .error_msg("Failed to create chroot directory")
        .run()?;
    let root = PathBuf::from(out.stdout_str().trim());

    let device = root_source()?;
    let subvol_opt = format!("subvol={subvol}");
    let out = Cmd::new("mount")
        .arg(&device)
        .arg_path(&root)
        .args(["-o", &subvol_opt])
        .allow_fail()
        .run()?;
    if !out.success {
        let _ = fs::remove_dir(&root);
        return Err(EngineError::Mount {
            stage: "subvolume",
            detail: out.stderr_str().trim().to_string(),
        }
        .into());
    }

    let mut chroot = ChrootMount {
        root,
        mounts: Vec::new(),
        active: true,
    };

    for dir in ["/proc", "/sys", "/dev"] {
        let target = chroot.root.join(&dir[1..]);
        fs::create_dir_all(&target).with_context(|| format!("creating {}", target.display()))?;
        mount_step(
            &mut chroot,
            "bind",
            Cmd::new("mount").arg("--bind").arg(dir).arg_path(&target),
            &target,
        )?;
    }

    let pts = chroot.root.join("dev/pts");
    fs::create_dir_all(&pts).with_context(|| format!("creating {}", pts.display()))?;
    mount_step(
        &mut chroot,
        "devpts",
        Cmd::new("mount")
            .args(["-t", "devpts", "devpts"])
            .arg_path(&pts)
            .args(["-o", "newinstance,ptmxmode=0666"]),
        &pts,
    )?;

    let shm = chroot.root.join("dev/shm");
    fs::create_dir_all(&shm).with_context(|| format!("creating {}", shm.display()))?;
    mount_step(
        &mut chroot,
        "tmpfs",
        Cmd::new("mount").args(["-t", "tmpfs", "tmpfs"]).arg_path(&shm),
        &shm,
    )?;

    // Name resolution inside the chroot; failure is tolerable.
    let _ = fs::copy("/etc/resolv.conf", chroot.root.join("etc/resolv.conf"));

    Ok(chroot)
}

fn mount_step(
    chroot: &mut ChrootMount,
    stage: &'static str,
    cmd: Cmd,
    target: &Path,
) -> Result<()> {
    let out = cmd.allow_fail().run()?;
    if !out.success {
        return Err(EngineError::Mount {
            stage,
            detail: format!("{}: {}", target.display(), out.stderr_str().trim()),
        }
        .into());
    }
    chroot.mounts.push(target.to_path_buf());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subvol_decoration_stripped() {
        assert_eq!(
            strip_subvol_decoration("/dev/sda2[/deployments/hammer-20240101000000]"),
            "/dev/sda2"
        );
        assert_eq!(strip_subvol_decoration("/dev/sda2"), "/dev/sda2");
        assert_eq!(strip_subvol_decoration(""), "");
    }

    #[test]
    fn teardown_order_is_reverse_of_setup() {
        // The guard drains its mount list back-to-front; the pseudo-fs
        // unmount order falls out of the setup order.
        let setup = ["proc", "sys", "dev", "dev/pts", "dev/shm"];
        let teardown: Vec<&str> = setup.iter().rev().copied().collect();
        assert_eq!(teardown, vec!["dev/shm", "dev/pts", "dev", "sys", "proc"]);
    }
}
