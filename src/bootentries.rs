//! GRUB menu entries for the deployment history.
//!
//! The engine owns boot-menu generation: a drop-in script covering the
//! newest good deployments is written into the new deployment, the stock
//! generators are disabled, and the in-chroot `update-grub` run renders the
//! final configuration from the engine's entries alone.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::btrfs;
use crate::config::EngineConfig;
use crate::meta::MetaStore;

/// Location of the drop-in inside a deployment.
pub const GRUB_DROPIN: &str = "etc/grub.d/25_hammer_entries";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub name: String,
    pub kernel: String,
}

/// Render the full generator script: shebang, self-tailing header, then one
/// menuentry block per deployment.
pub fn render_script(uuid: &str, entries: &[BootEntry]) -> String {
    let mut script = String::from("#!/bin/sh\nexec tail -n +3 $0\n");

    for entry in entries {
        let name = &entry.name;
        let kernel = &entry.kernel;
        script.push_str(&format!(
            "menuentry 'HackerOS {name}' --class hackeros --class gnu-linux --class gnu --class os {{\n\
             \tsearch --no-floppy --fs-uuid --set=root {uuid}\n\
             \tlinux /deployments/{name}/boot/vmlinuz-{kernel} root=UUID={uuid} rw rootflags=subvol=deployments/{name} quiet splash $vt_handoff\n\
             \tinitrd /deployments/{name}/boot/initrd.img-{kernel}\n\
             }}\n"
        ));
    }

    script
}

/// Boot-menu candidates: the newest good deployments, minus any whose
/// kernel metadata is missing.
pub fn select_entries(
    store: &MetaStore<'_>,
    limit: usize,
) -> Result<Vec<BootEntry>> {
    let entries = store
        .good_newest_first(limit)?
        .into_iter()
        .filter(|(_, meta)| !meta.kernel.is_empty())
        .map(|(name, meta)| BootEntry {
            name,
            kernel: meta.kernel,
        })
        .collect();
    Ok(entries)
}

/// Write the generator script into `deployment`, mode 0755.
pub fn write_entries(config: &EngineConfig, deployment: &Path) -> Result<()> {
    let store = MetaStore::new(config);
    let entries = select_entries(&store, config.keep_deployments)?;
    let uuid = btrfs::fs_uuid()?;
    let script = render_script(&uuid, &entries);

    let path = deployment.join(GRUB_DROPIN);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&path, script).with_context(|| format!("writing {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("marking {} executable", path.display()))?;
    Ok(())
}

/// Remove the execute bit from the stock `/etc/grub.d/` generators inside a
/// deployment so only the engine's entries reach the rendered config.
pub fn disable_stock_generators(deployment: &Path) -> Result<()> {
    let dir = deployment.join("etc/grub.d");
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_str() == Some("25_hammer_entries") {
            continue;
        }

        let metadata = entry.metadata()?;
        let mode = metadata.permissions().mode();
        if mode & 0o111 != 0 {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & !0o111))
                .with_context(|| format!("clearing execute bit on {}", path.display()))?;
        }
    }
    Ok(())
}
