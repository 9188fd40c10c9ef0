//! Typed wrappers around the btrfs admin CLI.
//!
//! Every operation is a thin child-process invocation; the output parsing is
//! kept in standalone functions so it can be tested without a btrfs
//! filesystem. Callers must not hold open file handles inside a subvolume
//! when flipping its `ro` property.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::error::EngineError;
use crate::process::{Cmd, CmdOutput};

fn check(stage: &'static str, out: CmdOutput) -> Result<CmdOutput> {
    if !out.success {
        return Err(EngineError::Btrfs {
            stage,
            detail: out.stderr_str().trim().to_string(),
        }
        .into());
    }
    Ok(out)
}

/// `btrfs subvolume snapshot [-r] <source> <dest>`.
pub fn snapshot(source: &Path, dest: &Path, writable: bool) -> Result<()> {
    let mut cmd = Cmd::new("btrfs").args(["subvolume", "snapshot"]);
    if !writable {
        cmd = cmd.arg("-r");
    }
    let out = cmd.arg_path(source).arg_path(dest).allow_fail().run()?;
    check("snapshot", out)?;
    Ok(())
}

/// Snapshot `source` and every subvolume nested inside it.
///
/// The top-level snapshot leaves empty placeholder directories where the
/// nested subvolumes were; each placeholder is removed and replaced with a
/// snapshot of the matching source subvolume, parents before children.
pub fn snapshot_recursive(source: &Path, dest: &Path, writable: bool) -> Result<()> {
    let nested = nested_subvolumes(source)?;

    // A read-only top snapshot cannot receive nested snapshots, so it is
    // created writable and sealed after the children are in place.
    let top_writable = writable || !nested.is_empty();
    snapshot(source, dest, top_writable)?;

    for rel in &nested {
        let placeholder = dest.join(rel);
        if placeholder.exists() {
            fs::remove_dir(&placeholder).map_err(|e| EngineError::Btrfs {
                stage: "snapshot-recursive",
                detail: format!("removing placeholder {}: {}", placeholder.display(), e),
            })?;
        }
        snapshot(&source.join(rel), &placeholder, writable)?;
    }

    if !writable && top_writable {
        set_ro(dest, true)?;
    }
    Ok(())
}

/// `btrfs subvolume create <path>`.
pub fn create_subvolume(path: &Path) -> Result<()> {
    let out = Cmd::new("btrfs")
        .args(["subvolume", "create"])
        .arg_path(path)
        .allow_fail()
        .run()?;
    check("create", out)?;
    Ok(())
}

/// `btrfs property set -ts <path> ro <value>`.
pub fn set_ro(path: &Path, ro: bool) -> Result<()> {
    let out = Cmd::new("btrfs")
        .args(["property", "set", "-ts"])
        .arg_path(path)
        .args(["ro", if ro { "true" } else { "false" }])
        .allow_fail()
        .run()?;
    check("property-set", out)?;
    Ok(())
}

/// Apply the `ro` property to `path` and every nested subvolume.
pub fn set_ro_recursive(path: &Path, ro: bool) -> Result<()> {
    set_ro(path, ro)?;
    for rel in nested_subvolumes(path)? {
        set_ro(&path.join(rel), ro)?;
    }
    Ok(())
}

/// Read the `ro` property of a subvolume.
pub fn get_ro(path: &Path) -> Result<bool> {
    let out = Cmd::new("btrfs")
        .args(["property", "get", "-ts"])
        .arg_path(path)
        .arg("ro")
        .allow_fail()
        .run()?;
    let out = check("property-get", out)?;
    parse_ro_value(&out.stdout_str()).ok_or_else(|| {
        EngineError::Btrfs {
            stage: "property-get",
            detail: format!("unrecognized output for {}", path.display()),
        }
        .into()
    })
}

/// Numeric subvolume id from `btrfs subvolume show`.
pub fn subvol_id(path: &Path) -> Result<u64> {
    let out = Cmd::new("btrfs")
        .args(["subvolume", "show"])
        .arg_path(path)
        .allow_fail()
        .run()?;
    let out = check("show", out)?;
    parse_subvol_id(&out.stdout_str()).ok_or_else(|| {
        EngineError::Btrfs {
            stage: "show",
            detail: format!("no subvolume id in output for {}", path.display()),
        }
        .into()
    })
}

/// Logical path of the subvolume mounted at `path`, relative to the
/// filesystem top. Empty for the top-level subvolume itself.
pub fn subvol_name(path: &Path) -> Result<String> {
    let out = Cmd::new("btrfs")
        .args(["subvolume", "show"])
        .arg_path(path)
        .allow_fail()
        .run()?;
    let out = check("show", out)?;
    Ok(parse_subvol_name(&out.stdout_str()))
}

/// `btrfs subvolume set-default <id> /`.
pub fn set_default(id: u64) -> Result<()> {
    let out = Cmd::new("btrfs")
        .args(["subvolume", "set-default"])
        .arg(&id.to_string())
        .arg("/")
        .allow_fail()
        .run()?;
    check("set-default", out)?;
    Ok(())
}

/// `btrfs subvolume delete <path>`.
pub fn delete(path: &Path) -> Result<()> {
    let out = Cmd::new("btrfs")
        .args(["subvolume", "delete"])
        .arg_path(path)
        .allow_fail()
        .run()?;
    check("delete", out)?;
    Ok(())
}

/// Delete a subvolume and everything nested inside it, deepest first.
///
/// Sealed subvolumes are unsealed first: removing a nested subvolume needs
/// a writable parent.
pub fn delete_recursive(path: &Path) -> Result<()> {
    let nested = nested_subvolumes(path)?;

    let _ = set_ro(path, false);
    for rel in &nested {
        let _ = set_ro(&path.join(rel), false);
    }

    for rel in nested.iter().rev() {
        delete(&path.join(rel))?;
    }
    delete(path)
}

/// UUID of the filesystem backing `/`.
pub fn fs_uuid() -> Result<String> {
    let out = Cmd::new("btrfs")
        .args(["filesystem", "show", "/"])
        .allow_fail()
        .run()?;
    let out = check("filesystem-show", out)?;
    parse_fs_uuid(&out.stdout_str()).ok_or_else(|| {
        EngineError::Btrfs {
            stage: "filesystem-show",
            detail: "no uuid in output".to_string(),
        }
        .into()
    })
}

/// Relative paths of subvolumes nested inside the subvolume at `path`,
/// sorted so parents precede children.
pub fn nested_subvolumes(path: &Path) -> Result<Vec<String>> {
    let logical = subvol_name(path)?;
    let out = Cmd::new("btrfs")
        .args(["subvolume", "list", "-a", "--sort=path", "/"])
        .allow_fail()
        .run()?;
    let out = check("list", out)?;
    Ok(parse_nested_paths(&out.stdout_str(), &logical))
}

/// Extract the numeric id from `btrfs subvolume show` output.
pub(crate) fn parse_subvol_id(output: &str) -> Option<u64> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("Subvolume ID:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// The first non-empty line of `btrfs subvolume show` is the logical path.
/// `<FS_TREE>` and `/` both mean the top-level subvolume.
pub(crate) fn parse_subvol_name(output: &str) -> String {
    let first = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if first == "<FS_TREE>" || first == "/" {
        return String::new();
    }
    first.trim_matches('/').to_string()
}

/// Parse `btrfs property get` output of the form `ro=true`.
pub(crate) fn parse_ro_value(output: &str) -> Option<bool> {
    for line in output.lines() {
        match line.trim() {
            "ro=true" => return Some(true),
            "ro=false" => return Some(false),
            _ => {}
        }
    }
    None
}

/// Extract the uuid from `btrfs filesystem show` output.
pub(crate) fn parse_fs_uuid(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(idx) = line.find("uuid:") {
            let uuid = line[idx + "uuid:".len()..].trim();
            if !uuid.is_empty() {
                return Some(uuid.to_string());
            }
        }
    }
    None
}

/// Relative paths of the subvolumes nested under `parent_logical`, from a
/// `btrfs subvolume list -a --sort=path` listing.
///
/// Listing lines look like
/// `ID 257 gen 12 top level 5 path <FS_TREE>/deployments/hammer-x/var/cache`.
pub(crate) fn parse_nested_paths(listing: &str, parent_logical: &str) -> Vec<String> {
    let parent = parent_logical.trim_matches('/');
    let mut out = Vec::new();

    for line in listing.lines() {
        let Some(idx) = line.find(" path ") else {
            continue;
        };
        let raw = line[idx + " path ".len()..].trim();
        let logical = raw.strip_prefix("<FS_TREE>/").unwrap_or(raw);
        let logical = logical.trim_matches('/');
        if logical.is_empty() {
            continue;
        }

        let rel = if parent.is_empty() {
            logical
        } else {
            // A plain prefix match would accept "hammer-ab" under parent
            // "hammer-a"; require a real path boundary.
            match logical.strip_prefix(parent) {
                Some(rest) if rest.starts_with('/') => &rest[1..],
                _ => continue,
            }
        };
        if rel.is_empty() {
            continue;
        }
        out.push(rel.to_string());
    }

    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_OUTPUT: &str = "\
deployments/hammer-20240101000000
\tName: \t\t\thammer-20240101000000
\tUUID: \t\t\t1f2e3d4c-0000-0000-0000-000000000000
\tCreation time: \t2024-01-01 00:00:00 +0000
\tSubvolume ID: \t\t256
\tGeneration: \t\t42
\tFlags: \t\t\treadonly
";

    #[test]
    fn subvol_id_parsed() {
        assert_eq!(parse_subvol_id(SHOW_OUTPUT), Some(256));
        assert_eq!(parse_subvol_id("garbage"), None);
    }

    #[test]
    fn subvol_name_parsed() {
        assert_eq!(
            parse_subvol_name(SHOW_OUTPUT),
            "deployments/hammer-20240101000000"
        );
    }

    #[test]
    fn top_level_names_are_empty() {
        assert_eq!(parse_subvol_name("<FS_TREE>\n\tName: ...\n"), "");
        assert_eq!(parse_subvol_name("/\n\tName: ...\n"), "");
    }

    #[test]
    fn ro_value_parsed() {
        assert_eq!(parse_ro_value("ro=true\n"), Some(true));
        assert_eq!(parse_ro_value("ro=false\n"), Some(false));
        assert_eq!(parse_ro_value("nothing"), None);
    }

    #[test]
    fn fs_uuid_parsed() {
        let output = "Label: none  uuid: d6c8c0ec-aaaa-bbbb-cccc-1234567890ab\n\
                      \tTotal devices 1 FS bytes used 10.00GiB\n";
        assert_eq!(
            parse_fs_uuid(output).as_deref(),
            Some("d6c8c0ec-aaaa-bbbb-cccc-1234567890ab")
        );
    }

    #[test]
    fn nested_paths_relative_and_sorted() {
        let listing = "\
ID 256 gen 40 top level 5 path <FS_TREE>/deployments/hammer-20240101000000
ID 259 gen 40 top level 256 path <FS_TREE>/deployments/hammer-20240101000000/var/lib/machines
ID 258 gen 40 top level 256 path <FS_TREE>/deployments/hammer-20240101000000/var/cache
ID 260 gen 40 top level 5 path <FS_TREE>/deployments/hammer-20240102000000
ID 261 gen 40 top level 5 path <FS_TREE>/other
";
        let nested = parse_nested_paths(listing, "deployments/hammer-20240101000000");
        assert_eq!(nested, vec!["var/cache", "var/lib/machines"]);
    }

    #[test]
    fn nested_paths_require_boundary() {
        let listing = "\
ID 258 gen 40 top level 5 path <FS_TREE>/deployments/hammer-20240101000000extra/sub
";
        let nested = parse_nested_paths(listing, "deployments/hammer-20240101000000");
        assert!(nested.is_empty());
    }

    #[test]
    fn nested_paths_without_fs_tree_prefix() {
        let listing =
            "ID 258 gen 40 top level 256 path deployments/hammer-20240101000000/var/cache\n";
        let nested = parse_nested_paths(listing, "deployments/hammer-20240101000000");
        assert_eq!(nested, vec!["var/cache"]);
    }

    #[test]
    fn nested_paths_of_top_level_list_everything() {
        let listing = "\
ID 256 gen 40 top level 5 path <FS_TREE>/@
ID 257 gen 40 top level 256 path <FS_TREE>/@/var/cache
";
        let nested = parse_nested_paths(listing, "");
        assert_eq!(nested, vec!["@", "@/var/cache"]);
    }
}
