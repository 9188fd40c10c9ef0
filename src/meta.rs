//! Per-deployment metadata.
//!
//! Each deployment carries a `meta.json` describing how it was created and
//! where it stands in the ready/booted/previous/broken lifecycle. Documents
//! are written atomically (temp file + rename); single-writer discipline is
//! enforced by the lock, not here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::error::EngineError;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

pub const DEPLOY_PREFIX: &str = "hammer-";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Ready,
    Booted,
    Previous,
    Broken,
}

impl DeployStatus {
    /// Good deployments are boot-menu candidates and survive `clean` longest.
    pub fn is_good(self) -> bool {
        matches!(self, DeployStatus::Ready | DeployStatus::Booted)
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStatus::Ready => "ready",
            DeployStatus::Booted => "booted",
            DeployStatus::Previous => "previous",
            DeployStatus::Broken => "broken",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    /// RFC 3339 UTC creation time.
    pub created: String,
    /// "initial", "update", "install <pkg>", "remove <pkg>" or "deploy".
    pub action: String,
    /// Name of the deployment this one was snapshotted from; empty for initial.
    #[serde(default)]
    pub parent: String,
    /// Kernel version; `/boot/vmlinuz-<kernel>` exists inside the deployment.
    pub kernel: String,
    /// Hex SHA-256 of the installed-package listing.
    pub system_version: String,
    pub status: DeployStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

/// Reads and writes `meta.json` documents under the deployments directory.
pub struct MetaStore<'a> {
    config: &'a EngineConfig,
}

impl<'a> MetaStore<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.config.deployment_path(name).join(META_FILE)
    }

    /// Write the document atomically into the deployment directory.
    pub fn write(&self, name: &str, meta: &DeploymentMeta) -> Result<()> {
        let path = self.meta_path(name);
        let dir = self.config.deployment_path(name);
        if !dir.exists() {
            return Err(EngineError::Meta(format!(
                "deployment directory missing: {}",
                dir.display()
            ))
            .into());
        }

        let bytes = serde_json::to_vec_pretty(meta)?;
        let tmp = dir.join(".meta.json.tmp");
        fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// `Ok(None)` when the deployment has no metadata document.
    pub fn read(&self, name: &str) -> Result<Option<DeploymentMeta>> {
        let path = self.meta_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let meta = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Meta(format!("malformed {}: {}", path.display(), e))
        })?;
        Ok(Some(meta))
    }

    pub fn require(&self, name: &str) -> Result<DeploymentMeta> {
        self.read(name)?.ok_or_else(|| {
            EngineError::Meta(format!("deployment '{name}' has no meta.json")).into()
        })
    }

    /// Patch the status (and rollback reason) of an existing document.
    ///
    /// A missing document gets a stub record so crash recovery can always
    /// label a half-built deployment.
    pub fn set_status(
        &self,
        name: &str,
        status: DeployStatus,
        rollback_reason: Option<&str>,
    ) -> Result<()> {
        let mut meta = match self.read(name)? {
            Some(meta) => meta,
            None => DeploymentMeta {
                created: now_rfc3339()?,
                action: String::new(),
                parent: String::new(),
                kernel: String::new(),
                system_version: String::new(),
                status,
                rollback_reason: None,
            },
        };
        meta.status = status;
        meta.rollback_reason = rollback_reason.map(str::to_string);
        self.write(name, &meta)
    }

    /// Deployment names under the deployments directory, newest first.
    ///
    /// Entries with the `hammer-` prefix but an invalid timestamp are
    /// ignored.
    pub fn list_deployments(&self) -> Result<Vec<String>> {
        let dir = &self.config.deployments_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if valid_deployment_name(&name) {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// All deployments with their metadata, sorted by creation time
    /// descending.
    pub fn all_newest_first(&self) -> Result<Vec<(String, Option<DeploymentMeta>)>> {
        let mut out = Vec::new();
        for name in self.list_deployments()? {
            let meta = self.read(&name)?;
            out.push((name, meta));
        }
        out.sort_by(|a, b| {
            let ka = sort_key(&a.0, a.1.as_ref());
            let kb = sort_key(&b.0, b.1.as_ref());
            kb.cmp(&ka).then_with(|| b.0.cmp(&a.0))
        });
        Ok(out)
    }

    /// The newest `limit` deployments whose status is ready or booted.
    pub fn good_newest_first(&self, limit: usize) -> Result<Vec<(String, DeploymentMeta)>> {
        let good = self
            .all_newest_first()?
            .into_iter()
            .filter_map(|(name, meta)| meta.map(|m| (name, m)))
            .filter(|(_, m)| m.status.is_good())
            .take(limit)
            .collect();
        Ok(good)
    }
}

/// Sort key: the creation timestamp reduced to its digits, falling back to
/// the timestamp embedded in the deployment name.
fn sort_key(name: &str, meta: Option<&DeploymentMeta>) -> String {
    if let Some(meta) = meta {
        let digits: String = meta.created.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() >= 14 {
            return digits[..14].to_string();
        }
    }
    name.trim_start_matches(DEPLOY_PREFIX).to_string()
}

/// `hammer-` followed by exactly fourteen digits.
pub fn valid_deployment_name(name: &str) -> bool {
    match name.strip_prefix(DEPLOY_PREFIX) {
        Some(ts) => ts.len() == 14 && ts.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Mint a deployment name from the local wall clock.
pub fn mint_deployment_name() -> Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let fmt = format_description!("[year][month][day][hour][minute][second]");
    let ts = now.format(&fmt).context("formatting deployment timestamp")?;
    Ok(format!("{DEPLOY_PREFIX}{ts}"))
}

/// Current time as RFC 3339 UTC.
pub fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> EngineConfig {
        EngineConfig::with_top_mount(temp.path().to_path_buf())
    }

    fn sample_meta(created: &str, status: DeployStatus) -> DeploymentMeta {
        DeploymentMeta {
            created: created.to_string(),
            action: "update".to_string(),
            parent: "hammer-20240101000000".to_string(),
            kernel: "6.1.0-18-amd64".to_string(),
            system_version: "ab".repeat(32),
            status,
            rollback_reason: None,
        }
    }

    fn add_deployment(config: &EngineConfig, name: &str, meta: Option<&DeploymentMeta>) {
        fs::create_dir_all(config.deployment_path(name)).unwrap();
        if let Some(meta) = meta {
            MetaStore::new(config).write(name, meta).unwrap();
        }
    }

    #[test]
    fn roundtrip() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = MetaStore::new(&config);
        let meta = sample_meta("2024-02-01T00:00:00Z", DeployStatus::Ready);

        add_deployment(&config, "hammer-20240201000000", None);
        store.write("hammer-20240201000000", &meta).unwrap();

        let read = store.read("hammer-20240201000000").unwrap().unwrap();
        assert_eq!(read.created, meta.created);
        assert_eq!(read.status, DeployStatus::Ready);
        assert_eq!(read.kernel, "6.1.0-18-amd64");
    }

    #[test]
    fn status_serializes_lowercase() {
        let meta = sample_meta("2024-02-01T00:00:00Z", DeployStatus::Booted);
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"status\": \"booted\"") || json.contains("\"status\":\"booted\""));
    }

    #[test]
    fn missing_meta_reads_none() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240201000000", None);
        assert!(MetaStore::new(&config)
            .read("hammer-20240201000000")
            .unwrap()
            .is_none());
    }

    #[test]
    fn set_status_on_missing_meta_writes_stub() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = MetaStore::new(&config);
        add_deployment(&config, "hammer-20240201000000", None);

        store
            .set_status("hammer-20240201000000", DeployStatus::Broken, None)
            .unwrap();
        let meta = store.read("hammer-20240201000000").unwrap().unwrap();
        assert_eq!(meta.status, DeployStatus::Broken);
    }

    #[test]
    fn set_status_clears_and_sets_reason() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let store = MetaStore::new(&config);
        let meta = sample_meta("2024-02-01T00:00:00Z", DeployStatus::Booted);
        add_deployment(&config, "hammer-20240201000000", Some(&meta));

        store
            .set_status(
                "hammer-20240201000000",
                DeployStatus::Previous,
                Some("manual"),
            )
            .unwrap();
        let read = store.read("hammer-20240201000000").unwrap().unwrap();
        assert_eq!(read.status, DeployStatus::Previous);
        assert_eq!(read.rollback_reason.as_deref(), Some("manual"));

        store
            .set_status("hammer-20240201000000", DeployStatus::Ready, None)
            .unwrap();
        let read = store.read("hammer-20240201000000").unwrap().unwrap();
        assert!(read.rollback_reason.is_none());
    }

    #[test]
    fn list_filters_invalid_names() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240201000000", None);
        fs::create_dir_all(config.deployments_dir.join("hammer-notadate")).unwrap();
        fs::create_dir_all(config.deployments_dir.join("hammer-2024")).unwrap();
        fs::create_dir_all(config.deployments_dir.join("other")).unwrap();
        fs::create_dir_all(config.deployments_dir.join(".refresh-20240201000000")).unwrap();

        let names = MetaStore::new(&config).list_deployments().unwrap();
        assert_eq!(names, vec!["hammer-20240201000000".to_string()]);
    }

    #[test]
    fn good_filtering_sorting_and_limit() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);

        let entries = [
            ("hammer-20240101000000", "2024-01-01T00:00:00Z", DeployStatus::Previous),
            ("hammer-20240102000000", "2024-01-02T00:00:00Z", DeployStatus::Booted),
            ("hammer-20240103000000", "2024-01-03T00:00:00Z", DeployStatus::Broken),
            ("hammer-20240104000000", "2024-01-04T00:00:00Z", DeployStatus::Ready),
            ("hammer-20240105000000", "2024-01-05T00:00:00Z", DeployStatus::Ready),
            ("hammer-20240106000000", "2024-01-06T00:00:00Z", DeployStatus::Ready),
        ];
        for (name, created, status) in &entries {
            add_deployment(&config, name, Some(&sample_meta(created, *status)));
        }

        let good = MetaStore::new(&config).good_newest_first(3).unwrap();
        let names: Vec<&str> = good.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "hammer-20240106000000",
                "hammer-20240105000000",
                "hammer-20240104000000"
            ]
        );
    }

    #[test]
    fn deployments_without_meta_sort_by_name() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240105000000", None);
        add_deployment(
            &config,
            "hammer-20240101000000",
            Some(&sample_meta("2024-01-01T00:00:00Z", DeployStatus::Booted)),
        );

        let all = MetaStore::new(&config).all_newest_first().unwrap();
        assert_eq!(all[0].0, "hammer-20240105000000");
        assert_eq!(all[1].0, "hammer-20240101000000");
    }

    #[test]
    fn name_validation() {
        assert!(valid_deployment_name("hammer-20240101123059"));
        assert!(!valid_deployment_name("hammer-2024"));
        assert!(!valid_deployment_name("hammer-2024010112305x"));
        assert!(!valid_deployment_name("other-20240101123059"));
        assert!(!valid_deployment_name("hammer-202401011230590"));
    }

    #[test]
    fn minted_name_is_valid() {
        let name = mint_deployment_name().unwrap();
        assert!(valid_deployment_name(&name));
    }
}
