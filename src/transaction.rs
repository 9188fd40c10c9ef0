//! Transaction marker and boot-time reconciliation.
//!
//! The marker is a sentinel file naming the deployment of an uncommitted
//! promotion. It is written as a JSON document; bare-name markers left by
//! earlier tool versions are still accepted on read. `reconcile` is the
//! `check-transaction` entry point, run early during boot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::config::EngineConfig;
use crate::logging::Logger;
use crate::meta::{DeployStatus, MetaStore};

#[derive(Debug, Serialize, Deserialize)]
struct MarkerDoc {
    deployment: String,
}

pub struct TransactionMarker<'a> {
    config: &'a EngineConfig,
}

impl<'a> TransactionMarker<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn exists(&self) -> bool {
        self.config.marker_path.exists()
    }

    pub fn create(&self, deployment: &str) -> Result<()> {
        let doc = MarkerDoc {
            deployment: deployment.to_string(),
        };
        let bytes = serde_json::to_vec(&doc)?;
        fs::write(&self.config.marker_path, bytes).with_context(|| {
            format!(
                "writing transaction marker {}",
                self.config.marker_path.display()
            )
        })?;
        Ok(())
    }

    /// The pending deployment name, or `None` when no marker exists.
    ///
    /// Accepts both the JSON document and a raw bare name.
    pub fn read(&self) -> Result<Option<String>> {
        let path = &self.config.marker_path;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading transaction marker {}", path.display()))?;

        if let Ok(doc) = serde_json::from_str::<MarkerDoc>(&content) {
            return Ok(Some(doc.deployment));
        }

        let raw = content.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(raw.to_string()))
    }

    pub fn remove(&self) -> Result<()> {
        let path = &self.config.marker_path;
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("removing transaction marker {}", path.display()))?;
        }
        Ok(())
    }
}

/// Name of the deployment the `current` symlink points at.
pub fn current_deployment_name(config: &EngineConfig) -> Result<Option<String>> {
    match fs::read_link(&config.current_link) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| {
            format!("reading current symlink {}", config.current_link.display())
        }),
    }
}

/// Reconcile the marker with the deployment that actually booted.
///
/// With a marker present: the pending deployment becomes `booted` when the
/// current symlink agrees with it, `broken` otherwise; the marker is removed
/// either way. Without a marker, a current deployment still sitting at
/// `ready` is promoted to `booted` (its transaction committed and the
/// marker was already cleared before reboot).
pub fn reconcile(config: &EngineConfig) -> Result<()> {
    let marker = TransactionMarker::new(config);
    let store = MetaStore::new(config);
    let current = current_deployment_name(config)?;

    match marker.read()? {
        Some(pending) => {
            let landed = current.as_deref() == Some(pending.as_str());
            if config.deployment_path(&pending).exists() {
                if landed {
                    store.set_status(&pending, DeployStatus::Booted, None)?;
                    Logger::success(&format!("Deployment {pending} booted successfully."));
                } else {
                    store.set_status(&pending, DeployStatus::Broken, None)?;
                    Logger::error(&format!(
                        "Deployment {pending} did not become the booted root; marked broken."
                    ));
                }
            } else {
                Logger::error(&format!(
                    "Transaction marker names missing deployment {pending}; dropping marker."
                ));
            }
            marker.remove()?;
        }
        None => {
            if let Some(current) = current {
                if let Some(meta) = store.read(&current)? {
                    if meta.status == DeployStatus::Ready {
                        store.set_status(&current, DeployStatus::Booted, None)?;
                        Logger::info(&format!("Deployment {current} promoted to booted."));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::DeploymentMeta;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> EngineConfig {
        EngineConfig::with_top_mount(temp.path().to_path_buf())
    }

    fn add_deployment(config: &EngineConfig, name: &str, status: DeployStatus) {
        fs::create_dir_all(config.deployment_path(name)).unwrap();
        let meta = DeploymentMeta {
            created: "2024-01-01T00:00:00Z".to_string(),
            action: "update".to_string(),
            parent: String::new(),
            kernel: "6.1.0-18-amd64".to_string(),
            system_version: "ab".repeat(32),
            status,
            rollback_reason: None,
        };
        MetaStore::new(config).write(name, &meta).unwrap();
    }

    fn point_current(config: &EngineConfig, name: &str) {
        let _ = fs::remove_file(&config.current_link);
        symlink(config.deployment_path(name), &config.current_link).unwrap();
    }

    #[test]
    fn marker_roundtrip_json() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        let marker = TransactionMarker::new(&config);

        marker.create("hammer-20240101000000").unwrap();
        assert!(marker.exists());
        assert_eq!(
            marker.read().unwrap().as_deref(),
            Some("hammer-20240101000000")
        );
        let raw = fs::read_to_string(&config.marker_path).unwrap();
        assert!(raw.contains("\"deployment\""));

        marker.remove().unwrap();
        assert!(!marker.exists());
        assert!(marker.read().unwrap().is_none());
    }

    #[test]
    fn marker_accepts_raw_name() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        fs::write(&config.marker_path, "hammer-20240101000000\n").unwrap();

        let marker = TransactionMarker::new(&config);
        assert_eq!(
            marker.read().unwrap().as_deref(),
            Some("hammer-20240101000000")
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        TransactionMarker::new(&config).remove().unwrap();
    }

    #[test]
    fn reconcile_promotes_matching_pending() {
        // Crash after symlink repoint, before marker removal (scenario 5).
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240102000000", DeployStatus::Ready);
        point_current(&config, "hammer-20240102000000");
        TransactionMarker::new(&config)
            .create("hammer-20240102000000")
            .unwrap();

        reconcile(&config).unwrap();

        let meta = MetaStore::new(&config)
            .read("hammer-20240102000000")
            .unwrap()
            .unwrap();
        assert_eq!(meta.status, DeployStatus::Booted);
        assert!(!config.marker_path.exists());
    }

    #[test]
    fn reconcile_breaks_mismatched_pending() {
        // Crash between metadata ready and default flip (scenario 6).
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240101000000", DeployStatus::Booted);
        add_deployment(&config, "hammer-20240102000000", DeployStatus::Ready);
        point_current(&config, "hammer-20240101000000");
        TransactionMarker::new(&config)
            .create("hammer-20240102000000")
            .unwrap();

        reconcile(&config).unwrap();

        let store = MetaStore::new(&config);
        let pending = store.read("hammer-20240102000000").unwrap().unwrap();
        assert_eq!(pending.status, DeployStatus::Broken);
        let old = store.read("hammer-20240101000000").unwrap().unwrap();
        assert_eq!(old.status, DeployStatus::Booted);
        assert!(!config.marker_path.exists());
    }

    #[test]
    fn reconcile_without_marker_promotes_ready_current() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240102000000", DeployStatus::Ready);
        point_current(&config, "hammer-20240102000000");

        reconcile(&config).unwrap();

        let meta = MetaStore::new(&config)
            .read("hammer-20240102000000")
            .unwrap()
            .unwrap();
        assert_eq!(meta.status, DeployStatus::Booted);
    }

    #[test]
    fn reconcile_without_marker_leaves_booted_alone() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        add_deployment(&config, "hammer-20240102000000", DeployStatus::Booted);
        point_current(&config, "hammer-20240102000000");

        reconcile(&config).unwrap();

        let meta = MetaStore::new(&config)
            .read("hammer-20240102000000")
            .unwrap()
            .unwrap();
        assert_eq!(meta.status, DeployStatus::Booted);
    }

    #[test]
    fn reconcile_tolerates_missing_deployment() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp);
        TransactionMarker::new(&config)
            .create("hammer-20991231235959")
            .unwrap();

        reconcile(&config).unwrap();
        assert!(!config.marker_path.exists());
    }
}
