//! Engine configuration.
//!
//! Every path the engine touches lives in one [`EngineConfig`] value that is
//! constructed in `main` and threaded explicitly; there are no ambient path
//! globals. Defaults are the stock HackerOS layout, optionally overridden by
//! `/etc/hammer/config.toml`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "/etc/hammer/config.toml";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mount point of the btrfs top-level subvolume.
    pub top_mount: PathBuf,
    /// Directory holding the deployment subvolumes.
    pub deployments_dir: PathBuf,
    /// Symlink naming the deployment intended to boot next.
    pub current_link: PathBuf,
    /// Lock file; its existence denotes a held exclusive lock.
    pub lock_path: PathBuf,
    /// Transaction marker for crash-safe promotion tracking.
    pub marker_path: PathBuf,
    /// Directory for the append-only engine log.
    pub log_dir: PathBuf,
    /// How many good deployments `clean` retains and the boot menu covers.
    pub keep_deployments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_top_mount(PathBuf::from("/btrfs-root"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    engine: Option<EngineToml>,
    paths: Option<PathsToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineToml {
    keep_deployments: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    top_mount: Option<PathBuf>,
    lock_file: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// Layout rooted at an arbitrary top-level mount. The deployments
    /// directory, current symlink and transaction marker always live
    /// directly under the top mount.
    pub fn with_top_mount(top_mount: PathBuf) -> Self {
        Self {
            deployments_dir: top_mount.join("deployments"),
            current_link: top_mount.join("current"),
            marker_path: top_mount.join("hammer-transaction"),
            top_mount,
            lock_path: PathBuf::from("/run/hammer.lock"),
            log_dir: PathBuf::from("/usr/lib/HackerOS/hammer/logs"),
            keep_deployments: 5,
        }
    }

    /// Defaults merged with `/etc/hammer/config.toml` when it exists.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let parsed: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("parsing config '{}'", path.display()))?;

        let mut config = match parsed.paths.as_ref().and_then(|p| p.top_mount.clone()) {
            Some(top) => Self::with_top_mount(top),
            None => Self::default(),
        };

        if let Some(paths) = parsed.paths {
            if let Some(lock) = paths.lock_file {
                config.lock_path = lock;
            }
            if let Some(log_dir) = paths.log_dir {
                config.log_dir = log_dir;
            }
        }
        if let Some(engine) = parsed.engine {
            if let Some(keep) = engine.keep_deployments {
                config.keep_deployments = keep;
            }
        }

        if config.keep_deployments == 0 {
            bail!(
                "invalid config '{}': keep_deployments must be >= 1",
                path.display()
            );
        }

        Ok(config)
    }

    pub fn deployment_path(&self, name: &str) -> PathBuf {
        self.deployments_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_layout() {
        let config = EngineConfig::default();
        assert_eq!(config.top_mount, Path::new("/btrfs-root"));
        assert_eq!(config.deployments_dir, Path::new("/btrfs-root/deployments"));
        assert_eq!(config.current_link, Path::new("/btrfs-root/current"));
        assert_eq!(config.lock_path, Path::new("/run/hammer.lock"));
        assert_eq!(
            config.marker_path,
            Path::new("/btrfs-root/hammer-transaction")
        );
        assert_eq!(config.keep_deployments, 5);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = EngineConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.keep_deployments, 5);
    }

    #[test]
    fn overrides_apply() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[engine]\nkeep_deployments = 3\n\n[paths]\ntop_mount = \"/mnt/pool\"\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.keep_deployments, 3);
        assert_eq!(config.top_mount, Path::new("/mnt/pool"));
        assert_eq!(config.deployments_dir, Path::new("/mnt/pool/deployments"));
        assert_eq!(config.marker_path, Path::new("/mnt/pool/hammer-transaction"));
    }

    #[test]
    fn zero_retention_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[engine]\nkeep_deployments = 0\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[engine]\nkeep = 3\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());
    }
}
