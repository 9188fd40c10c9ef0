//! The deployment transaction engine.
//!
//! Every mutating operation follows the same shape: take the lock, validate
//! the environment, snapshot the current deployment writable, record the
//! in-flight transaction, do the package work in a chroot, verify, seal,
//! promote. The running root is never touched; a reboot is the commit.
//!
//! Ordering inside a transaction is load-bearing: the default-subvolume flip
//! and symlink repoint come last, so a crash at any earlier point leaves the
//! machine bootable into the previous deployment and the marker identifies
//! the half-built one for boot-time reconciliation.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::btrfs;
use crate::chroot::{self, ChrootCmd, PackageWork};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lock::LockFile;
use crate::logging::Logger;
use crate::meta::{self, DeployStatus, DeploymentMeta, MetaStore};
use crate::preflight;
use crate::process::Cmd;
use crate::transaction::{self, TransactionMarker};
use crate::{bootentries, mount};

pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn store(&self) -> MetaStore<'_> {
        MetaStore::new(&self.config)
    }

    fn marker(&self) -> TransactionMarker<'_> {
        TransactionMarker::new(&self.config)
    }

    fn initialized(&self) -> bool {
        fs::symlink_metadata(&self.config.current_link).is_ok()
    }

    /// Name of the deployment `current` points at; error when uninitialized.
    fn current_name(&self) -> Result<String> {
        transaction::current_deployment_name(&self.config)?.ok_or_else(|| {
            EngineError::Env(
                "system is not initialized (no current symlink); run 'hammer init'".to_string(),
            )
            .into()
        })
    }

    /// Environment checks every operation on an initialized system performs:
    /// btrfs root, current symlink present, running deployment sealed.
    fn validate(&self) -> Result<()> {
        let fstype = mount::root_fstype()?;
        if fstype != "btrfs" {
            return Err(EngineError::Env(format!(
                "root filesystem is {fstype}, not btrfs"
            ))
            .into());
        }

        let current = self.current_name()?;
        let current_path = self.config.deployment_path(&current);
        if !current_path.exists() {
            return Err(EngineError::Env(format!(
                "current symlink points at missing deployment {current}"
            ))
            .into());
        }

        if !btrfs::get_ro(&current_path)? {
            return Err(EngineError::Env(format!(
                "running deployment {current} is not read-only"
            ))
            .into());
        }
        Ok(())
    }

    /// Require free space for another full deployment before snapshotting.
    fn check_space(&self) -> Result<()> {
        let usr_size = preflight::calculate_dir_size(Path::new("/usr"))?;
        preflight::check_free_space(&self.config.top_mount, usr_size * 2)
    }

    fn mint_name(&self) -> Result<String> {
        for _ in 0..3 {
            let name = meta::mint_deployment_name()?;
            if !self.config.deployment_path(&name).exists() {
                return Ok(name);
            }
            thread::sleep(Duration::from_secs(1));
        }
        Err(EngineError::Env("could not allocate a unique deployment name".to_string()).into())
    }

    /// Atomically repoint (or create) the `current` symlink.
    fn repoint_current(&self, name: &str) -> Result<()> {
        let target = self.config.deployment_path(name);
        let tmp = self.config.current_link.with_file_name(".current.tmp");
        let _ = fs::remove_file(&tmp);
        std::os::unix::fs::symlink(&target, &tmp)?;
        fs::rename(&tmp, &self.config.current_link)?;
        Ok(())
    }

    // --- operations ---

    /// First-time provisioning: capture the running root as the first
    /// deployment and hand boot control to the engine.
    pub fn init(&self) -> Result<()> {
        let _lock = LockFile::acquire(&self.config)?;

        if self.initialized() {
            return Err(EngineError::Env(
                "already initialized (current symlink exists)".to_string(),
            )
            .into());
        }
        let fstype = mount::root_fstype()?;
        if fstype != "btrfs" {
            return Err(EngineError::Env(format!(
                "root filesystem is {fstype}, not btrfs"
            ))
            .into());
        }
        preflight::check_host_tools()?;
        mount::ensure_top_mounted(&self.config)?;

        let root_subvol = btrfs::subvol_name(Path::new("/"))?;
        if root_subvol.is_empty() {
            return Err(EngineError::Env(
                "running root is the top-level subvolume; a dedicated root subvolume is required"
                    .to_string(),
            )
            .into());
        }
        let source_path = self.config.top_mount.join(&root_subvol);

        if !self.config.deployments_dir.exists() {
            btrfs::create_subvolume(&self.config.deployments_dir)?;
        }
        self.check_space()?;

        let name = self.mint_name()?;
        let new_path = self.config.deployment_path(&name);
        Logger::info(&format!("Creating initial deployment {name}"));

        btrfs::snapshot_recursive(&source_path, &new_path, true)?;
        self.marker().create(&name)?;

        match self.build_deployment(&name, &new_path, "", "initial", &PackageWork::Initial) {
            Ok(()) => {
                // The marker stays: first-boot reconciliation promotes the
                // deployment to booted.
                Logger::success(&format!(
                    "Initialized deployment {name}. Reboot to start using it."
                ));
                Ok(())
            }
            Err(e) => self.fail_transaction(&name, e),
        }
    }

    /// Full system upgrade in a new deployment.
    pub fn update(&self) -> Result<()> {
        if !self.initialized() {
            Logger::info("System is not initialized; running first-time provisioning.");
            self.init()?;
            Logger::info("Reboot into the new deployment, then run 'hammer update' again.");
            return Ok(());
        }

        let name = self.run_transaction("update".to_string(), PackageWork::Upgrade)?;
        Logger::success(&format!("Deployment {name} is ready. Reboot to apply."));
        Ok(())
    }

    pub fn install(&self, package: &str) -> Result<()> {
        let name = self.run_transaction(
            format!("install {package}"),
            PackageWork::Install(package.to_string()),
        )?;
        Logger::success(&format!(
            "Installed {package} in deployment {name}. Reboot to apply."
        ));
        Ok(())
    }

    pub fn remove(&self, package: &str) -> Result<()> {
        let name = self.run_transaction(
            format!("remove {package}"),
            PackageWork::Remove(package.to_string()),
        )?;
        Logger::success(&format!(
            "Removed {package} in deployment {name}. Reboot to apply."
        ));
        Ok(())
    }

    /// New deployment with the current content under a new identity.
    pub fn deploy(&self) -> Result<()> {
        let name = self.run_transaction("deploy".to_string(), PackageWork::DeployOnly)?;
        Logger::success(&format!("Deployment {name} is ready. Reboot to apply."));
        Ok(())
    }

    /// Make `name` (or the second-newest deployment) the next boot target.
    pub fn switch(&self, name: Option<&str>) -> Result<()> {
        let _lock = LockFile::acquire(&self.config)?;
        preflight::check_required_tools(&[("btrfs", "btrfs-progs"), ("findmnt", "util-linux")])?;
        mount::ensure_top_mounted(&self.config)?;
        self.validate()?;

        let store = self.store();
        let target = match name {
            Some(name) => name.to_string(),
            None => {
                let all = store.all_newest_first()?;
                if all.len() < 2 {
                    return Err(EngineError::NotFound(
                        "no previous deployment to switch to".to_string(),
                    )
                    .into());
                }
                all[1].0.clone()
            }
        };

        self.promote(&target)
    }

    /// Re-target boot `steps` deployments back in creation order.
    pub fn rollback(&self, steps: usize) -> Result<()> {
        let _lock = LockFile::acquire(&self.config)?;
        preflight::check_required_tools(&[("btrfs", "btrfs-progs"), ("findmnt", "util-linux")])?;
        mount::ensure_top_mounted(&self.config)?;
        self.validate()?;

        let all = self.store().all_newest_first()?;
        if all.len() <= steps {
            return Err(EngineError::NotFound(format!(
                "cannot roll back {steps} deployment(s); only {} exist",
                all.len()
            ))
            .into());
        }
        let target = all[steps].0.clone();
        self.promote(&target)
    }

    /// Shared promotion path for switch/rollback. Caller holds the lock.
    fn promote(&self, target: &str) -> Result<()> {
        let store = self.store();
        let target_path = self.config.deployment_path(target);
        if !target_path.exists() {
            return Err(
                EngineError::NotFound(format!("deployment '{target}' not found")).into(),
            );
        }

        let target_meta = store.read(target)?;
        if matches!(target_meta.as_ref().map(|m| m.status), Some(DeployStatus::Broken)) {
            return Err(EngineError::Env(format!(
                "refusing to switch to broken deployment {target}"
            ))
            .into());
        }

        let current = self.current_name()?;
        if current == target {
            Logger::info(&format!("Deployment {target} is already current."));
            return Ok(());
        }

        let id = btrfs::subvol_id(&target_path)?;
        btrfs::set_default(id)?;
        self.repoint_current(target)?;

        store.set_status(&current, DeployStatus::Previous, Some("manual"))?;
        if matches!(target_meta.map(|m| m.status), Some(DeployStatus::Previous)) {
            store.set_status(target, DeployStatus::Ready, None)?;
        }

        Logger::success(&format!(
            "Switched to deployment {target}. Reboot to apply."
        ));
        Ok(())
    }

    /// Refresh package metadata on a scratch snapshot, then discard it.
    ///
    /// The current deployment is sealed and stays sealed; apt cannot write
    /// into it, so the refresh runs on a throwaway writable copy.
    pub fn refresh(&self) -> Result<()> {
        let _lock = LockFile::acquire(&self.config)?;
        preflight::check_host_tools()?;
        mount::ensure_top_mounted(&self.config)?;
        self.validate()?;

        let current = self.current_name()?;
        let current_path = self.config.deployment_path(&current);
        let scratch = format!(".refresh-{}", current.trim_start_matches(meta::DEPLOY_PREFIX));
        let scratch_path = self.config.deployments_dir.join(&scratch);
        if scratch_path.exists() {
            btrfs::delete_recursive(&scratch_path)?;
        }

        btrfs::snapshot_recursive(&current_path, &scratch_path, true)?;

        let result = (|| -> Result<()> {
            let chroot_mount = mount::prepare_chroot(&format!("deployments/{scratch}"))?;
            let cc = ChrootCmd::new(chroot_mount.path());
            cc.run_step("apt-update", &["apt-get", "update"])?;
            chroot_mount.teardown()
        })();

        let cleanup = btrfs::delete_recursive(&scratch_path);
        result?;
        cleanup?;

        Logger::success("Package metadata refreshed.");
        Ok(())
    }

    /// Prune sandbox containers and deployments beyond the retention count.
    pub fn clean(&self) -> Result<()> {
        let _lock = LockFile::acquire(&self.config)?;
        mount::ensure_top_mounted(&self.config)?;

        if preflight::command_exists("podman") {
            let _ = Cmd::new("podman")
                .args(["system", "prune", "-f"])
                .allow_fail()
                .run();
        }

        // Scratch subvolumes left behind by an interrupted refresh.
        if self.config.deployments_dir.exists() {
            for entry in fs::read_dir(&self.config.deployments_dir)? {
                let entry = entry?;
                if entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(".refresh-"))
                {
                    Logger::info(&format!(
                        "Removing leftover scratch subvolume {}",
                        entry.path().display()
                    ));
                    btrfs::delete_recursive(&entry.path())?;
                }
            }
        }

        let current = transaction::current_deployment_name(&self.config)?;
        let all: Vec<String> = self
            .store()
            .all_newest_first()?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let victims = select_clean_victims(
            &all,
            current.as_deref(),
            self.config.keep_deployments,
        );

        for name in &victims {
            Logger::info(&format!("Deleting deployment {name}"));
            btrfs::delete_recursive(&self.config.deployment_path(name))?;
        }

        Logger::success(&format!(
            "Clean finished; removed {} deployment(s).",
            victims.len()
        ));
        Ok(())
    }

    /// Print the current deployment's metadata.
    pub fn status(&self) -> Result<()> {
        let current = self.current_name()?;
        let meta = self.store().require(&current)?;

        println!("Deployment:     {current}");
        println!("Status:         {}", meta.status);
        println!("Created:        {}", meta.created);
        println!("Action:         {}", meta.action);
        if !meta.parent.is_empty() {
            println!("Parent:         {}", meta.parent);
        }
        println!("Kernel:         {}", meta.kernel);
        println!("System version: {}", meta.system_version);
        if let Some(reason) = &meta.rollback_reason {
            println!("Rollback:       {reason}");
        }
        Ok(())
    }

    /// List deployments newest first, marking the current one.
    pub fn history(&self) -> Result<()> {
        let current = transaction::current_deployment_name(&self.config)?;
        let all = self.store().all_newest_first()?;
        if all.is_empty() {
            println!("No deployments.");
            return Ok(());
        }

        for (name, meta) in all {
            let marker = if current.as_deref() == Some(name.as_str()) {
                "*"
            } else {
                " "
            };
            match meta {
                Some(meta) => println!(
                    "{marker} {name}  {:<8}  {}  {}",
                    meta.status.to_string(),
                    meta.created,
                    meta.action
                ),
                None => println!("{marker} {name}  (no metadata)"),
            }
        }
        Ok(())
    }

    /// Boot-time reconciliation of the transaction marker.
    pub fn check_transaction(&self) -> Result<()> {
        transaction::reconcile(&self.config)
    }

    // --- transaction scaffold ---

    /// The shared mutating transaction for update/install/remove/deploy.
    fn run_transaction(&self, action: String, work: PackageWork) -> Result<String> {
        let _lock = LockFile::acquire(&self.config)?;
        preflight::check_host_tools()?;
        mount::ensure_top_mounted(&self.config)?;
        self.validate()?;
        self.check_noop(&work)?;
        self.check_space()?;

        let parent = self.current_name()?;
        let parent_path = self.config.deployment_path(&parent);
        let name = self.mint_name()?;
        let new_path = self.config.deployment_path(&name);

        Logger::info(&format!("Creating deployment {name} from {parent}"));
        btrfs::snapshot_recursive(&parent_path, &new_path, true)?;
        self.marker().create(&name)?;

        match self.build_deployment(&name, &new_path, &parent, &action, &work) {
            Ok(()) => {
                self.marker().remove()?;
                Ok(name)
            }
            Err(e) => self.fail_transaction(&name, e),
        }
    }

    /// Install/remove requests that change nothing abort before any
    /// snapshot exists.
    fn check_noop(&self, work: &PackageWork) -> Result<()> {
        match work {
            PackageWork::Install(pkg) => {
                if package_installed(pkg)? {
                    return Err(EngineError::Noop(format!(
                        "package '{pkg}' is already installed"
                    ))
                    .into());
                }
            }
            PackageWork::Remove(pkg) => {
                if !package_installed(pkg)? {
                    return Err(EngineError::Noop(format!(
                        "package '{pkg}' is not installed"
                    ))
                    .into());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Chroot work through promotion. Any error here is caught once by
    /// [`Engine::fail_transaction`].
    fn build_deployment(
        &self,
        name: &str,
        new_path: &Path,
        parent: &str,
        action: &str,
        work: &PackageWork,
    ) -> Result<()> {
        let chroot_mount = mount::prepare_chroot(&format!("deployments/{name}"))?;
        let cc = ChrootCmd::new(chroot_mount.path());

        for (stage, argv) in chroot::pre_dump_steps(work) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            cc.run_step(&stage, &argv)?;
        }

        let dump = cc.capture("package-dump", chroot::DUMP_ARGV)?;
        let listing_path = new_path.join("tmp/packages.list");
        if let Some(parent_dir) = listing_path.parent() {
            fs::create_dir_all(parent_dir)?;
        }
        fs::write(&listing_path, &dump)?;

        for (stage, argv) in chroot::post_dump_steps(work) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            cc.run_step(&stage, &argv)?;
        }

        let (kernel, system_version) = self.consume_package_listing(&listing_path)?;
        self.sanity_check(chroot_mount.path(), new_path, &kernel)?;

        let meta = DeploymentMeta {
            created: meta::now_rfc3339()?,
            action: action.to_string(),
            parent: parent.to_string(),
            kernel,
            system_version,
            status: DeployStatus::Ready,
            rollback_reason: None,
        };
        self.store().write(name, &meta)?;

        bootentries::write_entries(&self.config, new_path)?;
        bootentries::disable_stock_generators(new_path)?;
        cc.run_step("update-grub", chroot::GRUB_ARGV)?;

        chroot_mount.teardown()?;

        btrfs::set_ro_recursive(new_path, true)?;
        let id = btrfs::subvol_id(new_path)?;
        btrfs::set_default(id)?;
        self.repoint_current(name)?;
        Ok(())
    }

    /// The single failure handler of a mutating transaction: demote the
    /// half-built deployment, clear the marker, re-raise. The chroot guard
    /// and the lock guard have already unwound by drop.
    fn fail_transaction<T>(&self, name: &str, err: anyhow::Error) -> Result<T> {
        if self.config.deployment_path(name).exists() {
            if let Err(meta_err) = self.store().set_status(name, DeployStatus::Broken, None) {
                Logger::error(&format!(
                    "Failed to mark deployment {name} broken: {meta_err}"
                ));
            } else {
                Logger::error(&format!("Deployment {name} marked broken."));
            }
        }
        let _ = self.marker().remove();
        Err(err)
    }

    /// Parse the kernel and hash the listing, then delete the dump file.
    fn consume_package_listing(&self, listing_path: &Path) -> Result<(String, String)> {
        let bytes = fs::read(listing_path).map_err(|_| {
            EngineError::Sanity(format!(
                "package listing missing: {}",
                listing_path.display()
            ))
        })?;

        let text = String::from_utf8_lossy(&bytes);
        let kernel = parse_highest_kernel(&text).ok_or_else(|| {
            EngineError::Sanity("no linux-image package in the installed set".to_string())
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let system_version = format!("{:x}", hasher.finalize());

        fs::remove_file(listing_path)?;
        Ok((kernel, system_version))
    }

    /// Pre-seal verification: kernel and initramfs present for the recorded
    /// kernel, fstab mountable.
    fn sanity_check(&self, chroot_root: &Path, new_path: &Path, kernel: &str) -> Result<()> {
        let vmlinuz = new_path.join("boot").join(format!("vmlinuz-{kernel}"));
        if !vmlinuz.exists() {
            return Err(EngineError::Sanity(format!(
                "kernel image missing: {}",
                vmlinuz.display()
            ))
            .into());
        }

        let initrd = new_path.join("boot").join(format!("initrd.img-{kernel}"));
        if !initrd.exists() {
            return Err(EngineError::Sanity(format!(
                "initramfs missing: {}",
                initrd.display()
            ))
            .into());
        }

        let out = Cmd::new("chroot")
            .arg_path(chroot_root)
            .args(["mount", "-f", "-a"])
            .allow_fail()
            .run()?;
        if !out.success {
            return Err(EngineError::Sanity(format!(
                "fstab dry-run mount failed: {}",
                out.stderr_str().trim()
            ))
            .into());
        }
        Ok(())
    }
}

/// `dpkg -s` reports an installed package with `Status: install ok installed`.
fn package_installed(package: &str) -> Result<bool> {
    let out = Cmd::new("dpkg").args(["-s", package]).allow_fail().run()?;
    Ok(out.success && out.stdout_str().contains("Status: install ok installed"))
}

/// Highest `linux-image-<version>` from a `dpkg -l` listing.
///
/// Meta-packages like `linux-image-amd64` carry no version in their name and
/// are skipped.
pub(crate) fn parse_highest_kernel(listing: &str) -> Option<String> {
    let mut best: Option<String> = None;
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("ii") {
            continue;
        }
        let Some(package) = fields.next() else {
            continue;
        };
        let Some(version) = package.strip_prefix("linux-image-") else {
            continue;
        };
        if !version.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        match &best {
            Some(current) if compare_versions(version, current) != Ordering::Greater => {}
            _ => best = Some(version.to_string()),
        }
    }
    best
}

/// Compare dotted version strings chunk-wise: numeric runs numerically,
/// everything else lexically.
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    let chunks = |s: &str| -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut digits = false;
        for c in s.chars() {
            if current.is_empty() || c.is_ascii_digit() == digits {
                digits = c.is_ascii_digit();
                current.push(c);
            } else {
                out.push(std::mem::take(&mut current));
                digits = c.is_ascii_digit();
                current.push(c);
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    };

    let (ca, cb) = (chunks(a), chunks(b));
    for (x, y) in ca.iter().zip(cb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ca.len().cmp(&cb.len())
}

/// Which deployments `clean` should delete: everything beyond the newest
/// `keep`, except that the current deployment is always retained (displacing
/// the oldest kept entry when needed).
pub(crate) fn select_clean_victims(
    all_newest_first: &[String],
    current: Option<&str>,
    keep: usize,
) -> Vec<String> {
    let mut kept: Vec<&String> = all_newest_first.iter().take(keep).collect();

    if let Some(current) = current {
        let current_kept = kept.iter().any(|n| n.as_str() == current);
        let current_exists = all_newest_first.iter().any(|n| n == current);
        if !current_kept && current_exists {
            kept.pop();
            kept.push(
                all_newest_first
                    .iter()
                    .find(|n| n.as_str() == current)
                    .unwrap(),
            );
        }
    }

    all_newest_first
        .iter()
        .filter(|name| !kept.iter().any(|k| k == name))
        .cloned()
        .collect()
}
