//! Transactional lifecycle management for btrfs system roots.
//!
//! A running HackerOS installation lives in a *deployment*: a snapshot
//! subvolume under `/btrfs-root/deployments/`, sealed read-only and promoted
//! to the boot target through the btrfs default-subvolume id and the
//! `current` symlink. Administrative operations never touch the running
//! root; each one builds a new deployment in a chroot and a reboot is the
//! atomic commit.
//!
//! # Architecture
//!
//! ```text
//! bin/hammer (CLI surface)
//!     │
//!     └── engine (transaction orchestration)
//!           ├── lock          single-writer lock file
//!           ├── btrfs         snapshot / property / set-default wrappers
//!           ├── mount         top-level mount + chroot bind-mount set
//!           ├── chroot        stepwise package work inside the chroot
//!           ├── meta          per-deployment meta.json
//!           ├── transaction   crash-safe promotion marker
//!           ├── bootentries   GRUB drop-in generation
//!           └── preflight     tool and disk-space checks
//! ```
//!
//! Crash safety: the default-subvolume flip and symlink repoint happen last,
//! so an interrupted transaction leaves the machine bootable into the
//! previous deployment; `check-transaction` reconciles the leftover marker
//! on the next boot.

pub mod bootentries;
pub mod btrfs;
pub mod chroot;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod meta;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod transaction;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
