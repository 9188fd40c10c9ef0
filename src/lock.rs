//! Single-writer mutual exclusion.
//!
//! The lock is a file whose existence denotes a held lock: acquisition
//! creates it with `O_EXCL` and fails immediately when it is already there.
//! The created file additionally holds an exclusive flock. The lock is not
//! PID-aware; a stale file after a crash is an operator decision, guided by
//! the transaction marker.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// RAII guard: the lock file is removed on drop, on every exit path
/// including panics.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    pub fn acquire(config: &EngineConfig) -> Result<Self> {
        let path = config.lock_path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory for {}", path.display()))?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EngineError::Busy.into());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("creating lock file {}", path.display()));
            }
        };

        if file.try_lock_exclusive().is_err() {
            drop(file);
            return Err(EngineError::Busy.into());
        }

        let _ = write!(file, "{}", std::process::id());

        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.path);
    }
}
