//! Exclusive acquisition of an environment root
//!
//! EnvironmentState and the active principal are owned by exactly one
//! in-flight run. The lock is a sibling file of the root created with
//! `create_new` semantics and released on drop, so a second run against the
//! same root fails fast instead of interleaving.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Holds the environment root for the duration of one run
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock for `root`, failing with [`Error::LockHeld`] if
    /// another run holds it
    pub fn acquire(root: &Path) -> Result<Self> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let path = root.with_file_name(format!("{name}.lock"));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Owner pid, for the human who finds a stale lock
                let _ = writeln!(file, "{}", std::process::id());
                log::debug!("acquired lock {}", path.display());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::LockHeld(path)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}
