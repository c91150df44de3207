pub mod build;
pub mod cache;
pub mod validate;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the cache directory: an explicit flag, or the user cache dir
pub fn cache_dir(flag: Option<&Path>) -> Result<PathBuf> {
    match flag {
        Some(dir) => Ok(dir.to_path_buf()),
        None => {
            let base = dirs::cache_dir().context("Could not determine cache directory")?;
            Ok(base.join("strata"))
        }
    }
}
