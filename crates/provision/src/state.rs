//! Environment state: the materialized root, its metadata, and content hashing
//!
//! The state is a directory tree (the environment root) plus a metadata
//! table (user database, path-alias table, package database) persisted
//! inside the root at `.provision/state.json`, so snapshots and hashes
//! cover it. The abstract identity of a state is the BLAKE3 hash over the
//! tree and metadata.

use crate::error::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directory inside the environment root holding engine metadata
pub const META_DIR: &str = ".provision";

/// Metadata file name inside [`META_DIR`]
pub const META_FILE: &str = "state.json";

/// A user record in the environment's user database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: u32,
    pub home: PathBuf,
}

/// Metadata persisted inside the environment root.
///
/// BTreeMaps keep the serialized form canonical, which the state hash
/// depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// User database: name -> record
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,

    /// Path-alias table: global command name -> binary inside the environment
    #[serde(default)]
    pub aliases: BTreeMap<String, PathBuf>,

    /// Package database: name -> resolved version
    #[serde(default)]
    pub packages: BTreeMap<String, String>,
}

/// The cumulative filesystem/user/alias state produced by a prefix of steps.
///
/// Exclusively owned by a single pipeline run (see [`crate::lock`]).
pub struct EnvironmentState {
    root: PathBuf,
    meta: Metadata,
}

impl EnvironmentState {
    /// Open (or create) an environment root and load its metadata
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let meta_path = root.join(META_DIR).join(META_FILE);
        let meta = if meta_path.exists() {
            serde_json::from_str(&fs::read_to_string(&meta_path)?)?
        } else {
            let meta = Metadata::default();
            write_meta(&root, &meta)?;
            meta
        };

        Ok(Self { root, meta })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Reset to the empty base state. Every run starts here; prior
    /// materialized state is replaced (the cache makes replay cheap).
    pub fn reset(&mut self) -> Result<()> {
        clear_dir(&self.root)?;
        self.meta = Metadata::default();
        write_meta(&self.root, &self.meta)
    }

    /// Re-read metadata from disk, after a cache restore replaced the tree
    pub(crate) fn reload_meta(&mut self) -> Result<()> {
        let meta_path = self.root.join(META_DIR).join(META_FILE);
        self.meta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
        Ok(())
    }

    /// Map an environment-absolute path (e.g. `/home/indy`) to the host path
    /// inside this root
    pub fn host_path(&self, env_path: &Path) -> PathBuf {
        host_path_in(&self.root, env_path)
    }

    /// Content hash of the state: BLAKE3 over every path, file content and
    /// executable bit under the root (metadata included, since it lives in
    /// the tree). File contents are hashed in parallel; the combination
    /// order is the sorted path order, so the result is deterministic.
    pub fn hash(&self) -> Result<String> {
        hash_tree(&self.root)
    }

    /// Copy the current tree into a staging directory next to the root.
    ///
    /// A step executes against the staging copy and is committed as a whole
    /// or not at all.
    pub(crate) fn begin_staging(&self) -> Result<Staging> {
        let dir = sibling(&self.root, "staging");
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        copy_tree(&self.root, &dir)?;
        Ok(Staging {
            dir,
            meta: self.meta.clone(),
        })
    }

    /// Replace the root with a fully-applied staging copy
    pub(crate) fn commit(&mut self, staging: Staging) -> Result<()> {
        write_meta(&staging.dir, &staging.meta)?;

        let retired = sibling(&self.root, "old");
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        fs::rename(&self.root, &retired)?;
        fs::rename(&staging.dir, &self.root)?;
        fs::remove_dir_all(&retired)?;

        self.meta = staging.meta;
        Ok(())
    }
}

/// A staged copy of the environment, mutated by one in-flight step
pub(crate) struct Staging {
    pub(crate) dir: PathBuf,
    pub(crate) meta: Metadata,
}

impl Staging {
    pub(crate) fn host_path(&self, env_path: &Path) -> PathBuf {
        host_path_in(&self.dir, env_path)
    }

    /// Throw the staged copy away; the committed state is untouched
    pub(crate) fn discard(self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            log::warn!("failed to remove staging dir {}: {e}", self.dir.display());
        }
    }
}

fn write_meta(root: &Path, meta: &Metadata) -> Result<()> {
    let dir = root.join(META_DIR);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
    Ok(())
}

fn host_path_in(root: &Path, env_path: &Path) -> PathBuf {
    match env_path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(env_path),
    }
}

/// A sibling path of `dir` with a dotted suffix, e.g. `root` -> `root.staging`
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    dir.with_file_name(format!("{name}.{suffix}"))
}

/// Remove everything inside `dir` without removing `dir` itself
pub(crate) fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Recursively copy a directory tree; `fs::copy` preserves permission bits
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn hash_tree(root: &Path) -> Result<String> {
    let mut entries: Vec<(String, bool, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_string_lossy()
            .to_string();
        entries.push((relative, entry.file_type().is_dir(), entry.path().to_path_buf()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let hashed: Result<Vec<(String, bool, Option<(String, bool)>)>> = entries
        .into_par_iter()
        .map(|(relative, is_dir, path)| {
            let content = if is_dir {
                None
            } else {
                let hash = blake3::hash(&fs::read(&path)?).to_hex().to_string();
                Some((hash, is_executable(&path)))
            };
            Ok((relative, is_dir, content))
        })
        .collect();

    let mut hasher = blake3::Hasher::new();
    for (relative, is_dir, content) in hashed? {
        hasher.update(relative.as_bytes());
        hasher.update(if is_dir { b"/d" } else { b"/f" });
        if let Some((hash, executable)) = content {
            hasher.update(hash.as_bytes());
            hasher.update(if executable { b"x" } else { b"-" });
        }
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}
