//! Content-addressed layer cache
//!
//! Keys are `hash(predecessor-state-hash, step-digest)`, so an entry is
//! valid only while the entire causal prefix is unchanged. Values are the
//! resulting state hash plus a materialized layer (a gzip-compressed tar
//! snapshot of the environment root). The index is append-only: inserting
//! the same key with a different result is a [`Error::CacheConflict`], the
//! signature of a non-deterministic step.

use crate::error::{Error, Result};
use crate::state;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";
const LAYERS_DIR: &str = "layers";

/// One recorded layer: the outcome of a (predecessor, step) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// State hash after the step was applied
    pub result_hash: String,
    /// Layer snapshot file name under `layers/`
    pub layer: String,
    /// Step name at record time, for reporting only
    pub step: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent store of provisioning layers
pub struct LayerCache {
    dir: PathBuf,
    index: BTreeMap<String, CacheEntry>,
}

impl LayerCache {
    /// Open (or create) a cache directory and load its index
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(LAYERS_DIR))?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_str(&fs::read_to_string(&index_path)?)?
        } else {
            BTreeMap::new()
        };

        Ok(Self { dir, index })
    }

    /// Cache key for a step applied on top of a predecessor state
    pub fn key(predecessor_hash: &str, step_digest: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(predecessor_hash.as_bytes());
        hasher.update(b"\n");
        hasher.update(step_digest.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Pure lookup; no side effects
    pub fn lookup(&self, predecessor_hash: &str, step_digest: &str) -> Option<&CacheEntry> {
        self.index.get(&Self::key(predecessor_hash, step_digest))
    }

    /// Record a step result and snapshot the environment root as its layer.
    ///
    /// Re-storing an identical result is a no-op; a different result under
    /// the same key aborts with [`Error::CacheConflict`].
    pub fn store(
        &mut self,
        predecessor_hash: &str,
        step_digest: &str,
        result_hash: &str,
        step_name: &str,
        root: &Path,
    ) -> Result<()> {
        let key = Self::key(predecessor_hash, step_digest);

        if let Some(existing) = self.index.get(&key) {
            if existing.result_hash == result_hash {
                log::debug!("cache entry for step '{step_name}' already recorded");
                return Ok(());
            }
            return Err(Error::CacheConflict {
                step: step_name.to_string(),
                key,
                existing: existing.result_hash.clone(),
                candidate: result_hash.to_string(),
            });
        }

        let layer = format!("{result_hash}.tar.gz");
        let layer_path = self.dir.join(LAYERS_DIR).join(&layer);
        if !layer_path.exists() {
            snapshot(root, &layer_path)?;
        }

        self.index.insert(
            key,
            CacheEntry {
                result_hash: result_hash.to_string(),
                layer,
                step: step_name.to_string(),
                created_at: Utc::now(),
            },
        );
        self.save_index()?;
        log::debug!("recorded layer {result_hash} for step '{step_name}'");
        Ok(())
    }

    /// Restore a cached layer into the environment root, replacing its
    /// current contents
    pub fn restore(&self, entry: &CacheEntry, root: &Path) -> Result<()> {
        let layer_path = self.dir.join(LAYERS_DIR).join(&entry.layer);
        state::clear_dir(root)?;
        let archive = File::open(&layer_path)?;
        tar::Archive::new(GzDecoder::new(archive)).unpack(root)?;
        log::debug!("restored layer {} into {}", entry.result_hash, root.display());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Entries in key order, for inspection
    pub fn entries(&self) -> impl Iterator<Item = (&str, &CacheEntry)> {
        self.index.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total on-disk size of the materialized layers
    pub fn layers_size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(self.dir.join(LAYERS_DIR))? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    /// Delete every entry and layer snapshot; returns the number of entries
    /// removed. This is an operator command, not an eviction policy.
    pub fn clear(&mut self) -> Result<usize> {
        let removed = self.index.len();
        self.index.clear();
        self.save_index()?;

        for entry in fs::read_dir(self.dir.join(LAYERS_DIR))? {
            fs::remove_file(entry?.path())?;
        }
        Ok(removed)
    }

    fn save_index(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.index)?;
        fs::write(self.dir.join(INDEX_FILE), content)?;
        Ok(())
    }
}

/// Snapshot a directory tree as a gzip-compressed tar archive
fn snapshot(root: &Path, layer_path: &Path) -> Result<()> {
    let file = File::create(layer_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", root)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, LayerCache, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::open(tmp.path().join("cache")).unwrap();
        let root = tmp.path().join("env");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("file"), "contents").unwrap();
        (tmp, cache, root)
    }

    #[test]
    fn test_store_and_lookup() {
        let (_tmp, mut cache, root) = fixture();

        assert!(cache.lookup("pred", "step").is_none());
        cache.store("pred", "step", "result", "packages", &root).unwrap();

        let entry = cache.lookup("pred", "step").unwrap();
        assert_eq!(entry.result_hash, "result");
        assert_eq!(entry.step, "packages");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_restore_materializes_layer() {
        let (tmp, mut cache, root) = fixture();
        cache.store("pred", "step", "result", "packages", &root).unwrap();

        let target = tmp.path().join("restored");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), "to be replaced").unwrap();

        let entry = cache.lookup("pred", "step").unwrap();
        cache.restore(entry, &target).unwrap();

        assert!(!target.join("stale").exists());
        assert_eq!(fs::read_to_string(target.join("file")).unwrap(), "contents");
    }

    #[test]
    fn test_same_result_restore_is_noop() {
        let (_tmp, mut cache, root) = fixture();
        cache.store("pred", "step", "result", "packages", &root).unwrap();
        cache.store("pred", "step", "result", "packages", &root).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_divergent_store_is_a_conflict() {
        let (_tmp, mut cache, root) = fixture();
        cache.store("pred", "step", "result-a", "packages", &root).unwrap();

        match cache.store("pred", "step", "result-b", "packages", &root) {
            Err(Error::CacheConflict { existing, candidate, .. }) => {
                assert_eq!(existing, "result-a");
                assert_eq!(candidate, "result-b");
            }
            other => panic!("expected CacheConflict, got {:?}", other.map(|_| ())),
        }

        // The original entry survives
        assert_eq!(cache.lookup("pred", "step").unwrap().result_hash, "result-a");
    }

    #[test]
    fn test_index_persists_across_open() {
        let (tmp, mut cache, root) = fixture();
        cache.store("pred", "step", "result", "packages", &root).unwrap();
        drop(cache);

        let reopened = LayerCache::open(tmp.path().join("cache")).unwrap();
        assert_eq!(reopened.lookup("pred", "step").unwrap().result_hash, "result");
    }

    #[test]
    fn test_clear_removes_entries_and_layers() {
        let (_tmp, mut cache, root) = fixture();
        cache.store("pred", "step", "result", "packages", &root).unwrap();
        assert!(cache.layers_size().unwrap() > 0);

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.layers_size().unwrap(), 0);
    }

    #[test]
    fn test_key_depends_on_both_inputs() {
        let base = LayerCache::key("pred", "step");
        assert_ne!(base, LayerCache::key("pred2", "step"));
        assert_ne!(base, LayerCache::key("pred", "step2"));
        assert_eq!(base, LayerCache::key("pred", "step"));
    }
}
