//! JSON files under a cache directory, one per key.
use crate::cache::CacheEntry;
use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub(crate) struct DiskStore {
    directory: PathBuf,
}

impl DiskStore {
    pub(crate) fn new(directory: &Path) -> DiskStore {
        DiskStore { directory: directory.to_path_buf() }
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.directory.join(format!("{digest}.json"))
    }

    pub(crate) fn load<V: DeserializeOwned>(&self, digest: &str) -> Result<Option<CacheEntry<V>>> {
        let path = self.entry_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path).with_context(|| format!("Failed to read cache file {}", path.display()))?;
        let entry = serde_json::from_slice(&content).with_context(|| format!("Corrupt cache file {}", path.display()))?;
        Ok(Some(entry))
    }

    /// Writes through a temporary file so readers never see a partial entry.
    pub(crate) fn store<V: Serialize>(&self, entry: &CacheEntry<V>) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .with_context(|| format!("Failed to create cache directory {}", self.directory.display()))?;
        let path = self.entry_path(&entry.key);
        let staging = path.with_extension("json.tmp");
        let content = serde_json::to_vec(entry).context("Failed to serialize cache entry")?;
        fs::write(&staging, content).with_context(|| format!("Failed to write cache file {}", staging.display()))?;
        fs::rename(&staging, &path).with_context(|| format!("Failed to move cache file into {}", path.display()))?;
        Ok(())
    }

    pub(crate) fn remove(&self, digest: &str) -> Result<()> {
        let path = self.entry_path(digest);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to remove cache file {}", path.display()))?;
        }
        Ok(())
    }

    /// Removes every stored entry computed from `source`, returning how many were removed.
    pub(crate) fn remove_source<V: DeserializeOwned>(&self, source: &Path) -> Result<usize> {
        if !self.directory.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let listing = fs::read_dir(&self.directory)
            .with_context(|| format!("Failed to list cache directory {}", self.directory.display()))?;
        for item in listing {
            let path = item?.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
                continue;
            }
            let Some(digest) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.load::<V>(digest) {
                Ok(Some(entry)) if entry.path == source => {
                    self.remove(digest)?;
                    removed += 1;
                }
                Ok(_) => (),
                Err(error) => tracing::warn!("Skipping unreadable cache file {}: {error:#}", path.display()),
            }
        }
        Ok(removed)
    }
}
