//! Durable mapping from cache key to captured response.
//!
//! Entries are written once and never updated. The index is keyed by entry id (the hash of
//! the key) so that seeding can register disk entries from file names alone. The index lock is
//! never held across a filesystem await.

mod disk;
mod entry;
mod key;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};

use disk::DiskLayout;

pub use entry::CacheEntry;
pub use key::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// Entries survive restarts under this directory.
    Disk(PathBuf),
    /// Entries live in process memory and vanish on exit.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// An entry already existed for the key; the store was left untouched.
    AlreadyPresent,
}

impl PutOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PutOutcome::Stored => "stored",
            PutOutcome::AlreadyPresent => "exists",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to persist cache entry at {path}: {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
enum Slot {
    OnDisk,
    InMemory(Arc<CacheEntry>),
}

#[derive(Debug)]
pub struct CacheStore {
    index: RwLock<HashMap<String, Slot>>,
    disk: Option<DiskLayout>,
}

impl CacheStore {
    pub async fn open(mode: StoreMode) -> Result<Self> {
        let disk = match mode {
            StoreMode::Memory => None,
            StoreMode::Disk(root) => {
                tokio::fs::create_dir_all(&root).await.with_context(|| {
                    format!("failed to create data directory {}", root.display())
                })?;
                Some(DiskLayout::new(root))
            }
        };
        Ok(Self {
            index: RwLock::new(HashMap::new()),
            disk,
        })
    }

    pub fn memory() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            disk: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.read().contains_key(&key.entry_id())
    }

    /// Registers entries already present on disk and clears leftover temp files. Entry files
    /// are not opened. Returns the number of indexed entries afterwards.
    pub async fn seed(&self) -> Result<usize> {
        let Some(disk) = self.disk.clone() else {
            return Ok(self.len());
        };
        let root = disk.root().to_path_buf();
        let (removed, found) = task::spawn_blocking(move || -> Result<_> {
            let removed = disk.remove_temp_files()?;
            let found = disk.scan()?;
            Ok((removed, found))
        })
        .await
        .map_err(|err| anyhow!("cache seed task failed: {err}"))?
        .with_context(|| format!("failed to scan data directory {}", root.display()))?;

        let count = {
            let mut index = self.index.write();
            for entry_id in found {
                index.entry(entry_id).or_insert(Slot::OnDisk);
            }
            index.len()
        };
        crate::metrics::set_cache_entries(count);
        info!(
            data_dir = %root.display(),
            entries = count,
            temp_files_removed = removed,
            "seeded cache index"
        );
        Ok(count)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let entry_id = key.entry_id();
        let slot = self.index.read().get(&entry_id).cloned()?;
        if let Slot::InMemory(entry) = slot {
            return Some(entry);
        }
        let disk = self.disk.as_ref()?;

        let data = match disk.read_entry(&entry_id).await {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                warn!(
                    key = %key,
                    path = %disk.entry_path(&entry_id).display(),
                    error = %err,
                    "cache entry unreadable; treating as miss"
                );
                if err.kind() == ErrorKind::NotFound {
                    self.forget(&entry_id);
                }
                return None;
            }
        };
        match entry::decode(key.as_str(), data) {
            Ok(entry) => Some(Arc::new(entry)),
            Err(err) => {
                warn!(
                    key = %key,
                    path = %disk.entry_path(&entry_id).display(),
                    error = %err,
                    "cache entry is corrupt; treating as miss"
                );
                self.forget(&entry_id);
                None
            }
        }
    }

    pub async fn put(
        &self,
        key: &CacheKey,
        entry: Arc<CacheEntry>,
    ) -> Result<PutOutcome, StoreError> {
        let entry_id = key.entry_id();
        if self.index.read().contains_key(&entry_id) {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let slot = match &self.disk {
            None => Slot::InMemory(entry),
            Some(disk) => {
                let data = entry::encode(key.as_str(), &entry).map_err(|err| {
                    StoreError::PersistFailed {
                        path: disk.entry_path(&entry_id),
                        source: err.into(),
                    }
                })?;
                let path = disk
                    .write_entry(&entry_id, &data)
                    .await
                    .map_err(|(path, source)| StoreError::PersistFailed { path, source })?;
                debug!(key = %key, path = %path.display(), bytes = data.len(), "wrote cache entry");
                Slot::OnDisk
            }
        };

        let (outcome, count) = {
            let mut index = self.index.write();
            let outcome = if index.contains_key(&entry_id) {
                PutOutcome::AlreadyPresent
            } else {
                index.insert(entry_id, slot);
                PutOutcome::Stored
            };
            (outcome, index.len())
        };
        crate::metrics::set_cache_entries(count);
        Ok(outcome)
    }

    fn forget(&self, entry_id: &str) {
        let count = {
            let mut index = self.index.write();
            index.remove(entry_id);
            index.len()
        };
        crate::metrics::set_cache_entries(count);
    }
}
