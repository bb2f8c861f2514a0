//! LRU cache of open fork descriptors
//!
//! Bounds how many files the flat-file backend keeps open. The least
//! recently used descriptor is closed when a new one needs room.

use super::types::{ForkNumber, StorageIdentity};
use crate::error::{Error, Result};
use lru::LruCache;
use std::fs::File;
use std::num::NonZeroUsize;

type ForkKey = (StorageIdentity, ForkNumber);

/// Descriptor cache; callers provide locking
pub struct DescriptorCache {
    files: LruCache<ForkKey, File>,
    hits: u64,
    misses: u64,
}

impl DescriptorCache {
    /// Create a cache holding at most `capacity` descriptors
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            files: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached descriptor for a fork, or the one produced by `open`
    pub fn get_or_open(
        &mut self,
        key: ForkKey,
        open: impl FnOnce() -> Result<File>,
    ) -> Result<&mut File> {
        if self.files.contains(&key) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let file = open()?;
            self.files.put(key, file);
        }
        self.files.get_mut(&key).ok_or_else(|| {
            Error::Internal(format!("descriptor for fork {} of {} went missing", key.1, key.0))
        })
    }

    /// Keep a freshly created descriptor
    pub fn insert(&mut self, key: ForkKey, file: File) {
        self.files.put(key, file);
    }

    /// Close one fork's descriptor; no-op if it is not open
    pub fn remove(&mut self, key: &ForkKey) {
        self.files.pop(key);
    }

    pub fn contains(&self, key: &ForkKey) -> bool {
        self.files.contains(key)
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn stats(&self) -> DescriptorStats {
        let total = self.hits + self.misses;
        let hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
        DescriptorStats {
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            open: self.files.len(),
            capacity: self.files.cap().get(),
        }
    }
}

/// Descriptor cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DescriptorStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub open: usize,
    pub capacity: usize,
}
