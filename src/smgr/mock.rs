//! In-memory storage backend
//!
//! Keeps every fork as a vector of blocks. Intended for tests and for
//! resolver override hooks; nothing survives the process. Call counters
//! let tests observe whether the registry reached the backend at all.

use super::backend::StorageBackend;
use super::types::{BlockNumber, ForkNumber, StorageIdentity};
use crate::error::{Error, Result};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ForkKey = (StorageIdentity, ForkNumber);

/// Snapshot of backend call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub opens: u64,
    pub nblocks: u64,
    pub syncs: u64,
    pub writebacks: u64,
    pub unlogged_build_steps: u64,
}

#[derive(Default)]
struct Counters {
    opens: AtomicU64,
    nblocks: AtomicU64,
    syncs: AtomicU64,
    writebacks: AtomicU64,
    unlogged_build_steps: AtomicU64,
}

/// In-memory backend
#[derive(Clone)]
pub struct MemoryBackend {
    block_size: usize,
    forks: Arc<DashMap<ForkKey, Vec<Vec<u8>>>>,
    open_forks: Arc<DashSet<ForkKey>>,
    counters: Arc<Counters>,
}

impl MemoryBackend {
    /// Create an empty backend with the given block size
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            forks: Arc::new(DashMap::new()),
            open_forks: Arc::new(DashSet::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of forks with a "descriptor" currently open
    pub fn open_fork_count(&self) -> usize {
        self.open_forks.len()
    }

    pub fn is_fork_open(&self, identity: &StorageIdentity, fork: ForkNumber) -> bool {
        self.open_forks.contains(&(*identity, fork))
    }

    /// Number of physical forks stored
    pub fn len(&self) -> usize {
        self.forks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            opens: self.counters.opens.load(Ordering::SeqCst),
            nblocks: self.counters.nblocks.load(Ordering::SeqCst),
            syncs: self.counters.syncs.load(Ordering::SeqCst),
            writebacks: self.counters.writebacks.load(Ordering::SeqCst),
            unlogged_build_steps: self.counters.unlogged_build_steps.load(Ordering::SeqCst),
        }
    }

    fn check_buffer(&self, len: usize) -> Result<()> {
        if len != self.block_size {
            return Err(Error::InvalidArgument(format!(
                "Buffer of {} bytes does not match block size {}",
                len, self.block_size
            )));
        }
        Ok(())
    }

    fn missing(identity: &StorageIdentity, fork: ForkNumber) -> Error {
        Error::NotFound(format!("Fork {} of relation {} does not exist", fork, identity))
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, _identity: &StorageIdentity) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        self.open_forks.remove(&(*identity, fork));
        Ok(())
    }

    fn create(&self, identity: &StorageIdentity, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let key = (*identity, fork);
        if self.forks.contains_key(&key) {
            if !is_redo {
                return Err(Error::AlreadyExists(format!(
                    "Fork {} of relation {} already exists",
                    fork, identity
                )));
            }
        } else {
            self.forks.insert(key, Vec::new());
        }
        self.open_forks.insert(key);
        Ok(())
    }

    fn exists(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<bool> {
        Ok(self.forks.contains_key(&(*identity, fork)))
    }

    fn unlink(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        let key = (*identity, fork);
        self.open_forks.remove(&key);
        self.forks
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Self::missing(identity, fork))
    }

    fn extend(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        _skip_fsync: bool,
    ) -> Result<()> {
        self.check_buffer(buffer.len())?;
        if block == BlockNumber::MAX {
            return Err(Error::InvalidArgument(format!(
                "Cannot extend fork {} of {} beyond {} blocks",
                fork,
                identity,
                BlockNumber::MAX
            )));
        }
        let key = (*identity, fork);
        let mut blocks = self
            .forks
            .get_mut(&key)
            .ok_or_else(|| Self::missing(identity, fork))?;

        let block = block as usize;
        if block < blocks.len() {
            return Err(Error::InvalidArgument(format!(
                "Cannot extend fork {} of {}: block {} is below end of file {}",
                fork,
                identity,
                block,
                blocks.len()
            )));
        }
        blocks.resize(block, vec![0u8; self.block_size]);
        blocks.push(buffer.to_vec());
        drop(blocks);

        self.open_forks.insert(key);
        Ok(())
    }

    fn prefetch(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        _block: BlockNumber,
    ) -> Result<bool> {
        self.exists(identity, fork)
    }

    fn read(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &mut [u8],
    ) -> Result<()> {
        self.check_buffer(buffer.len())?;
        let blocks = self
            .forks
            .get(&(*identity, fork))
            .ok_or_else(|| Self::missing(identity, fork))?;
        let data = blocks.get(block as usize).ok_or_else(|| {
            Error::Storage(format!(
                "Could not read block {} of fork {} of {}: only {} blocks",
                block,
                fork,
                identity,
                blocks.len()
            ))
        })?;
        buffer.copy_from_slice(data);
        Ok(())
    }

    fn write(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        _skip_fsync: bool,
    ) -> Result<()> {
        self.check_buffer(buffer.len())?;
        let mut blocks = self
            .forks
            .get_mut(&(*identity, fork))
            .ok_or_else(|| Self::missing(identity, fork))?;
        let len = blocks.len();
        let slot = blocks.get_mut(block as usize).ok_or_else(|| {
            Error::Storage(format!(
                "Could not write block {} of fork {} of {}: only {} blocks",
                block, fork, identity, len
            ))
        })?;
        slot.copy_from_slice(buffer);
        Ok(())
    }

    fn writeback(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        _start: BlockNumber,
        _count: BlockNumber,
    ) -> Result<()> {
        if !self.forks.contains_key(&(*identity, fork)) {
            return Err(Self::missing(identity, fork));
        }
        self.counters.writebacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn nblocks(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<BlockNumber> {
        self.counters.nblocks.fetch_add(1, Ordering::SeqCst);
        let blocks = self
            .forks
            .get(&(*identity, fork))
            .ok_or_else(|| Self::missing(identity, fork))?;
        BlockNumber::try_from(blocks.len()).map_err(|_| {
            Error::Storage(format!(
                "Fork {} of {} holds more blocks than a block number can address",
                fork, identity
            ))
        })
    }

    fn truncate(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let mut blocks = self
            .forks
            .get_mut(&(*identity, fork))
            .ok_or_else(|| Self::missing(identity, fork))?;
        if nblocks as usize > blocks.len() {
            return Err(Error::InvalidArgument(format!(
                "Cannot truncate fork {} of {} to {} blocks: it is only {} blocks",
                fork,
                identity,
                nblocks,
                blocks.len()
            )));
        }
        blocks.truncate(nblocks as usize);
        Ok(())
    }

    fn immediate_sync(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        if !self.forks.contains_key(&(*identity, fork)) {
            return Err(Self::missing(identity, fork));
        }
        self.counters.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_unlogged_build(&self, _identity: &StorageIdentity) -> Result<()> {
        self.counters.unlogged_build_steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish_unlogged_build_phase_1(&self, _identity: &StorageIdentity) -> Result<()> {
        self.counters.unlogged_build_steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn end_unlogged_build(&self, _identity: &StorageIdentity) -> Result<()> {
        self.counters.unlogged_build_steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
