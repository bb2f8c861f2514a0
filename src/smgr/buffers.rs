//! Page buffer cache contract
//!
//! The buffer cache owns in-memory page contents. It must be asked to
//! flush or drop pages before file-level sync, truncate or unlink so dirty
//! pages are not lost and stale pages are not resurrected.

use super::types::{BlockNumber, ForkNumber, StorageIdentity};
use crate::error::Result;
use parking_lot::Mutex;

/// Buffer cache operations consumed by the storage manager
pub trait BufferCache: Send + Sync {
    /// Write out every dirty page of the given relations
    fn flush_all_buffers(&self, relations: &[StorageIdentity]) -> Result<()>;

    /// Drop pages at or beyond `nblocks[i]` in `forks[i]`, without writing them
    fn drop_buffers_for_range(
        &self,
        relation: &StorageIdentity,
        forks: &[ForkNumber],
        nblocks: &[BlockNumber],
    ) -> Result<()>;

    /// Drop every page of the given relations, without writing them
    fn drop_all_buffers(&self, relations: &[StorageIdentity]) -> Result<()>;
}

/// Buffer cache that holds nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBufferCache;

impl BufferCache for NoopBufferCache {
    fn flush_all_buffers(&self, _relations: &[StorageIdentity]) -> Result<()> {
        Ok(())
    }

    fn drop_buffers_for_range(
        &self,
        _relation: &StorageIdentity,
        _forks: &[ForkNumber],
        _nblocks: &[BlockNumber],
    ) -> Result<()> {
        Ok(())
    }

    fn drop_all_buffers(&self, _relations: &[StorageIdentity]) -> Result<()> {
        Ok(())
    }
}

/// One request received by [`RecordingBufferCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferRequest {
    FlushAll(Vec<StorageIdentity>),
    DropRange {
        relation: StorageIdentity,
        forks: Vec<ForkNumber>,
        nblocks: Vec<BlockNumber>,
    },
    DropAll(Vec<StorageIdentity>),
}

/// Buffer cache that records every request, in order
#[derive(Debug, Default)]
pub struct RecordingBufferCache {
    requests: Mutex<Vec<BufferRequest>>,
}

impl RecordingBufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<BufferRequest> {
        self.requests.lock().clone()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

impl BufferCache for RecordingBufferCache {
    fn flush_all_buffers(&self, relations: &[StorageIdentity]) -> Result<()> {
        self.requests
            .lock()
            .push(BufferRequest::FlushAll(relations.to_vec()));
        Ok(())
    }

    fn drop_buffers_for_range(
        &self,
        relation: &StorageIdentity,
        forks: &[ForkNumber],
        nblocks: &[BlockNumber],
    ) -> Result<()> {
        self.requests.lock().push(BufferRequest::DropRange {
            relation: *relation,
            forks: forks.to_vec(),
            nblocks: nblocks.to_vec(),
        });
        Ok(())
    }

    fn drop_all_buffers(&self, relations: &[StorageIdentity]) -> Result<()> {
        self.requests
            .lock()
            .push(BufferRequest::DropAll(relations.to_vec()));
        Ok(())
    }
}
