//! Per-handle block operations
//!
//! Each call dispatches through the backend bound to the handle and keeps
//! the per-fork block-count cache honest.

use super::metrics::FSYNC_TOTAL;
use super::registry::{entry, entry_mut, SmgrRegistry};
use super::handle::SmgrHandle;
use super::types::{BlockNumber, ForkNumber};
use crate::error::Result;
use tracing::{debug, trace};

impl SmgrRegistry {
    /// Create the physical file of one fork. `is_redo` tolerates an
    /// existing file while replaying history.
    pub fn create_fork(&mut self, handle: &SmgrHandle, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.create(&rel.identity, fork, is_redo)?;
        debug!(relation = %rel.identity, %fork, is_redo, "Created fork");
        Ok(())
    }

    /// Add a block at or beyond end of file.
    ///
    /// The cached size advances by one only if it was exactly `block`
    /// before; anything else leaves it unknown.
    pub fn extend(
        &mut self,
        handle: &SmgrHandle,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        let rel = entry_mut(&mut self.relations, handle)?;
        rel.backend
            .extend(&rel.identity, fork, block, buffer, skip_fsync)?;

        let next = match rel.cached(fork) {
            Some(cached) if cached == block => block.checked_add(1),
            _ => None,
        };
        rel.set_cached(fork, next);
        trace!(relation = %rel.identity, %fork, block, "Extended fork");
        Ok(())
    }

    /// Start an asynchronous read of a block. `false` when the file is
    /// gone, which is expected while replaying drops.
    pub fn prefetch(&self, handle: &SmgrHandle, fork: ForkNumber, block: BlockNumber) -> Result<bool> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.prefetch(&rel.identity, fork, block)
    }

    pub fn read(
        &self,
        handle: &SmgrHandle,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &mut [u8],
    ) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.read(&rel.identity, fork, block, buffer)
    }

    /// Overwrite an existing block. Not synchronous: durability waits for
    /// the next forced sync unless `skip_fsync` says the caller handles it.
    pub fn write(
        &mut self,
        handle: &SmgrHandle,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend
            .write(&rel.identity, fork, block, buffer, skip_fsync)
    }

    /// Hint the kernel to start writing back a block range
    pub fn writeback(
        &self,
        handle: &SmgrHandle,
        fork: ForkNumber,
        start: BlockNumber,
        count: BlockNumber,
    ) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.writeback(&rel.identity, fork, start, count)
    }

    /// Cached size of a fork, if it may be trusted.
    ///
    /// Only historical replay trusts the cache: outside it other workers
    /// may change the size and nothing tells us.
    pub fn cached_block_count(&self, handle: &SmgrHandle, fork: ForkNumber) -> Result<Option<BlockNumber>> {
        let rel = entry(&self.relations, handle)?;
        if self.replay.is_active() {
            return Ok(rel.cached(fork));
        }
        Ok(None)
    }

    /// Number of blocks in a fork
    pub fn block_count(&mut self, handle: &SmgrHandle, fork: ForkNumber) -> Result<BlockNumber> {
        if let Some(nblocks) = self.cached_block_count(handle, fork)? {
            return Ok(nblocks);
        }

        let rel = entry_mut(&mut self.relations, handle)?;
        let nblocks = rel.backend.nblocks(&rel.identity, fork)?;
        rel.set_cached(fork, Some(nblocks));
        Ok(nblocks)
    }

    /// Force earlier writes of a fork to stable storage. Dirty buffers of
    /// the fork must already have been flushed by the caller.
    pub fn immediate_sync(&self, handle: &SmgrHandle, fork: ForkNumber) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.immediate_sync(&rel.identity, fork)?;
        FSYNC_TOTAL.inc();
        Ok(())
    }

    // --- Unlogged build hooks ---

    pub fn start_unlogged_build(&self, handle: &SmgrHandle) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.start_unlogged_build(&rel.identity)
    }

    pub fn finish_unlogged_build_phase_1(&self, handle: &SmgrHandle) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.finish_unlogged_build_phase_1(&rel.identity)
    }

    pub fn end_unlogged_build(&self, handle: &SmgrHandle) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.end_unlogged_build(&rel.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::smgr::backend::{BackendResolver, StorageBackend};
    use crate::smgr::mock::MemoryBackend;
    use crate::smgr::types::{Durability, StorageIdentity};
    use std::sync::Arc;

    const BLOCK: usize = 16;

    fn setup() -> (SmgrRegistry, MemoryBackend, SmgrHandle) {
        let backend = MemoryBackend::new(BLOCK);
        let resolver = Arc::new(BackendResolver::new(Arc::new(backend.clone())));
        let mut reg = SmgrRegistry::new(resolver).unwrap();
        let h = reg
            .lookup_or_create(StorageIdentity::shared(1663, 1, 2000), Durability::Permanent)
            .unwrap();
        reg.create_fork(&h, ForkNumber::Main, false).unwrap();
        (reg, backend, h)
    }

    #[test]
    fn test_extend_advances_matching_cache() -> Result<()> {
        let (mut reg, _, h) = setup();
        assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 0);

        reg.extend(&h, ForkNumber::Main, 0, &[1u8; BLOCK], false)?;
        assert_eq!(reg.info(&h)?.cached_nblocks[ForkNumber::Main.index()], Some(1));
        Ok(())
    }

    #[test]
    fn test_extend_with_unknown_cache_stays_unknown() -> Result<()> {
        let (mut reg, _, h) = setup();
        reg.extend(&h, ForkNumber::Main, 0, &[1u8; BLOCK], false)?;
        assert_eq!(reg.info(&h)?.cached_nblocks[ForkNumber::Main.index()], None);
        Ok(())
    }

    #[test]
    fn test_extend_past_cached_end_invalidates() -> Result<()> {
        let (mut reg, _, h) = setup();
        assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 0);

        // Skipping ahead leaves a zero-filled gap and an unknown cache
        reg.extend(&h, ForkNumber::Main, 3, &[2u8; BLOCK], false)?;
        assert_eq!(reg.info(&h)?.cached_nblocks[ForkNumber::Main.index()], None);
        assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 4);

        let mut buf = [9u8; BLOCK];
        reg.read(&h, ForkNumber::Main, 1, &mut buf)?;
        assert_eq!(buf, [0u8; BLOCK]);
        Ok(())
    }

    #[test]
    fn test_block_count_queries_backend_outside_replay() -> Result<()> {
        let (mut reg, backend, h) = setup();
        reg.block_count(&h, ForkNumber::Main)?;
        reg.block_count(&h, ForkNumber::Main)?;
        assert_eq!(backend.calls().nblocks, 2);
        Ok(())
    }

    #[test]
    fn test_block_count_trusts_cache_in_replay() -> Result<()> {
        let (mut reg, backend, h) = setup();
        reg.replay_mode().enter();

        reg.block_count(&h, ForkNumber::Main)?;
        reg.block_count(&h, ForkNumber::Main)?;
        assert_eq!(backend.calls().nblocks, 1);
        assert_eq!(reg.cached_block_count(&h, ForkNumber::Main)?, Some(0));
        Ok(())
    }

    #[test]
    fn test_read_write_round_trip() -> Result<()> {
        let (mut reg, _, h) = setup();
        reg.extend(&h, ForkNumber::Main, 0, &[0u8; BLOCK], true)?;
        reg.write(&h, ForkNumber::Main, 0, &[5u8; BLOCK], false)?;

        let mut buf = [0u8; BLOCK];
        reg.read(&h, ForkNumber::Main, 0, &mut buf)?;
        assert_eq!(buf, [5u8; BLOCK]);
        Ok(())
    }

    #[test]
    fn test_prefetch_after_file_removed_returns_false() -> Result<()> {
        let (reg, backend, h) = setup();
        assert!(reg.prefetch(&h, ForkNumber::Main, 0)?);

        backend.unlink(h.identity(), ForkNumber::Main)?;
        assert!(!reg.prefetch(&h, ForkNumber::Main, 0)?);
        Ok(())
    }

    #[test]
    fn test_create_existing_fork_needs_redo() -> Result<()> {
        let (mut reg, _, h) = setup();
        assert!(matches!(
            reg.create_fork(&h, ForkNumber::Main, false),
            Err(Error::AlreadyExists(_))
        ));
        reg.create_fork(&h, ForkNumber::Main, true)?;
        Ok(())
    }

    #[test]
    fn test_sync_writeback_and_unlogged_hooks_dispatch() -> Result<()> {
        let (reg, backend, h) = setup();
        reg.writeback(&h, ForkNumber::Main, 0, 0)?;
        reg.immediate_sync(&h, ForkNumber::Main)?;
        reg.start_unlogged_build(&h)?;
        reg.finish_unlogged_build_phase_1(&h)?;
        reg.end_unlogged_build(&h)?;

        let calls = backend.calls();
        assert_eq!(calls.writebacks, 1);
        assert_eq!(calls.syncs, 1);
        assert_eq!(calls.unlogged_build_steps, 3);
        Ok(())
    }
}
