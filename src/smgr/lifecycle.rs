//! Bulk operations and lifecycle sweeps
//!
//! Operations here span many handles. Cross-worker safety comes from
//! ordering: buffers are dealt with first, invalidation notices go out
//! before any physical change, and nothing is rolled back.

use super::backend::StorageBackend;
use super::handle::SmgrHandle;
use super::invalidation::InvalidationReceiver;
use super::metrics::{FSYNC_TOTAL, INVALIDATIONS_SENT, UNLINK_FAILURES};
use super::registry::{entry, entry_mut, SmgrRegistry};
use super::types::{BlockNumber, ForkNumber, StorageIdentity};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Target = (StorageIdentity, Arc<dyn StorageBackend>);

impl SmgrRegistry {
    fn targets(&self, handles: &[SmgrHandle]) -> Result<Vec<Target>> {
        handles
            .iter()
            .map(|handle| -> Result<Target> {
                let rel = entry(&self.relations, handle)?;
                Ok((rel.identity, Arc::clone(&rel.backend)))
            })
            .collect()
    }

    /// Make every existing fork of the given relations durable.
    ///
    /// Dirty buffers of all relations are flushed in one pass first, then
    /// each existing fork is synced.
    pub fn sync_all(&self, handles: &[SmgrHandle]) -> Result<()> {
        if handles.is_empty() {
            return Ok(());
        }

        let targets = self.targets(handles)?;
        let identities: Vec<StorageIdentity> = targets.iter().map(|(id, _)| *id).collect();
        self.buffers.flush_all_buffers(&identities)?;

        let mut synced = 0usize;
        for (identity, backend) in &targets {
            for fork in ForkNumber::ALL {
                if backend.exists(identity, fork)? {
                    backend.immediate_sync(identity, fork)?;
                    FSYNC_TOTAL.inc();
                    synced += 1;
                }
            }
        }

        debug!(relations = targets.len(), forks = synced, "Synced relations");
        Ok(())
    }

    /// Remove the storage of the given relations, irreversibly.
    ///
    /// Buffers are dropped unwritten, every fork is closed, an invalidation
    /// notice goes out per relation and only then are the files deleted.
    /// Delete failures are logged and skipped: the drop is already decided.
    /// Handles stay in the registry until their invalidation is processed.
    pub fn unlink_all(&mut self, handles: &[SmgrHandle], is_redo: bool) -> Result<()> {
        if handles.is_empty() {
            return Ok(());
        }

        let targets = self.targets(handles)?;
        let identities: Vec<StorageIdentity> = targets.iter().map(|(id, _)| *id).collect();
        self.buffers.drop_all_buffers(&identities)?;

        for (identity, backend) in &targets {
            for fork in ForkNumber::ALL {
                backend.close(identity, fork)?;
            }
        }

        for identity in &identities {
            self.invalidation.broadcast_invalidate(*identity);
            INVALIDATIONS_SENT.inc();
        }

        for (identity, backend) in &targets {
            for fork in ForkNumber::ALL {
                match backend.unlink(identity, fork) {
                    Ok(()) => debug!(relation = %identity, %fork, "Unlinked fork"),
                    // Auxiliary forks are often never created
                    Err(e) if e.is_not_found() && fork != ForkNumber::Main => {}
                    Err(e) if e.is_not_found() && is_redo => {
                        warn!(relation = %identity, %fork, "Relation storage already gone during replay");
                    }
                    Err(e) => {
                        UNLINK_FAILURES.inc();
                        warn!(relation = %identity, %fork, error = %e, "Could not remove relation file");
                    }
                }
            }
        }

        info!(relations = identities.len(), is_redo, "Unlinked relations");
        Ok(())
    }

    /// Shrink forks of one relation to `nblocks[i]` blocks.
    ///
    /// The caller must hold an exclusive lock on the relation. Buffers past
    /// the new ends are dropped and other workers are told to forget the old
    /// size before the files change. A fork's cached size is unknown while
    /// its truncate is in flight.
    pub fn truncate(
        &mut self,
        handle: &SmgrHandle,
        forks: &[ForkNumber],
        nblocks: &[BlockNumber],
    ) -> Result<()> {
        if forks.len() != nblocks.len() {
            return Err(Error::InvalidArgument(format!(
                "truncate got {} forks but {} block counts",
                forks.len(),
                nblocks.len()
            )));
        }

        let identity = entry(&self.relations, handle)?.identity;
        self.buffers
            .drop_buffers_for_range(&identity, forks, nblocks)?;

        self.invalidation.broadcast_invalidate(identity);
        INVALIDATIONS_SENT.inc();

        let rel = entry_mut(&mut self.relations, handle)?;
        for (&fork, &count) in forks.iter().zip(nblocks) {
            rel.set_cached(fork, None);
            rel.backend.truncate(&identity, fork, count)?;
            rel.set_cached(fork, Some(count));
            debug!(relation = %identity, %fork, nblocks = count, "Truncated fork");
        }
        Ok(())
    }

    /// Close every unowned handle; run at end of transaction.
    ///
    /// Returns how many handles were closed.
    pub fn end_of_transaction_sweep(&mut self) -> Result<usize> {
        let unowned = self.unowned_handles();
        for handle in &unowned {
            debug_assert_eq!(self.owner_of(handle)?, None);
            self.close(handle)?;
        }
        if !unowned.is_empty() {
            debug!(closed = unowned.len(), "End-of-transaction sweep");
        }
        Ok(unowned.len())
    }

    /// Answer a release barrier: drop every backend resource and cached
    /// size while keeping the handles, then report success.
    pub fn barrier_release(&mut self) -> Result<bool> {
        self.release_all()?;
        info!(handles = self.len(), "Processed release barrier");
        Ok(true)
    }

    /// Apply pending invalidation notices; returns how many were drained
    pub fn process_invalidations(&mut self, receiver: &InvalidationReceiver) -> Result<usize> {
        let notices = receiver.drain();
        for identity in &notices {
            self.close_by_identity(identity)?;
        }
        Ok(notices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmgrConfig;
    use crate::smgr::backend::BackendResolver;
    use crate::smgr::buffers::{BufferRequest, RecordingBufferCache};
    use crate::smgr::invalidation::InvalidationHub;
    use crate::smgr::mock::MemoryBackend;
    use crate::smgr::recovery::ReplayMode;
    use crate::smgr::registry::Collaborators;
    use crate::smgr::types::Durability;

    const BLOCK: usize = 16;

    struct Fixture {
        reg: SmgrRegistry,
        backend: MemoryBackend,
        buffers: Arc<RecordingBufferCache>,
        inbox: InvalidationReceiver,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new(BLOCK);
        let buffers = Arc::new(RecordingBufferCache::new());
        let hub = Arc::new(InvalidationHub::new());
        let inbox = hub.subscribe();
        let resolver = Arc::new(BackendResolver::new(Arc::new(backend.clone())));
        let reg = SmgrRegistry::with_options(
            resolver,
            Collaborators {
                buffers: buffers.clone(),
                invalidation: hub,
                replay: ReplayMode::new(),
            },
            &SmgrConfig::default(),
        )
        .unwrap();
        Fixture {
            reg,
            backend,
            buffers,
            inbox,
        }
    }

    fn relation_with_blocks(f: &mut Fixture, rel: u32, blocks: u32) -> SmgrHandle {
        let h = f
            .reg
            .lookup_or_create(StorageIdentity::shared(1663, 1, rel), Durability::Permanent)
            .unwrap();
        f.reg.create_fork(&h, ForkNumber::Main, false).unwrap();
        for block in 0..blocks {
            f.reg.extend(&h, ForkNumber::Main, block, &[block as u8; BLOCK], false).unwrap();
        }
        h
    }

    #[test]
    fn test_sync_all_flushes_then_syncs_existing_forks() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 10, 2);
        let b = relation_with_blocks(&mut f, 11, 1);
        f.reg.create_fork(&b, ForkNumber::VisibilityMap, false)?;

        f.reg.sync_all(&[a, b])?;

        assert_eq!(
            f.buffers.requests(),
            vec![BufferRequest::FlushAll(vec![*a.identity(), *b.identity()])]
        );
        // main of a, main and vm of b
        assert_eq!(f.backend.calls().syncs, 3);
        Ok(())
    }

    #[test]
    fn test_sync_all_with_no_handles_does_nothing() -> Result<()> {
        let f = fixture();
        f.reg.sync_all(&[])?;
        assert!(f.buffers.requests().is_empty());
        Ok(())
    }

    #[test]
    fn test_unlink_all_drops_buffers_invalidates_and_deletes() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 20, 1);

        f.reg.unlink_all(&[a], false)?;

        assert_eq!(f.buffers.requests(), vec![BufferRequest::DropAll(vec![*a.identity()])]);
        assert_eq!(f.inbox.pending(), 1);
        assert!(!f.backend.exists(a.identity(), ForkNumber::Main)?);
        assert_eq!(f.backend.open_fork_count(), 0);

        // Own notice closes the local handle
        assert_eq!(f.reg.process_invalidations(&f.inbox)?, 1);
        assert!(!f.reg.contains(a.identity()));
        Ok(())
    }

    #[test]
    fn test_unlink_all_in_redo_tolerates_missing_files() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 21, 1);
        f.reg.create_fork(&a, ForkNumber::FreeSpaceMap, false)?;
        f.backend.unlink(a.identity(), ForkNumber::Main)?;

        f.reg.unlink_all(&[a], true)?;
        assert_eq!(f.inbox.drain(), vec![*a.identity()]);
        assert!(!f.backend.exists(a.identity(), ForkNumber::FreeSpaceMap)?);
        assert!(f.backend.is_empty());
        Ok(())
    }

    #[test]
    fn test_unlink_failure_does_not_stop_other_relations() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 22, 1);
        let b = relation_with_blocks(&mut f, 23, 2);
        f.backend.unlink(a.identity(), ForkNumber::Main)?;
        let failures = UNLINK_FAILURES.get();

        f.reg.unlink_all(&[a, b], false)?;

        assert!(!f.backend.exists(b.identity(), ForkNumber::Main)?);
        assert!(UNLINK_FAILURES.get() > failures);
        assert_eq!(f.inbox.drain(), vec![*a.identity(), *b.identity()]);
        Ok(())
    }

    #[test]
    fn test_truncate_sets_cache_and_notifies() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 30, 8);

        f.reg.truncate(&a, &[ForkNumber::Main], &[5])?;

        assert_eq!(
            f.buffers.requests(),
            vec![BufferRequest::DropRange {
                relation: *a.identity(),
                forks: vec![ForkNumber::Main],
                nblocks: vec![5],
            }]
        );
        assert_eq!(f.inbox.drain(), vec![*a.identity()]);
        assert_eq!(f.reg.info(&a)?.cached_nblocks[ForkNumber::Main.index()], Some(5));
        assert_eq!(f.backend.nblocks(a.identity(), ForkNumber::Main)?, 5);
        Ok(())
    }

    #[test]
    fn test_truncate_failure_leaves_cache_unknown() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 31, 2);
        f.reg.replay_mode().enter();
        assert_eq!(f.reg.block_count(&a, ForkNumber::Main)?, 2);

        // Growing through truncate is refused by the backend
        assert!(f.reg.truncate(&a, &[ForkNumber::Main], &[10]).is_err());
        assert_eq!(f.reg.info(&a)?.cached_nblocks[ForkNumber::Main.index()], None);
        Ok(())
    }

    #[test]
    fn test_truncate_rejects_mismatched_lengths() {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 32, 1);
        let err = f.reg.truncate(&a, &[ForkNumber::Main], &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_sweep_closes_only_unowned() -> Result<()> {
        let mut f = fixture();
        let owned = relation_with_blocks(&mut f, 40, 0);
        let transient = relation_with_blocks(&mut f, 41, 0);
        let slot = f.reg.new_owner_slot();
        f.reg.set_owner(slot, &owned)?;

        assert_eq!(f.reg.end_of_transaction_sweep()?, 1);
        assert!(f.reg.contains(owned.identity()));
        assert!(!f.reg.contains(transient.identity()));
        Ok(())
    }

    #[test]
    fn test_barrier_release_keeps_handles() -> Result<()> {
        let mut f = fixture();
        let a = relation_with_blocks(&mut f, 50, 3);
        f.reg.replay_mode().enter();
        f.reg.block_count(&a, ForkNumber::Main)?;

        assert!(f.reg.barrier_release()?);
        assert!(f.reg.contains(a.identity()));
        assert_eq!(f.reg.info(&a)?.cached_nblocks, [None; ForkNumber::COUNT]);
        assert_eq!(f.backend.open_fork_count(), 0);
        // Handle is still usable
        assert_eq!(f.reg.block_count(&a, ForkNumber::Main)?, 3);
        Ok(())
    }
}
