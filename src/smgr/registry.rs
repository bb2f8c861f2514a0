//! Relation handle registry
//!
//! One registry per worker. It maps each storage identity to a single
//! [`SmgrRelation`] and tracks who owns it. A handle is either owned by
//! exactly one [`OwnerSlot`] or sits in the unowned set; the unowned set is
//! the keyed table filtered by ownership tag.

use super::backend::BackendResolver;
use super::buffers::{BufferCache, NoopBufferCache};
use super::handle::{HandleInfo, OwnerSlot, Ownership, SmgrHandle, SmgrRelation};
use super::invalidation::{InvalidationBus, NoopInvalidationBus};
use super::metrics::{HANDLES_CREATED, HANDLES_OPEN};
use super::recovery::ReplayMode;
use super::types::{BlockNumber, Durability, ForkNumber, StorageIdentity};
use crate::config::SmgrConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// External subsystems the registry coordinates with
#[derive(Clone)]
pub struct Collaborators {
    pub buffers: Arc<dyn BufferCache>,
    pub invalidation: Arc<dyn InvalidationBus>,
    pub replay: ReplayMode,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            buffers: Arc::new(NoopBufferCache),
            invalidation: Arc::new(NoopInvalidationBus),
            replay: ReplayMode::new(),
        }
    }
}

/// Per-worker storage manager context
pub struct SmgrRegistry {
    pub(crate) resolver: Arc<BackendResolver>,
    pub(crate) buffers: Arc<dyn BufferCache>,
    pub(crate) invalidation: Arc<dyn InvalidationBus>,
    pub(crate) replay: ReplayMode,
    pub(crate) relations: HashMap<StorageIdentity, SmgrRelation>,
    owners: HashMap<OwnerSlot, StorageIdentity>,
    next_generation: u64,
    next_slot: u64,
}

impl fmt::Debug for SmgrRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmgrRegistry")
            .field("relations", &self.relations.len())
            .field("owners", &self.owners.len())
            .field("replay", &self.replay.is_active())
            .finish()
    }
}

impl Drop for SmgrRegistry {
    fn drop(&mut self) {
        HANDLES_OPEN.sub(self.relations.len() as i64);
    }
}

/// Look up a live entry, rejecting handles from an earlier incarnation
pub(crate) fn entry<'a>(
    relations: &'a HashMap<StorageIdentity, SmgrRelation>,
    handle: &SmgrHandle,
) -> Result<&'a SmgrRelation> {
    match relations.get(handle.identity()) {
        Some(rel) if rel.generation == handle.generation() => Ok(rel),
        _ => Err(Error::StaleHandle(format!("{} is no longer open", handle))),
    }
}

pub(crate) fn entry_mut<'a>(
    relations: &'a mut HashMap<StorageIdentity, SmgrRelation>,
    handle: &SmgrHandle,
) -> Result<&'a mut SmgrRelation> {
    match relations.get_mut(handle.identity()) {
        Some(rel) if rel.generation == handle.generation() => Ok(rel),
        _ => Err(Error::StaleHandle(format!("{} is no longer open", handle))),
    }
}

impl SmgrRegistry {
    /// Create a registry with no-op collaborators and default sizing
    pub fn new(resolver: Arc<BackendResolver>) -> Result<Self> {
        Self::with_options(resolver, Collaborators::default(), &SmgrConfig::default())
    }

    /// Create a registry wired to the given collaborators.
    ///
    /// Runs the resolver's process-wide init hook if no registry has
    /// done so yet.
    pub fn with_options(
        resolver: Arc<BackendResolver>,
        collaborators: Collaborators,
        config: &SmgrConfig,
    ) -> Result<Self> {
        resolver.initialize()?;

        Ok(Self {
            resolver,
            buffers: collaborators.buffers,
            invalidation: collaborators.invalidation,
            replay: collaborators.replay,
            relations: HashMap::with_capacity(config.initial_capacity),
            owners: HashMap::new(),
            next_generation: 1,
            next_slot: 1,
        })
    }

    pub fn resolver(&self) -> &Arc<BackendResolver> {
        &self.resolver
    }

    pub fn replay_mode(&self) -> &ReplayMode {
        &self.replay
    }

    /// Number of handles in the keyed table
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn contains(&self, identity: &StorageIdentity) -> bool {
        self.relations.contains_key(identity)
    }

    /// Current handle for an identity, without creating one
    pub fn get(&self, identity: &StorageIdentity) -> Option<SmgrHandle> {
        self.relations.get(identity).map(SmgrRelation::handle)
    }

    /// Snapshot of a handle's state
    pub fn info(&self, handle: &SmgrHandle) -> Result<HandleInfo> {
        entry(&self.relations, handle).map(HandleInfo::from)
    }

    /// Return the handle for `identity`, creating it on first reference.
    ///
    /// A new handle is bound to the backend chosen by the resolver, opened
    /// at the backend level (no physical file is touched), has every cached
    /// size unknown and starts unowned. For an existing handle the
    /// durability hint is reconciled with the recorded class.
    pub fn lookup_or_create(
        &mut self,
        identity: StorageIdentity,
        durability: Durability,
    ) -> Result<SmgrHandle> {
        if let Some(rel) = self.relations.get_mut(&identity) {
            rel.durability = rel.durability.reconcile(durability)?;
            return Ok(rel.handle());
        }

        let backend = self.resolver.select(&identity);
        backend.open(&identity)?;

        let generation = self.next_generation;
        self.next_generation += 1;

        let rel = SmgrRelation::new(identity, generation, durability, backend);
        let handle = rel.handle();
        self.relations.insert(identity, rel);

        HANDLES_CREATED.inc();
        HANDLES_OPEN.inc();
        debug!(relation = %identity, generation, ?durability, "Opened relation handle");
        Ok(handle)
    }

    pub fn durability(&self, handle: &SmgrHandle) -> Result<Durability> {
        Ok(entry(&self.relations, handle)?.durability)
    }

    pub fn target_block(&self, handle: &SmgrHandle) -> Result<Option<BlockNumber>> {
        Ok(entry(&self.relations, handle)?.target_block)
    }

    /// Record an append-position hint. Not authoritative.
    pub fn set_target_block(&mut self, handle: &SmgrHandle, block: Option<BlockNumber>) -> Result<()> {
        entry_mut(&mut self.relations, handle)?.target_block = block;
        Ok(())
    }

    // --- Ownership protocol ---

    /// Issue a fresh owner slot
    pub fn new_owner_slot(&mut self) -> OwnerSlot {
        let slot = OwnerSlot(self.next_slot);
        self.next_slot += 1;
        slot
    }

    fn check_slot(&self, slot: OwnerSlot) -> Result<()> {
        if slot.0 == 0 || slot.0 >= self.next_slot {
            return Err(Error::InvalidArgument(format!(
                "{} was not issued by this registry",
                slot
            )));
        }
        Ok(())
    }

    /// Handle currently held by `slot`
    pub fn owned_by(&self, slot: OwnerSlot) -> Option<SmgrHandle> {
        self.owners
            .get(&slot)
            .and_then(|identity| self.relations.get(identity))
            .map(SmgrRelation::handle)
    }

    pub fn owner_of(&self, handle: &SmgrHandle) -> Result<Option<OwnerSlot>> {
        match entry(&self.relations, handle)?.ownership {
            Ownership::Owned(slot) => Ok(Some(slot)),
            Ownership::Unowned => Ok(None),
        }
    }

    /// Handles without an owner, oldest first
    pub fn unowned_handles(&self) -> Vec<SmgrHandle> {
        let mut handles: Vec<SmgrHandle> = self
            .relations
            .values()
            .filter(|rel| !rel.is_owned())
            .map(SmgrRelation::handle)
            .collect();
        handles.sort_by_key(SmgrHandle::generation);
        handles
    }

    /// Make `slot` the sole owner of `handle`.
    ///
    /// A handle previously held by `slot` goes back to the unowned set, and
    /// the handle's previous owner slot (if any) is emptied.
    pub fn set_owner(&mut self, slot: OwnerSlot, handle: &SmgrHandle) -> Result<()> {
        self.check_slot(slot)?;
        let identity = entry(&self.relations, handle)?.identity;

        if let Some(previous) = self.owners.remove(&slot) {
            if previous != identity {
                if let Some(rel) = self.relations.get_mut(&previous) {
                    rel.ownership = Ownership::Unowned;
                    debug!(relation = %previous, %slot, "Owner slot reassigned, old handle now unowned");
                }
            }
        }

        let rel = entry_mut(&mut self.relations, handle)?;
        if let Ownership::Owned(old_slot) = rel.ownership {
            self.owners.remove(&old_slot);
        }
        rel.ownership = Ownership::Owned(slot);
        self.owners.insert(slot, identity);

        debug_assert_eq!(
            self.owners.values().filter(|id| **id == identity).count(),
            1,
            "handle must have exactly one owner"
        );
        Ok(())
    }

    /// Give up ownership. No-op unless `slot` currently owns `handle`.
    pub fn clear_owner(&mut self, slot: OwnerSlot, handle: &SmgrHandle) -> Result<()> {
        let rel = entry_mut(&mut self.relations, handle)?;
        if rel.ownership != Ownership::Owned(slot) {
            return Ok(());
        }
        rel.ownership = Ownership::Unowned;
        self.owners.remove(&slot);
        Ok(())
    }

    /// Retire an owner slot, disowning whatever it holds
    pub fn retire_owner_slot(&mut self, slot: OwnerSlot) -> Result<()> {
        self.check_slot(slot)?;
        if let Some(identity) = self.owners.remove(&slot) {
            if let Some(rel) = self.relations.get_mut(&identity) {
                rel.ownership = Ownership::Unowned;
            }
        }
        Ok(())
    }

    // --- Close and release ---

    /// Destroy a handle.
    ///
    /// Every fork is closed at the backend level, the entry leaves the
    /// keyed table and only then is the owner slot emptied.
    pub fn close(&mut self, handle: &SmgrHandle) -> Result<()> {
        let rel = entry(&self.relations, handle)?;
        rel.close_forks()?;
        let identity = rel.identity;
        let ownership = rel.ownership;

        if self.relations.remove(&identity).is_none() {
            return Err(Error::RegistryCorrupted(format!(
                "relation {} vanished from the handle table",
                identity
            )));
        }

        if let Ownership::Owned(slot) = ownership {
            self.owners.remove(&slot);
        }

        HANDLES_OPEN.dec();
        debug!(relation = %identity, "Closed relation handle");
        Ok(())
    }

    /// Close the handle for `identity` if there is one
    pub fn close_by_identity(&mut self, identity: &StorageIdentity) -> Result<()> {
        match self.get(identity) {
            Some(handle) => self.close(&handle),
            None => Ok(()),
        }
    }

    /// Close every fork and forget cached sizes; the handle stays usable
    pub fn release(&mut self, handle: &SmgrHandle) -> Result<()> {
        entry_mut(&mut self.relations, handle)?.release()
    }

    /// Release every handle in the registry
    pub fn release_all(&mut self) -> Result<()> {
        for rel in self.relations.values_mut() {
            rel.release()?;
        }
        Ok(())
    }

    /// Close every handle in the registry
    pub fn close_all(&mut self) -> Result<()> {
        let handles: Vec<SmgrHandle> = self.relations.values().map(SmgrRelation::handle).collect();
        let count = handles.len();
        for handle in handles {
            self.close(&handle)?;
        }
        if count > 0 {
            info!(count, "Closed all relation handles");
        }
        Ok(())
    }

    /// Close everything, then run the process-wide shutdown hook
    pub fn shutdown(&mut self) -> Result<()> {
        self.close_all()?;
        self.resolver.shutdown()
    }

    /// Does the fork exist physically?
    pub fn exists(&self, handle: &SmgrHandle, fork: ForkNumber) -> Result<bool> {
        let rel = entry(&self.relations, handle)?;
        rel.backend.exists(&rel.identity, fork)
    }
}
