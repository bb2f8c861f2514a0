//! Relation handles and ownership state

use super::backend::StorageBackend;
use super::types::{BlockNumber, Durability, ForkNumber, StorageIdentity};
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Caller-side reference to a registry entry.
///
/// Copyable and cheap. The generation ties it to one incarnation of the
/// entry: once the entry is closed, the handle goes stale even if the same
/// identity is opened again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmgrHandle {
    identity: StorageIdentity,
    generation: u64,
}

impl SmgrHandle {
    pub(crate) fn new(identity: StorageIdentity, generation: u64) -> Self {
        Self {
            identity,
            generation,
        }
    }

    pub fn identity(&self) -> &StorageIdentity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SmgrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.identity, self.generation)
    }
}

/// Registry-issued owner slot.
///
/// Stands for one long-lived external reference cell (a relation
/// descriptor cache entry). A slot holds at most one handle at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerSlot(pub(crate) u64);

impl fmt::Display for OwnerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Ownership state of a handle: Unowned -> Owned(slot) -> Unowned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    #[default]
    Unowned,
    Owned(OwnerSlot),
}

/// Per-relation state held by the registry
pub struct SmgrRelation {
    pub(crate) identity: StorageIdentity,
    pub(crate) generation: u64,
    pub(crate) durability: Durability,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) cached_nblocks: [Option<BlockNumber>; ForkNumber::COUNT],
    pub(crate) target_block: Option<BlockNumber>,
    pub(crate) ownership: Ownership,
}

impl fmt::Debug for SmgrRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmgrRelation")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("durability", &self.durability)
            .field("backend", &self.backend.name())
            .field("cached_nblocks", &self.cached_nblocks)
            .field("target_block", &self.target_block)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl SmgrRelation {
    pub(crate) fn new(
        identity: StorageIdentity,
        generation: u64,
        durability: Durability,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            identity,
            generation,
            durability,
            backend,
            cached_nblocks: [None; ForkNumber::COUNT],
            target_block: None,
            ownership: Ownership::Unowned,
        }
    }

    pub(crate) fn handle(&self) -> SmgrHandle {
        SmgrHandle::new(self.identity, self.generation)
    }

    pub(crate) fn is_owned(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    pub(crate) fn cached(&self, fork: ForkNumber) -> Option<BlockNumber> {
        self.cached_nblocks[fork.index()]
    }

    pub(crate) fn set_cached(&mut self, fork: ForkNumber, nblocks: Option<BlockNumber>) {
        self.cached_nblocks[fork.index()] = nblocks;
    }

    /// Close every fork at the backend level
    pub(crate) fn close_forks(&self) -> Result<()> {
        for fork in ForkNumber::ALL {
            self.backend.close(&self.identity, fork)?;
        }
        Ok(())
    }

    /// Close every fork and forget cached sizes, keeping the entry
    pub(crate) fn release(&mut self) -> Result<()> {
        for fork in ForkNumber::ALL {
            self.backend.close(&self.identity, fork)?;
            self.set_cached(fork, None);
        }
        self.target_block = None;
        Ok(())
    }
}

/// Read-only view of a handle's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: SmgrHandle,
    pub durability: Durability,
    pub ownership: Ownership,
    pub cached_nblocks: [Option<BlockNumber>; ForkNumber::COUNT],
    pub target_block: Option<BlockNumber>,
}

impl From<&SmgrRelation> for HandleInfo {
    fn from(rel: &SmgrRelation) -> Self {
        Self {
            handle: rel.handle(),
            durability: rel.durability,
            ownership: rel.ownership,
            cached_nblocks: rel.cached_nblocks,
            target_block: rel.target_block,
        }
    }
}
