//! Backend dispatch contract and backend selection

use super::types::{BlockNumber, ForkNumber, StorageIdentity};
use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Storage backend trait
///
/// One implementation per backend kind. Backends are shared between all
/// handles bound to them, so per-relation state (open descriptors, dirty
/// segments) lives behind interior mutability keyed by identity.
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Process-wide startup, run once before any handle is created
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Process-wide teardown
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Prepare per-relation state. Must not touch the physical files.
    fn open(&self, identity: &StorageIdentity) -> Result<()>;

    /// Drop per-fork resources. Closing an already closed fork is a no-op.
    fn close(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()>;

    /// Create the physical file for a fork. With `is_redo` an existing
    /// file is accepted.
    fn create(&self, identity: &StorageIdentity, fork: ForkNumber, is_redo: bool) -> Result<()>;

    fn exists(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<bool>;

    /// Remove the physical file of a fork; `Error::NotFound` when absent
    fn unlink(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()>;

    /// Write a block at or beyond end of file. Any gap reads back as zeroes.
    fn extend(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Asynchronous read hint; `false` when the file does not exist
    fn prefetch(&self, identity: &StorageIdentity, fork: ForkNumber, block: BlockNumber)
        -> Result<bool>;

    fn read(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &mut [u8],
    ) -> Result<()>;

    fn write(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Advisory writeback of `count` blocks starting at `start`
    fn writeback(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        start: BlockNumber,
        count: BlockNumber,
    ) -> Result<()>;

    /// Current number of blocks in the fork
    fn nblocks(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<BlockNumber>;

    fn truncate(&self, identity: &StorageIdentity, fork: ForkNumber, nblocks: BlockNumber)
        -> Result<()>;

    /// Force all earlier writes of the fork to stable storage
    fn immediate_sync(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()>;

    // --- Unlogged index build hooks (optional) ---

    fn start_unlogged_build(&self, _identity: &StorageIdentity) -> Result<()> {
        Ok(())
    }

    fn finish_unlogged_build_phase_1(&self, _identity: &StorageIdentity) -> Result<()> {
        Ok(())
    }

    fn end_unlogged_build(&self, _identity: &StorageIdentity) -> Result<()> {
        Ok(())
    }
}

/// Chooses a backend for an identity; `None` falls back to the default
pub type SelectHook =
    Arc<dyn Fn(&StorageIdentity) -> Option<Arc<dyn StorageBackend>> + Send + Sync>;

/// Process-wide init/shutdown hook
pub type LifecycleHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Backend selection strategy
///
/// Shared by every registry in a process. The init hook runs at most once
/// per resolver; without one the default backend's `init` is used. The
/// shutdown hook likewise replaces the default backend's `shutdown`.
pub struct BackendResolver {
    default: Arc<dyn StorageBackend>,
    select_hook: Option<SelectHook>,
    init_hook: Option<LifecycleHook>,
    shutdown_hook: Option<LifecycleHook>,
    initialized: Mutex<bool>,
}

impl fmt::Debug for BackendResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendResolver")
            .field("default", &self.default.name())
            .field("select_hook", &self.select_hook.is_some())
            .field("initialized", &*self.initialized.lock())
            .finish()
    }
}

impl BackendResolver {
    pub fn new(default: Arc<dyn StorageBackend>) -> Self {
        Self {
            default,
            select_hook: None,
            init_hook: None,
            shutdown_hook: None,
            initialized: Mutex::new(false),
        }
    }

    /// Install an override hook consulted before the default backend
    pub fn with_select_hook(mut self, hook: SelectHook) -> Self {
        self.select_hook = Some(hook);
        self
    }

    pub fn with_init_hook(mut self, hook: LifecycleHook) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn with_shutdown_hook(mut self, hook: LifecycleHook) -> Self {
        self.shutdown_hook = Some(hook);
        self
    }

    /// Backend used when no hook claims an identity
    pub fn default_backend(&self) -> &Arc<dyn StorageBackend> {
        &self.default
    }

    /// Select the backend for an identity
    pub fn select(&self, identity: &StorageIdentity) -> Arc<dyn StorageBackend> {
        if let Some(hook) = &self.select_hook {
            if let Some(backend) = hook(identity) {
                debug!(relation = %identity, backend = backend.name(), "Backend chosen by hook");
                return backend;
            }
        }
        Arc::clone(&self.default)
    }

    /// Run the init hook unless it already ran
    pub fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Ok(());
        }

        match &self.init_hook {
            Some(hook) => hook()?,
            None => self.default.init()?,
        }

        *initialized = true;
        info!(backend = self.default.name(), "Storage manager initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock()
    }

    /// Run the shutdown hook, or the default backend's own shutdown without one
    pub fn shutdown(&self) -> Result<()> {
        match &self.shutdown_hook {
            Some(hook) => hook()?,
            None => self.default.shutdown()?,
        }
        *self.initialized.lock() = false;
        info!(backend = self.default.name(), "Storage manager shut down");
        Ok(())
    }
}
