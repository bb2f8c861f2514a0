//! Storage manager switch
//!
//! # Architecture
//!
//! Every access to a relation's files goes through this layer:
//!
//! ```text
//! SmgrRegistry (one per worker)
//!   ├─→ relations: StorageIdentity → SmgrRelation
//!   │     ├─→ backend (chosen by BackendResolver)
//!   │     ├─→ cached_nblocks[fork]
//!   │     └─→ ownership: Unowned | Owned(OwnerSlot)
//!   └─→ owners: OwnerSlot → StorageIdentity
//!
//! Collaborators
//!   ├─→ BufferCache      flush / drop pages before file operations
//!   ├─→ InvalidationBus  "close your handle" notices to all workers
//!   └─→ ReplayMode       trust cached sizes while replaying history
//! ```
//!
//! ## Handle lifetime
//!
//! A handle is created unowned on the first `lookup_or_create`. The
//! relation descriptor cache may claim it with `set_owner` and give it back
//! with `clear_owner`. Unowned handles are closed by the end-of-transaction
//! sweep, so transient handles never pin descriptors for long.
//!
//! ## Backends
//!
//! - **FileBackend**: one flat file per fork, LRU-bounded descriptors (default)
//! - **MemoryBackend**: in-memory forks for tests and override hooks

pub mod backend;
pub mod buffers;
pub mod fd_cache;
pub mod file;
pub mod handle;
pub mod invalidation;
mod io;
mod lifecycle;
pub mod metrics;
pub mod mock;
pub mod recovery;
pub mod registry;
pub mod types;

pub use backend::{BackendResolver, LifecycleHook, SelectHook, StorageBackend};
pub use buffers::{BufferCache, BufferRequest, NoopBufferCache, RecordingBufferCache};
pub use fd_cache::{DescriptorCache, DescriptorStats};
pub use file::FileBackend;
pub use handle::{HandleInfo, OwnerSlot, Ownership, SmgrHandle};
pub use invalidation::{InvalidationBus, InvalidationHub, InvalidationReceiver, NoopInvalidationBus};
pub use mock::{CallCounts, MemoryBackend};
pub use recovery::ReplayMode;
pub use registry::{Collaborators, SmgrRegistry};
pub use types::{BackendScope, BlockNumber, Durability, ForkNumber, RelFileId, StorageIdentity};
