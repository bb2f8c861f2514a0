// PhotonDB - Storage Manager Switch
// Routes every relation-fork access through a per-worker handle registry

#![warn(rust_2018_idioms)]

pub mod config;
pub mod smgr;

// Re-exports for convenience
pub use config::SmgrConfig;
pub use smgr::{
    BackendResolver, Durability, ForkNumber, OwnerSlot, SmgrHandle, SmgrRegistry,
    StorageBackend, StorageIdentity,
};

/// Storage manager error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        /// Conflicting state detected, e.g. a durability class mismatch.
        /// Fatal to the current operation, never to the process.
        #[error("Consistency violation: {0}")]
        ConsistencyViolation(String),

        #[error("Relation registry corrupted: {0}")]
        RegistryCorrupted(String),

        #[error("Stale relation handle: {0}")]
        StaleHandle(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Already exists: {0}")]
        AlreadyExists(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// True when the error only reports that a file or entry is absent
        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::NotFound(_))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
