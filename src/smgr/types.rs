//! Storage identities, fork kinds and durability classes

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block number within one fork
pub type BlockNumber = u32;

/// Physical file identity of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelFileId {
    pub tablespace: u32,
    pub database: u32,
    pub relation: u32,
}

impl RelFileId {
    pub fn new(tablespace: u32, database: u32, relation: u32) -> Self {
        Self {
            tablespace,
            database,
            relation,
        }
    }
}

impl fmt::Display for RelFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tablespace, self.database, self.relation)
    }
}

/// Which backend process a relation's storage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackendScope {
    /// Visible to every backend
    Shared,
    /// Session-temporary storage of the given backend id
    Temp(u32),
}

/// Registry key: file identity plus scope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageIdentity {
    pub file: RelFileId,
    pub scope: BackendScope,
}

impl StorageIdentity {
    pub fn new(file: RelFileId, scope: BackendScope) -> Self {
        Self { file, scope }
    }

    /// Identity of a shared (non-temporary) relation
    pub fn shared(tablespace: u32, database: u32, relation: u32) -> Self {
        Self::new(RelFileId::new(tablespace, database, relation), BackendScope::Shared)
    }

    /// Identity of a session-temporary relation owned by `backend`
    pub fn temp(tablespace: u32, database: u32, relation: u32, backend: u32) -> Self {
        Self::new(
            RelFileId::new(tablespace, database, relation),
            BackendScope::Temp(backend),
        )
    }

    pub fn is_temp(&self) -> bool {
        matches!(self.scope, BackendScope::Temp(_))
    }
}

impl fmt::Display for StorageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            BackendScope::Shared => write!(f, "{}", self.file),
            BackendScope::Temp(backend) => write!(f, "{}@t{}", self.file, backend),
        }
    }
}

/// Sub-stream of a relation's storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    Main = 0,
    FreeSpaceMap = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkNumber {
    /// Number of fork kinds
    pub const COUNT: usize = 4;

    /// Every fork, in fork-number order
    pub const ALL: [ForkNumber; ForkNumber::COUNT] = [
        ForkNumber::Main,
        ForkNumber::FreeSpaceMap,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// File-name suffix; the main fork has none
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            ForkNumber::Main => None,
            ForkNumber::FreeSpaceMap => Some("fsm"),
            ForkNumber::VisibilityMap => Some("vm"),
            ForkNumber::Init => Some("init"),
        }
    }

    pub fn name(self) -> &'static str {
        self.suffix().unwrap_or("main")
    }

    /// Parse a fork name as printed by [`ForkNumber::name`]
    pub fn from_name(name: &str) -> Result<Self> {
        ForkNumber::ALL
            .into_iter()
            .find(|fork| fork.name() == name)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown fork '{}'", name)))
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Durability classification of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Durability {
    #[default]
    Unknown,
    Permanent,
    Unlogged,
    Temporary,
}

impl Durability {
    /// Merge a caller-supplied hint into the current class.
    ///
    /// Unknown adopts the hint; an unknown hint changes nothing; two
    /// different concrete classes are a consistency violation.
    pub fn reconcile(self, hint: Durability) -> Result<Durability> {
        match (self, hint) {
            (Durability::Unknown, hint) => Ok(hint),
            (current, Durability::Unknown) => Ok(current),
            (current, hint) if current == hint => Ok(current),
            (current, hint) => Err(Error::ConsistencyViolation(format!(
                "durability mismatch: requested {:?} but relation is {:?}",
                hint, current
            ))),
        }
    }
}
