//! Flat-file storage backend
//!
//! One file per relation fork:
//!
//! ```text
//! <data_dir>/<tablespace>/<database>/<relation>[_fsm|_vm|_init]
//! <data_dir>/<tablespace>/<database>/t<backend>_<relation>[...]   (temp)
//! ```
//!
//! Descriptors are kept in an LRU cache so the number of open files stays
//! bounded. Writes that do not skip fsync mark the fork dirty; the mark is
//! cleared by the next `immediate_sync`.

use super::backend::StorageBackend;
use super::fd_cache::{DescriptorCache, DescriptorStats};
use super::types::{BackendScope, BlockNumber, ForkNumber, StorageIdentity};
use crate::config::SmgrConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type ForkKey = (StorageIdentity, ForkNumber);

fn io_error(context: String, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("{}: {}", context, e))
    } else {
        Error::Storage(format!("{}: {}", context, e))
    }
}

/// Flat-file backend, the default backend of the storage manager
pub struct FileBackend {
    base_path: PathBuf,
    block_size: usize,
    fsync_enabled: bool,
    descriptors: Mutex<DescriptorCache>,
    dirty: Mutex<HashSet<ForkKey>>,
}

impl FileBackend {
    /// Create a backend rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P, block_size: usize, max_open_files: usize) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            block_size,
            fsync_enabled: true,
            descriptors: Mutex::new(DescriptorCache::new(max_open_files)),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Create a backend from configuration
    pub fn from_config(config: &SmgrConfig) -> Self {
        let mut backend = Self::new(&config.data_dir, config.block_size, config.max_open_files);
        backend.fsync_enabled = config.fsync_enabled;
        backend
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of the file holding one fork
    pub fn fork_path(&self, identity: &StorageIdentity, fork: ForkNumber) -> PathBuf {
        let file = identity.file;
        let mut name = match identity.scope {
            BackendScope::Shared => file.relation.to_string(),
            BackendScope::Temp(backend) => format!("t{}_{}", backend, file.relation),
        };
        if let Some(suffix) = fork.suffix() {
            name.push('_');
            name.push_str(suffix);
        }
        self.base_path
            .join(file.tablespace.to_string())
            .join(file.database.to_string())
            .join(name)
    }

    pub fn descriptor_stats(&self) -> DescriptorStats {
        self.descriptors.lock().stats()
    }

    /// Forks written since their last sync
    pub fn pending_syncs(&self) -> usize {
        self.dirty.lock().len()
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

    fn offset(&self, block: BlockNumber) -> u64 {
        block as u64 * self.block_size as u64
    }

    /// Run `f` against the open descriptor of a fork, opening it if needed
    fn with_file<T>(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        f: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let path = self.fork_path(identity, fork);
        let mut descriptors = self.descriptors.lock();
        let file = descriptors.get_or_open((*identity, fork), || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| io_error(format!("Could not open file {:?}", path), e))
        })?;
        f(file)
    }

    fn nblocks_of(&self, file: &File, identity: &StorageIdentity, fork: ForkNumber) -> Result<BlockNumber> {
        let len = file
            .metadata()
            .map_err(|e| io_error(format!("Could not stat fork {} of {}", fork, identity), e))?
            .len();
        BlockNumber::try_from(len / self.block_size as u64).map_err(|_| {
            Error::Storage(format!(
                "Fork {} of {} is {} bytes, more blocks than a block number can address",
                fork, identity, len
            ))
        })
    }

    fn mark_dirty(&self, identity: &StorageIdentity, fork: ForkNumber, skip_fsync: bool) {
        if !skip_fsync {
            self.dirty.lock().insert((*identity, fork));
        }
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        info!(path = ?self.base_path, block_size = self.block_size, "File backend ready");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.descriptors.lock().clear();
        Ok(())
    }

    fn open(&self, identity: &StorageIdentity) -> Result<()> {
        debug!(relation = %identity, "File backend open");
        Ok(())
    }

    fn close(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        self.descriptors.lock().remove(&(*identity, fork));
        Ok(())
    }

    fn create(&self, identity: &StorageIdentity, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let path = self.fork_path(identity, fork);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_error(format!("Could not create directory {:?}", parent), e))?;
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && is_redo => OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| io_error(format!("Could not open file {:?}", path), e))?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(format!("File {:?} already exists", path)));
            }
            Err(e) => return Err(io_error(format!("Could not create file {:?}", path), e)),
        };

        self.descriptors.lock().insert((*identity, fork), file);
        debug!(path = ?path, "Created fork file");
        Ok(())
    }

    fn exists(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<bool> {
        // A cached descriptor may outlive an unlink done elsewhere
        self.descriptors.lock().remove(&(*identity, fork));
        Ok(self.fork_path(identity, fork).exists())
    }

    fn unlink(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        let key = (*identity, fork);
        self.descriptors.lock().remove(&key);
        self.dirty.lock().remove(&key);

        let path = self.fork_path(identity, fork);
        std::fs::remove_file(&path)
            .map_err(|e| io_error(format!("Could not remove file {:?}", path), e))?;
        debug!(path = ?path, "Removed fork file");
        Ok(())
    }

    fn extend(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
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
        let offset = self.offset(block);

        self.with_file(identity, fork, |file| {
            let nblocks = self.nblocks_of(file, identity, fork)?;
            if block < nblocks {
                return Err(Error::InvalidArgument(format!(
                    "Cannot extend fork {} of {}: block {} is below end of file {}",
                    fork, identity, block, nblocks
                )));
            }
            // Seeking past the end leaves a hole that reads back as zeroes
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
            file.write_all(buffer).map_err(|e| {
                Error::Storage(format!("Could not extend fork {} of {}: {}", fork, identity, e))
            })
        })?;

        self.mark_dirty(identity, fork, skip_fsync);
        Ok(())
    }

    fn prefetch(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        _block: BlockNumber,
    ) -> Result<bool> {
        match self.with_file(identity, fork, |_| Ok(())) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &mut [u8],
    ) -> Result<()> {
        self.check_buffer(buffer.len())?;
        let offset = self.offset(block);

        self.with_file(identity, fork, |file| {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
            file.read_exact(buffer).map_err(|e| {
                Error::Storage(format!(
                    "Could not read block {} of fork {} of {}: {}",
                    block, fork, identity, e
                ))
            })
        })
    }

    fn write(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        block: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.check_buffer(buffer.len())?;
        let offset = self.offset(block);

        self.with_file(identity, fork, |file| {
            let nblocks = self.nblocks_of(file, identity, fork)?;
            if block >= nblocks {
                return Err(Error::Storage(format!(
                    "Could not write block {} of fork {} of {}: only {} blocks",
                    block, fork, identity, nblocks
                )));
            }
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
            file.write_all(buffer).map_err(|e| {
                Error::Storage(format!(
                    "Could not write block {} of fork {} of {}: {}",
                    block, fork, identity, e
                ))
            })
        })?;

        self.mark_dirty(identity, fork, skip_fsync);
        Ok(())
    }

    fn writeback(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        start: BlockNumber,
        count: BlockNumber,
    ) -> Result<()> {
        // No portable range writeback; make sure the file is there and move on
        self.with_file(identity, fork, |_| Ok(()))?;
        debug!(relation = %identity, %fork, start, count, "Writeback hint");
        Ok(())
    }

    fn nblocks(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<BlockNumber> {
        self.with_file(identity, fork, |file| self.nblocks_of(file, identity, fork))
    }

    fn truncate(
        &self,
        identity: &StorageIdentity,
        fork: ForkNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let new_len = self.offset(nblocks);
        self.with_file(identity, fork, |file| {
            let current = self.nblocks_of(file, identity, fork)?;
            if nblocks > current {
                return Err(Error::InvalidArgument(format!(
                    "Cannot truncate fork {} of {} to {} blocks: it is only {} blocks",
                    fork, identity, nblocks, current
                )));
            }
            file.set_len(new_len).map_err(|e| {
                Error::Storage(format!(
                    "Could not truncate fork {} of {} to {} blocks: {}",
                    fork, identity, nblocks, e
                ))
            })
        })
    }

    fn immediate_sync(&self, identity: &StorageIdentity, fork: ForkNumber) -> Result<()> {
        self.with_file(identity, fork, |file| {
            if self.fsync_enabled {
                file.sync_all().map_err(|e| {
                    Error::Storage(format!("Could not fsync fork {} of {}: {}", fork, identity, e))
                })?;
            }
            Ok(())
        })?;
        self.dirty.lock().remove(&(*identity, fork));
        Ok(())
    }
}
