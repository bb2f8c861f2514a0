//! End-to-end storage manager scenarios
//!
//! Exercises the registry against both the in-memory and the flat-file
//! backends, the way the relation cache and transaction machinery drive it.

use photon_smgr::error::{Error, Result};
use photon_smgr::smgr::{
    Collaborators, FileBackend, InvalidationBus, InvalidationHub, MemoryBackend, ReplayMode,
    StorageBackend,
};
use photon_smgr::{
    BackendResolver, Durability, ForkNumber, SmgrConfig, SmgrRegistry, StorageIdentity,
};
use std::path::PathBuf;
use std::sync::Arc;

const BLOCK: usize = 32;

fn memory_registry() -> (SmgrRegistry, MemoryBackend) {
    let backend = MemoryBackend::new(BLOCK);
    let resolver = Arc::new(BackendResolver::new(Arc::new(backend.clone())));
    (SmgrRegistry::new(resolver).unwrap(), backend)
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("smgr_it_{}_{}", name, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn file_config(dir: &PathBuf) -> SmgrConfig {
    SmgrConfig {
        data_dir: dir.clone(),
        block_size: BLOCK,
        max_open_files: 8,
        initial_capacity: 16,
        fsync_enabled: false,
    }
}

#[test]
fn test_owned_handle_survives_sweep_until_released() -> Result<()> {
    let (mut reg, _) = memory_registry();
    let id = StorageIdentity::shared(1663, 5, 16384);

    let h = reg.lookup_or_create(id, Durability::Permanent)?;
    reg.create_fork(&h, ForkNumber::Main, false)?;
    let slot = reg.new_owner_slot();
    reg.set_owner(slot, &h)?;

    assert_eq!(reg.end_of_transaction_sweep()?, 0);
    assert!(reg.contains(&id));

    reg.clear_owner(slot, &h)?;
    assert_eq!(reg.owned_by(slot), None);
    assert_eq!(reg.end_of_transaction_sweep()?, 1);
    assert!(!reg.contains(&id));

    // The old handle is stale; a fresh lookup starts from scratch
    assert!(matches!(reg.block_count(&h, ForkNumber::Main), Err(Error::StaleHandle(_))));
    let fresh = reg.lookup_or_create(id, Durability::Unknown)?;
    assert!(fresh.generation() > h.generation());
    assert_eq!(reg.info(&fresh)?.cached_nblocks, [None; ForkNumber::COUNT]);
    assert_eq!(reg.durability(&fresh)?, Durability::Unknown);
    Ok(())
}

#[test]
fn test_durability_is_reconciled_across_lookups() -> Result<()> {
    let (mut reg, _) = memory_registry();
    let id = StorageIdentity::shared(1663, 5, 1);

    let h = reg.lookup_or_create(id, Durability::Unknown)?;
    reg.lookup_or_create(id, Durability::Unlogged)?;
    assert_eq!(reg.durability(&h)?, Durability::Unlogged);

    reg.lookup_or_create(id, Durability::Unknown)?;
    assert_eq!(reg.durability(&h)?, Durability::Unlogged);

    assert!(matches!(
        reg.lookup_or_create(id, Durability::Permanent),
        Err(Error::ConsistencyViolation(_))
    ));
    Ok(())
}

#[test]
fn test_truncate_then_block_count_in_and_out_of_replay() -> Result<()> {
    let (mut reg, backend) = memory_registry();
    let h = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 2), Durability::Permanent)?;
    reg.create_fork(&h, ForkNumber::Main, false)?;
    for block in 0..6 {
        reg.extend(&h, ForkNumber::Main, block, &[7u8; BLOCK], true)?;
    }

    reg.truncate(&h, &[ForkNumber::Main], &[2])?;
    let before = backend.calls().nblocks;
    assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 2);
    assert_eq!(backend.calls().nblocks, before + 1);

    reg.replay_mode().enter();
    reg.truncate(&h, &[ForkNumber::Main], &[1])?;
    let before = backend.calls().nblocks;
    assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 1);
    assert_eq!(backend.calls().nblocks, before);
    reg.replay_mode().exit();
    Ok(())
}

#[test]
fn test_select_hook_routes_temp_relations_to_memory() -> Result<()> {
    let dir = scratch_dir("hook");
    let config = file_config(&dir);
    let files = Arc::new(FileBackend::from_config(&config));
    let memory = MemoryBackend::new(BLOCK);

    let temp_backend: Arc<dyn StorageBackend> = Arc::new(memory.clone());
    let resolver = BackendResolver::new(files.clone()).with_select_hook(Arc::new(
        move |id: &StorageIdentity| {
            if id.is_temp() {
                Some(Arc::clone(&temp_backend))
            } else {
                None
            }
        },
    ));
    let mut reg = SmgrRegistry::with_options(Arc::new(resolver), Collaborators::default(), &config)?;

    let temp = reg.lookup_or_create(StorageIdentity::temp(1663, 5, 3, 7), Durability::Temporary)?;
    let shared = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 3), Durability::Permanent)?;
    reg.create_fork(&temp, ForkNumber::Main, false)?;
    reg.create_fork(&shared, ForkNumber::Main, false)?;

    assert_eq!(memory.len(), 1);
    assert!(files.fork_path(shared.identity(), ForkNumber::Main).exists());
    assert!(!files.fork_path(temp.identity(), ForkNumber::Main).exists());

    reg.shutdown()?;
    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

#[test]
fn test_file_backed_lifecycle() -> Result<()> {
    let dir = scratch_dir("lifecycle");
    let config = file_config(&dir);
    let files = Arc::new(FileBackend::from_config(&config));
    let hub = Arc::new(InvalidationHub::new());
    let inbox = hub.subscribe();
    let collaborators = Collaborators {
        invalidation: hub.clone(),
        ..Collaborators::default()
    };
    let mut reg = SmgrRegistry::with_options(
        Arc::new(BackendResolver::new(files.clone())),
        collaborators,
        &config,
    )?;

    let h = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 4), Durability::Permanent)?;
    reg.create_fork(&h, ForkNumber::Main, false)?;
    reg.create_fork(&h, ForkNumber::FreeSpaceMap, false)?;
    for block in 0..3 {
        reg.extend(&h, ForkNumber::Main, block, &[block as u8; BLOCK], false)?;
    }
    reg.sync_all(&[h])?;
    assert_eq!(files.pending_syncs(), 0);

    let mut buf = [0u8; BLOCK];
    reg.read(&h, ForkNumber::Main, 2, &mut buf)?;
    assert_eq!(buf, [2u8; BLOCK]);

    // Drop the relation; the prefetch of a removed file is not an error
    reg.unlink_all(&[h], false)?;
    assert!(!reg.exists(&h, ForkNumber::Main)?);
    assert!(!reg.exists(&h, ForkNumber::FreeSpaceMap)?);
    assert!(!reg.prefetch(&h, ForkNumber::Main, 0)?);

    assert_eq!(reg.process_invalidations(&inbox)?, 1);
    assert!(reg.is_empty());

    // Replaying the same drop finds nothing left and only warns
    let again = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 4), Durability::Permanent)?;
    reg.unlink_all(&[again], true)?;

    reg.shutdown()?;
    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

/// Bus that checks the relation file is still on disk when notified
struct FileStillThere {
    backend: Arc<FileBackend>,
    seen: parking_lot::Mutex<Vec<bool>>,
}

impl InvalidationBus for FileStillThere {
    fn broadcast_invalidate(&self, identity: StorageIdentity) {
        let present = self.backend.fork_path(&identity, ForkNumber::Main).exists();
        self.seen.lock().push(present);
    }
}

#[test]
fn test_invalidation_precedes_physical_unlink() -> Result<()> {
    let dir = scratch_dir("ordering");
    let config = file_config(&dir);
    let files = Arc::new(FileBackend::from_config(&config));
    let bus = Arc::new(FileStillThere {
        backend: files.clone(),
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let collaborators = Collaborators {
        invalidation: bus.clone(),
        replay: ReplayMode::new(),
        ..Collaborators::default()
    };
    let mut reg = SmgrRegistry::with_options(
        Arc::new(BackendResolver::new(files.clone())),
        collaborators,
        &config,
    )?;

    let a = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 10), Durability::Permanent)?;
    let b = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 11), Durability::Permanent)?;
    reg.create_fork(&a, ForkNumber::Main, false)?;
    reg.create_fork(&b, ForkNumber::Main, false)?;

    reg.unlink_all(&[a, b], false)?;

    assert_eq!(*bus.seen.lock(), vec![true, true]);
    assert!(!files.fork_path(a.identity(), ForkNumber::Main).exists());
    assert!(!files.fork_path(b.identity(), ForkNumber::Main).exists());

    reg.shutdown()?;
    std::fs::remove_dir_all(dir).ok();
    Ok(())
}

#[test]
fn test_barrier_release_reopens_on_demand() -> Result<()> {
    let dir = scratch_dir("barrier");
    let config = file_config(&dir);
    let files = Arc::new(FileBackend::from_config(&config));
    let mut reg = SmgrRegistry::with_options(
        Arc::new(BackendResolver::new(files.clone())),
        Collaborators::default(),
        &config,
    )?;

    let h = reg.lookup_or_create(StorageIdentity::shared(1663, 5, 20), Durability::Permanent)?;
    reg.create_fork(&h, ForkNumber::Main, false)?;
    reg.extend(&h, ForkNumber::Main, 0, &[1u8; BLOCK], false)?;
    assert!(files.descriptor_stats().open > 0);

    assert!(reg.barrier_release()?);
    assert_eq!(files.descriptor_stats().open, 0);
    assert_eq!(reg.block_count(&h, ForkNumber::Main)?, 1);

    reg.shutdown()?;
    std::fs::remove_dir_all(dir).ok();
    Ok(())
}
