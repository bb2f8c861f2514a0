//! PhotonDB storage manager command-line tool
//!
//! Drives the storage manager against a data directory on disk:
//! - Relation fork management (create, extend, truncate, unlink)
//! - Size queries and forced syncs
//! - Configuration and metrics inspection
//!
//! # Examples
//!
//! ```bash
//! # Create the main fork of relation 16384 in database 5
//! photon-smgr create 16384 --database 5
//!
//! # Append ten empty blocks and read the size back
//! photon-smgr extend 16384 --database 5 --blocks 10
//! photon-smgr nblocks 16384 --database 5
//!
//! # Drop the relation's storage
//! photon-smgr unlink 16384 --database 5
//! ```

use clap::{Args, Parser, Subcommand};
use photon_smgr::smgr::metrics::{export_metrics, register_metrics};
use photon_smgr::smgr::{
    BackendScope, FileBackend, RelFileId, SmgrHandle, SmgrRegistry, StorageBackend,
};
use photon_smgr::{BackendResolver, Durability, ForkNumber, SmgrConfig, StorageIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB storage manager tool
#[derive(Parser, Debug)]
#[command(name = "photon-smgr")]
#[command(version = photon_smgr::VERSION)]
#[command(about = "Inspect and manage relation storage through the storage manager", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Data directory path (overrides the configuration file)
    #[arg(long, global = true, env = "PHOTON_SMGR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTON_SMGR_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a relation fork file
    Create {
        #[command(flatten)]
        target: ForkArgs,

        /// Tolerate an existing file, as during replay
        #[arg(long)]
        redo: bool,
    },

    /// Append zero-filled blocks to a fork
    Extend {
        #[command(flatten)]
        target: ForkArgs,

        /// Number of blocks to append
        #[arg(long, default_value = "1")]
        blocks: u32,
    },

    /// Print the number of blocks in a fork
    Nblocks {
        #[command(flatten)]
        target: ForkArgs,
    },

    /// Shrink a fork to the given number of blocks
    Truncate {
        #[command(flatten)]
        target: ForkArgs,

        /// New length in blocks
        nblocks: u32,
    },

    /// Remove every fork of a relation
    Unlink {
        #[command(flatten)]
        relation: RelationArgs,

        /// Treat an already missing file as expected, as during replay
        #[arg(long)]
        redo: bool,
    },

    /// Force all existing forks of a relation to stable storage
    Sync {
        #[command(flatten)]
        relation: RelationArgs,
    },

    /// Show storage statistics and metrics
    Stats,

    /// Print the effective configuration
    Config,

    /// Show version
    Version,
}

/// Relation addressing
#[derive(Args, Debug)]
struct RelationArgs {
    /// Relation file number
    relation: u32,

    /// Tablespace id
    #[arg(long, default_value = "1663")]
    tablespace: u32,

    /// Database id
    #[arg(long, default_value = "1")]
    database: u32,

    /// Owning backend id for temporary relations
    #[arg(long)]
    temp: Option<u32>,
}

/// One fork of a relation
#[derive(Args, Debug)]
struct ForkArgs {
    #[command(flatten)]
    relation: RelationArgs,

    /// Fork (main, fsm, vm, init)
    #[arg(long, default_value = "main", value_parser = parse_fork)]
    fork: ForkNumber,
}

impl RelationArgs {
    fn identity(&self) -> StorageIdentity {
        let scope = match self.temp {
            Some(backend) => BackendScope::Temp(backend),
            None => BackendScope::Shared,
        };
        StorageIdentity::new(
            RelFileId::new(self.tablespace, self.database, self.relation),
            scope,
        )
    }

    fn durability(&self) -> Durability {
        if self.temp.is_some() {
            Durability::Temporary
        } else {
            Durability::Permanent
        }
    }
}

fn parse_fork(name: &str) -> Result<ForkNumber, String> {
    ForkNumber::from_name(name).map_err(|e| e.to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let mut config = SmgrConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Create { target, redo } => create_command(&config, target, redo),
        Commands::Extend { target, blocks } => extend_command(&config, target, blocks),
        Commands::Nblocks { target } => nblocks_command(&config, target),
        Commands::Truncate { target, nblocks } => truncate_command(&config, target, nblocks),
        Commands::Unlink { relation, redo } => unlink_command(&config, relation, redo),
        Commands::Sync { relation } => sync_command(&config, relation),
        Commands::Stats => stats_command(&config),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("photon-smgr {}", photon_smgr::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "photon-smgr.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .compact(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// A file-backed registry plus the backend itself for statistics
fn open_registry(config: &SmgrConfig) -> anyhow::Result<(SmgrRegistry, Arc<FileBackend>)> {
    register_metrics();
    let backend = Arc::new(FileBackend::from_config(config));
    let resolver = Arc::new(BackendResolver::new(backend.clone()));
    let registry = SmgrRegistry::with_options(resolver, Default::default(), config)?;
    Ok((registry, backend))
}

fn open_relation(
    registry: &mut SmgrRegistry,
    relation: &RelationArgs,
) -> anyhow::Result<SmgrHandle> {
    Ok(registry.lookup_or_create(relation.identity(), relation.durability())?)
}

fn create_command(config: &SmgrConfig, target: ForkArgs, redo: bool) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &target.relation)?;
    registry.create_fork(&handle, target.fork, redo)?;
    println!("created {} fork of {}", target.fork, handle.identity());
    registry.shutdown()?;
    Ok(())
}

fn extend_command(config: &SmgrConfig, target: ForkArgs, blocks: u32) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &target.relation)?;
    let zeroes = vec![0u8; config.block_size];

    let start = registry.block_count(&handle, target.fork)?;
    for block in start..start.saturating_add(blocks) {
        // One sync for the whole batch below
        registry.extend(&handle, target.fork, block, &zeroes, true)?;
    }
    registry.immediate_sync(&handle, target.fork)?;

    let nblocks = registry.block_count(&handle, target.fork)?;
    info!(relation = %handle.identity(), fork = %target.fork, from = start, to = nblocks, "Extended");
    println!("{}", nblocks);
    registry.shutdown()?;
    Ok(())
}

fn nblocks_command(config: &SmgrConfig, target: ForkArgs) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &target.relation)?;
    println!("{}", registry.block_count(&handle, target.fork)?);
    registry.shutdown()?;
    Ok(())
}

fn truncate_command(config: &SmgrConfig, target: ForkArgs, nblocks: u32) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &target.relation)?;
    registry.truncate(&handle, &[target.fork], &[nblocks])?;
    println!("{}", nblocks);
    registry.shutdown()?;
    Ok(())
}

fn unlink_command(config: &SmgrConfig, relation: RelationArgs, redo: bool) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &relation)?;
    registry.unlink_all(&[handle], redo)?;
    println!("unlinked {}", handle.identity());
    registry.shutdown()?;
    Ok(())
}

fn sync_command(config: &SmgrConfig, relation: RelationArgs) -> anyhow::Result<()> {
    let (mut registry, _) = open_registry(config)?;
    let handle = open_relation(&mut registry, &relation)?;
    registry.sync_all(&[handle])?;
    println!("synced {}", handle.identity());
    registry.shutdown()?;
    Ok(())
}

fn stats_command(config: &SmgrConfig) -> anyhow::Result<()> {
    let (mut registry, backend) = open_registry(config)?;

    let stats = serde_json::json!({
        "version": photon_smgr::VERSION,
        "backend": backend.name(),
        "data_dir": config.data_dir,
        "block_size": config.block_size,
        "max_open_files": config.max_open_files,
        "fsync_enabled": config.fsync_enabled,
    });
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!();
    print!("{}", export_metrics());

    registry.shutdown()?;
    Ok(())
}
