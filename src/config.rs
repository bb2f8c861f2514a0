//! Storage manager configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `PHOTON_SMGR_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides (e.g. `PHOTON_SMGR_BLOCK_SIZE`)
pub const ENV_PREFIX: &str = "PHOTON_SMGR";

/// Storage manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmgrConfig {
    /// Root directory for relation files
    pub data_dir: PathBuf,
    /// Size of one block in bytes
    pub block_size: usize,
    /// Upper bound on descriptors kept open by the file backend
    pub max_open_files: usize,
    /// Pre-sized capacity of the relation handle table
    pub initial_capacity: usize,
    /// Issue real fsyncs (disable only for throwaway data)
    pub fsync_enabled: bool,
}

impl Default for SmgrConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/smgr"),
            block_size: 8192,
            max_open_files: 1000,
            initial_capacity: 400,
            fsync_enabled: true,
        }
    }
}

impl SmgrConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&SmgrConfig::default())
            .map_err(|e| Error::Config(format!("Failed to seed defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let settings = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        let config: SmgrConfig = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend can work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be greater than zero".to_string()));
        }
        if self.max_open_files == 0 {
            return Err(Error::Config("max_open_files must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render configuration: {}", e)))
    }
}
