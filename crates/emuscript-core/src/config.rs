//! Host configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! [memory]
//! endianness = "big"
//!
//! [[memory.regions]]
//! name = "mem1"
//! base = 0x80000000
//! size = 0x01800000
//!
//! [limits]
//! max_string_scan = 65536
//!
//! [runner]
//! stop_on_script_error = false
//!
//! [controller]
//! seed = 1234
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use crate::bridge::BridgeLimits;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::memory::{Endianness, FlatMemory, RegionConfig};
use crate::runner::RunnerConfig;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Layout of the reference memory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub endianness: Endianness,
    pub regions: Vec<RegionConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            endianness: Endianness::Big,
            regions: vec![RegionConfig::mem1()],
        }
    }
}

impl MemoryConfig {
    pub fn build(&self) -> FlatMemory {
        FlatMemory::new(&self.regions, self.endianness)
    }
}

/// Controller override settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Fixed RNG seed for probability events; random when unset.
    pub seed: Option<u64>,
}

impl ControllerConfig {
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub memory: MemoryConfig,
    pub limits: BridgeLimits,
    pub runner: RunnerConfig,
    pub controller: ControllerConfig,
    pub logging: LogConfig,
}

impl BridgeConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let regions = &self.memory.regions;
        if regions.is_empty() {
            return Err(ConfigError::Invalid(
                "memory.regions must contain at least one region".to_string(),
            ));
        }
        for region in regions {
            if region.size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "memory region \"{}\" has zero size",
                    region.name
                )));
            }
            if region.end() > 1 << 32 {
                return Err(ConfigError::Invalid(format!(
                    "memory region \"{}\" extends past the 32-bit address space",
                    region.name
                )));
            }
        }
        for (i, a) in regions.iter().enumerate() {
            if let Some(b) = regions[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(ConfigError::Invalid(format!(
                    "memory regions \"{}\" and \"{}\" overlap",
                    a.name, b.name
                )));
            }
        }
        if self.limits.max_string_scan == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_string_scan must be >= 1".to_string(),
            ));
        }
        if self.limits.max_bulk_read == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_bulk_read must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
