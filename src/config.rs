//! Workload configuration for the stress driver.
//!
//! ```toml
//! capacity = 65536
//! producers = 4
//! items_per_producer = 1000000
//! log_level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StressConfig {
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::producers")]
    pub producers: usize,
    #[serde(default = "defaults::items_per_producer")]
    pub items_per_producer: u64,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid ring capacity")]
    Capacity(#[source] Error),

    #[error("at least one producer is required")]
    NoProducers,
}

mod defaults {
    pub fn capacity() -> usize {
        1 << 16 // 65536
    }

    pub fn producers() -> usize {
        4
    }

    pub fn items_per_producer() -> u64 {
        1_000_000
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            capacity: defaults::capacity(),
            producers: defaults::producers(),
            items_per_producer: defaults::items_per_producer(),
            log_level: defaults::log_level(),
        }
    }
}

impl StressConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: StressConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.capacity.is_power_of_two() {
            return Err(ConfigError::Capacity(Error::InvalidCapacity(self.capacity)));
        }
        if self.producers == 0 {
            return Err(ConfigError::NoProducers);
        }
        Ok(())
    }
}
