use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How hard a physical commit pushes its bytes to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Leave durability to the OS page cache (tests, scratch stores).
    None,
    /// `fsync`: data and metadata.
    #[serde(rename = "fsync")]
    FSync,
    /// `fdatasync`: data only.
    #[default]
    #[serde(rename = "fdatasync")]
    FDataSync,
}

/// Tunables for the generational store and its commit batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The young generation is rotated out once its load factor drops to or
    /// below this fraction (default: 0.1).
    pub rotate_load_factor: f32,
    /// After merging a frozen generation into the old one, the old one is
    /// rewritten if its load factor falls below this fraction (default: 0.5).
    pub recompact_load_factor: f32,
    /// Logical updates coalesced into one physical commit (default: 10).
    pub batch_capacity: usize,
    /// Durability call issued after commits, merges and compactions.
    pub sync_mode: SyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rotate_load_factor: 0.1,
            recompact_load_factor: 0.5,
            batch_capacity: 10,
            sync_mode: SyncMode::FDataSync,
        }
    }
}

/// Configuration parse / validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl StoreConfig {
    /// Parse a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("rotate_load_factor", self.rotate_load_factor),
            ("recompact_load_factor", self.recompact_load_factor),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is outside (0, 1]", value),
                });
            }
        }
        if self.batch_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_capacity",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
