//! `rwdx` configuration.
//!
//! Provides configuration support via `rwdx.toml`, `RWDX_*` environment
//! variables, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (constructed directly in code)
//! 2. Environment variables (`RWDX_*`)
//! 3. Configuration file (`rwdx.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Ingest configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of shards build buffers are split across. Must be a power of two.
    pub shards: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { shards: 16 }
    }
}

/// Posting representation-selection configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    /// Minimum density (cardinality / `universe_size`) to prefer a bitmap.
    pub bitmap_density_threshold: f64,
    /// Minimum cardinality to prefer a bitmap regardless of density.
    pub bitmap_cardinality_threshold: usize,
    /// Size ratio (larger / smaller) above which intersection switches to galloping.
    pub galloping_skew_factor: usize,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            bitmap_density_threshold: 0.02,
            bitmap_cardinality_threshold: 4096,
            galloping_skew_factor: 16,
        }
    }
}

/// Store (persistence) configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Whether `IndexStore::load` memory-maps the file (vs. reading it fully
    /// into memory; useful on filesystems without mmap support).
    pub mmap: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { mmap: true }
    }
}

/// Query configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Cap on the number of values profiled per demographic attribute.
    /// `None` means unbounded.
    pub max_profile_values: Option<usize>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_profile_values: None,
        }
    }
}

/// Top-level `rwdx` configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RwdxConfig {
    /// Ingest configuration.
    pub ingest: IngestConfig,
    /// Posting representation-selection configuration.
    pub posting: PostingConfig,
    /// Store (persistence) configuration.
    pub store: StoreConfig,
    /// Query configuration.
    pub query: QueryConfig,
}

impl RwdxConfig {
    /// Loads configuration from the default file name (`rwdx.toml`), layered
    /// with environment variables and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("rwdx.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RWDX_").split("_").lowercase(false));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.shards == 0 || !self.ingest.shards.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                key: "ingest.shards".to_string(),
                message: format!(
                    "value {} must be a nonzero power of two",
                    self.ingest.shards
                ),
            });
        }

        if !(0.0..=1.0).contains(&self.posting.bitmap_density_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "posting.bitmap_density_threshold".to_string(),
                message: format!(
                    "value {} is out of range [0.0, 1.0]",
                    self.posting.bitmap_density_threshold
                ),
            });
        }

        if self.posting.galloping_skew_factor < 2 {
            return Err(ConfigError::InvalidValue {
                key: "posting.galloping_skew_factor".to_string(),
                message: format!("value {} must be >= 2", self.posting.galloping_skew_factor),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RwdxConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let mut cfg = RwdxConfig::default();
        cfg.ingest.shards = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_density() {
        let mut cfg = RwdxConfig::default();
        cfg.posting.bitmap_density_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_toml_overrides_defaults() {
        let figment = Figment::new()
            .merge(Serialized::defaults(RwdxConfig::default()))
            .merge(Toml::string("[ingest]\nshards = 32\n"));
        let cfg: RwdxConfig = figment.extract().unwrap();
        assert_eq!(cfg.ingest.shards, 32);
    }
}
