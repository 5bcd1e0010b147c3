//! Renderer configuration
//!
//! Deserializable settings covering the JIT backend selection, optimization
//! level, worker-thread count, and routine-cache capacity, with validation
//! and TOML loading.

use crate::pipeline::constants::ROUTINE_CACHE_CAPACITY;
use crate::reactor::backend::OptLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::reactor::backend::BackendKind;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML text could not be parsed
    #[error("failed to parse renderer config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A field value is out of range
    #[error("invalid renderer config: {0}")]
    Invalid(String),
}

/// Renderer-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Worker threads (0 selects the hardware thread count)
    pub worker_threads: usize,
    /// JIT backend
    pub backend: BackendKind,
    /// Optimization level for the optimizing backend
    pub optimization_level: OptLevel,
    /// Per-stage routine cache capacity
    pub routine_cache_capacity: usize,
    /// Debug aid: run all batches on a single worker
    pub force_single_batch_worker: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            backend: BackendKind::Optimizing,
            optimization_level: OptLevel::Default,
            routine_cache_capacity: ROUTINE_CACHE_CAPACITY,
            force_single_batch_worker: false,
        }
    }
}

impl RendererConfig {
    /// Parses a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads > 1024 {
            return Err(ConfigError::Invalid(format!(
                "worker_threads {} is unreasonable",
                self.worker_threads
            )));
        }
        if self.routine_cache_capacity == 0 || self.routine_cache_capacity > 65536 {
            return Err(ConfigError::Invalid(format!(
                "routine_cache_capacity {} must be in 1..=65536",
                self.routine_cache_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RendererConfig::default().validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RendererConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = RendererConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.routine_cache_capacity, config.routine_cache_capacity);
        assert_eq!(parsed.backend, config.backend);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = RendererConfig::from_toml("backend = \"direct\"").unwrap();
        assert_eq!(parsed.backend, BackendKind::Direct);
        assert_eq!(
            parsed.routine_cache_capacity,
            ROUTINE_CACHE_CAPACITY
        );
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        assert!(RendererConfig::from_toml("routine_cache_capacity = 0").is_err());
    }
}
