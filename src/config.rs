//! Runtime configuration — seed, library access and retry settings
//!
//! Stored as pretty JSON. Missing fields fall back to their defaults so older
//! files keep loading after new settings are added.

use crate::error::{ExpertError, Result};
use crate::evolution::EvolutionConfig;
use crate::library::{LibraryOptions, RetryPolicy};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seeds every RNG the model and transforms create
    pub seed: u64,
    pub library: LibraryOptions,
    /// Bound on a single replica exchange wait, in seconds
    pub exchange_timeout_secs: u64,
    pub evolution: EvolutionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            library: LibraryOptions::default(),
            exchange_timeout_secs: 300,
            evolution: EvolutionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        info!("Loaded runtime config from {}", path.display());
        Ok(config)
    }

    /// `load` if the file exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.library.retry.max_attempts == 0 {
            return Err(ExpertError::config("retry.max_attempts must be >= 1"));
        }
        if self.library.retry.call_timeout_ms == Some(0) {
            return Err(ExpertError::config("retry.call_timeout_ms must be > 0 when set"));
        }
        if self.exchange_timeout_secs == 0 {
            return Err(ExpertError::config("exchange_timeout_secs must be > 0"));
        }
        if self.evolution.offspring == 0 {
            return Err(ExpertError::config("evolution.offspring must be >= 1"));
        }
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.library.retry
    }
}
