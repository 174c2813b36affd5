//! Persistence of [`IrrigationConfig`].
//!
//! Stores are allowed to fail: a missing or invalid document falls back to
//! defaults with a warning, and a failed save leaves the in-memory config
//! in force.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::irrigation::IrrigationConfig;

pub trait ConfigStore: Send {
    fn load(&self) -> Result<IrrigationConfig>;
    /// `false` if the config could not be stored.
    fn save(&mut self, config: &IrrigationConfig) -> bool;
}

/// Load, or fall back to defaults when the store has nothing usable.
pub fn load_or_default<C: ConfigStore + ?Sized>(store: &C) -> IrrigationConfig {
    match store.load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "using default irrigation config");
            IrrigationConfig::default()
        }
    }
}

/// Persist and return the defaults.
pub fn reset_to_defaults<C: ConfigStore + ?Sized>(store: &mut C) -> IrrigationConfig {
    let defaults = IrrigationConfig::default();
    if !store.save(&defaults) {
        warn!("default irrigation config could not be persisted");
    }
    defaults
}

// ---------------------------------------------------------------------------
// TOML file
// ---------------------------------------------------------------------------

/// ```toml
/// soil_moisture_threshold = 30.0
/// duration_secs = 600
/// min_interval_secs = 3600
/// auto_mode = true
/// ```
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<IrrigationConfig> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let config: IrrigationConfig = toml::from_str(&text).map_err(|e| {
            Error::Config(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        config.validate()?;
        info!(path = %self.path.display(), "irrigation config loaded");
        Ok(config)
    }

    fn save(&mut self, config: &IrrigationConfig) -> bool {
        let text = match toml::to_string_pretty(config) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialise irrigation config");
                return false;
            }
        };
        match fs::write(&self.path, text) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to write irrigation config");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

/// For nodes without storage, and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    pub stored: Option<IrrigationConfig>,
    pub fail_saves: bool,
    pub saves: u32,
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<IrrigationConfig> {
        self.stored
            .clone()
            .ok_or_else(|| Error::Config("no stored config".into()))
    }

    fn save(&mut self, config: &IrrigationConfig) -> bool {
        if self.fail_saves {
            return false;
        }
        self.saves += 1;
        self.stored = Some(config.clone());
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
