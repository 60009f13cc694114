//! Federation configuration.
//!
//! Loaded from JSON or built in code. Drivers themselves are registered
//! programmatically; the configuration only maps file name suffixes to
//! driver names.

use std::collections::BTreeMap;

use nestfs_vfs::InputOptions;
use serde::{Deserialize, Serialize};

use crate::driver::json::JSON_DRIVER;

/// Default suffix handled by the JSON reference driver.
pub const DEFAULT_SUFFIX: &str = "nar";

/// Configuration error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid federation config: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Federation configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// File name suffix (without the dot) -> driver name. A path component
    /// ending in `.<suffix>` is a mount point.
    pub archive_suffixes: BTreeMap<String, String>,

    /// Input options fixed by every controller. Only the bits outside the
    /// input preferences mask are taken from here.
    pub fixed_input_options: InputOptions,

    /// Reject synchronizations that combine `CLEAR_CACHE` with a
    /// `WAIT_CLOSE_*` option instead of running them at the caller's risk.
    pub reject_wait_with_clear: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        let mut archive_suffixes = BTreeMap::new();
        archive_suffixes.insert(String::from(DEFAULT_SUFFIX), String::from(JSON_DRIVER));
        Self {
            archive_suffixes,
            fixed_input_options: InputOptions::EMPTY,
            reject_wait_with_clear: false,
        }
    }
}

impl FederationConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Map an additional suffix to a driver.
    pub fn with_suffix(mut self, suffix: &str, driver: &str) -> Self {
        self.archive_suffixes
            .insert(suffix.to_ascii_lowercase(), String::from(driver));
        self
    }

    /// Check suffixes are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for suffix in self.archive_suffixes.keys() {
            if suffix.is_empty() || suffix.contains('/') || suffix.contains('.') {
                return Err(ConfigError(format!("bad archive suffix '{}'", suffix)));
            }
        }
        Ok(())
    }

    /// Driver name for a path component, if the component names an archive.
    pub fn driver_for(&self, component: &str) -> Option<&str> {
        let (stem, ext) = component.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        self.archive_suffixes
            .get(&ext.to_ascii_lowercase())
            .map(String::as_str)
    }
}
