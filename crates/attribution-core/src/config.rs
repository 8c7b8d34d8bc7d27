//! Coordinator configuration.
//!
//! The deferral timeout and the per-context queue bound are policy values,
//! not architectural constants, so both are configurable. Everything has a
//! default and a TOML file only needs to name what it overrides:
//!
//! ```toml
//! deferral_timeout_ms = 5000
//! max_deferred_per_context = 30
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

pub const DEFAULT_DEFERRAL_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_DEFERRED_PER_CONTEXT: usize = 30;
pub const DEFAULT_EVICTION_MEMORY: usize = 256;
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Tunables for one coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Single-shot timeout armed when a context is created.
    pub deferral_timeout_ms: u64,

    /// Deferred triggers (and pre-binding sources) held per context.
    pub max_deferred_per_context: usize,

    /// Evicted tokens remembered so late legs can be classified.
    pub eviction_memory: usize,

    /// Capacity of the bounded command and completion queues.
    pub event_queue_capacity: usize,

    /// Deliver OS registrations; when false they are dropped.
    pub os_registrations_enabled: bool,

    pub logging: LogConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            deferral_timeout_ms: DEFAULT_DEFERRAL_TIMEOUT_MS,
            max_deferred_per_context: DEFAULT_MAX_DEFERRED_PER_CONTEXT,
            eviction_memory: DEFAULT_EVICTION_MEMORY,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            os_registrations_enabled: true,
            logging: LogConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub const fn deferral_timeout(&self) -> Duration {
        Duration::from_millis(self.deferral_timeout_ms)
    }

    #[must_use]
    pub const fn with_deferral_timeout(mut self, timeout: Duration) -> Self {
        self.deferral_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_max_deferred(mut self, limit: usize) -> Self {
        self.max_deferred_per_context = limit;
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(input).map_err(|err| ConfigError::ParseError(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::ReadFailed(path.display().to_string(), err.to_string()))?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::SerializeFailed(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deferral_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "deferral_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_deferred_per_context == 0 {
            return Err(ConfigError::ValidationError(
                "max_deferred_per_context must be greater than zero".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.eviction_memory == 0 {
            return Err(ConfigError::ValidationError(
                "eviction_memory must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
