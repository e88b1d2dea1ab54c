//! Engine configuration loading and resolution.

use crate::definition::Disambiguation;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of operations executing at once across all nodes.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Timeout applied when a request does not carry its own.
    #[serde(default = "default_operation_timeout_ms")]
    pub default_operation_timeout_ms: u64,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Upper bound for the retry delay.
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,

    /// Deadline for one discovery pass unless the definition overrides it.
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Rule used when a single-element selector matches several elements
    /// and the definition names no rule of its own.
    #[serde(default)]
    pub default_disambiguation: Disambiguation,

    /// Broadcast buffer size for engine events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_retry_backoff_base_ms() -> u64 {
    250
}

fn default_retry_backoff_cap_ms() -> u64 {
    5_000
}

fn default_discovery_timeout_ms() -> u64 {
    15_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            default_operation_timeout_ms: default_operation_timeout_ms(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_cap_ms: default_retry_backoff_cap_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            default_disambiguation: Disambiguation::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file (JSON). Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration.
    ///
    /// Lookup order: explicit path, `TRELLIS_CONFIG`, `~/.trellis/config.json`,
    /// built-in defaults. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, EngineError> {
        let mut config = match config_path(explicit) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRELLIS_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), EngineError> {
        if let Some(v) = env_number("TRELLIS_MAX_IN_FLIGHT")? {
            self.max_in_flight = v as usize;
        }
        if let Some(v) = env_number("TRELLIS_OPERATION_TIMEOUT_MS")? {
            self.default_operation_timeout_ms = v;
        }
        if let Some(v) = env_number("TRELLIS_DISCOVERY_TIMEOUT_MS")? {
            self.discovery_timeout_ms = v;
        }
        Ok(())
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_in_flight == 0 {
            return Err(EngineError::Config(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.retry_backoff_cap_ms < self.retry_backoff_base_ms {
            return Err(EngineError::Config(format!(
                "retry_backoff_cap_ms ({}) is below retry_backoff_base_ms ({})",
                self.retry_backoff_cap_ms, self.retry_backoff_base_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var("TRELLIS_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    let home_config = dirs::home_dir()?.join(".trellis/config.json");
    home_config.exists().then_some(home_config)
}

fn env_number(key: &str) -> Result<Option<u64>, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
