//! Engine configuration, loadable from YAML.
//!
//! Every section is optional; missing fields take their defaults:
//! ```yaml
//! persist:
//!   chunk_threshold: 10485760
//!   chunk_size: 1048576
//!   compression: zstd     # none | zstd | lz4
//! event_log:
//!   max_events: 10000
//!   snapshot_interval: 100
//!   persist_events: false
//! worker:
//!   channel_capacity: 64
//! ```

use std::path::Path;

use chronostate_persist::{Algorithm, PersistConfig};
use chronostate_sync::WorkerConfig;
use chronostate_timeline::EventLogConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {source}")]
    Yaml { source: serde_yaml::Error },
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(source: serde_yaml::Error) -> Self {
        Self::Yaml { source }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub persist: PersistConfig,
    pub event_log: EventLogConfig,
    pub worker: WorkerConfig,
}

impl EngineConfig {
    /// Load, apply `CHRONOSTATE_*` environment overrides, and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate. No environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Override fields from variables resolved by `lookup`:
    /// `CHRONOSTATE_COMPRESSION`, `CHRONOSTATE_PERSIST_EVENTS`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup("CHRONOSTATE_COMPRESSION") {
            self.persist.compression = raw.parse::<Algorithm>().map_err(|e| ConfigError::Invalid {
                field: "persist.compression",
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = lookup("CHRONOSTATE_PERSIST_EVENTS") {
            self.event_log.persist_events = match raw.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ConfigError::Invalid {
                        field: "event_log.persist_events",
                        reason: format!("expected a boolean, got {other:?}"),
                    });
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 4] = [
            ("persist.chunk_size", self.persist.chunk_size == 0),
            ("event_log.snapshot_interval", self.event_log.snapshot_interval == 0),
            ("event_log.max_events", self.event_log.max_events == 0),
            ("worker.channel_capacity", self.worker.channel_capacity == 0),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".into(),
            }),
            None => Ok(()),
        }
    }
}
