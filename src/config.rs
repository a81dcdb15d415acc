//! Configuration loaded from TOML

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::EnvironmentParams;
use crate::error::ConfigError;
use crate::store::PinPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub engine: EngineConfig,
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub seed: u64,
    /// Timestamp of tick zero
    pub epoch: DateTime<Utc>,
    pub tick_duration_secs: u64,
    pub environment: EnvironmentParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            epoch: DateTime::<Utc>::default(),
            tick_duration_secs: 60,
            environment: EnvironmentParams::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given seed and defaults elsewhere
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for `<id>.json` documents; in memory when unset
    pub dir: Option<PathBuf>,
    pub id_prefix: String,
    pub pin: PinPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: None,
            id_prefix: "ckpt_".to_string(),
            pin: PinPolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.engine.tick_duration_secs == 0 {
            return Err(invalid("engine.tick_duration_secs", "must be positive"));
        }
        let env = &self.engine.environment;
        if env.labor_cost_cents < 0 || env.raw_material_cost_cents < 0 {
            return Err(invalid("engine.environment", "costs must not be negative"));
        }
        if !(0..=100).contains(&env.consumer_confidence) {
            return Err(invalid("engine.environment.consumer_confidence", "must be within 0..=100"));
        }
        let prefix = &self.checkpoint.id_prefix;
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid("checkpoint.id_prefix", "must be non-empty [A-Za-z0-9_-]"));
        }
        if self.checkpoint.pin.max_attempts == 0 {
            return Err(invalid("checkpoint.pin.max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.checkpoint.id_prefix, "ckpt_");
    }

    #[test]
    fn test_partial_document() {
        let config = CoreConfig::from_toml_str(
            r#"
            [engine]
            seed = 7
            epoch = "2024-01-01T00:00:00Z"

            [engine.environment]
            labor_cost_cents = 250000

            [checkpoint]
            dir = "/var/lib/tickchain"

            [checkpoint.pin]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.seed, 7);
        assert_eq!(config.engine.epoch.timestamp(), 1_704_067_200);
        assert_eq!(config.engine.environment.labor_cost_cents, 250_000);
        assert_eq!(config.engine.environment.raw_material_cost_cents, 10_000);
        assert_eq!(config.checkpoint.dir, Some(PathBuf::from("/var/lib/tickchain")));
        assert_eq!(config.checkpoint.pin.max_attempts, 5);
        assert_eq!(config.checkpoint.pin.backoff_ms, 50);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            CoreConfig::from_toml_str("[engine]\ntick_duration_secs = 0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            CoreConfig::from_toml_str("[checkpoint]\nid_prefix = \"a/b\""),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            CoreConfig::from_toml_str("[engine]\nseed = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
