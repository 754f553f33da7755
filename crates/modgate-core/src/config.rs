//! File-based configuration.
//!
//! Every section and field is optional; anything omitted takes its default.
//!
//! ```toml
//! [sandbox]
//! max_sandboxes = 4
//!
//! [policy]
//! default_timeout_ms = 2000
//!
//! [orchestrator]
//! health_threshold = 0.9
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::{CapabilityPolicy, SandboxSettings, ScoringConfig};
use crate::upgrade::OrchestratorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModgateConfig {
    pub sandbox: SandboxSettings,
    pub policy: CapabilityPolicy,
    pub scoring: ScoringConfig,
    pub orchestrator: OrchestratorConfig,
}

impl ModgateConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sandbox.max_sandboxes == 0 {
            return invalid("sandbox.max_sandboxes must be at least 1".into());
        }
        if self.sandbox.monitor_interval_ms == 0 {
            return invalid("sandbox.monitor_interval_ms must be positive".into());
        }
        if self.policy.default_timeout_ms == 0 {
            return invalid("policy.default_timeout_ms must be positive".into());
        }
        if self.policy.min_interval_ms > self.policy.max_timer_delay_ms {
            return invalid(format!(
                "policy.min_interval_ms ({}) exceeds policy.max_timer_delay_ms ({})",
                self.policy.min_interval_ms, self.policy.max_timer_delay_ms
            ));
        }
        if self.scoring.needs_improvement_threshold > self.scoring.ready_threshold {
            return invalid(
                "scoring.needs_improvement_threshold exceeds scoring.ready_threshold".into(),
            );
        }
        let o = &self.orchestrator;
        if !(0.0..=1.0).contains(&o.health_threshold) {
            return invalid(format!(
                "orchestrator.health_threshold {} outside 0..=1",
                o.health_threshold
            ));
        }
        if !(0.0..=1.0).contains(&o.refresh_probability) {
            return invalid(format!(
                "orchestrator.refresh_probability {} outside 0..=1",
                o.refresh_probability
            ));
        }
        if o.sandbox_poll_attempts == 0 {
            return invalid("orchestrator.sandbox_poll_attempts must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let cfg = ModgateConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ModgateConfig::default());
        assert_eq!(cfg.sandbox.max_sandboxes, 10);
        assert_eq!(cfg.policy.default_timeout_ms, 5_000);
        assert_eq!(cfg.orchestrator.health_threshold, 0.8);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let cfg = ModgateConfig::from_toml_str(
            "[sandbox]\nmax_sandboxes = 3\n\n[orchestrator]\nrefresh_probability = 0.5\n",
        )
        .unwrap();
        assert_eq!(cfg.sandbox.max_sandboxes, 3);
        assert_eq!(cfg.sandbox.monitor_interval_ms, 1_000);
        assert_eq!(cfg.orchestrator.refresh_probability, 0.5);
        assert_eq!(cfg.orchestrator.sandbox_poll_attempts, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for doc in [
            "[sandbox]\nmax_sandboxes = 0",
            "[orchestrator]\nhealth_threshold = 1.5",
            "[orchestrator]\nrefresh_probability = -0.1",
            "[policy]\nmin_interval_ms = 9000",
            "[scoring]\nneeds_improvement_threshold = 95.0",
        ] {
            assert!(
                matches!(
                    ModgateConfig::from_toml_str(doc),
                    Err(ConfigError::Invalid(_))
                ),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            ModgateConfig::from_toml_str("[sandbox\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
