//! Configuration file support.
//!
//! Every section and every field has a default, so an empty file is valid:
//!
//! ```toml
//! [drift]
//! strict_mode = true
//! type_tolerance = "compatible"
//!
//! [planner]
//! lock_scope = "per_relation"
//!
//! [risk]
//! default_weight = 30.0
//!
//! [risk.weights]
//! DROP_TABLE = 95.0
//!
//! [executor]
//! isolation = "read_committed"
//! lock_timeout_ms = 5000
//!
//! [executor.retry]
//! max_retries = 5
//!
//! [verifier]
//! strict = true
//! probe_timeout_ms = 10000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::drift::DriftConfig;
use crate::error::{GuardError, GuardResult};
use crate::plan::PlannerConfig;
use crate::risk::RiskConfig;
use crate::transaction::ExecutorConfig;
use crate::verify::VerifierConfig;

/// Settings for every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// `[drift]`
    pub drift: DriftConfig,
    /// `[planner]`
    pub planner: PlannerConfig,
    /// `[risk]`
    pub risk: RiskConfig,
    /// `[executor]`
    pub executor: ExecutorConfig,
    /// `[verifier]`
    pub verifier: VerifierConfig,
}

impl ShieldConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(content: &str) -> GuardResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> GuardResult<Self> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> GuardResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GuardError::config(format!("failed to serialize configuration: {e}")))
    }

    /// Reject nonsensical values.
    pub fn validate(&self) -> GuardResult<()> {
        self.risk.validate()?;
        self.executor.validate()?;
        self.verifier.validate()?;
        Ok(())
    }

    /// Set the drift section.
    pub fn drift(mut self, drift: DriftConfig) -> Self {
        self.drift = drift;
        self
    }

    /// Set the planner section.
    pub fn planner(mut self, planner: PlannerConfig) -> Self {
        self.planner = planner;
        self
    }

    /// Set the risk section.
    pub fn risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    /// Set the executor section.
    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set the verifier section.
    pub fn verifier(mut self, verifier: VerifierConfig) -> Self {
        self.verifier = verifier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::TypeTolerance;
    use crate::plan::LockScope;
    use crate::transaction::IsolationLevel;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(ShieldConfig::from_toml_str("").unwrap(), ShieldConfig::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = ShieldConfig::from_toml_str(
            r#"
            [drift]
            strict_mode = true
            type_tolerance = "loose"

            [planner]
            lock_scope = "per_relation"

            [risk.weights]
            DROP_TABLE = 95.0

            [executor]
            isolation = "serializable"
            max_savepoints = 8
            lock_timeout_ms = 5000

            [executor.retry]
            max_retries = 5
            jitter = false

            [verifier]
            strict = true
            regression_threshold_pct = 25.0
            "#,
        )
        .unwrap();

        assert!(config.drift.strict_mode);
        assert_eq!(config.drift.type_tolerance, TypeTolerance::Loose);
        assert_eq!(config.planner.lock_scope, LockScope::PerRelation);
        assert_eq!(config.risk.weights.get("DROP_TABLE"), Some(&95.0));
        assert_eq!(config.executor.isolation, IsolationLevel::Serializable);
        assert_eq!(config.executor.max_savepoints, 8);
        assert_eq!(config.executor.lock_timeout_ms, Some(5000));
        assert_eq!(config.executor.retry.max_retries, 5);
        assert_eq!(config.executor.retry.base_delay_ms, 100);
        assert!(!config.executor.retry.jitter);
        assert!(config.verifier.strict);
        assert_eq!(config.verifier.regression_threshold_pct, 25.0);
        assert_eq!(config.verifier.probe_timeout_ms, 30_000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ShieldConfig::from_toml_str("[executor]\nmax_savepoints = 0").is_err());
        assert!(ShieldConfig::from_toml_str("[executor]\nmax_savepoints = 64").is_err());
        assert!(ShieldConfig::from_toml_str("[verifier]\nregression_threshold_pct = -5.0").is_err());
        assert!(ShieldConfig::from_toml_str("[risk.weights]\nNOT_A_KIND = 1.0").is_err());
        assert!(
            ShieldConfig::from_toml_str(
                "[executor.retry]\nbase_delay_ms = 500\nmax_delay_ms = 100"
            )
            .is_err()
        );
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = ShieldConfig::from_toml_str("[executor").unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShieldConfig::load(dir.path().join("pgshield.toml")).await.unwrap();
        assert_eq!(config, ShieldConfig::default());
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgshield.toml");
        let config = ShieldConfig::new()
            .planner(PlannerConfig::new().lock_scope(LockScope::PerRelation))
            .verifier(VerifierConfig::new().strict(true));
        tokio::fs::write(&path, config.to_toml_string().unwrap())
            .await
            .unwrap();

        assert_eq!(ShieldConfig::load(&path).await.unwrap(), config);
    }
}
