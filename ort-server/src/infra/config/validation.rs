use thiserror::Error;

use super::models::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("invalid orchestrator settings: {0}")]
    Orchestrator(#[from] ort_core::OrchestratorError),
    #[error("database max_connections must be greater than zero")]
    ZeroConnections,
}

/// Rejects unusable settings and warns about risky ones.
pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    config.orchestrator.validate()?;
    if config.database.max_connections == 0 {
        return Err(ConfigGuardRailError::ZeroConnections);
    }

    let stuck = &config.orchestrator.monitor.stuck_runs;
    if stuck.enabled && stuck.min_age_secs < stuck.interval_secs {
        warnings.push_with_hint(
            "stuck run min_age is shorter than the sweep interval",
            "Slow but healthy runs may be re-evaluated on every sweep",
        );
    }

    let monitor = &config.orchestrator.monitor;
    if !monitor.stuck_runs.enabled && !monitor.job_timeouts.enabled {
        warnings.push(
            "both sweeps are disabled; runs whose messages are lost stay ACTIVE",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::models::{ConfigMetadata, DatabaseConfig};
    use ort_core::orchestration::OrchestratorConfig;

    fn config() -> Config {
        Config {
            database: DatabaseConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&config()).expect("valid");
        assert!(warnings.is_empty());
    }

    #[test]
    fn aggressive_stuck_threshold_warns() {
        let mut config = config();
        config.orchestrator.monitor.stuck_runs.min_age_secs = 10;

        let warnings = apply_guard_rails(&config).expect("valid");
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].hint.is_some());
    }

    #[test]
    fn zero_connections_are_rejected() {
        let mut config = config();
        config.database.max_connections = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::ZeroConnections)
        ));
    }
}
