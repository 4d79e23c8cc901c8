use std::time::Duration;

use serde::{Deserialize, Serialize};

use ort_model::Stage;

use crate::error::{OrchestratorError, Result};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a deployment only needs to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Send a `ConfigRequest` first and schedule the pipeline only after the
    /// config worker reported back.
    pub config_worker: bool,
    /// Detection of stuck runs and timed out jobs.
    pub monitor: MonitorConfig,
    /// Shared settings of the maintenance job runner.
    pub maintenance: MaintenanceConfig,
}

impl OrchestratorConfig {
    /// Rejects settings that would make the sweeps spin or never fire.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("monitor.stuck_runs.interval_secs", self.monitor.stuck_runs.interval_secs),
            ("monitor.job_timeouts.interval_secs", self.monitor.job_timeouts.interval_secs),
            ("maintenance.claim_stale_after_secs", self.maintenance.claim_stale_after_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(OrchestratorError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        for stage in Stage::ALL {
            if self.monitor.job_timeouts.timeouts.for_stage(stage).is_zero() {
                return Err(OrchestratorError::Configuration(format!(
                    "monitor.job_timeouts.timeouts.{stage} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Sweeps that detect runs and jobs needing attention.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Re-evaluation of idle runs.
    pub stuck_runs: StuckRunsConfig,
    /// Failing of jobs that outlive their stage timeout.
    pub job_timeouts: JobTimeoutsConfig,
}

/// Stuck-run sweep. A run is suspected stuck when it is ACTIVE and has not
/// been updated for `min_age_secs`; this is a heuristic and a slow worker
/// can be swept if the threshold is too aggressive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StuckRunsConfig {
    /// Whether the sweep runs
    pub enabled: bool,
    /// Cadence of the sweep (seconds)
    pub interval_secs: u64,
    /// Minimum time since the last update of a run (seconds)
    pub min_age_secs: u64,
}

impl StuckRunsConfig {
    /// Cadence of the sweep.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Idle time after which a run is suspected stuck.
    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

impl Default for StuckRunsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5 * 60,
            min_age_secs: 10 * 60,
        }
    }
}

/// Job-timeout sweep. Fails jobs that stayed active for longer than their stage allows.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobTimeoutsConfig {
    /// Whether the sweep runs
    pub enabled: bool,
    /// Cadence of the sweep (seconds)
    pub interval_secs: u64,
    /// Per-stage limits
    pub timeouts: TimeoutConfig,
}

impl JobTimeoutsConfig {
    /// Cadence of the sweep.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for JobTimeoutsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 2 * 60,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Maximum time a job of each stage may stay active (seconds).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Config worker. Measured from the last update of the run.
    pub config: u64,
    /// Stage jobs. Measured from the creation of the job.
    pub analyzer: u64,
    /// See `analyzer`.
    pub advisor: u64,
    /// See `analyzer`.
    pub scanner: u64,
    /// See `analyzer`.
    pub evaluator: u64,
    /// See `analyzer`.
    pub reporter: u64,
    /// See `analyzer`.
    pub notifier: u64,
}

impl TimeoutConfig {
    /// Timeout of the jobs of `stage`.
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Analyzer => self.analyzer,
            Stage::Advisor => self.advisor,
            Stage::Scanner => self.scanner,
            Stage::Evaluator => self.evaluator,
            Stage::Reporter => self.reporter,
            Stage::Notifier => self.notifier,
        };
        Duration::from_secs(secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            config: 5 * 60,
            analyzer: 60 * 60,
            advisor: 30 * 60,
            scanner: 4 * 60 * 60,
            evaluator: 30 * 60,
            reporter: 60 * 60,
            notifier: 10 * 60,
        }
    }
}

/// Coordination of maintenance jobs between replicas.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// A claim not refreshed for this long is treated as abandoned (seconds)
    pub claim_stale_after_secs: u64,
}

impl MaintenanceConfig {
    /// Age after which a held claim may be taken over.
    pub fn claim_stale_after(&self) -> Duration {
        Duration::from_secs(self.claim_stale_after_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            claim_stale_after_secs: 5 * 60,
        }
    }
}
