use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use ort_core::orchestration::OrchestratorConfig;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub stuck_runs_interval: Option<Duration>,
    pub stuck_runs_min_age: Option<Duration>,
    pub job_timeouts_interval: Option<Duration>,
    pub config_worker: Option<bool>,
    /// Variables that were set but could not be parsed.
    pub invalid: Vec<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Gathers values through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env_config = Self::default();

        env_config.config_path = lookup("ORT_CONFIG_PATH")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        env_config.database_url = lookup("DATABASE_URL");
        env_config.database_max_connections = parse_var(
            &lookup,
            "ORT_DATABASE_MAX_CONNECTIONS",
            |raw| raw.parse().ok(),
            &mut env_config.invalid,
        );
        env_config.stuck_runs_interval = parse_var(
            &lookup,
            "ORT_STUCK_RUNS_INTERVAL",
            parse_duration,
            &mut env_config.invalid,
        );
        env_config.stuck_runs_min_age = parse_var(
            &lookup,
            "ORT_STUCK_RUNS_MIN_AGE",
            parse_duration,
            &mut env_config.invalid,
        );
        env_config.job_timeouts_interval = parse_var(
            &lookup,
            "ORT_JOB_TIMEOUTS_INTERVAL",
            parse_duration,
            &mut env_config.invalid,
        );
        env_config.config_worker = parse_var(
            &lookup,
            "ORT_CONFIG_WORKER",
            parse_bool,
            &mut env_config.invalid,
        );

        env_config
    }
}

fn parse_var<L, T>(
    lookup: &L,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
    invalid: &mut Vec<String>,
) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = parse(trimmed);
    if parsed.is_none() {
        invalid.push(name.to_string());
    }
    parsed
}

/// Accepts `humantime` durations (`90s`, `5m`, `1h 30m`) or plain seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .ok()
        .or_else(|| humantime::parse_duration(raw).ok())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
