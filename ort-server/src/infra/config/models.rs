use std::path::PathBuf;

use ort_core::orchestration::OrchestratorConfig;
use serde::Serialize;
use url::Url;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Effective server configuration after merging defaults, file and
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// The URL with its password masked, for logs.
    pub fn redacted_url(&self) -> Option<String> {
        self.url.as_deref().map(redact_url)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Masks the password of a connection URL. Unparseable input is masked
/// entirely.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// Printable form of [`Config`], shaped like the TOML file.
#[derive(Debug, Serialize)]
pub struct EffectiveConfig<'a> {
    pub database: EffectiveDatabase,
    pub orchestrator: &'a OrchestratorConfig,
}

#[derive(Debug, Serialize)]
pub struct EffectiveDatabase {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Config {
    pub fn effective(&self) -> EffectiveConfig<'_> {
        EffectiveConfig {
            database: EffectiveDatabase {
                url: self.database.redacted_url(),
                max_connections: self.database.max_connections,
            },
            orchestrator: &self.orchestrator,
        }
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&self.effective())
    }
}
