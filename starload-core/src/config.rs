//! Configuration system for Starload.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit file -> environment -> overrides.
//! Configuration is loaded from `~/.config/starload/config.toml` and/or
//! `.starload/config.toml` in the workspace directory.

use crate::error::ConfigError;
use crate::pipeline::types::{Backoff, RetryPolicy};
use crate::quality::QualityRules;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarloadConfig {
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub quality: QualityRules,
}

/// Which warehouse connection a run targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Connection identifier handed to the warehouse connector.
    pub connection_id: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            connection_id: "redshift".to_string(),
        }
    }
}

/// Where credentials for the object store come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialBackend {
    #[default]
    Env,
    Keyring,
}

impl std::fmt::Display for CredentialBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialBackend::Env => write!(f, "env"),
            CredentialBackend::Keyring => write!(f, "keyring"),
        }
    }
}

/// Defaults for staging pulls. Task parameters override each field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub bucket: String,
    pub region: String,
    pub credential_ref: String,
    /// JSON path file, or `auto` to map fields by name.
    pub json_path: String,
    #[serde(default)]
    pub credential_backend: CredentialBackend,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bucket: "udacity-dend".to_string(),
            region: "us-west-2".to_string(),
            credential_ref: "aws_credentials".to_string(),
            json_path: "auto".to_string(),
            credential_backend: CredentialBackend::Env,
        }
    }
}

/// Default retry policy for tasks that do not declare their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub delay_secs: u64,
    #[serde(default)]
    pub backoff: Backoff,
    pub max_delay_secs: u64,
    /// Allow retries of fact appends. Each retry may duplicate rows that a
    /// partially failed attempt already inserted.
    pub retry_non_idempotent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay_secs: 300,
            backoff: Backoff::Fixed,
            max_delay_secs: 3600,
            retry_non_idempotent: true,
        }
    }
}

impl RetryConfig {
    pub fn default_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.delay_secs),
            self.backoff,
        );
        policy.max_delay = Duration::from_secs(self.max_delay_secs.max(self.delay_secs));
        policy
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap on task bodies running at once. 0 means unbounded.
    pub max_concurrent_tasks: usize,
}

impl StarloadConfig {
    /// Reject values that no run could use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "retry.max_attempts must be at least 1".into(),
            });
        }
        if self.source.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "source.bucket must not be empty".into(),
            });
        }
        if self.source.credential_ref.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "source.credential_ref must not be empty".into(),
            });
        }
        if self.warehouse.connection_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "warehouse.connection_id must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "starload", "starload")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".starload").join("config.toml")
}

/// Load configuration from all layers.
///
/// An explicit `config_file` must exist; the user and workspace files are
/// optional.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&StarloadConfig>,
) -> Result<StarloadConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(StarloadConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (STARLOAD_RETRY__MAX_ATTEMPTS, STARLOAD_SOURCE__BUCKET, etc.)
    figment = figment.merge(Env::prefixed("STARLOAD_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: StarloadConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Check whether any Starload configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
