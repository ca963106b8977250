use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix for environment variable configuration, e.g. `AXON_SOURCE_DB_HOST`.
const ENV_PREFIX: &str = "AXON";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration from environment: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0} is required")]
    Missing(&'static str),
}

/// Configuration for the replication pipeline, loaded from `AXON_`-prefixed
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AxonConfig {
    // source db credentials
    #[serde(default = "default_host")]
    pub source_db_host: String,
    #[serde(default = "default_port")]
    pub source_db_port: u16,
    #[serde(default)]
    pub source_db_name: String,
    #[serde(default = "default_user")]
    pub source_db_user: String,
    #[serde(default)]
    pub source_db_pass: String,

    // target db credentials
    #[serde(default = "default_host")]
    pub target_db_host: String,
    #[serde(default = "default_port")]
    pub target_db_port: u16,
    #[serde(default)]
    pub target_db_name: String,
    #[serde(default = "default_user")]
    pub target_db_user: String,
    #[serde(default)]
    pub target_db_pass: String,

    /// Replaces the schema of every applied changeset; empty disables the
    /// override.
    #[serde(default = "default_target_schema")]
    pub target_db_schema: String,

    /// Shut down after applying the newest changeset on the source.
    #[serde(default)]
    pub shutdown_after_last_changeset: bool,

    /// Changeset ids up to and including this one are assumed applied.
    #[serde(default)]
    pub start_from_id: i64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_listener_batch_size")]
    pub listener_batch_size: i64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Optional cursor checkpoint file holding a single changeset id.
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_target_schema() -> String {
    "public".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_listener_batch_size() -> i64 {
    500
}

fn default_channel_capacity() -> usize {
    64
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    6
}

impl AxonConfig {
    /// Loads the configuration from `AXON_`-prefixed environment variables.
    pub fn from_env() -> Result<AxonConfig, ConfigError> {
        Self::from_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        )
    }

    fn from_source(source: config::Environment) -> Result<AxonConfig, ConfigError> {
        let settings = config::Config::builder().add_source(source).build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn source_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.source_db_host)
            .port(self.source_db_port)
            .dbname(&self.source_db_name)
            .user(&self.source_db_user);
        if !self.source_db_pass.is_empty() {
            config.password(&self.source_db_pass);
        }
        config
    }

    pub fn target_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.target_db_host)
            .port(self.target_db_port)
            .dbname(&self.target_db_name)
            .user(&self.target_db_user);
        if !self.target_db_pass.is_empty() {
            config.password(&self.target_db_pass);
        }
        config
    }

    pub fn require_source(&self) -> Result<(), ConfigError> {
        if self.source_db_name.is_empty() {
            return Err(ConfigError::Missing("AXON_SOURCE_DB_NAME"));
        }
        Ok(())
    }

    pub fn require_target(&self) -> Result<(), ConfigError> {
        if self.target_db_name.is_empty() {
            return Err(ConfigError::Missing("AXON_TARGET_DB_NAME"));
        }
        Ok(())
    }

    /// The configured schema override, if any.
    pub fn schema_override(&self) -> Option<&str> {
        if self.target_db_schema.is_empty() {
            None
        } else {
            Some(&self.target_db_schema)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
