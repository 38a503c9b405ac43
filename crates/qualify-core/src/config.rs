//! Configuration for qualify-core

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{QualifyError, Result};

/// Prefix of environment variables overriding file settings,
/// e.g. `RVOIP_QUALIFY_WORKER_COUNT=8` or `RVOIP_QUALIFY_LOGGING__LEVEL=debug`
pub const ENV_PREFIX: &str = "RVOIP_QUALIFY";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualifyConfig {
    /// Upper bound in seconds of the randomized delay before the first
    /// probe of a contact scheduled in bulk; 0 uses the qualify frequency
    pub max_initial_qualify_time: u32,
    /// Workers running qualify tasks
    pub worker_count: usize,
    /// Tasks that may wait for a worker before pushes are rejected
    pub task_queue_depth: usize,
    /// Ignore `;`-parameters in the user part of inbound OPTIONS URIs
    pub ignore_uri_user_options: bool,
    /// How long `stop` waits for timers and workers to finish
    pub shutdown_timeout_ms: u64,
    pub logging: LoggingSettings,
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
}

impl Default for QualifyConfig {
    fn default() -> Self {
        Self {
            max_initial_qualify_time: 0,
            worker_count: 4,
            task_queue_depth: 1024,
            ignore_uri_user_options: false,
            shutdown_timeout_ms: 5000,
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl QualifyConfig {
    /// Load configuration from an optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(QualifyError::Config("worker_count must be at least 1".to_string()));
        }
        if self.task_queue_depth == 0 {
            return Err(QualifyError::Config("task_queue_depth must be at least 1".to_string()));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(QualifyError::Config("shutdown_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
