//! Configuration management for PatientMap.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`PATIENTMAP__` prefix, `__` separator)
//! 2. Config file (`patientmap.toml`)
//! 3. Defaults

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::PatientMapError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientMapConfig {
    #[serde(default)]
    pub neo4j: Neo4jSettings,

    #[serde(default)]
    pub build: BuildConfig,
}

/// `[neo4j]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jSettings {
    #[serde(default = "default_uri")]
    pub uri: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

/// `[build]` section: limits for the build/validate loop.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Hard iteration ceiling.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum node specs submitted per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Consecutive no-progress iterations before the loop gives up.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,

    /// Timeout applied to every individual store call.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Retries for transient store errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step between retries.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Hop limit for connectivity analysis.
    #[serde(default = "default_analysis_max_depth")]
    pub analysis_max_depth: usize,
}

fn default_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_user() -> String {
    "neo4j".to_string()
}

fn default_database() -> String {
    "neo4j".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    256
}

fn default_max_iterations() -> u32 {
    3
}

fn default_batch_size() -> usize {
    100
}

fn default_stall_threshold() -> u32 {
    2
}

fn default_op_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_analysis_max_depth() -> usize {
    3
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            batch_size: default_batch_size(),
            stall_threshold: default_stall_threshold(),
            op_timeout_ms: default_op_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            analysis_max_depth: default_analysis_max_depth(),
        }
    }
}

impl PatientMapConfig {
    /// Load configuration from `<file_prefix>.toml` (optional) and the environment.
    pub fn load(file_prefix: &str) -> Result<Self, PatientMapError> {
        let settings = Config::builder()
            .add_source(File::with_name(file_prefix).required(false))
            .add_source(
                Environment::with_prefix("PATIENTMAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.build.validate()?;
        tracing::debug!(
            neo4j_uri = %config.neo4j.uri,
            max_iterations = config.build.max_iterations,
            batch_size = config.build.batch_size,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string, without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, PatientMapError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.build.validate()?;
        Ok(config)
    }
}

impl BuildConfig {
    /// Reject limits that would stop the loop from ever running or stalling.
    pub fn validate(&self) -> Result<(), PatientMapError> {
        let zero = |key: &'static str| PatientMapError::InvalidSetting {
            key,
            reason: "must be greater than zero",
        };
        if self.max_iterations == 0 {
            return Err(zero("build.max_iterations"));
        }
        if self.batch_size == 0 {
            return Err(zero("build.batch_size"));
        }
        if self.stall_threshold == 0 {
            return Err(zero("build.stall_threshold"));
        }
        if self.op_timeout_ms == 0 {
            return Err(zero("build.op_timeout_ms"));
        }
        Ok(())
    }
}
