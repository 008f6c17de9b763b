//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are layered
//! in increasing precedence:
//!
//! 1. `{dir}/base.toml` (required)
//! 2. `{dir}/environments/{env}.toml` (optional)
//! 3. `COB__SECTION__KEY` environment variables

use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::CobConfig;
use crate::constants::{DEFAULT_ENVIRONMENT, ENVIRONMENT_VARIABLE};

const BASE_FILE: &str = "base.toml";
const ENVIRONMENTS_DIR: &str = "environments";

#[derive(Debug)]
pub struct ConfigManager {
    config: CobConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `config/cob` with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration with an explicit environment, useful in tests that
    /// must not touch process-wide environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        let base_path = config_directory.join(BASE_FILE);

        if !base_path.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![base_path]));
        }

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading COB configuration"
        );

        let environment_path = config_directory
            .join(ENVIRONMENTS_DIR)
            .join(format!("{environment}.toml"));

        let config: CobConfig = Config::builder()
            .add_source(File::from(base_path).format(FileFormat::Toml))
            .add_source(
                File::from(environment_path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("COB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        info!(
            environment = environment,
            jobs = config.jobs.len(),
            chunk_size = config.batch.chunk_size,
            worker_count = config.batch.worker_count,
            durable_locks = config.database.is_some(),
            "COB configuration loaded"
        );
        debug!(config = %Self::sanitize_config_for_logging(&config), "Effective configuration");

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Some(config_directory),
        }))
    }

    /// Load configuration from an in-memory TOML document without any
    /// environment layering
    pub fn from_toml_str(toml: &str) -> ConfigResult<Arc<ConfigManager>> {
        let config: CobConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: None,
        }))
    }

    pub fn config(&self) -> &CobConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }

    pub fn detect_environment() -> String {
        env::var(ENVIRONMENT_VARIABLE)
            .unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        PathBuf::from("config").join("cob")
    }

    /// Mask the database url, which carries credentials
    pub fn sanitize_config_for_logging(config: &CobConfig) -> serde_json::Value {
        let mut value = serde_json::json!(config);
        if let Some(url) = value
            .get_mut("database")
            .and_then(|db| db.get_mut("url"))
        {
            *url = serde_json::Value::String("[MASKED]".to_string());
        }
        value
    }
}
