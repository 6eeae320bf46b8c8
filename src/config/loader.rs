//! Configuration Loader
//!
//! Layered configuration loading: built-in defaults, then an optional TOML
//! file, then `LAZYFETCH_*` environment variables. Nested keys use a double
//! underscore (`LAZYFETCH_BUDGETS__OVERALL_MS=1500`) and `cache.endpoints`
//! accepts a comma-separated list.

use super::FetchConfig;
use crate::error::FetchResult;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LAZYFETCH";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_VAR: &str = "LAZYFETCH_CONFIG";

const DEFAULT_CONFIG_FILES: [&str; 2] = ["lazyfetch.toml", "config/lazyfetch.toml"];

/// Builds a [`FetchConfig`] from defaults, a file and the environment
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_source: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of searching the default locations
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use this map in place of the process environment
    ///
    /// Useful for testing without modifying global environment variables.
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn load(self) -> FetchResult<FetchConfig> {
        let defaults = Config::try_from(&FetchConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        match self.file.or_else(Self::discover_file) {
            Some(path) => {
                debug!(path = %path.display(), "Loading fetch configuration file");
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => debug!("No configuration file found, using defaults and environment"),
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("cache.endpoints")
            .source(self.env_source);

        let config: FetchConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;

        info!(
            endpoints = ?config.cache.endpoints,
            retry_channel = %config.broker.retry_channel,
            policy = ?config.default_policy,
            "Fetch configuration loaded"
        );

        Ok(config)
    }

    fn discover_file() -> Option<PathBuf> {
        if let Ok(path) = env::var(CONFIG_PATH_VAR) {
            return Some(PathBuf::from(path));
        }

        DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }
}

impl FetchConfig {
    /// Load from the default file locations and the process environment
    pub fn load() -> FetchResult<Self> {
        ConfigLoader::new().load()
    }

    /// Load from an explicit file plus the process environment
    pub fn load_from(path: impl AsRef<Path>) -> FetchResult<Self> {
        ConfigLoader::new().with_file(path.as_ref()).load()
    }
}
