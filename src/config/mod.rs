//! Configuration management for the watch client.
//!
//! Provides hierarchical configuration loading with priority:
//! 1. Default values (hardcoded)
//! 2. Configuration file named by `CONFIG_PATH`
//! 3. Environment variables with the `HAYSTACK__` prefix (highest priority)

mod watch;
pub use watch::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "HAYSTACK";

/// Main configuration container for the client
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Watch polling and batching parameters
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Debug for ClientConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ClientConfig").field("watch", &self.watch).finish()
    }
}

impl ClientConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources are merged in order (later overrides earlier):
    /// 1. Type defaults
    /// 2. File from the `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables such as `HAYSTACK__WATCH__BATCH_WINDOW_MS`
    ///
    /// Call [`validate`](Self::validate) once all overrides are applied.
    ///
    /// # Examples
    /// ```ignore
    /// let cfg = ClientConfig::new()?
    ///     .with_override_config("client.toml")?
    ///     .validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional overrides from a file, then re-applies environment
    /// variables so they keep the highest priority.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.watch.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
