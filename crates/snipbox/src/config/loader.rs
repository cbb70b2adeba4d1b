//! Configuration loading
//!
//! A TOML file (or the embedded example) is layered under `SNIPBOX__*`
//! environment overrides using the config crate.

use std::collections::HashSet;
use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        Self::finish(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        Self::finish(config)
    }

    /// Load the service configuration: the given file (or the embedded example)
    /// overlaid with `SNIPBOX__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = match path {
            Some(path) => ConfigBuilder::builder().add_source(File::from(path)),
            None => ConfigBuilder::builder()
                .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::finish(config)
    }

    fn finish(config: ConfigBuilder) -> Result<Self, ConfigError> {
        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut identifiers = HashSet::new();
        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile
                && compile.command.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty compile command"
                )));
            }
            for name in std::iter::once(id).chain(&lang.aliases) {
                if !identifiers.insert(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "language identifier '{name}' is used more than once"
                    )));
                }
            }
        }

        if self.pool.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_workers must be at least 1".to_owned(),
            ));
        }
        if self.pool.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pool.queue_capacity must be at least 1".to_owned(),
            ));
        }
        if self.quota.burst == 0 || self.quota.refill_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "quota.burst and quota.refill_interval_ms must be positive".to_owned(),
            ));
        }
        if self.quota.max_concurrent_per_session == 0 {
            return Err(ConfigError::Invalid(
                "quota.max_concurrent_per_session must be at least 1".to_owned(),
            ));
        }
        if self.gateway.end_to_end_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.end_to_end_timeout_secs must be positive".to_owned(),
            ));
        }
        if self.default_limits.wall_clock().is_none() {
            return Err(ConfigError::Invalid(
                "default_limits needs a positive time_limit or wall_time_limit".to_owned(),
            ));
        }

        Ok(())
    }
}
