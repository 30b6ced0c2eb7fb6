//! Configuration management

use clap::Parser;
use config::{Config as ConfigBuilder, ConfigError as BuilderError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sources configuration: {0}")]
    InvalidSources(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sources: SourcesConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Self::builder_with_defaults()?;

        // Config file (medium priority)
        if let Some(config_path) = &cli_args.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Environment variables, prefixed with FOLIO_ and using __ for nesting
        // Example: FOLIO_SOURCES__CALL_TIMEOUT=10
        builder = builder.add_source(
            Environment::with_prefix("FOLIO")
                .separator("__")
                .try_parsing(true),
        );

        // CLI arguments (highest priority)
        if let Some(sources_dir) = &cli_args.sources_dir {
            builder = builder.set_override("sources.sources_dir", sources_dir.display().to_string())?;
        }
        if let Some(log_level) = &cli_args.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = Self::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn builder_with_defaults(
    ) -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let default_sources_dir = default_sources_dir();
        Ok(ConfigBuilder::builder()
            .set_default("sources.sources_dir", default_sources_dir.display().to_string())?
            .set_default("sources.call_timeout", 30)? // seconds
            .set_default("sources.channel_capacity", 32)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            .set_default("logging.output", "stdout")?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sources.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Default sources directory: `<platform data dir>/folio/sources`, falling
/// back to a relative path when the platform dir cannot be determined.
fn default_sources_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("folio").join("sources"))
        .unwrap_or_else(|| PathBuf::from("./sources"))
}

/// Command-line arguments for configuration override
///
/// Flattened into the binary's clap parser alongside its subcommands.
#[derive(Debug, Default, Parser)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding installed sources
    #[arg(long, value_name = "DIR", global = true)]
    pub sources_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Directory scanned for installed source directories
    pub sources_dir: PathBuf,
    /// Per-call timeout in seconds
    pub call_timeout: u64,
    /// Bridge command channel capacity
    pub channel_capacity: usize,
}

impl SourcesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidSources(
                "sources_dir cannot be empty".to_string(),
            ));
        }

        if self.call_timeout == 0 {
            return Err(ConfigError::InvalidSources(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidSources(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.call_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "level must be one of: {:?}",
                valid_levels
            )));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "format must be one of: {:?}",
                valid_formats
            )));
        }

        let valid_outputs = ["stdout", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!(
                "output must be one of: {:?}",
                valid_outputs
            )));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        Ok(())
    }
}
