//! Core infrastructure: configuration, logging, and the error taxonomy.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{CliArgs, Config, ConfigError, LoggingConfig, SourcesConfig};
pub use error::{ErrorReport, Result, SourceError};
pub use logging::Logger;
