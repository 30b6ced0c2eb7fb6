//! Folio Sources
//!
//! Runtime for installable book-catalog source extensions: discovery and
//! registration of script sources, a per-source execution bridge, normalized
//! catalog records, and cursor-based pagination over source listings.

pub mod core;
pub mod source;

// Re-export commonly used types
pub use crate::core::{Config, Logger, Result, SourceError};
pub use source::{SourceBridge, SourceRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
