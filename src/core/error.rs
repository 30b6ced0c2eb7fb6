//! Error type system for the source extension runtime
//!
//! Every failure that crosses the bridge or registry boundary is one of the
//! variants below; script-side misbehavior is recovered into this taxonomy
//! before it reaches a caller.

use serde::{Deserialize, Serialize};

/// Main error type for the source runtime
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    // Registry-level errors
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Source not loaded: {0}")]
    NotLoaded(String),

    #[error("Source initialization failed: {0}")]
    InitializationFailed(String),

    // Bridge/contract errors
    #[error("Source contract violation: {0}")]
    ContractViolation(String),

    #[error("Capability not declared by source: {0}")]
    CapabilityUnsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Pagination
    #[error("No more pages for listing: {0}")]
    NoMorePages(String),

    // Script execution errors
    #[error("Call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SourceError {
    /// Get the error kind name, stable across message changes
    ///
    /// Callers are expected to branch on this (or on the variant itself) to
    /// render distinct failure states rather than one generic message.
    pub fn error_type(&self) -> &'static str {
        match self {
            SourceError::UnknownSource(_) => "UnknownSource",
            SourceError::NotLoaded(_) => "NotLoaded",
            SourceError::InitializationFailed(_) => "InitializationFailed",
            SourceError::ContractViolation(_) => "ContractViolation",
            SourceError::CapabilityUnsupported(_) => "CapabilityUnsupported",
            SourceError::NotFound(_) => "NotFound",
            SourceError::NoMorePages(_) => "NoMorePages",
            SourceError::Timeout(_) => "Timeout",
            SourceError::NetworkError(_) => "NetworkError",
            SourceError::ParseError(_) => "ParseError",
            SourceError::Config(_) => "Config",
            SourceError::Io(_) => "Io",
            SourceError::Serialization(_) => "Serialization",
        }
    }

    /// Check if a retry by the caller could plausibly succeed
    ///
    /// The runtime itself never retries; this is advisory for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout(_)
                | SourceError::NetworkError(_)
                | SourceError::InitializationFailed(_)
        )
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Serialization(err.to_string())
    }
}

/// Serializable error report, used to surface the last failure recorded
/// against a source (e.g. in CLI `list` output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error kind identifier
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// When the failure was recorded
    pub at: chrono::DateTime<chrono::Utc>,
}

impl ErrorReport {
    pub fn new(error: &SourceError) -> Self {
        Self {
            kind: error.error_type().to_string(),
            message: error.to_string(),
            at: chrono::Utc::now(),
        }
    }
}

/// Result type alias for operations that can fail with SourceError
pub type Result<T> = std::result::Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            SourceError::UnknownSource("x".into()).error_type(),
            "UnknownSource"
        );
        assert_eq!(
            SourceError::CapabilityUnsupported("download".into()).error_type(),
            "CapabilityUnsupported"
        );
        assert_eq!(
            SourceError::Timeout(std::time::Duration::from_secs(5)).error_type(),
            "Timeout"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(SourceError::NetworkError("x".into()).is_retryable());
        assert!(SourceError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!SourceError::NotFound("x".into()).is_retryable());
        assert!(!SourceError::ContractViolation("x".into()).is_retryable());
        assert!(!SourceError::NoMorePages("x".into()).is_retryable());
    }

    #[test]
    fn test_error_report() {
        let report = ErrorReport::new(&SourceError::InitializationFailed("boom".into()));
        assert_eq!(report.kind, "InitializationFailed");
        assert!(report.message.contains("boom"));
    }
}
