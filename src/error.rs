//! Error types for security group rule operations.

use thiserror::Error;

/// Errors that can occur while managing security group rules.
#[derive(Debug, Error)]
pub enum RulesError {
    /// A referenced peer security group could not be resolved.
    #[error("Security group lookup failed: {0}")]
    Lookup(String),

    /// The parent security group (or another object) does not exist anymore.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The declared configuration is invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Stored state could not be migrated to the current schema version.
    #[error("State migration error: {0}")]
    Migration(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is not served by this provider.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// The backing service returned an error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The operation did not complete within the configured timeout.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A state migration pattern failed to compile.
    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),
}

impl RulesError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::Lookup(msg) => msg,
            Self::NotFound(msg) => msg,
            Self::Validation(msg) => msg,
            Self::Migration(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::UnknownResource(msg) => msg,
            Self::Backend(msg) => msg,
            Self::DeadlineExceeded(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Regex(_err) => "pattern error (see Debug output)",
        }
    }

    /// Whether this error means the looked up object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RulesError>;
