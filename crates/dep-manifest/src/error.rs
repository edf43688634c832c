//! Error types for dep-manifest

use thiserror::Error;

/// Errors that can occur while reading a repository's dependency declarations
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Repository root does not exist
    #[error("Repository root not found: {0}")]
    RootNotFound(String),

    /// Invalid Pipfile.lock format
    #[error("Invalid Pipfile.lock format: {0}")]
    InvalidPipfileLock(String),

    /// A requirements file could not be interpreted
    #[error("Malformed requirements file {path}: {reason}")]
    MalformedRequirements { path: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
