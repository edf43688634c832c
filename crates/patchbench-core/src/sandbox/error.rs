//! Error types for the sandbox module.

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The isolated context could not be created; worth one retry.
    #[error("sandbox setup failed: {reason}")]
    SetupFailed { reason: String },

    #[error(
        "circuit breaker open: {consecutive_failures} consecutive setup failures (threshold {threshold})"
    )]
    CircuitBreakerOpen {
        consecutive_failures: u32,
        threshold: u32,
    },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn setup(reason: impl Into<String>) -> Self {
        Self::SetupFailed {
            reason: reason.into(),
        }
    }

    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::SetupFailed { .. })
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
