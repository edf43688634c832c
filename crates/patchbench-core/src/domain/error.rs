//! Domain-level error taxonomy for patchbench.

/// Errors produced while validating a data point.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("patch is empty")]
    EmptyPatch,

    #[error("both FAIL_TO_PASS and PASS_TO_PASS are empty")]
    NoExpectedTests,

    #[error("invalid repository id: {0}")]
    InvalidRepo(String),

    #[error("invalid git ref: {0}")]
    InvalidRef(String),

    #[error("unsafe instance id: {0}")]
    UnsafeInstanceId(String),
}

/// patchbench domain errors.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("invalid data point: {0}")]
    InvalidDataPoint(#[from] ValidationError),

    #[error("invalid canonical value: {0}")]
    InvalidCanonicalValue(String),

    #[error("illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for patchbench domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::from(ValidationError::EmptyPatch);
        assert!(err.to_string().contains("invalid data point"));
        assert!(err.to_string().contains("patch is empty"));

        let err = DomainError::IllegalTransition {
            from: "pending".to_string(),
            to: "running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn test_missing_field_names_field() {
        let err = ValidationError::MissingField {
            field: "base_commit".to_string(),
        };
        assert!(err.to_string().contains("base_commit"));
    }
}
