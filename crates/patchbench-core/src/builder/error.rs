//! Build failures.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::LayerKind;

/// How a build step failed, which decides whether it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildErrorKind {
    /// The data point's patch does not apply
    Conflict,
    /// Looks like a network or infrastructure hiccup
    Transient,
    Permanent,
    Cancelled,
    Timeout,
    Io,
}

/// A failed build step. Partial artifacts of the step are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} build failed at {step} ({kind}): {message}")]
pub struct BuildError {
    pub stage: LayerKind,
    /// Recipe step that failed (`checkout`, `install`, `apply_patch`, ...)
    pub step: String,
    pub kind: BuildErrorKind,
    pub message: String,
}

impl fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildErrorKind::Conflict => "conflict",
            BuildErrorKind::Transient => "transient",
            BuildErrorKind::Permanent => "permanent",
            BuildErrorKind::Cancelled => "cancelled",
            BuildErrorKind::Timeout => "timeout",
            BuildErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl BuildError {
    pub fn new(
        stage: LayerKind,
        step: impl Into<String>,
        kind: BuildErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            step: step.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn io(stage: LayerKind, step: impl Into<String>, err: &std::io::Error) -> Self {
        Self::new(stage, step, BuildErrorKind::Io, err.to_string())
    }

    pub fn cancelled(stage: LayerKind, step: impl Into<String>) -> Self {
        Self::new(stage, step, BuildErrorKind::Cancelled, "cancelled")
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, BuildErrorKind::Transient)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, BuildErrorKind::Conflict)
    }

    /// Whether the failure says something about the identity, so it can be
    /// remembered for `failure_ttl`.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self.kind, BuildErrorKind::Cancelled)
    }
}

/// Stderr fragments that mark a failed command as worth one retry.
const TRANSIENT_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection timed out",
    "connection reset",
    "temporary failure in name resolution",
    "network is unreachable",
    "early eof",
    "the remote end hung up unexpectedly",
    "read timed out",
    "503 service unavailable",
    "502 bad gateway",
    "too many requests",
];

/// Classify a failed command's output as transient or permanent.
pub fn classify_failure(output: &str) -> BuildErrorKind {
    let lower = output.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        BuildErrorKind::Transient
    } else {
        BuildErrorKind::Permanent
    }
}
