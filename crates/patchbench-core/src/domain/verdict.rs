//! Verdicts: the terminal outcome of one evaluation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
    Timeout,
    PatchConflict,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Pass => "pass",
            VerdictStatus::Fail => "fail",
            VerdictStatus::Error => "error",
            VerdictStatus::Timeout => "timeout",
            VerdictStatus::PatchConflict => "patch_conflict",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestStatus {
    pub fn is_passing(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

/// Which ids of one expected set passed and which did not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSetOutcome {
    pub success: Vec<String>,
    pub failure: Vec<String>,
}

impl TestSetOutcome {
    pub fn all_passed(&self) -> bool {
        self.failure.is_empty()
    }
}

/// FAIL_TO_PASS / PASS_TO_PASS breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestsStatus {
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: TestSetOutcome,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: TestSetOutcome,
}

/// Terminal result of one evaluation. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub instance_id: String,
    pub status: VerdictStatus,
    /// Per-test status as observed in the output
    pub tests: BTreeMap<String, TestStatus>,
    pub tests_status: TestsStatus,
    pub duration_ms: u64,
    /// Location of `run_instance.log`
    pub log_path: PathBuf,
    /// Captured output hit the byte limit
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Matcher that produced `tests` (absent when nothing ran)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl Verdict {
    /// Verdict for an evaluation that ended before any test ran.
    pub fn early(
        instance_id: impl Into<String>,
        status: VerdictStatus,
        error: impl Into<String>,
        duration_ms: u64,
        log_path: PathBuf,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            tests: BTreeMap::new(),
            tests_status: TestsStatus::default(),
            duration_ms,
            log_path,
            truncated: false,
            error: Some(error.into()),
            matcher: None,
            finished_at: Utc::now(),
        }
    }

    /// The patch resolved the instance.
    pub fn resolved(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}
