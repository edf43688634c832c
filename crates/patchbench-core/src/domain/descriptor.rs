//! Data-point descriptors.
//!
//! A `DataPointDescriptor` is one evaluation input: where the repository
//! lives, which commit to check out, which patch to apply and which tests
//! decide the verdict. It is immutable once handed to the orchestrator.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use super::error::ValidationError;

/// One evaluation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPointDescriptor {
    pub instance_id: String,
    /// `owner/name` repository id
    pub repo: String,
    pub base_commit: String,
    /// Golden (reference) patch
    pub patch: String,
    /// Candidate patch under evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_patch: Option<String>,
    /// Patch adding or updating the tests named below
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_patch: Option<String>,
    /// Evaluate the golden patch even when a candidate is present
    #[serde(default)]
    pub golden: bool,
    #[serde(rename = "FAIL_TO_PASS", deserialize_with = "test_id_list")]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", deserialize_with = "test_id_list")]
    pub pass_to_pass: Vec<String>,
    /// Per-instance extra dependencies installed into the Instance layer
    #[serde(default, alias = "additional_dependencies")]
    pub extra_dependencies: Vec<String>,
    /// Overrides the run-wide test timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_setup_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Expected test sets of a data point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedTests {
    pub fail_to_pass: BTreeSet<String>,
    pub pass_to_pass: BTreeSet<String>,
}

impl ExpectedTests {
    /// Every expected test id, FAIL_TO_PASS first.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.fail_to_pass.iter().chain(self.pass_to_pass.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.fail_to_pass.is_empty() && self.pass_to_pass.is_empty()
    }
}

impl DataPointDescriptor {
    /// Check the descriptor before any build work starts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.instance_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "instance_id".to_string(),
            });
        }
        if !is_safe_path_component(&self.instance_id) {
            return Err(ValidationError::UnsafeInstanceId(self.instance_id.clone()));
        }
        if !is_valid_repo(&self.repo) {
            return Err(ValidationError::InvalidRepo(self.repo.clone()));
        }
        if !is_valid_git_ref(&self.base_commit) {
            return Err(ValidationError::InvalidRef(self.base_commit.clone()));
        }
        if let Some(commit) = &self.environment_setup_commit {
            if !is_valid_git_ref(commit) {
                return Err(ValidationError::InvalidRef(commit.clone()));
            }
        }
        if self.patch.trim().is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        if self.fail_to_pass.is_empty() && self.pass_to_pass.is_empty() {
            return Err(ValidationError::NoExpectedTests);
        }
        Ok(())
    }

    /// Directory name for this data point's logs. Equals `instance_id` when
    /// that is a safe path component; otherwise unsafe characters are
    /// replaced so an invalid descriptor can still be logged.
    pub fn log_dir_name(&self) -> String {
        if is_safe_path_component(&self.instance_id) {
            return self.instance_id.clone();
        }
        let cleaned: String = self
            .instance_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
            .collect();
        if cleaned.is_empty() {
            "unnamed".to_string()
        } else {
            cleaned
        }
    }

    pub fn expected_tests(&self) -> ExpectedTests {
        ExpectedTests {
            fail_to_pass: self.fail_to_pass.iter().cloned().collect(),
            pass_to_pass: self.pass_to_pass.iter().cloned().collect(),
        }
    }

    /// The patch to evaluate.
    ///
    /// `golden` (from the descriptor or the run) selects the reference patch;
    /// otherwise the candidate is used when present.
    pub fn selected_patch(&self, golden: bool) -> &str {
        if golden || self.golden {
            return &self.patch;
        }
        self.model_patch
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(self.patch.as_str())
    }
}

/// Accept either a JSON array of ids or a JSON string holding such an array.
fn test_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Encoded(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(ids) => Ok(ids),
        Raw::Encoded(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str::<Vec<String>>(trimmed).map_err(serde::de::Error::custom)
        }
    }
}

/// Safe as a single directory name under the log directory.
fn is_safe_path_component(s: &str) -> bool {
    !s.is_empty()
        && !s.contains("..")
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_repo(repo: &str) -> bool {
    static REPO_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+/[a-zA-Z0-9._-]+$").expect("valid regex"));
    REPO_PATTERN.is_match(repo) && !repo.contains("..")
}

fn is_valid_git_ref(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.contains("..")
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "instance_id": "psf__requests-1234",
            "repo": "psf/requests",
            "base_commit": "0123456789abcdef",
            "patch": "diff --git a/x b/x\n",
            "FAIL_TO_PASS": ["tests/test_x.py::test_foo"],
            "PASS_TO_PASS": "[\"tests/test_x.py::test_bar\"]"
        })
    }

    #[test]
    fn test_deserialize_mixed_test_list_encodings() {
        let dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(dp.fail_to_pass, vec!["tests/test_x.py::test_foo"]);
        assert_eq!(dp.pass_to_pass, vec!["tests/test_x.py::test_bar"]);
        assert!(!dp.golden);
        assert!(dp.validate().is_ok());
    }

    #[test]
    fn test_additional_dependencies_alias() {
        let mut v = sample_json();
        v["additional_dependencies"] = serde_json::json!(["pytest-mock==3.12.0"]);
        let dp: DataPointDescriptor = serde_json::from_value(v).unwrap();
        assert_eq!(dp.extra_dependencies, vec!["pytest-mock==3.12.0"]);
    }

    #[test]
    fn test_missing_required_field_fails_deserialize() {
        let mut v = sample_json();
        v.as_object_mut().unwrap().remove("base_commit");
        assert!(serde_json::from_value::<DataPointDescriptor>(v).is_err());
    }

    #[test]
    fn test_empty_patch_rejected() {
        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        dp.patch = "  \n".to_string();
        assert!(matches!(dp.validate(), Err(ValidationError::EmptyPatch)));
    }

    #[test]
    fn test_no_expected_tests_rejected() {
        let mut v = sample_json();
        v["FAIL_TO_PASS"] = serde_json::json!([]);
        v["PASS_TO_PASS"] = serde_json::json!("[]");
        let dp: DataPointDescriptor = serde_json::from_value(v).unwrap();
        assert!(matches!(dp.validate(), Err(ValidationError::NoExpectedTests)));
    }

    #[test]
    fn test_traversal_rejected() {
        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        dp.instance_id = "../etc".to_string();
        assert!(matches!(dp.validate(), Err(ValidationError::UnsafeInstanceId(_))));

        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        dp.repo = "not a repo".to_string();
        assert!(matches!(dp.validate(), Err(ValidationError::InvalidRepo(_))));

        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        dp.base_commit = "--upload-pack=evil".to_string();
        assert!(matches!(dp.validate(), Err(ValidationError::InvalidRef(_))));
    }

    #[test]
    fn test_log_dir_name_never_escapes() {
        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(dp.log_dir_name(), "psf__requests-1234");

        dp.instance_id = "../../etc".to_string();
        assert_eq!(dp.log_dir_name(), "______etc");

        dp.instance_id = String::new();
        assert_eq!(dp.log_dir_name(), "unnamed");
    }

    #[test]
    fn test_selected_patch() {
        let mut dp: DataPointDescriptor = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(dp.selected_patch(false), dp.patch);

        dp.model_patch = Some("candidate".to_string());
        assert_eq!(dp.selected_patch(false), "candidate");
        assert_eq!(dp.selected_patch(true), dp.patch);

        dp.golden = true;
        assert_eq!(dp.selected_patch(false), dp.patch);
    }

    #[test]
    fn test_expected_tests_dedup() {
        let mut v = sample_json();
        v["FAIL_TO_PASS"] = serde_json::json!(["a", "a", "b"]);
        let dp: DataPointDescriptor = serde_json::from_value(v).unwrap();
        let expected = dp.expected_tests();
        assert_eq!(expected.fail_to_pass.len(), 2);
        assert_eq!(expected.all().count(), 3);
    }
}
