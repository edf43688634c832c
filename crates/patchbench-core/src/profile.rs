//! Repository profiles: per-repository recipe inputs.
//!
//! A profile decides how a repository is fetched, how its dependencies are
//! installed, which test command runs and which matcher reads the output.
//! Built-in profiles cover the common benchmark repositories; `[[repos]]`
//! entries in the config replace them per repository.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::TestStatus;

/// Test command used when a profile does not set one.
pub const DEFAULT_TEST_COMMAND: &str = "pytest --no-header -rA -p no:cacheprovider";

/// Output matcher a profile asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Pytest,
    Django,
    Sympy,
    Generic,
}

/// Which arguments are appended to the test command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSelection {
    /// Expected test ids
    #[default]
    Ids,
    /// Files touched by the test patch
    TestPatchFiles,
    /// Nothing; the command selects its own tests
    None,
}

/// How expected test ids are spelled on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestIdFormat {
    #[default]
    Plain,
    /// `module.Class.test_name` for Django's `runtests.py`
    Django,
}

/// Config-declared output rule: lines matching `pattern` record the captured
/// `test` group with `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexRule {
    pub pattern: String,
    pub status: TestStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoProfile {
    /// `owner/name`
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Replaces the manifest-derived install plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Vec<String>>,
    /// Environment-level patches applied after checkout
    #[serde(default)]
    pub env_patches: Vec<PathBuf>,
    /// Command prefix for per-instance extras; package specs are appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<MatcherKind>,
    /// Clone source; defaults to the GitHub URL of `repo`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub rules: Vec<RegexRule>,
    #[serde(default)]
    pub selection: TestSelection,
    #[serde(default)]
    pub id_format: TestIdFormat,
}

impl RepoProfile {
    /// Profile for a repository nothing is known about.
    pub fn generic(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            matcher: Some(MatcherKind::Pytest),
            ..Default::default()
        }
    }

    pub fn source_url(&self) -> String {
        self.source_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.repo))
    }

    pub fn base_test_command(&self) -> &str {
        self.test_command.as_deref().unwrap_or(DEFAULT_TEST_COMMAND)
    }

    /// Full test command for the given expected ids and test patch.
    pub fn test_command(&self, test_ids: &[String], test_patch: Option<&str>) -> String {
        let base = self.base_test_command();
        let args: Vec<String> = match self.selection {
            TestSelection::None => Vec::new(),
            TestSelection::TestPatchFiles => {
                test_patch.map(files_in_patch).unwrap_or_default()
            }
            TestSelection::Ids => match self.id_format {
                TestIdFormat::Plain => test_ids.to_vec(),
                TestIdFormat::Django => {
                    let mut ids: Vec<String> =
                        test_ids.iter().map(|id| django_test_label(id)).collect();
                    ids.dedup();
                    ids
                }
            },
        };

        if args.is_empty() {
            return base.to_string();
        }
        let escaped: Vec<String> = args.iter().map(|a| shell_escape(a)).collect();
        format!("{} {}", base, escaped.join(" "))
    }
}

/// Built-in profiles merged with configured overrides.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, RepoProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        for profile in [
            RepoProfile {
                repo: "django/django".to_string(),
                test_command: Some(
                    "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1"
                        .to_string(),
                ),
                matcher: Some(MatcherKind::Django),
                id_format: TestIdFormat::Django,
                ..Default::default()
            },
            RepoProfile {
                repo: "sympy/sympy".to_string(),
                test_command: Some("bin/test -C --verbose".to_string()),
                matcher: Some(MatcherKind::Sympy),
                selection: TestSelection::TestPatchFiles,
                ..Default::default()
            },
            RepoProfile {
                repo: "sphinx-doc/sphinx".to_string(),
                test_command: Some("tox --current-env -epy39 -v --".to_string()),
                matcher: Some(MatcherKind::Pytest),
                ..Default::default()
            },
        ] {
            profiles.insert(profile.repo.clone(), profile);
        }
        Self { profiles }
    }

    /// Built-ins overlaid with `overrides` (whole-profile replacement).
    pub fn with_overrides(overrides: &[RepoProfile]) -> Self {
        let mut registry = Self::builtin();
        for profile in overrides {
            registry.profiles.insert(profile.repo.clone(), profile.clone());
        }
        registry
    }

    pub fn is_registered(&self, repo: &str) -> bool {
        self.profiles.contains_key(repo)
    }

    pub fn resolve(&self, repo: &str) -> RepoProfile {
        self.profiles
            .get(repo)
            .cloned()
            .unwrap_or_else(|| RepoProfile::generic(repo))
    }
}

/// `+++ b/<path>` targets of a unified diff, in first-seen order.
pub fn files_in_patch(patch: &str) -> Vec<String> {
    static DIFF_PATH: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\+\+\+ b/(.+)$").expect("valid regex"));

    let mut files = Vec::new();
    for line in patch.lines() {
        if let Some(path) = DIFF_PATH.captures(line).and_then(|c| c.get(1)) {
            let p = path.as_str().trim_end().to_string();
            if !files.contains(&p) {
                files.push(p);
            }
        }
    }
    files
}

/// Convert a test id to a `runtests.py` label.
///
/// - `test_foo (admin_views.tests.AdminViewTest)` → `admin_views.tests.AdminViewTest.test_foo`
/// - `tests/admin_views/tests.py::AdminViewTest::test_foo` → `admin_views.tests.AdminViewTest.test_foo`
///
/// Anything else is returned unchanged.
pub fn django_test_label(id: &str) -> String {
    static UNITTEST_ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\w+) \(([\w.]+)\)").expect("valid regex"));

    if let Some(caps) = UNITTEST_ID.captures(id) {
        return format!("{}.{}", &caps[2], &caps[1]);
    }
    if let Some((file_path, test_part)) = id.split_once("::") {
        let module = file_path
            .strip_prefix("tests/")
            .unwrap_or(file_path)
            .strip_suffix(".py")
            .unwrap_or(file_path)
            .replace('/', ".");
        return format!("{}.{}", module, test_part.replace("::", "."));
    }
    id.to_string()
}

/// Single-quote `s` for `sh` unless it is made only of safe characters.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
