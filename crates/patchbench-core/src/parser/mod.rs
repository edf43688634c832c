//! Result parser: captured output plus exit status → verdict.
//!
//! Precedence:
//! 1. the runner never started (exit 126/127, or a command-not-found style
//!    crash without any test markers) → `Error`
//! 2. the first matcher in the chain that recognizes markers decides the
//!    per-test map; `Pass` iff every FAIL_TO_PASS and PASS_TO_PASS id is
//!    observed passing
//! 3. no markers at all → exit-code fallback, with every expected id
//!    recorded under the exit-derived status
//!
//! Expected ids missing from a truncated log take the exit-derived status.

pub mod matchers;

pub use matchers::{
    matcher_for, DjangoMatcher, GenericMatcher, MatcherStrategy, PytestMatcher, RegexMatcher,
    SympyMatcher, TestMap,
};

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ExpectedTests, TestSetOutcome, TestStatus, TestsStatus, VerdictStatus};
use crate::profile::{MatcherKind, RepoProfile};
use crate::sandbox::ExecutionResult;

/// Only the first lines of output are checked for a start failure; later
/// lines belong to the tests themselves.
const START_FAILURE_LINES: usize = 10;

// `sh: 1: pytest: not found`, `run_tests.sh: line 3: tox: command not found`,
// `bash: ./runtests.py: Permission denied`
static SHELL_START_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S*(?:sh|bash|dash): (?:line \d+: |\d+: )?[^:]+: (?:command not found|not found|Permission denied)$")
        .expect("valid regex")
});

// `/usr/bin/python3: No module named pytest`, `python: can't open file 'x.py'`
static INTERPRETER_START_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S*python[\d.]*: (?:No module named \S+|can't open file .*)$").expect("valid regex")
});

/// Verdict fields derived from one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub status: VerdictStatus,
    pub tests: TestMap,
    pub tests_status: TestsStatus,
    /// Matcher that produced `tests`; `exit_code` for the coarse fallback
    pub matcher: Option<String>,
    pub error: Option<String>,
}

/// Matcher chain for one repository.
pub struct ResultParser {
    chain: Vec<Box<dyn MatcherStrategy>>,
}

impl ResultParser {
    pub fn new(chain: Vec<Box<dyn MatcherStrategy>>) -> Self {
        Self { chain }
    }

    /// Chain for `profile`: its regex rules, then its matcher, then the
    /// generic marker matcher.
    pub fn for_profile(profile: &RepoProfile) -> Result<Self, regex::Error> {
        let mut chain: Vec<Box<dyn MatcherStrategy>> = Vec::new();
        if !profile.rules.is_empty() {
            chain.push(Box::new(RegexMatcher::new(&profile.rules)?));
        }
        let kind = profile.matcher.unwrap_or(MatcherKind::Pytest);
        chain.push(matcher_for(kind));
        if kind != MatcherKind::Generic {
            chain.push(Box::new(GenericMatcher));
        }
        Ok(Self::new(chain))
    }

    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub fn parse(&self, result: &ExecutionResult, expected: &ExpectedTests) -> ParsedResult {
        let (matcher, mut tests) = self
            .chain
            .iter()
            .map(|m| (m.name(), m.parse(&result.output)))
            .find(|(_, tests)| !tests.is_empty())
            .map(|(name, tests)| (Some(name.to_string()), tests))
            .unwrap_or((None, TestMap::new()));

        let early = if result.timed_out {
            Some((VerdictStatus::Timeout, "test command timed out".to_string()))
        } else if result.cancelled {
            Some((VerdictStatus::Error, "evaluation cancelled".to_string()))
        } else {
            start_failure(result, matcher.is_some()).map(|reason| (VerdictStatus::Error, reason))
        };
        if let Some((status, reason)) = early {
            return ParsedResult {
                tests_status: breakdown(&tests, expected),
                status,
                tests,
                matcher,
                error: Some(reason),
            };
        }

        let exit_status = if result.exit_code == Some(0) {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        let matcher = match matcher {
            Some(name) => {
                if result.truncated {
                    for id in expected.all() {
                        tests.entry(id.clone()).or_insert(exit_status);
                    }
                }
                Some(name)
            }
            None => {
                debug!(
                    "No test markers recognized; falling back to exit code {:?}",
                    result.exit_code
                );
                for id in expected.all() {
                    tests.insert(id.clone(), exit_status);
                }
                Some("exit_code".to_string())
            }
        };

        let tests_status = breakdown(&tests, expected);
        let status = if tests_status.fail_to_pass.all_passed()
            && tests_status.pass_to_pass.all_passed()
        {
            VerdictStatus::Pass
        } else {
            VerdictStatus::Fail
        };
        ParsedResult {
            status,
            tests,
            tests_status,
            matcher,
            error: None,
        }
    }
}

fn start_failure(result: &ExecutionResult, saw_markers: bool) -> Option<String> {
    match result.exit_code {
        Some(126) => return Some("test command could not be executed (exit 126)".to_string()),
        Some(127) => return Some("test command not found (exit 127)".to_string()),
        _ => {}
    }
    if saw_markers || result.exit_code == Some(0) {
        return None;
    }
    result
        .output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(START_FAILURE_LINES)
        .find(|line| SHELL_START_FAILURE.is_match(line) || INTERPRETER_START_FAILURE.is_match(line))
        .map(|line| format!("test command failed to start: {line}"))
}

fn outcome(ids: &BTreeSet<String>, tests: &TestMap) -> TestSetOutcome {
    let (success, failure): (Vec<String>, Vec<String>) = ids
        .iter()
        .cloned()
        .partition(|id| tests.get(id).is_some_and(|s| s.is_passing()));
    TestSetOutcome { success, failure }
}

fn breakdown(tests: &TestMap, expected: &ExpectedTests) -> TestsStatus {
    TestsStatus {
        fail_to_pass: outcome(&expected.fail_to_pass, tests),
        pass_to_pass: outcome(&expected.pass_to_pass, tests),
    }
}
