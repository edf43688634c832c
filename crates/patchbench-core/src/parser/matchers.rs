//! Per-test output matchers.
//!
//! Each matcher scans captured test output for the markers one test runner
//! family prints and returns what it recognized. An empty map means "no
//! markers of mine here", which lets the parser fall through to the next
//! matcher in the chain.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::TestStatus;
use crate::profile::{MatcherKind, RegexRule};

/// Test id → observed status.
pub type TestMap = BTreeMap<String, TestStatus>;

/// A strategy for reading per-test results out of raw output.
pub trait MatcherStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, output: &str) -> TestMap;
}

/// Matcher for a profile's [`MatcherKind`].
pub fn matcher_for(kind: MatcherKind) -> Box<dyn MatcherStrategy> {
    match kind {
        MatcherKind::Pytest => Box::new(PytestMatcher),
        MatcherKind::Django => Box::new(DjangoMatcher),
        MatcherKind::Sympy => Box::new(SympyMatcher),
        MatcherKind::Generic => Box::new(GenericMatcher),
    }
}

fn pytest_status(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XFAIL" | "XPASS" => Some(TestStatus::Passed),
        "FAILED" => Some(TestStatus::Failed),
        "ERROR" => Some(TestStatus::Error),
        "SKIPPED" => Some(TestStatus::Skipped),
        _ => None,
    }
}

// `-rA` summary: `PASSED tests/test_a.py::test_x` / `FAILED tests/test_a.py::test_y - AssertionError`.
// Parametrized ids may contain spaces, so the id runs to the first ` - ` or
// the end of the line.
static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(PASSED|FAILED|ERROR|XFAIL|XPASS)\s+(\S+::.+?)(?:\s+-\s.*)?\s*$")
        .expect("valid regex")
});

// Verbose progress: `tests/test_a.py::test_x PASSED [ 50%]`; the id runs up
// to the trailing status word.
static PYTEST_VERBOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+::.+?)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(?:\s+\[\s*\d+%\])?\s*$")
        .expect("valid regex")
});

/// pytest run with `-rA` (short summary) or `-v` (per-test lines).
#[derive(Debug, Clone, Copy, Default)]
pub struct PytestMatcher;

impl MatcherStrategy for PytestMatcher {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn parse(&self, output: &str) -> TestMap {
        let mut tests = TestMap::new();
        for line in output.lines() {
            let line = line.trim();
            let (id, word) = if let Some(caps) = PYTEST_SUMMARY.captures(line) {
                (caps[2].to_string(), caps[1].to_string())
            } else if let Some(caps) = PYTEST_VERBOSE.captures(line) {
                (caps[1].to_string(), caps[2].to_string())
            } else {
                continue;
            };
            if let Some(status) = pytest_status(&word) {
                tests.insert(id, status);
            }
        }
        tests
    }
}

static DJANGO_TEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+) \(([\w.]+)\)").expect("valid regex"));

fn django_status(result: &str) -> Option<TestStatus> {
    let result = result.trim();
    if result == "ok" || result == "expected failure" {
        Some(TestStatus::Passed)
    } else if result == "FAIL" || result == "unexpected success" {
        Some(TestStatus::Failed)
    } else if result == "ERROR" {
        Some(TestStatus::Error)
    } else if result.starts_with("skipped") {
        Some(TestStatus::Skipped)
    } else {
        None
    }
}

/// Django's `runtests.py --verbosity 2`: `test_x (module.Class) ... ok`.
///
/// Ids are reported as `test_x (module.Class)`. A docstring line may sit
/// between the test line and its `... ok`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DjangoMatcher;

impl DjangoMatcher {
    fn test_id(line: &str) -> Option<String> {
        let caps = DJANGO_TEST.captures(line)?;
        let name = &caps[1];
        let class = &caps[2];
        // Python 3.11+ appends the method name to the class path.
        let class = class
            .strip_suffix(name)
            .and_then(|c| c.strip_suffix('.'))
            .unwrap_or(class);
        Some(format!("{name} ({class})"))
    }
}

impl MatcherStrategy for DjangoMatcher {
    fn name(&self) -> &'static str {
        "django"
    }

    fn parse(&self, output: &str) -> TestMap {
        let mut tests = TestMap::new();
        let mut pending: Option<String> = None;
        for line in output.lines() {
            let line = line.trim_end();
            let (head, result) = match line.rsplit_once(" ... ") {
                Some((head, result)) => (head, Some(result)),
                None => (line, None),
            };
            if let Some(id) = Self::test_id(head) {
                pending = Some(id);
            }
            if let Some(result) = result {
                if let (Some(id), Some(status)) = (pending.take(), django_status(result)) {
                    tests.insert(id, status);
                }
            }
        }
        tests
    }
}

static SYMPY_TEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(test_\w+)\s+(ok|F|E|f|s|X)\s*$").expect("valid regex"));

/// SymPy's `bin/test` runner: `test_x ok`, `test_y F`, `test_z E`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SympyMatcher;

impl MatcherStrategy for SympyMatcher {
    fn name(&self) -> &'static str {
        "sympy"
    }

    fn parse(&self, output: &str) -> TestMap {
        let mut tests = TestMap::new();
        for line in output.lines() {
            let Some(caps) = SYMPY_TEST.captures(line.trim()) else {
                continue;
            };
            let status = match &caps[2] {
                "ok" | "f" => TestStatus::Passed,
                "F" | "X" => TestStatus::Failed,
                "E" => TestStatus::Error,
                _ => TestStatus::Skipped,
            };
            tests.insert(caps[1].to_string(), status);
        }
        tests
    }
}

static GENERIC_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+(PASSED|FAILED|ERROR|SKIPPED|ok|FAIL)\b").expect("valid regex")
});

/// `<id> PASSED|FAILED|ERROR|SKIPPED|ok|FAIL`, one test per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericMatcher;

impl MatcherStrategy for GenericMatcher {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn parse(&self, output: &str) -> TestMap {
        let mut tests = TestMap::new();
        for line in output.lines() {
            let Some(caps) = GENERIC_MARKER.captures(line.trim()) else {
                continue;
            };
            let status = match &caps[2] {
                "PASSED" | "ok" => TestStatus::Passed,
                "FAILED" | "FAIL" => TestStatus::Failed,
                "ERROR" => TestStatus::Error,
                _ => TestStatus::Skipped,
            };
            tests.insert(caps[1].to_string(), status);
        }
        tests
    }
}

/// Config-declared rules: a line matching a rule's pattern records its
/// `test` capture group (or the first group) with the rule's status.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    rules: Vec<(Regex, TestStatus)>,
}

impl RegexMatcher {
    pub fn new(rules: &[RegexRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| Regex::new(&r.pattern).map(|re| (re, r.status)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }
}

impl MatcherStrategy for RegexMatcher {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn parse(&self, output: &str) -> TestMap {
        let mut tests = TestMap::new();
        for line in output.lines() {
            for (pattern, status) in &self.rules {
                let Some(caps) = pattern.captures(line) else {
                    continue;
                };
                if let Some(id) = caps.name("test").or_else(|| caps.get(1)) {
                    tests.insert(id.as_str().to_string(), *status);
                    break;
                }
            }
        }
        tests
    }
}
