//! Verdict derivation from captured output across matcher strategies.

use patchbench_core::domain::{ExpectedTests, TestStatus, VerdictStatus};
use patchbench_core::parser::ResultParser;
use patchbench_core::profile::{MatcherKind, ProfileRegistry, RegexRule, RepoProfile};
use patchbench_core::sandbox::ExecutionResult;

fn run(exit_code: Option<i32>, output: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code,
        output: output.to_string(),
        duration_ms: 1,
        truncated: false,
        timed_out: false,
        cancelled: false,
    }
}

fn expected(f2p: &[&str], p2p: &[&str]) -> ExpectedTests {
    ExpectedTests {
        fail_to_pass: f2p.iter().map(|s| s.to_string()).collect(),
        pass_to_pass: p2p.iter().map(|s| s.to_string()).collect(),
    }
}

fn parser_for(repo: &str) -> ResultParser {
    ResultParser::for_profile(&ProfileRegistry::builtin().resolve(repo)).unwrap()
}

#[test]
fn test_marker_pass_with_exit_zero() {
    let parsed = parser_for("owner/repo").parse(&run(Some(0), "test_foo PASSED\n"), &expected(&["test_foo"], &[]));
    assert_eq!(parsed.status, VerdictStatus::Pass);
    assert_eq!(parsed.tests["test_foo"], TestStatus::Passed);
    assert_eq!(parsed.tests_status.fail_to_pass.success, vec!["test_foo"]);
}

#[test]
fn test_no_markers_nonzero_exit_fails() {
    let parsed = parser_for("owner/repo").parse(
        &run(Some(1), "Traceback (most recent call last):\nAssertionError\n"),
        &expected(&["test_foo"], &["test_bar"]),
    );
    assert_eq!(parsed.status, VerdictStatus::Fail);
    assert_eq!(parsed.matcher.as_deref(), Some("exit_code"));
    assert_eq!(parsed.tests_status.fail_to_pass.failure, vec!["test_foo"]);
    assert_eq!(parsed.tests_status.pass_to_pass.failure, vec!["test_bar"]);
}

#[test]
fn test_pass_requires_pass_to_pass_too() {
    let output = "\
tests/test_a.py::test_new PASSED
tests/test_a.py::test_old FAILED
";
    let parsed = parser_for("owner/repo").parse(
        &run(Some(1), output),
        &expected(&["tests/test_a.py::test_new"], &["tests/test_a.py::test_old"]),
    );
    assert_eq!(parsed.status, VerdictStatus::Fail);
    assert!(parsed.tests_status.fail_to_pass.all_passed());
    assert!(!parsed.tests_status.pass_to_pass.all_passed());
}

#[test]
fn test_django_profile_parses_runner_output() {
    let output = "\
test_add (admin_views.tests.AdminViewTest) ... ok
test_delete (admin_views.tests.AdminViewTest) ... FAIL
";
    let parsed = parser_for("django/django").parse(
        &run(Some(1), output),
        &expected(
            &["test_add (admin_views.tests.AdminViewTest)"],
            &["test_delete (admin_views.tests.AdminViewTest)"],
        ),
    );
    assert_eq!(parsed.matcher.as_deref(), Some("django"));
    assert_eq!(parsed.status, VerdictStatus::Fail);
    assert_eq!(
        parsed.tests["test_delete (admin_views.tests.AdminViewTest)"],
        TestStatus::Failed
    );
}

#[test]
fn test_sympy_profile_parses_runner_output() {
    let output = "\
test_simplify ok
test_expand F
";
    let parsed = parser_for("sympy/sympy").parse(&run(Some(1), output), &expected(&["test_simplify"], &[]));
    assert_eq!(parsed.matcher.as_deref(), Some("sympy"));
    assert_eq!(parsed.status, VerdictStatus::Pass);
    assert_eq!(parsed.tests["test_expand"], TestStatus::Failed);
}

#[test]
fn test_custom_rules_take_precedence() {
    let profile = RepoProfile {
        repo: "owner/custom".to_string(),
        matcher: Some(MatcherKind::Generic),
        rules: vec![
            RegexRule {
                pattern: r"^OK: (?P<test>\S+)$".to_string(),
                status: TestStatus::Passed,
            },
            RegexRule {
                pattern: r"^BAD: (?P<test>\S+)$".to_string(),
                status: TestStatus::Failed,
            },
        ],
        ..Default::default()
    };
    let parser = ResultParser::for_profile(&profile).unwrap();
    let parsed = parser.parse(
        &run(Some(0), "OK: check_one\nBAD: check_two\ncheck_two PASSED\n"),
        &expected(&["check_one"], &["check_two"]),
    );
    assert_eq!(parsed.matcher.as_deref(), Some("regex"));
    assert_eq!(parsed.status, VerdictStatus::Fail);
}

#[test]
fn test_invalid_rule_is_rejected() {
    let profile = RepoProfile {
        repo: "owner/custom".to_string(),
        rules: vec![RegexRule {
            pattern: "(".to_string(),
            status: TestStatus::Passed,
        }],
        ..Default::default()
    };
    assert!(ResultParser::for_profile(&profile).is_err());
}

#[test]
fn test_timeout_wins_over_markers() {
    let mut result = run(None, "test_foo PASSED\n");
    result.timed_out = true;
    let parsed = parser_for("owner/repo").parse(&result, &expected(&["test_foo"], &[]));
    assert_eq!(parsed.status, VerdictStatus::Timeout);
    assert_eq!(parsed.tests["test_foo"], TestStatus::Passed);
}

#[test]
fn test_parametrized_id_with_space_passes() {
    let output = "PASSED tests/test_a.py::test_ok\nPASSED tests/test_a.py::test_p[a b]\n";
    let parsed = parser_for("owner/repo").parse(&run(Some(0), output), &expected(&["tests/test_a.py::test_p[a b]"], &[]));
    assert_eq!(parsed.status, VerdictStatus::Pass);
    assert_eq!(parsed.tests["tests/test_a.py::test_p[a b]"], TestStatus::Passed);
}

#[test]
fn test_permission_error_in_test_output_is_fail() {
    let parsed = parser_for("owner/repo").parse(
        &run(Some(1), "PermissionError: [Errno 13] Permission denied: '/tmp/x'\n"),
        &expected(&["test_foo"], &[]),
    );
    assert_eq!(parsed.status, VerdictStatus::Fail);
    assert_eq!(parsed.matcher.as_deref(), Some("exit_code"));
}
