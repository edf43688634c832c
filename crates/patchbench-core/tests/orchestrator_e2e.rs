//! End-to-end evaluations against a local git repository with the local
//! sandbox backend.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use patchbench_core::cache::{CachePolicy, LayerCache};
use patchbench_core::config::{BaseConfig, PatchbenchConfig};
use patchbench_core::domain::{DataPointDescriptor, EvaluationStage, LayerKind, VerdictStatus};
use patchbench_core::orchestrator::Orchestrator;
use patchbench_core::profile::{MatcherKind, RepoProfile, TestSelection};
use patchbench_core::reporting::read_instance_report;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHECKS: &str = "\
if grep -q fixed app.txt; then
  echo 'test_foo PASSED'
  exit 0
fi
echo 'test_foo FAILED'
exit 1
";

const FIX: &str = "\
diff --git a/app.txt b/app.txt
--- a/app.txt
+++ b/app.txt
@@ -1 +1 @@
-broken
+fixed
";

const STALE: &str = "\
diff --git a/app.txt b/app.txt
--- a/app.txt
+++ b/app.txt
@@ -1 +1 @@
-something else entirely
+fixed
";

const FIX_SRC: &str = "\
diff --git a/src/pkg/__init__.py b/src/pkg/__init__.py
--- a/src/pkg/__init__.py
+++ b/src/pkg/__init__.py
@@ -1 +1 @@
-VALUE = 'broken'
+VALUE = 'fixed'
";

// What `pip install -e .` leaves behind for a src-layout project.
const EDITABLE_INSTALL: [&str; 2] = [
    "python3 -m venv --without-pip \"$PATCHBENCH_DEPS\"",
    "echo \"$(pwd)/src\" > \"$(ls -d \"$PATCHBENCH_DEPS\"/lib/python3*/site-packages)/__editable__.pkg-0.1.pth\"",
];

const IMPORT_CHECK: &str = "python -c \"import pkg, sys; print(pkg.__file__); \
sys.exit(0 if pkg.VALUE == 'fixed' else 1)\" && echo 'test_foo PASSED' || echo 'test_foo FAILED'";

fn has_python_venv() -> bool {
    Command::new("python3")
        .args(["-m", "venv", "--help"])
        .output()
        .is_ok_and(|o| o.status.success())
}

// Touches an unrelated file, so the check still sees `broken`.
const NOOP: &str = "\
diff --git a/notes.txt b/notes.txt
new file mode 100644
--- /dev/null
+++ b/notes.txt
@@ -0,0 +1 @@
+hello
";

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Fixture {
    origin: TempDir,
    work: TempDir,
    commit: String,
}

impl Fixture {
    fn new() -> Self {
        let origin = tempfile::tempdir().unwrap();
        git(origin.path(), &["init", "--quiet"]);
        git(origin.path(), &["config", "user.name", "test-user"]);
        git(origin.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(origin.path().join("app.txt"), "broken\n").unwrap();
        std::fs::write(origin.path().join("run_checks.sh"), CHECKS).unwrap();
        std::fs::create_dir_all(origin.path().join("src/pkg")).unwrap();
        std::fs::write(origin.path().join("src/pkg/__init__.py"), "VALUE = 'broken'\n").unwrap();
        git(origin.path(), &["add", "."]);
        git(origin.path(), &["commit", "--quiet", "-m", "init"]);
        let commit = git(origin.path(), &["rev-parse", "HEAD"]);
        Self {
            origin,
            work: tempfile::tempdir().unwrap(),
            commit,
        }
    }

    fn profile(&self, repo: &str, test_command: &str) -> RepoProfile {
        RepoProfile {
            repo: repo.to_string(),
            test_command: Some(test_command.to_string()),
            install: Some(Vec::new()),
            matcher: Some(MatcherKind::Generic),
            source_url: Some(self.origin.path().to_string_lossy().to_string()),
            selection: TestSelection::None,
            ..Default::default()
        }
    }

    fn config(&self) -> PatchbenchConfig {
        let mut config = PatchbenchConfig::default();
        config.run.log_dir = self.work.path().join("logs");
        config.cache.root = self.work.path().join("cache");
        config.build.step_timeout_secs = 120;
        config.build.backoff_base_ms = 10;
        config.base = BaseConfig {
            tools: vec!["git".to_string()],
            setup: Vec::new(),
        };
        config.sandbox.drain_grace_ms = 200;
        config.repos = vec![
            self.profile("local/demo", "sh run_checks.sh"),
            self.profile("local/slow", "echo 'test_foo started'; sleep 30"),
            self.profile("local/crash", "echo 'Segmentation fault'; exit 2"),
            RepoProfile {
                install: Some(EDITABLE_INSTALL.iter().map(|c| c.to_string()).collect()),
                ..self.profile("local/srcpkg", IMPORT_CHECK)
            },
        ];
        config
    }

    fn orchestrator(&self) -> Orchestrator {
        let config = self.config();
        let cache = LayerCache::open(&config.cache.root, CachePolicy::from(&config.cache)).unwrap();
        Orchestrator::new(&config, cache, "e2e")
    }

    fn descriptor(&self, id: &str, repo: &str, patch: &str) -> DataPointDescriptor {
        serde_json::from_value(serde_json::json!({
            "instance_id": id,
            "repo": repo,
            "base_commit": self.commit,
            "patch": patch,
            "FAIL_TO_PASS": ["test_foo"],
            "PASS_TO_PASS": [],
        }))
        .unwrap()
    }
}

fn instances_left(orchestrator: &Orchestrator) -> usize {
    std::fs::read_dir(orchestrator.cache().instances_dir())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_clean_patch_passes() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let descriptor = fixture.descriptor("local__demo-1", "local/demo", FIX);

    let (verdict, stages) = orchestrator
        .evaluate_tracked(&descriptor, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, VerdictStatus::Pass, "{:?}", verdict.error);
    assert_eq!(verdict.tests_status.fail_to_pass.success, vec!["test_foo"]);
    assert!(stages.contains(&EvaluationStage::Running));
    assert!(stages.contains(&EvaluationStage::Parsing));
    assert_eq!(stages.last(), Some(&EvaluationStage::Finished(VerdictStatus::Pass)));

    assert!(verdict.log_path.ends_with("e2e/local__demo-1/run_instance.log"));
    let log = std::fs::read_to_string(&verdict.log_path).unwrap();
    assert!(log.contains("test_foo PASSED"));
    let report = read_instance_report(&verdict.log_path.with_file_name("report.json")).unwrap();
    assert!(report["local__demo-1"].resolved);

    assert_eq!(instances_left(&orchestrator), 0);
    assert_eq!(orchestrator.cache().len(), 2);
}

#[tokio::test]
async fn test_unpatched_tree_fails() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let verdict = orchestrator
        .evaluate(&fixture.descriptor("local__demo-2", "local/demo", NOOP), &CancellationToken::new())
        .await;
    assert_eq!(verdict.status, VerdictStatus::Fail);
    assert_eq!(verdict.tests_status.fail_to_pass.failure, vec!["test_foo"]);
}

#[tokio::test]
async fn test_non_applying_hunk_is_patch_conflict() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let descriptor = fixture.descriptor("local__demo-3", "local/demo", STALE);

    let (verdict, stages) = orchestrator
        .evaluate_tracked(&descriptor, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, VerdictStatus::PatchConflict);
    assert!(verdict.error.is_some());
    assert!(stages.contains(&EvaluationStage::ApplyingPatch));
    assert!(!stages.contains(&EvaluationStage::Running));
    assert!(!stages.contains(&EvaluationStage::Parsing));
    assert_eq!(instances_left(&orchestrator), 0);
}

#[tokio::test]
async fn test_hanging_command_times_out() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let mut descriptor = fixture.descriptor("local__slow-1", "local/slow", FIX);
    descriptor.timeout_secs = Some(5);

    // Warm the layers so the measured run is only the sandbox.
    let mut warm = fixture.descriptor("local__slow-0", "local/slow", FIX);
    warm.timeout_secs = Some(1);
    orchestrator.evaluate(&warm, &CancellationToken::new()).await;

    let started = Instant::now();
    let verdict = orchestrator.evaluate(&descriptor, &CancellationToken::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(verdict.status, VerdictStatus::Timeout);
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    let log = std::fs::read_to_string(&verdict.log_path).unwrap();
    assert!(log.contains("test_foo started"));
    assert_eq!(instances_left(&orchestrator), 0);
}

#[tokio::test]
async fn test_no_markers_nonzero_exit_fails() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let verdict = orchestrator
        .evaluate(&fixture.descriptor("local__crash-1", "local/crash", FIX), &CancellationToken::new())
        .await;
    assert_eq!(verdict.status, VerdictStatus::Fail);
    assert_eq!(verdict.matcher.as_deref(), Some("exit_code"));
}

#[tokio::test]
async fn test_concurrent_evaluations_share_layers() {
    let fixture = Fixture::new();
    let orchestrator = Arc::new(fixture.orchestrator());
    let cancel = CancellationToken::new();

    let a = fixture.descriptor("local__demo-10", "local/demo", FIX);
    let b = fixture.descriptor("local__demo-11", "local/demo", FIX);
    let (va, vb) = tokio::join!(orchestrator.evaluate(&a, &cancel), orchestrator.evaluate(&b, &cancel));

    assert_eq!(va.status, VerdictStatus::Pass);
    assert_eq!(vb.status, VerdictStatus::Pass);
    assert_eq!(orchestrator.cache().len(), 2);
}

#[tokio::test]
async fn test_cancelled_evaluation_is_error_and_cleans_up() {
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let verdict = orchestrator
        .evaluate(&fixture.descriptor("local__demo-20", "local/demo", FIX), &cancel)
        .await;
    assert_eq!(verdict.status, VerdictStatus::Error);
    assert_eq!(instances_left(&orchestrator), 0);
}

#[tokio::test]
async fn test_src_layout_editable_install_imports_patched_tree() {
    if !has_python_venv() {
        eprintln!("python3 venv unavailable; skipping");
        return;
    }
    let fixture = Fixture::new();
    let orchestrator = fixture.orchestrator();
    let verdict = orchestrator
        .evaluate(&fixture.descriptor("local__srcpkg-1", "local/srcpkg", FIX_SRC), &CancellationToken::new())
        .await;

    let log = std::fs::read_to_string(&verdict.log_path).unwrap();
    assert_eq!(verdict.status, VerdictStatus::Pass, "{log}");
    assert!(log.contains(".instances"), "{log}");

    // The shared Environment tree is untouched.
    let environment = orchestrator
        .cache()
        .list()
        .into_iter()
        .find(|layer| layer.key.kind == LayerKind::Environment)
        .unwrap();
    let shared = std::fs::read_to_string(environment.path.join("repo/src/pkg/__init__.py")).unwrap();
    assert_eq!(shared, "VALUE = 'broken'\n");
}

#[tokio::test]
async fn test_rebuilt_environment_is_reproducible() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.cache.max_layers = 0;
    let cache = LayerCache::open(&config.cache.root, CachePolicy::from(&config.cache)).unwrap();
    let orchestrator = Orchestrator::new(&config, cache, "repro");

    let mut builds = Vec::new();
    for round in 0..2 {
        let descriptor = fixture.descriptor(&format!("local__demo-{}", 30 + round), "local/demo", NOOP);
        let verdict = orchestrator.evaluate(&descriptor, &CancellationToken::new()).await;
        assert_eq!(verdict.status, VerdictStatus::Fail);

        let environment = orchestrator
            .cache()
            .list()
            .into_iter()
            .find(|layer| layer.key.kind == LayerKind::Environment)
            .unwrap();
        let env_record = std::fs::read_to_string(environment.path.join("env.json")).unwrap();
        let head = git(&environment.path.join("repo"), &["rev-parse", "HEAD"]);
        let log = std::fs::read_to_string(&verdict.log_path).unwrap();
        let test_output: Vec<String> = log
            .lines()
            .skip_while(|line| *line != ">>>>> test output")
            .skip(1)
            .take_while(|line| *line != "<<<<< test output")
            .map(str::to_string)
            .collect();
        builds.push((environment.key, env_record, head, test_output, verdict.tests_status));

        // Nothing is leased between evaluations, so everything goes.
        let evicted = orchestrator.cache().evict().await.unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(orchestrator.cache().is_empty());
    }

    assert_eq!(builds[0], builds[1]);
    assert_eq!(builds[0].2, fixture.commit);
    assert!(!builds[0].3.is_empty());
}
