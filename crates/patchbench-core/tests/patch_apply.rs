//! Patch application against real git trees.

use std::path::Path;
use std::process::Command;

use patchbench_core::patch::{PatchApplicator, PatchOutcome};

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["config", "user.name", "test-user"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    std::fs::write(dir.path().join("a.py"), "x = 1\ny = 2\n").unwrap();
    std::fs::write(dir.path().join("b.py"), "z = 3\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "--quiet", "-m", "init"]);
    dir
}

const CLEAN: &str = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1,2 +1,2 @@
-x = 1
+x = 10
 y = 2
";

/// First hunk applies, second does not.
const HALF_BAD: &str = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1,2 +1,2 @@
-x = 1
+x = 10
 y = 2
diff --git a/b.py b/b.py
--- a/b.py
+++ b/b.py
@@ -1 +1 @@
-z = 999
+z = 4
";

#[tokio::test]
async fn test_clean_patch_applies() {
    let dir = repo();
    let outcome = PatchApplicator::new().apply(dir.path(), CLEAN).await.unwrap();
    assert_eq!(
        outcome,
        PatchOutcome::Applied {
            files: vec!["a.py".to_string()]
        }
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
        "x = 10\ny = 2\n"
    );
}

#[tokio::test]
async fn test_conflict_leaves_tree_untouched() {
    let dir = repo();
    let outcome = PatchApplicator::new().apply(dir.path(), HALF_BAD).await.unwrap();
    assert!(!outcome.is_applied());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
        "x = 1\ny = 2\n"
    );
    assert_eq!(std::fs::read_to_string(dir.path().join("b.py")).unwrap(), "z = 3\n");
}

#[tokio::test]
async fn test_applying_twice_conflicts() {
    let dir = repo();
    let applicator = PatchApplicator::new();
    assert!(applicator.apply(dir.path(), CLEAN).await.unwrap().is_applied());
    match applicator.apply(dir.path(), CLEAN).await.unwrap() {
        PatchOutcome::Conflict { reason } => assert!(!reason.is_empty()),
        other => panic!("expected conflict, got {other:?}"),
    }
}
