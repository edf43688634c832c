//! Git plumbing for Environment checkouts.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// A git invocation that could not run or exited non-zero.
#[derive(Debug, Clone, thiserror::Error)]
#[error("git {args} failed: {stderr}")]
pub struct GitError {
    pub args: String,
    pub stderr: String,
}

/// Run `git <args>` in `dir` and return its trimmed stdout.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    debug!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| GitError {
            args: args.join(" "),
            stderr: format!("failed to run git: {e}"),
        })?;

    if !output.status.success() {
        return Err(GitError {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Clone `source` (URL or local path) into `dest` and detach at `commit`.
///
/// When the commit is not reachable from the cloned refs it is fetched
/// explicitly before checking out.
pub async fn clone_at_commit(source: &str, dest: &Path, commit: &str) -> Result<(), GitError> {
    let parent = dest.parent().unwrap_or(dest);
    let dest_str = dest.to_string_lossy().to_string();
    run_git(parent, &["clone", "--quiet", "--no-checkout", source, &dest_str]).await?;

    let checkout = ["-c", "advice.detachedHead=false", "checkout", "--quiet", "--detach", commit];
    if run_git(dest, &checkout).await.is_err() {
        run_git(dest, &["fetch", "--quiet", "origin", commit]).await?;
        run_git(dest, &checkout).await?;
    }
    Ok(())
}

/// Capture the HEAD commit SHA of the repository at `repo_dir`.
pub async fn capture_head_sha(repo_dir: &Path) -> Result<String, GitError> {
    let sha = run_git(repo_dir, &["rev-parse", "HEAD"]).await?;
    if sha.is_empty() {
        return Err(GitError {
            args: "rev-parse HEAD".to_string(),
            stderr: "empty output".to_string(),
        });
    }
    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    std::process::Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path(), &["init", "--quiet"]);
        run(dir.path(), &["config", "user.name", "test-user"]);
        run(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "--quiet", "-m", "first"]);
        dir
    }

    #[tokio::test]
    async fn clone_checks_out_requested_commit() {
        let origin = make_git_repo();
        let first = capture_head_sha(origin.path()).await.unwrap();
        std::fs::write(origin.path().join("a.txt"), "two\n").unwrap();
        run(origin.path(), &["commit", "--quiet", "-am", "second"]);

        let work = tempfile::tempdir().unwrap();
        let dest = work.path().join("repo");
        clone_at_commit(&origin.path().to_string_lossy(), &dest, &first)
            .await
            .unwrap();

        assert_eq!(capture_head_sha(&dest).await.unwrap(), first);
        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "one\n");
    }

    #[tokio::test]
    async fn clone_unknown_commit_fails() {
        let origin = make_git_repo();
        let work = tempfile::tempdir().unwrap();
        let result = clone_at_commit(
            &origin.path().to_string_lossy(),
            &work.path().join("repo"),
            "0000000000000000000000000000000000000000",
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).await.is_err());
        assert!(!is_git_repo(dir.path()));
    }
}
