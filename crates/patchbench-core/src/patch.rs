//! Patch applicator.
//!
//! Applies a unified diff to a checked-out tree with `git apply`: exact
//! context, no fuzz and no three-way fallback. The whole patch is checked
//! before any file is touched, so a conflict leaves the tree unchanged.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::profile::files_in_patch;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to run git apply: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write patch to git apply: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("repository root not found: {0}")]
    MissingRoot(String),
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Every hunk applied; `files` are the touched paths
    Applied { files: Vec<String> },
    /// At least one hunk did not apply; nothing was changed
    Conflict { reason: String },
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied { .. })
    }
}

/// Applies unified diffs to a repository tree.
#[derive(Debug, Clone, Default)]
pub struct PatchApplicator;

impl PatchApplicator {
    pub fn new() -> Self {
        Self
    }

    /// Apply `patch` to the tree at `repo_root`, all-or-nothing.
    pub async fn apply(&self, repo_root: &Path, patch: &str) -> Result<PatchOutcome, PatchError> {
        if !repo_root.is_dir() {
            return Err(PatchError::MissingRoot(repo_root.display().to_string()));
        }
        if patch.trim().is_empty() {
            return Ok(PatchOutcome::Conflict {
                reason: "patch is empty".to_string(),
            });
        }

        let check = git_apply(repo_root, patch, &["--check"]).await?;
        if !check.success {
            debug!("git apply --check rejected patch: {}", check.stderr);
            return Ok(PatchOutcome::Conflict {
                reason: conflict_reason(&check.stderr),
            });
        }

        let applied = git_apply(repo_root, patch, &[]).await?;
        if !applied.success {
            return Ok(PatchOutcome::Conflict {
                reason: conflict_reason(&applied.stderr),
            });
        }

        let files = files_in_patch(patch);
        info!("Applied patch touching {} file(s)", files.len());
        Ok(PatchOutcome::Applied { files })
    }
}

struct ApplyRun {
    success: bool,
    stderr: String,
}

async fn git_apply(repo_root: &Path, patch: &str, extra: &[&str]) -> Result<ApplyRun, PatchError> {
    let mut child = Command::new("git")
        .arg("apply")
        .args(extra)
        .args(["--whitespace=nowarn", "-"])
        .current_dir(repo_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(PatchError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(patch.as_bytes())
            .await
            .map_err(PatchError::Stdin)?;
    }

    let output = child.wait_with_output().await.map_err(PatchError::Spawn)?;
    Ok(ApplyRun {
        success: output.status.success(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn conflict_reason(stderr: &str) -> String {
    if stderr.is_empty() {
        "git apply rejected the patch".to_string()
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_patch_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = PatchApplicator::new().apply(dir.path(), "  \n").await.unwrap();
        assert!(matches!(outcome, PatchOutcome::Conflict { .. }));
    }

    #[tokio::test]
    async fn missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PatchApplicator::new()
            .apply(&dir.path().join("missing"), "diff")
            .await;
        assert!(matches!(result, Err(PatchError::MissingRoot(_))));
    }
}
