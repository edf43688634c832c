//! Recipe steps: shell commands and git operations under a per-step
//! timeout, cancellation, and one retry for transient failures.

use std::collections::BTreeSet;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{classify_failure, BuildError, BuildErrorKind};
use crate::config::BuildConfig;
use crate::domain::LayerKind;

/// Lines of command output kept in a step's error message.
const ERROR_TAIL_LINES: usize = 20;

/// Executes the steps of one layer recipe.
#[derive(Debug, Clone)]
pub struct StepRunner {
    stage: LayerKind,
    timeout: Duration,
    retries: u32,
    backoff_base: Duration,
    cancel: CancellationToken,
    log: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl StepRunner {
    pub fn new(stage: LayerKind, config: &BuildConfig, cancel: CancellationToken) -> Self {
        Self {
            stage,
            timeout: config.step_timeout(),
            retries: config.transient_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            cancel,
            log: None,
            env: Vec::new(),
        }
    }

    /// Append every command and its output to `path`.
    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log = Some(path);
        self
    }

    /// Extra environment for every shell step.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stage(&self) -> LayerKind {
        self.stage
    }

    pub fn error(&self, step: &str, kind: BuildErrorKind, message: impl Into<String>) -> BuildError {
        BuildError::new(self.stage, step, kind, message)
    }

    pub fn io_error(&self, step: &str, err: &std::io::Error) -> BuildError {
        BuildError::io(self.stage, step, err)
    }

    /// Run `op` under the step timeout and cancellation token, retrying
    /// transient failures with exponential backoff.
    pub async fn step<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T, BuildError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BuildError>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(BuildError::cancelled(self.stage, step));
            }
            let outcome = tokio::select! {
                result = tokio::time::timeout(self.timeout, op()) => match result {
                    Ok(r) => r,
                    Err(_) => Err(self.error(
                        step,
                        BuildErrorKind::Timeout,
                        format!("step exceeded {}s", self.timeout.as_secs()),
                    )),
                },
                _ = self.cancel.cancelled() => Err(BuildError::cancelled(self.stage, step)),
            };

            match outcome {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff_base * 2u32.pow(attempt - 1);
                    warn!(
                        "[{}] {} failed transiently (attempt {}), retrying in {:?}: {}",
                        self.stage, step, attempt, delay, e.message
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(BuildError::cancelled(self.stage, step));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Run `command` with `sh -c` in `dir`; returns its combined output.
    pub async fn shell(&self, step: &str, dir: &Path, command: &str) -> Result<String, BuildError> {
        self.step(step, || self.shell_once(step, dir, command)).await
    }

    async fn shell_once(&self, step: &str, dir: &Path, command: &str) -> Result<String, BuildError> {
        debug!("[{}] {}: {}", self.stage, step, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.io_error(step, &e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        self.append_log(command, &combined);

        if output.status.success() {
            return Ok(combined);
        }
        let kind = classify_failure(&combined);
        Err(self.error(
            step,
            kind,
            format!("`{}` exited with {}: {}", command, output.status, tail(&combined)),
        ))
    }

    fn append_log(&self, command: &str, output: &str) {
        let Some(path) = &self.log else {
            return;
        };
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "$ {command}\n{output}"));
        if let Err(e) = written {
            warn!("Could not append to build log {}: {}", path.display(), e);
        }
    }
}

/// Last lines of `output`, for error messages.
pub fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Regular files under `dir`, paired with whether they sit in a `bin/`
/// directory.
fn walk_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, bool)>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let in_bin = current.file_name().is_some_and(|n| n == "bin");
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push((entry.path(), in_bin));
            }
        }
    }
    Ok(files)
}

/// `.pth` and `.egg-link` files and setuptools' `__editable__*_finder.py`
/// modules: the files an editable install records source paths in.
fn is_editable_record(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".pth")
        || name.ends_with(".egg-link")
        || (name.starts_with("__editable__") && name.ends_with(".py"))
}

/// Rewrite absolute `from` prefixes to `to` in the files of `dir` that bake
/// in their install location: scripts under `bin/` directories, `.cfg`
/// files and editable-install records. Returns the number of rewritten
/// files.
pub fn relocate_prefix(dir: &Path, from: &Path, to: &Path) -> std::io::Result<usize> {
    let from = from.to_string_lossy().to_string();
    let to = to.to_string_lossy().to_string();
    let mut rewritten = 0;

    for (path, in_bin) in walk_files(dir)? {
        let relocatable =
            in_bin || is_editable_record(&path) || path.extension().is_some_and(|ext| ext == "cfg");
        if !relocatable {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        if content.contains(&from) {
            std::fs::write(&path, content.replace(&from, &to))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

static QUOTED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"](/[^'"]+)['"]"#).expect("valid regex"));

/// Source directories inside `repo` that editable installs under `deps`
/// put on `sys.path`, relative to `repo` (`src`, `lib`, or empty for the
/// root itself).
///
/// `.pth` and `.egg-link` lines name the directory directly. Finder modules
/// map package names to package directories or module files, so the parent
/// of each mapped path is taken.
pub fn editable_source_roots(deps: &Path, repo: &Path) -> std::io::Result<BTreeSet<PathBuf>> {
    let mut roots = BTreeSet::new();
    if !deps.is_dir() {
        return Ok(roots);
    }
    for (path, _) in walk_files(deps)? {
        if !is_editable_record(&path) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let is_finder = path.extension().is_some_and(|ext| ext == "py");
        let candidates: Vec<PathBuf> = if is_finder {
            QUOTED_PATH
                .captures_iter(&content)
                .filter_map(|caps| Path::new(&caps[1]).parent().map(Path::to_path_buf))
                .collect()
        } else {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.starts_with("import ") && !line.starts_with('#'))
                .map(PathBuf::from)
                .collect()
        };
        for candidate in candidates {
            if let Ok(relative) = candidate.strip_prefix(repo) {
                roots.insert(relative.to_path_buf());
            }
        }
    }
    Ok(roots)
}
