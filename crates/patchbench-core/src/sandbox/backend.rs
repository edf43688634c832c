//! Isolation backends.
//!
//! A backend turns a [`RunRequest`] into a running, isolated process and
//! tears it down again. The runner owns timeouts and output capture.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::{SandboxError, SandboxResult};

/// What to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Instance layer directory; the only host path the sandbox needs
    pub root: PathBuf,
    /// Working directory (inside `root`)
    pub workdir: PathBuf,
    /// Shell command line
    pub command: String,
    /// Extra environment on top of the sandbox baseline
    pub env: Vec<(String, String)>,
    /// Parent layer directories the command reads but must not modify
    pub read_only: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            workdir: root.clone(),
            root,
            command: command.into(),
            env: Vec::new(),
            read_only: Vec::new(),
        }
    }
}

/// Live isolated context bound to one Instance layer.
///
/// Destroyed by [`SandboxBackend::teardown`] before the runner returns.
pub struct SandboxHandle {
    pub id: String,
    pub child: Child,
    /// Pid at launch; still valid for group kills after the child is reaped
    pid: Option<u32>,
    /// Private HOME/TMPDIR; removed on drop
    scratch: Option<TempDir>,
}

impl SandboxHandle {
    pub fn new(id: String, child: Child, scratch: Option<TempDir>) -> Self {
        let pid = child.id();
        Self {
            id,
            child,
            pid,
            scratch,
        }
    }

    fn scratch_dir(&self) -> Option<&std::path::Path> {
        self.scratch.as_ref().map(|s| s.path())
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("scratch", &self.scratch_dir())
            .finish()
    }
}

/// Trait for isolation backends.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start `request` in a fresh isolated context with piped stdout/stderr.
    async fn launch(&self, request: &RunRequest) -> SandboxResult<SandboxHandle>;

    /// Destroy the context: kill everything it started and release its
    /// resources. Must be safe to call after the process has exited.
    async fn teardown(&self, handle: &mut SandboxHandle);

    /// Whether a finished run actually failed to set up the sandbox.
    fn is_setup_failure(&self, _exit_code: Option<i32>, _output: &str) -> bool {
        false
    }
}

fn base_env(home: &str, tmp: &str) -> Vec<(String, String)> {
    vec![
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        ),
        ("HOME".to_string(), home.to_string()),
        ("TMPDIR".to_string(), tmp.to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        ("LC_ALL".to_string(), "C.UTF-8".to_string()),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("PYTHONHASHSEED".to_string(), "0".to_string()),
    ]
}

/// Host-process backend: cleared environment, private HOME/TMPDIR and its
/// own process group, so teardown reaches every descendant.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, request: &RunRequest) -> SandboxResult<SandboxHandle> {
        if !request.workdir.is_dir() {
            return Err(SandboxError::setup(format!(
                "working directory missing: {}",
                request.workdir.display()
            )));
        }
        let scratch = tempfile::Builder::new()
            .prefix("patchbench-sandbox-")
            .tempdir()
            .map_err(|e| SandboxError::setup(format!("scratch dir: {e}")))?;
        let home = scratch.path().join("home");
        let tmp = scratch.path().join("tmp");
        for dir in [&home, &tmp] {
            std::fs::create_dir_all(dir)
                .map_err(|e| SandboxError::setup(format!("scratch dir: {e}")))?;
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir)
            .env_clear()
            .envs(base_env(&home.to_string_lossy(), &tmp.to_string_lossy()))
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::setup(format!("spawn sh: {e}")))?;
        let id = format!("local-{}", child.id().unwrap_or(0));
        debug!("Launched {} in {}", id, request.workdir.display());
        Ok(SandboxHandle::new(id, child, Some(scratch)))
    }

    async fn teardown(&self, handle: &mut SandboxHandle) {
        #[cfg(unix)]
        if let Some(pid) = handle.pid {
            // Negative pid addresses the whole process group, including
            // background children left behind by a finished command.
            let _ = Command::new("kill")
                .args(["-KILL", "--"])
                .arg(format!("-{pid}"))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        let _ = handle.child.start_kill();
        let _ = handle.child.wait().await;
        handle.scratch.take();
        debug!("Tore down {}", handle.id);
    }
}

/// Docker backend: one throwaway container per run with networking disabled.
///
/// The instance layer is bind-mounted at its host path so that paths baked
/// into the layer (virtualenvs, scripts) stay valid inside the container.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    image: String,
}

impl DockerBackend {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    fn container_name() -> String {
        format!("patchbench-{}", uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, request: &RunRequest) -> SandboxResult<SandboxHandle> {
        let name = Self::container_name();
        let root = request.root.to_string_lossy().to_string();
        let workdir = request.workdir.to_string_lossy().to_string();

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--network=none"])
            .args(["--name", name.as_str()])
            .args(["-v", format!("{root}:{root}").as_str()]);
        for dir in &request.read_only {
            let dir = dir.to_string_lossy();
            cmd.arg("-v").arg(format!("{dir}:{dir}:ro"));
        }
        cmd.args(["-w", workdir.as_str()])
            .args(["-e", "HOME=/tmp", "-e", "LANG=C.UTF-8", "-e", "PYTHONDONTWRITEBYTECODE=1"]);
        for (k, v) in &request.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(&self.image)
            .args(["sh", "-c", request.command.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::setup(format!("spawn docker: {e}")))?;
        debug!("Launched container {}", name);
        Ok(SandboxHandle::new(name, child, None))
    }

    async fn teardown(&self, handle: &mut SandboxHandle) {
        let removed = Command::new("docker")
            .args(["rm", "-f", handle.id.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = removed {
            warn!("docker rm -f {} failed: {}", handle.id, e);
        }
        let _ = handle.child.start_kill();
        let _ = handle.child.wait().await;
    }

    /// `docker run` exits 125 when the daemon could not start the container.
    fn is_setup_failure(&self, exit_code: Option<i32>, output: &str) -> bool {
        exit_code == Some(125) && output.contains("docker")
    }
}
