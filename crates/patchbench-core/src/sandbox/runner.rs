//! Sandbox runner: one command, one isolated context, one hard deadline.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{DockerBackend, LocalBackend, RunRequest, SandboxBackend};
use super::error::{SandboxError, SandboxResult};
use super::execution::{with_setup_retries, CircuitBreaker, RetryPolicy};
use crate::config::{BackendKind, SandboxSettings};
use crate::metrics::METRICS;

/// Outcome of a single sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Absent when the process was killed
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, up to the capture limit
    pub output: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecutionResult {
    /// The command ran to completion and exited 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Bounded buffer shared by the stdout and stderr drains.
///
/// Bytes past `limit` are read and discarded so the child never blocks on a
/// full pipe.
#[derive(Debug)]
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }

    fn truncated(&self) -> bool {
        self.dropped > 0
    }
}

fn lock(capture: &Mutex<Capture>) -> std::sync::MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_drain<R>(reader: Option<R>, capture: Arc<Mutex<Capture>>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => lock(&capture).push(&chunk[..n]),
            }
        }
    }))
}

enum Finish {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Runs commands through a [`SandboxBackend`] with timeout, output capture,
/// setup retries and a circuit breaker over consecutive setup failures.
pub struct SandboxRunner {
    backend: Arc<dyn SandboxBackend>,
    capture_limit: usize,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    drain_grace: Duration,
}

impl SandboxRunner {
    pub fn new(backend: Arc<dyn SandboxBackend>, capture_limit: usize) -> Self {
        Self {
            backend,
            capture_limit,
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::new(5),
            drain_grace: Duration::from_secs(2),
        }
    }

    pub fn from_settings(settings: &SandboxSettings, capture_limit: usize) -> Self {
        let backend: Arc<dyn SandboxBackend> = match settings.backend {
            BackendKind::Local => Arc::new(LocalBackend::new()),
            BackendKind::Docker => Arc::new(DockerBackend::new(settings.image.clone())),
        };
        Self {
            backend,
            capture_limit,
            retry: RetryPolicy {
                max_retries: settings.setup_retries,
                ..RetryPolicy::default()
            },
            breaker: CircuitBreaker::new(settings.breaker_threshold),
            drain_grace: Duration::from_millis(settings.drain_grace_ms),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker = CircuitBreaker::new(threshold);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run `request` under a hard wall-clock `timeout`.
    ///
    /// The sandbox is torn down on every path before this returns. A timed
    /// out or cancelled run still returns the output captured so far. Setup
    /// failures are retried per the retry policy; `Err` means no usable run.
    pub async fn run(
        &self,
        request: &RunRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SandboxResult<ExecutionResult> {
        with_setup_retries(&self.retry, &self.breaker, move || {
            self.run_once(request, timeout, cancel)
        })
        .await
    }

    async fn run_once(
        &self,
        request: &RunRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SandboxResult<ExecutionResult> {
        if cancel.is_cancelled() {
            return Ok(ExecutionResult {
                exit_code: None,
                output: String::new(),
                duration_ms: 0,
                truncated: false,
                timed_out: false,
                cancelled: true,
            });
        }

        let started = Instant::now();
        let mut handle = self.backend.launch(request).await?;
        METRICS.inc_sandbox_launches();
        debug!("Running in {}: {}", handle.id, request.command);

        let capture = Arc::new(Mutex::new(Capture::new(self.capture_limit)));
        let drains: Vec<JoinHandle<()>> = [
            spawn_drain(handle.child.stdout.take(), Arc::clone(&capture)),
            spawn_drain(handle.child.stderr.take(), Arc::clone(&capture)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let finish = tokio::select! {
            status = handle.child.wait() => Finish::Exited(status.ok().and_then(|s| s.code())),
            _ = tokio::time::sleep(timeout) => Finish::TimedOut,
            _ = cancel.cancelled() => Finish::Cancelled,
        };
        self.backend.teardown(&mut handle).await;

        for mut drain in drains {
            if tokio::time::timeout(self.drain_grace, &mut drain).await.is_err() {
                warn!("Output drain for {} did not finish; aborting", handle.id);
                drain.abort();
            }
        }

        let (output, truncated) = {
            let capture = lock(&capture);
            (
                String::from_utf8_lossy(&capture.buf).into_owned(),
                capture.truncated(),
            )
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (exit_code, timed_out, cancelled) = match finish {
            Finish::Exited(code) => (code, false, false),
            Finish::TimedOut => {
                METRICS.inc_timeouts();
                warn!("Command in {} timed out after {:?}", handle.id, timeout);
                (None, true, false)
            }
            Finish::Cancelled => {
                info!("Command in {} cancelled", handle.id);
                (None, false, true)
            }
        };

        if !timed_out && !cancelled && self.backend.is_setup_failure(exit_code, &output) {
            return Err(SandboxError::setup(format!(
                "{} backend failed to start the command: {}",
                self.backend.name(),
                output.lines().last().unwrap_or_default()
            )));
        }

        Ok(ExecutionResult {
            exit_code,
            output,
            duration_ms,
            truncated,
            timed_out,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_prefix_and_counts_dropped() {
        let mut capture = Capture::new(4);
        capture.push(b"ab");
        capture.push(b"cdef");
        capture.push(b"gh");
        assert_eq!(capture.buf, b"abcd");
        assert_eq!(capture.dropped, 4);
        assert!(capture.truncated());
    }

    #[test]
    fn capture_at_exact_limit_is_not_truncated() {
        let mut capture = Capture::new(3);
        capture.push(b"abc");
        assert!(!capture.truncated());
    }

    #[test]
    fn succeeded_requires_clean_exit() {
        let mut result = ExecutionResult {
            exit_code: Some(0),
            output: String::new(),
            duration_ms: 1,
            truncated: false,
            timed_out: false,
            cancelled: false,
        };
        assert!(result.succeeded());
        result.exit_code = Some(1);
        assert!(!result.succeeded());
    }
}
