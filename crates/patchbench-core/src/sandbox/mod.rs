//! Sandbox: isolated, ephemeral execution of a test command.
//!
//! # Modules
//!
//! - [`backend`]: `SandboxBackend` trait with local and docker backends
//! - [`runner`]: `SandboxRunner` (timeout, capture, teardown on every path)
//! - [`execution`]: `RetryPolicy`, `CircuitBreaker`, `with_setup_retries()`
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod backend;
pub mod error;
pub mod execution;
pub mod runner;

pub use backend::{DockerBackend, LocalBackend, RunRequest, SandboxBackend, SandboxHandle};
pub use error::{SandboxError, SandboxResult};
pub use execution::{with_setup_retries, CircuitBreaker, RetryPolicy};
pub use runner::{ExecutionResult, SandboxRunner};
