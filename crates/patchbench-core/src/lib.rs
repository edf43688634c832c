//! Patchbench Core Library
//!
//! Layered build cache, patch application, sandboxed test execution and
//! result parsing for evaluating patches against real repositories.

pub mod builder;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod git;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod parser;
pub mod patch;
pub mod profile;
pub mod reporting;
pub mod sandbox;
pub mod telemetry;

pub use builder::{BuildError, BuildErrorKind, InstanceLayer, LayerBuilder};
pub use cache::{CacheError, CachePolicy, Layer, LayerCache, LayerLease, LayerStatus};
pub use config::{ConfigError, PatchbenchConfig};
pub use dataset::{DataPointLoader, Prediction, PredictionFormatter};
pub use domain::{
    DataPointDescriptor, EvaluationStage, LayerIdentity, LayerKey, LayerKind, TestStatus, Verdict,
    VerdictStatus,
};
pub use git::{capture_head_sha, is_git_repo};
pub use metrics::METRICS;
pub use orchestrator::Orchestrator;
pub use parser::{MatcherStrategy, ParsedResult, ResultParser};
pub use patch::{PatchApplicator, PatchError, PatchOutcome};
pub use profile::{ProfileRegistry, RepoProfile};
pub use reporting::{write_instance_report, RunLog, RunSummary};
pub use sandbox::{ExecutionResult, RunRequest, SandboxBackend, SandboxError, SandboxRunner};
