//! Orchestrator: drives one data point through the layer stack to a verdict.
//!
//! `evaluate` always returns exactly one terminal [`Verdict`] with a log
//! reference. Failures jump straight to `Finished`:
//! - invalid data point, build failure, sandbox fault, cancellation → `Error`
//! - patch or test patch does not apply → `PatchConflict`
//! - command exceeds its timeout → `Timeout`
//!
//! The Instance layer is removed and the parent leases released before
//! `evaluate` returns, on every path.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::builder::{BuildError, InstanceLayer, LayerBuilder};
use crate::cache::{CacheError, LayerCache};
use crate::config::{PatchbenchConfig, RunConfig};
use crate::domain::{DataPointDescriptor, EvaluationStage, StageTracker, Verdict, VerdictStatus};
use crate::obs::{self, EvaluationSpan};
use crate::parser::{ParsedResult, ResultParser};
use crate::profile::ProfileRegistry;
use crate::reporting::{write_instance_report, RunLog};
use crate::sandbox::SandboxRunner;

/// Evaluates data points against one layer cache.
pub struct Orchestrator {
    run: RunConfig,
    profiles: ProfileRegistry,
    cache: Arc<LayerCache>,
    builder: LayerBuilder,
    runner: Arc<SandboxRunner>,
    run_id: String,
}

impl Orchestrator {
    pub fn new(config: &PatchbenchConfig, cache: Arc<LayerCache>, run_id: impl Into<String>) -> Self {
        Self {
            run: config.run.clone(),
            profiles: ProfileRegistry::with_overrides(&config.repos),
            cache,
            builder: LayerBuilder::new(config.base.clone(), config.build.clone()),
            runner: Arc::new(SandboxRunner::from_settings(
                &config.sandbox,
                config.run.capture_byte_limit,
            )),
            run_id: run_id.into(),
        }
    }

    pub fn with_runner(mut self, runner: SandboxRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cache(&self) -> &Arc<LayerCache> {
        &self.cache
    }

    /// `<log_dir>/<run_id>/<instance_id>`
    pub fn log_dir_for(&self, instance_id: &str) -> PathBuf {
        self.run.log_dir.join(&self.run_id).join(instance_id)
    }

    pub async fn evaluate(&self, descriptor: &DataPointDescriptor, cancel: &CancellationToken) -> Verdict {
        self.evaluate_tracked(descriptor, cancel).await.0
    }

    /// Like [`evaluate`](Self::evaluate), also returning the visited stages.
    pub async fn evaluate_tracked(
        &self,
        descriptor: &DataPointDescriptor,
        cancel: &CancellationToken,
    ) -> (Verdict, Vec<EvaluationStage>) {
        let span = EvaluationSpan::new(&self.run_id, &descriptor.instance_id);
        span.instrument(self.evaluate_inner(descriptor, cancel)).await
    }

    async fn evaluate_inner(
        &self,
        descriptor: &DataPointDescriptor,
        cancel: &CancellationToken,
    ) -> (Verdict, Vec<EvaluationStage>) {
        let golden = descriptor.golden || self.run.golden;
        let log_dir = self.log_dir_for(&descriptor.log_dir_name());
        let mut eval = Evaluation {
            instance_id: descriptor.instance_id.clone(),
            tracker: StageTracker::new(),
            log: RunLog::create(&log_dir),
            log_dir,
            started: Instant::now(),
        };

        obs::emit_evaluation_started(&descriptor.instance_id, &descriptor.repo, golden);
        eval.log.line(format!(
            "instance {} repo {} commit {} golden={}",
            descriptor.instance_id, descriptor.repo, descriptor.base_commit, golden
        ));
        if let Some(commit) = &descriptor.environment_setup_commit {
            eval.log.line(format!("environment_setup_commit {commit}"));
        }
        if let Some(version) = &descriptor.version {
            eval.log.line(format!("version {version}"));
        }

        let outcome = self.drive(&mut eval, descriptor, golden, cancel).await;
        eval.conclude(outcome)
    }

    async fn drive(
        &self,
        eval: &mut Evaluation,
        descriptor: &DataPointDescriptor,
        golden: bool,
        cancel: &CancellationToken,
    ) -> Result<Completed, Early> {
        descriptor
            .validate()
            .map_err(|e| Early::error(format!("invalid data point: {e}")))?;
        let profile = self.profiles.resolve(&descriptor.repo);
        let parser = ResultParser::for_profile(&profile)
            .map_err(|e| Early::error(format!("invalid matcher rule for {}: {e}", descriptor.repo)))?;
        debug!(
            "Profile for {} (registered: {}), matchers {:?}",
            descriptor.repo,
            self.profiles.is_registered(&descriptor.repo),
            parser.matcher_names()
        );

        eval.advance(EvaluationStage::BuildingBase);
        let (base, _base_lease) = until_cancelled(self.builder.ensure_base(&self.cache), cancel).await?;
        eval.log.line(format!("base layer {}", base.key));

        eval.advance(EvaluationStage::BuildingEnvironment);
        let (environment, _env_lease) = until_cancelled(
            self.builder
                .ensure_environment(&self.cache, &base, descriptor, &profile),
            cancel,
        )
        .await?;
        eval.log.line(format!("environment layer {}", environment.key));

        eval.advance(EvaluationStage::BuildingInstance);
        let instance = self
            .builder
            .build_instance(
                &self.cache.instances_dir(),
                &base,
                &environment,
                descriptor,
                &profile,
                golden,
                cancel,
            )
            .await
            .map_err(Early::from_build)?;
        eval.log.line(format!("instance layer {} at {}", instance.key, instance.path().display()));

        let result = self
            .run_instance(eval, &instance, descriptor, golden, &parser, cancel)
            .await;
        let instance_key = instance.key.clone();
        if let Err(e) = instance.close() {
            obs::emit_cleanup_error(&descriptor.instance_id, &e);
        } else {
            debug!("Removed instance layer {}", instance_key);
        }
        result
    }

    async fn run_instance(
        &self,
        eval: &mut Evaluation,
        instance: &InstanceLayer,
        descriptor: &DataPointDescriptor,
        golden: bool,
        parser: &ResultParser,
        cancel: &CancellationToken,
    ) -> Result<Completed, Early> {
        eval.advance(EvaluationStage::ApplyingPatch);
        if cancel.is_cancelled() {
            return Err(Early::cancelled());
        }
        let files = self
            .builder
            .apply_patch(instance, descriptor, golden)
            .await
            .map_err(Early::from_build)?;
        eval.log.line(format!("patch applied to {}", files.join(", ")));

        eval.advance(EvaluationStage::Running);
        let timeout = Duration::from_secs(descriptor.timeout_secs.unwrap_or(self.run.timeout_secs));
        eval.log.line(format!("test command: {}", instance.test_command));
        let execution = self
            .runner
            .run(&instance.run_request(), timeout, cancel)
            .await
            .map_err(|e| Early::error(format!("sandbox: {e}")))?;
        eval.log.block("test output", &execution.output);
        eval.log.line(format!(
            "exit code {:?} after {}ms (timed_out={}, truncated={})",
            execution.exit_code, execution.duration_ms, execution.timed_out, execution.truncated
        ));

        eval.advance(EvaluationStage::Parsing);
        let parsed = parser.parse(&execution, &descriptor.expected_tests());
        Ok(Completed {
            parsed,
            truncated: execution.truncated,
        })
    }
}

/// Await a cache operation unless `cancel` fires first. Shared builds keep
/// running for other waiters.
async fn until_cancelled<T>(
    op: impl Future<Output = Result<T, CacheError>>,
    cancel: &CancellationToken,
) -> Result<T, Early> {
    tokio::select! {
        result = op => result.map_err(Early::from_cache),
        _ = cancel.cancelled() => Err(Early::cancelled()),
    }
}

struct Completed {
    parsed: ParsedResult,
    truncated: bool,
}

/// An evaluation that ended before its output was parsed.
struct Early {
    status: VerdictStatus,
    error: String,
}

impl Early {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Error,
            error: message.into(),
        }
    }

    fn cancelled() -> Self {
        Self::error("evaluation cancelled")
    }

    fn from_build(e: BuildError) -> Self {
        Self {
            status: if e.is_conflict() {
                VerdictStatus::PatchConflict
            } else {
                VerdictStatus::Error
            },
            error: e.to_string(),
        }
    }

    fn from_cache(e: CacheError) -> Self {
        match e {
            CacheError::Build(e) => Self::from_build(e),
            other => Self::error(other.to_string()),
        }
    }
}

/// Per-evaluation bookkeeping: stage tracker and run log.
struct Evaluation {
    instance_id: String,
    tracker: StageTracker,
    log: RunLog,
    log_dir: PathBuf,
    started: Instant,
}

impl Evaluation {
    fn advance(&mut self, stage: EvaluationStage) {
        if let Err(e) = self.tracker.advance(stage) {
            warn!("{}: {}", self.instance_id, e);
            return;
        }
        self.log.line(format!("stage: {stage}"));
        obs::emit_stage(&self.instance_id, stage);
    }

    fn conclude(mut self, outcome: Result<Completed, Early>) -> (Verdict, Vec<EvaluationStage>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let log_path = self.log.path().to_path_buf();
        let verdict = match outcome {
            Ok(Completed { parsed, truncated }) => Verdict {
                instance_id: self.instance_id.clone(),
                status: parsed.status,
                tests: parsed.tests,
                tests_status: parsed.tests_status,
                duration_ms,
                log_path,
                truncated,
                error: parsed.error,
                matcher: parsed.matcher,
                finished_at: Utc::now(),
            },
            Err(early) => {
                self.log.line(format!("error: {}", early.error));
                Verdict::early(&self.instance_id, early.status, early.error, duration_ms, log_path)
            }
        };

        let stage = self.tracker.finish(verdict.status);
        self.log.line(format!("stage: {stage}"));
        obs::emit_stage(&self.instance_id, stage);
        if let Err(e) = write_instance_report(&self.log_dir, &verdict) {
            warn!("Could not write report for {}: {:#}", self.instance_id, e);
        }
        obs::emit_evaluation_finished(&self.instance_id, verdict.status, verdict.duration_ms);
        (verdict, self.tracker.history().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildErrorKind;
    use crate::domain::LayerKind;

    #[test]
    fn conflict_maps_to_patch_conflict() {
        let e = BuildError::new(LayerKind::Instance, "apply_patch", BuildErrorKind::Conflict, "hunk #1 failed");
        let early = Early::from_cache(CacheError::Build(e));
        assert_eq!(early.status, VerdictStatus::PatchConflict);
        assert!(early.error.contains("hunk #1 failed"));
    }

    #[test]
    fn other_build_failures_are_errors() {
        for kind in [BuildErrorKind::Permanent, BuildErrorKind::Timeout, BuildErrorKind::Transient] {
            let e = BuildError::new(LayerKind::Environment, "install", kind, "boom");
            assert_eq!(Early::from_build(e).status, VerdictStatus::Error);
        }
    }

    #[tokio::test]
    async fn invalid_descriptor_finishes_with_error_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PatchbenchConfig::default();
        config.run.log_dir = dir.path().join("logs");
        let cache = LayerCache::open(dir.path().join("cache"), Default::default()).unwrap();
        let orchestrator = Orchestrator::new(&config, cache, "run-1");

        let descriptor: DataPointDescriptor = serde_json::from_value(serde_json::json!({
            "instance_id": "owner__repo-1",
            "repo": "owner/repo",
            "base_commit": "abc1234",
            "patch": "   ",
            "FAIL_TO_PASS": ["test_foo"],
            "PASS_TO_PASS": [],
        }))
        .unwrap();

        let (verdict, stages) = orchestrator
            .evaluate_tracked(&descriptor, &CancellationToken::new())
            .await;
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert!(verdict.error.unwrap().contains("patch is empty"));
        assert_eq!(
            stages,
            vec![EvaluationStage::Pending, EvaluationStage::Finished(VerdictStatus::Error)]
        );
        let log_dir = dir.path().join("logs/run-1/owner__repo-1");
        assert!(log_dir.join("run_instance.log").exists());
        assert!(log_dir.join("report.json").exists());
    }

    #[tokio::test]
    async fn traversal_instance_id_logs_inside_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PatchbenchConfig::default();
        config.run.log_dir = dir.path().join("logs");
        let cache = LayerCache::open(dir.path().join("cache"), Default::default()).unwrap();
        let orchestrator = Orchestrator::new(&config, cache, "run-1");

        let descriptor: DataPointDescriptor = serde_json::from_value(serde_json::json!({
            "instance_id": "../escape",
            "repo": "owner/repo",
            "base_commit": "abc1234",
            "patch": "diff --git a/x b/x\n",
            "FAIL_TO_PASS": ["test_foo"],
            "PASS_TO_PASS": [],
        }))
        .unwrap();

        let verdict = orchestrator.evaluate(&descriptor, &CancellationToken::new()).await;
        assert_eq!(verdict.status, VerdictStatus::Error);
        assert!(verdict.log_path.starts_with(dir.path().join("logs/run-1")));
        assert!(!dir.path().join("logs/escape").exists());
    }
}
