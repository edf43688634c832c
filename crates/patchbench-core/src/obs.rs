//! Structured lifecycle events for evaluations and layers.
//!
//! Every event carries an `event = "..."` field so log pipelines can filter
//! on it. Evaluation events are emitted inside an [`EvaluationSpan`].

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument, Span};

use crate::domain::{EvaluationStage, LayerKey, VerdictStatus};

/// Evaluation-scoped span. Attach it to the evaluation future with
/// [`EvaluationSpan::instrument`]; entering it directly is only for
/// synchronous code.
///
/// ```ignore
/// let span = EvaluationSpan::new("run-1", "psf__requests-1234");
/// span.instrument(evaluate(descriptor)).await;
/// ```
#[derive(Debug, Clone)]
pub struct EvaluationSpan {
    span: Span,
}

impl EvaluationSpan {
    pub fn new(run_id: &str, instance_id: &str) -> Self {
        let span = tracing::info_span!(
            "patchbench.evaluation",
            run_id = %run_id,
            instance_id = %instance_id
        );
        Self { span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

pub fn emit_evaluation_started(instance_id: &str, repo: &str, golden: bool) {
    info!(
        event = "evaluation.started",
        instance_id = %instance_id,
        repo = %repo,
        golden = golden,
    );
}

pub fn emit_stage(instance_id: &str, stage: EvaluationStage) {
    info!(event = "evaluation.stage", instance_id = %instance_id, stage = %stage);
}

pub fn emit_evaluation_finished(instance_id: &str, status: VerdictStatus, duration_ms: u64) {
    info!(
        event = "evaluation.finished",
        instance_id = %instance_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_layer_built(key: &LayerKey, duration_ms: u64) {
    info!(event = "layer.built", layer = %key, duration_ms = duration_ms);
}

pub fn emit_layer_evicted(key: &LayerKey, reason: &str) {
    info!(event = "layer.evicted", layer = %key, reason = %reason);
}

/// Cleanup of per-instance resources failed (warning level).
pub fn emit_cleanup_error(instance_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "evaluation.cleanup_error", instance_id = %instance_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_and_events_do_not_panic() {
        let span = EvaluationSpan::new("run", "inst");
        let _entered = span.enter();
        emit_evaluation_started("inst", "a/b", false);
        emit_stage("inst", EvaluationStage::Running);
        emit_evaluation_finished("inst", VerdictStatus::Pass, 10);
    }

    #[tokio::test]
    async fn test_span_instruments_future() {
        let span = EvaluationSpan::new("run", "inst");
        let value = EvaluationSpan::instrument(&span, async { 7 }).await;
        assert_eq!(value, 7);
    }
}
