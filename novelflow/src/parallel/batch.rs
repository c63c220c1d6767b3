//! One sequential sub-pipeline per target, targets in parallel.

use super::executor::{ParallelExecutor, ParallelResult, ParallelTask};
use crate::cancellation::CancellationToken;
use crate::config::{ParallelConfig, StageRetryPolicy};
use crate::context::{StageContext, StageTarget};
use crate::core::StageResult;
use crate::errors::StageError;
use crate::events::EventSink;
use crate::pipeline::run_stage_with_retry;
use crate::stages::Stage;
use crate::utils::generate_id;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the same ordered stage list once per target.
///
/// Within a target the stages run in order, each seeing the context merged
/// from its predecessors; the chain stops at the first failure. Targets run
/// concurrently under the executor's limit, and the per-stage deadline
/// applies to each target's whole chain.
#[derive(Debug, Clone)]
pub struct BatchGenerator {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    retry: StageRetryPolicy,
    executor: ParallelExecutor,
}

impl BatchGenerator {
    /// Creates a generator running `stages` per target.
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Stage>>, config: ParallelConfig) -> Self {
        Self {
            name: name.into(),
            stages,
            retry: StageRetryPolicy::default(),
            executor: ParallelExecutor::new(config),
        }
    }

    /// Retry policy for chain stages without their own override.
    #[must_use]
    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Routes stage events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_sink(sink);
        self
    }

    /// Uses `token` as the shared abort signal.
    #[must_use]
    pub fn with_abort(mut self, token: Arc<CancellationToken>) -> Self {
        self.executor = self.executor.with_abort(token);
        self
    }

    /// Runs the chain for every target. `results[i]` belongs to `targets[i]`;
    /// a successful output maps each stage id to that stage's output.
    pub async fn run(&self, targets: Vec<StageTarget>, input: serde_json::Value) -> ParallelResult {
        info!(batch = %self.name, targets = targets.len(), stages = self.stages.len(), "Starting batch");
        let tasks: Vec<ParallelTask> = targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| {
                let chain: Arc<dyn Stage> = Arc::new(ChainStage {
                    id: chain_id(&self.name, &target, index),
                    stages: self.stages.clone(),
                    stage_retry: self.retry.clone(),
                    no_retry: StageRetryPolicy::no_retry(),
                });
                let ctx = StageContext::new(generate_id(), &self.name, chain.id(), index)
                    .with_target(target)
                    .with_input(input.clone());
                (chain, ctx)
            })
            .collect();
        self.executor.run(tasks).await
    }
}

fn chain_id(name: &str, target: &StageTarget, index: usize) -> String {
    match target.resource_id() {
        Some(resource) => format!("{name}:{resource}"),
        None => format!("{name}:{index}"),
    }
}

/// A fixed stage list run in order as a single stage. Retries happen per
/// inner stage, never for the chain as a whole.
#[derive(Debug)]
struct ChainStage {
    id: String,
    stages: Vec<Arc<dyn Stage>>,
    stage_retry: StageRetryPolicy,
    no_retry: StageRetryPolicy,
}

#[async_trait]
impl Stage for ChainStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn retry_override(&self) -> Option<&StageRetryPolicy> {
        Some(&self.no_retry)
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let mut context = ctx.context().clone();
        let mut outputs = serde_json::Map::new();

        for (index, stage) in self.stages.iter().enumerate() {
            if ctx.is_cancelled() {
                let reason = ctx.cancellation().reason().unwrap_or_else(|| "cancelled".to_string());
                return Ok(StageResult::fail(format!("Cancelled before {}: {reason}", stage.id())));
            }

            let policy = stage.retry_override().unwrap_or(&self.stage_retry).clone();
            let child = StageContext::new(ctx.execution_id(), ctx.pipeline_type(), stage.id(), index)
                .with_target(ctx.target().clone())
                .with_input(ctx.input().clone())
                .with_context(Arc::new(context.clone()))
                .with_retry(policy.clone())
                .with_cancellation(Arc::clone(ctx.cancellation()))
                .with_sink(Arc::clone(ctx.progress().sink()));

            let outcome = run_stage_with_retry(stage.as_ref(), child, &policy, ctx.progress().sink().as_ref()).await;
            if !outcome.result.success {
                debug!(chain = %self.id, stage_id = stage.id(), "Chain stopped at failed stage");
                return Ok(StageResult::fail(format!("{}: {}", stage.id(), outcome.result.error_message()))
                    .with_error_detail("failed_stage", serde_json::Value::String(stage.id().to_string())));
            }

            if let Some(update) = &outcome.result.context_update {
                context = context.merge(update);
            }
            outputs.insert(stage.id().to_string(), outcome.result.output);
            ctx.progress().report((index + 1) as f64 / self.stages.len() as f64, Some(stage.id()));
            if outcome.result.skip_remaining {
                break;
            }
        }

        Ok(StageResult::ok(serde_json::Value::Object(outputs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextUpdate;
    use crate::parallel::TaskStatus;
    use crate::testing::{CallLog, FailingStage, RecordingStage, SuccessStage};
    use pretty_assertions::assert_eq;

    fn chapters(ids: &[&str]) -> Vec<StageTarget> {
        ids.iter().map(|id| StageTarget::novel("n1").with_chapter(*id)).collect()
    }

    #[tokio::test]
    async fn test_batch_runs_chain_per_target() {
        let log = CallLog::default();
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(
                RecordingStage::new("outline", log.clone())
                    .with_context_update(ContextUpdate::new().chapter_outline(serde_json::json!(["beat"]))),
            ),
            Arc::new(RecordingStage::new("draft", log.clone())),
        ];
        let batch = BatchGenerator::new("chapters", stages, ParallelConfig::default());

        let result = batch.run(chapters(&["c1", "c2", "c3"]), serde_json::json!({"words": 1500})).await;

        assert!(result.all_succeeded());
        assert_eq!(result.results[1].stage_id, "chapters:c2");
        let output = result.results[0].output().expect("output");
        assert_eq!(output["draft"]["stage"], "draft");

        let calls = log.lock().clone();
        assert_eq!(calls.len(), 6);
        for call in calls.iter().filter(|c| c.stage_id == "draft") {
            assert_eq!(call.context_version, 1);
        }
        assert!(calls.iter().all(|c| c.input == serde_json::json!({"words": 1500})));
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let last = Arc::new(SuccessStage::new("polish"));
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(SuccessStage::new("outline")),
            Arc::new(FailingStage::new("draft", "invalid outline")),
            last.clone(),
        ];
        let batch = BatchGenerator::new("chapters", stages, ParallelConfig::default());

        let result = batch.run(chapters(&["c1"]), serde_json::Value::Null).await;

        assert_eq!(result.results[0].status, TaskStatus::Failed);
        assert_eq!(result.results[0].error(), Some("draft: invalid outline"));
        assert_eq!(last.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_target_does_not_stop_others() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(
            crate::testing::ScriptedStage::new(
                "draft",
                vec![
                    crate::testing::Script::fail("invalid outline"),
                    crate::testing::Script::ok(serde_json::json!("text")),
                ],
            )
            .with_retry(StageRetryPolicy::no_retry()),
        )];
        let batch = BatchGenerator::new("chapters", stages, ParallelConfig::default().with_max_concurrency(1));

        let result = batch.run(chapters(&["c1", "c2"]), serde_json::Value::Null).await;

        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test]
    async fn test_generator_reruns_after_stopped_batch() {
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(
            crate::testing::ScriptedStage::new(
                "draft",
                vec![
                    crate::testing::Script::fail("invalid outline"),
                    crate::testing::Script::ok(serde_json::json!("text")),
                    crate::testing::Script::ok(serde_json::json!("text")),
                ],
            )
            .with_retry(StageRetryPolicy::no_retry()),
        )];
        let config = ParallelConfig::default()
            .with_max_concurrency(1)
            .with_stop_on_first_failure(true);
        let batch = BatchGenerator::new("chapters", stages, config);

        let first = batch.run(chapters(&["c1"]), serde_json::Value::Null).await;
        assert_eq!(first.failed, 1);

        let second = batch.run(chapters(&["c2", "c3"]), serde_json::Value::Null).await;
        assert_eq!(second.succeeded, 2);
        assert_eq!(second.aborted, 0);
    }

    #[test]
    fn test_chain_id_without_resource() {
        assert_eq!(chain_id("batch", &StageTarget::default(), 4), "batch:4");
    }
}
