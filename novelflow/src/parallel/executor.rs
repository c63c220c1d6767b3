//! Bounded-concurrency execution of independent stages.

use super::semaphore::Semaphore;
use crate::cancellation::CancellationToken;
use crate::config::ParallelConfig;
use crate::context::StageContext;
use crate::core::{PipelineEvent, PipelineEventKind, StageResult};
use crate::events::{emit_safely, EventSink, NoOpEventSink};
use crate::pipeline::run_stage_with_retry;
use crate::stages::Stage;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// How one parallel task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The stage succeeded (or was skipped by its error handler).
    Succeeded,
    /// The stage failed.
    Failed,
    /// The stage exceeded the per-stage deadline.
    TimedOut,
    /// The stage never ran, or was stopped, because the run was aborted.
    Aborted,
}

/// Outcome of one task, at its input position.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Position in the input list.
    pub index: usize,
    /// Stage id.
    pub stage_id: String,
    /// How the task ended.
    pub status: TaskStatus,
    /// Stage result; absent for aborted tasks that never ran.
    pub result: Option<StageResult>,
    /// Retries performed.
    pub retry_count: u32,
    /// Wall time including the semaphore wait.
    pub duration_ms: u64,
}

impl TaskReport {
    fn aborted(index: usize, stage_id: String, started: Instant) -> Self {
        Self {
            index,
            stage_id,
            status: TaskStatus::Aborted,
            result: None,
            retry_count: 0,
            duration_ms: millis_since(started),
        }
    }

    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    /// The stage output when the task succeeded.
    pub fn output(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().filter(|_| self.is_success()).map(|r| &r.output)
    }

    /// The failure message, if any.
    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.error.as_deref())
    }
}

/// Outcome of a parallel run.
#[derive(Debug, Clone)]
pub struct ParallelResult {
    /// One report per task, in input order.
    pub results: Vec<TaskReport>,
    /// Tasks that succeeded.
    pub succeeded: usize,
    /// Tasks that failed or timed out.
    pub failed: usize,
    /// Tasks stopped by an abort.
    pub aborted: usize,
    /// Wall time of the whole run.
    pub duration_ms: u64,
}

impl ParallelResult {
    fn from_reports(results: Vec<TaskReport>, started: Instant) -> Self {
        let count = |f: fn(&TaskStatus) -> bool| results.iter().filter(|r| f(&r.status)).count();
        let succeeded = count(|s| *s == TaskStatus::Succeeded);
        let failed = count(|s| matches!(s, TaskStatus::Failed | TaskStatus::TimedOut));
        let aborted = count(|s| *s == TaskStatus::Aborted);
        Self {
            results,
            succeeded,
            failed,
            aborted,
            duration_ms: millis_since(started),
        }
    }

    /// Whether every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.results.len()
    }
}

/// One unit of work: a stage and the context it runs with.
pub type ParallelTask = (Arc<dyn Stage>, StageContext);

/// Runs independent stages under a concurrency limit.
///
/// Each stage runs through the same retry wrapper the engine uses, under a
/// hard per-stage deadline. No resource lock is taken; callers keep the
/// targets disjoint from running engine executions.
#[derive(Clone)]
pub struct ParallelExecutor {
    config: ParallelConfig,
    sink: Arc<dyn EventSink>,
    abort: Arc<CancellationToken>,
}

impl ParallelExecutor {
    /// Creates an executor.
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            sink: Arc::new(NoOpEventSink),
            abort: CancellationToken::shared(),
        }
    }

    /// Routes stage events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses `token` as the shared abort signal.
    #[must_use]
    pub fn with_abort(mut self, token: Arc<CancellationToken>) -> Self {
        self.abort = token;
        self
    }

    /// The caller-side abort signal. Cancelling it stops pending tasks of any
    /// run in progress and of every later run.
    pub fn abort_handle(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.abort)
    }

    /// The executor configuration.
    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Runs every task and waits for all of them.
    pub async fn run(&self, tasks: Vec<ParallelTask>) -> ParallelResult {
        let started = Instant::now();
        let total = tasks.len();
        let semaphore = Semaphore::new(self.config.max_concurrency);
        let run_abort = RunAbort::linked_to(&self.abort);
        info!(
            tasks = total,
            max_concurrency = semaphore.capacity(),
            stop_on_first_failure = self.config.stop_on_first_failure,
            "Starting parallel run"
        );

        let mut ids = Vec::with_capacity(total);
        let mut running = FuturesUnordered::new();
        for (index, (stage, ctx)) in tasks.into_iter().enumerate() {
            ids.push(stage.id().to_string());
            let worker = Worker {
                config: self.config.clone(),
                sink: Arc::clone(&self.sink),
                abort: Arc::clone(&run_abort.token),
                semaphore: semaphore.clone(),
            };
            let span = ctx.span().clone();
            running.push(tokio::spawn(worker.run(index, stage, ctx).instrument(span)));
        }

        let mut slots: Vec<Option<TaskReport>> = vec![None; total];
        while let Some(joined) = running.next().await {
            match joined {
                Ok(report) => {
                    let index = report.index;
                    slots[index] = Some(report);
                }
                Err(err) => warn!(error = %err, "Parallel task panicked"),
            }
        }

        let results: Vec<TaskReport> = slots
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(index, (slot, stage_id))| {
                slot.unwrap_or_else(|| TaskReport {
                    index,
                    stage_id,
                    status: TaskStatus::Failed,
                    result: Some(StageResult::fail("stage task panicked")),
                    retry_count: 0,
                    duration_ms: millis_since(started),
                })
            })
            .collect();

        let result = ParallelResult::from_reports(results, started);
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            aborted = result.aborted,
            duration_ms = result.duration_ms,
            "Parallel run finished"
        );
        result
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("aborted", &self.abort.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Abort signal of a single run. It fires when the caller's token does, or
/// when a failure in this run stops the remaining work; the latter never
/// reaches the caller's token.
struct RunAbort {
    token: Arc<CancellationToken>,
    forward: JoinHandle<()>,
}

impl RunAbort {
    fn linked_to(parent: &Arc<CancellationToken>) -> Self {
        let token = CancellationToken::shared();
        if parent.is_cancelled() {
            token.cancel(parent.reason().unwrap_or_else(|| "aborted".to_string()));
        }
        let forward = {
            let parent = Arc::clone(parent);
            let token = Arc::clone(&token);
            tokio::spawn(async move {
                parent.cancelled().await;
                token.cancel(parent.reason().unwrap_or_else(|| "aborted".to_string()));
            })
        };
        Self { token, forward }
    }
}

impl Drop for RunAbort {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

fn millis_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct Worker {
    config: ParallelConfig,
    sink: Arc<dyn EventSink>,
    abort: Arc<CancellationToken>,
    semaphore: Semaphore,
}

impl Worker {
    async fn run(self, index: usize, stage: Arc<dyn Stage>, ctx: StageContext) -> TaskReport {
        let started = Instant::now();
        let stage_id = stage.id().to_string();

        let permit = tokio::select! {
            biased;
            () = self.abort.cancelled() => None,
            permit = self.semaphore.acquire() => permit.ok(),
        };
        let Some(_permit) = permit else {
            debug!(stage_id = %stage_id, "Aborted before start");
            return TaskReport::aborted(index, stage_id, started);
        };
        if self.abort.is_cancelled() {
            return TaskReport::aborted(index, stage_id, started);
        }

        let emit = |kind: PipelineEventKind| {
            let event = PipelineEvent::new(ctx.execution_id(), ctx.pipeline_type(), kind);
            emit_safely(self.sink.as_ref(), &event);
        };
        emit(PipelineEventKind::StageStarted {
            stage_id: stage_id.clone(),
            stage_index: index,
            stage_name: stage.name().to_string(),
        });

        let policy = stage.retry_override().cloned().unwrap_or_else(|| ctx.retry().clone());
        let stage_ctx = ctx
            .clone()
            .with_retry(policy.clone())
            .with_cancellation(Arc::clone(&self.abort))
            .with_sink(Arc::clone(&self.sink));
        let deadline = self.config.stage_timeout();
        let attempt = run_stage_with_retry(stage.as_ref(), stage_ctx, &policy, self.sink.as_ref());

        let (status, result, retry_count) = match tokio::time::timeout(deadline, attempt).await {
            Ok(outcome) if outcome.result.success => (TaskStatus::Succeeded, outcome.result, outcome.retry_count),
            Ok(outcome) if self.abort.is_cancelled() => (TaskStatus::Aborted, outcome.result, outcome.retry_count),
            Ok(outcome) => (TaskStatus::Failed, outcome.result, outcome.retry_count),
            Err(_) => {
                let message = format!("Stage {stage_id} timed out after {}ms", self.config.stage_timeout_ms);
                warn!(stage_id = %stage_id, timeout_ms = self.config.stage_timeout_ms, "Stage timed out");
                (TaskStatus::TimedOut, StageResult::fail(message), 0)
            }
        };
        let duration_ms = millis_since(started);

        match status {
            TaskStatus::Succeeded => emit(PipelineEventKind::StageCompleted {
                stage_id: stage_id.clone(),
                stage_index: index,
                duration_ms,
                retry_count,
                metrics: result.metrics.clone(),
            }),
            TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Aborted => {
                emit(PipelineEventKind::StageFailed {
                    stage_id: stage_id.clone(),
                    stage_index: index,
                    error: result.error_message().to_string(),
                    retry_count,
                    duration_ms,
                });
            }
        }

        if matches!(status, TaskStatus::Failed | TaskStatus::TimedOut) && self.config.stop_on_first_failure {
            info!(stage_id = %stage_id, "Stopping remaining work after failure");
            self.abort.cancel(format!("stage {stage_id} failed"));
            self.semaphore.close();
        }

        TaskReport {
            index,
            stage_id,
            status,
            result: Some(result),
            retry_count,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageRetryPolicy;
    use crate::events::CollectingEventSink;
    use crate::testing::{FailingStage, SlowStage, SuccessStage};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx(stage_id: &str, index: usize) -> StageContext {
        StageContext::new("batch-1", "parallel", stage_id, index).with_retry(StageRetryPolicy::no_retry())
    }

    fn task(stage: impl Stage + 'static, index: usize) -> ParallelTask {
        let stage: Arc<dyn Stage> = Arc::new(stage);
        let ctx = ctx(stage.id(), index);
        (stage, ctx)
    }

    /// Tracks the peak number of concurrent executions.
    #[derive(Debug, Default)]
    struct GaugeStage {
        id: String,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Stage for GaugeStage {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<StageResult, crate::errors::StageError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(StageResult::ok_empty())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_in_input_order() {
        let executor = ParallelExecutor::new(ParallelConfig::default());
        let result = executor
            .run(vec![
                task(SlowStage::new("slow", Duration::from_millis(200)), 0),
                task(SuccessStage::new("fast"), 1),
                task(FailingStage::new("broken", "invalid prompt"), 2),
            ])
            .await;

        let ids: Vec<&str> = result.results.iter().map(|r| r.stage_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast", "broken"]);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.aborted, 0);
        assert_eq!(result.results[2].error(), Some("invalid prompt"));
        assert_eq!(result.results[1].output(), Some(&serde_json::json!({"stage": "fast"})));
        assert!(!result.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..6)
            .map(|i| {
                let stage = GaugeStage {
                    id: format!("s{i}"),
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                };
                task(stage, i)
            })
            .collect();

        let result = ParallelExecutor::new(ParallelConfig::default().with_max_concurrency(2))
            .run(tasks)
            .await;

        assert!(result.all_succeeded());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_a_failure() {
        let executor = ParallelExecutor::new(ParallelConfig::default().with_stage_timeout_ms(100));
        let result = executor
            .run(vec![task(SlowStage::new("slow", Duration::from_secs(60)), 0)])
            .await;

        assert_eq!(result.results[0].status, TaskStatus::TimedOut);
        assert_eq!(result.failed, 1);
        assert_eq!(result.results[0].error(), Some("Stage slow timed out after 100ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_first_failure_aborts_pending() {
        let config = ParallelConfig::default()
            .with_max_concurrency(1)
            .with_stop_on_first_failure(true);
        let result = ParallelExecutor::new(config)
            .run(vec![
                task(FailingStage::new("broken", "invalid prompt"), 0),
                task(SuccessStage::new("second"), 1),
                task(SuccessStage::new("third"), 2),
            ])
            .await;

        assert_eq!(result.results[0].status, TaskStatus::Failed);
        assert_eq!(result.results[1].status, TaskStatus::Aborted);
        assert_eq!(result.results[2].status, TaskStatus::Aborted);
        assert_eq!(result.failed, 1);
        assert_eq!(result.aborted, 2);
        assert!(result.results[1].result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stop_does_not_leak_into_next_run() {
        let config = ParallelConfig::default()
            .with_max_concurrency(1)
            .with_stop_on_first_failure(true);
        let executor = ParallelExecutor::new(config);

        let first = executor
            .run(vec![
                task(FailingStage::new("broken", "invalid prompt"), 0),
                task(SuccessStage::new("skipped"), 1),
            ])
            .await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.aborted, 1);
        assert!(!executor.abort_handle().is_cancelled());

        let second = executor
            .run(vec![task(SuccessStage::new("a"), 0), task(SuccessStage::new("b"), 1)])
            .await;
        assert_eq!(second.succeeded, 2);
        assert_eq!(second.aborted, 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_token_aborts_every_task() {
        let executor = ParallelExecutor::new(ParallelConfig::default());
        executor.abort_handle().cancel("shutdown");

        let result = executor.run(vec![task(SuccessStage::new("a"), 0)]).await;

        assert_eq!(result.aborted, 1);
        assert_eq!(result.succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_abort_stops_running_stage() {
        let executor = ParallelExecutor::new(ParallelConfig::default());
        let abort = executor.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            abort.cancel("shutdown");
        });

        let result = executor
            .run(vec![task(SlowStage::new("slow", Duration::from_secs(60)), 0)])
            .await;

        assert_eq!(result.results[0].status, TaskStatus::Aborted);
        assert_eq!(result.aborted, 1);
    }

    #[tokio::test]
    async fn test_emits_stage_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let executor = ParallelExecutor::new(ParallelConfig::default()).with_sink(sink.clone());

        executor
            .run(vec![
                task(SuccessStage::new("a"), 0),
                task(FailingStage::new("b", "invalid prompt"), 1),
            ])
            .await;

        assert_eq!(sink.events_named("stage:started").len(), 2);
        assert_eq!(sink.events_named("stage:completed").len(), 1);
        assert_eq!(sink.events_named("stage:failed").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let result = ParallelExecutor::new(ParallelConfig::default()).run(Vec::new()).await;
        assert!(result.results.is_empty());
        assert!(result.all_succeeded());
    }
}
