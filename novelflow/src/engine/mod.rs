//! The pipeline execution engine.
//!
//! [`PipelineEngine`] runs registered pipelines one stage at a time under a
//! per-resource lease. Every mutation is persisted through
//! [`ExecutionPersistence`], progress is checkpointed after each stage, and
//! lifecycle events go to the configured [`EventSink`].
//!
//! ```text
//! execute ─▶ resolve ─▶ lock pipeline:{type}:{resource}
//!              │
//!              ▼
//!   ┌──── for each stage ──────────────────────────────┐
//!   │ cancelled? ─▶ extend lease ─▶ retry wrapper       │
//!   │       └─ failure ─▶ self-healing ─▶ rerun / fail  │
//!   │ merge context ─▶ persist ─▶ checkpoint ─▶ events  │
//!   └──────────────────────────────────────────────────┘
//!              │
//!              ▼
//!        complete ─▶ release lock
//! ```

mod options;


pub use options::{EngineStores, ExecuteOptions, ExecutionResult};

use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointManager, ExecutionPersistence, RecoveryManager};
use crate::config::{EngineConfig, PipelineConfig};
use crate::context::StageContext;
use crate::core::{PipelineEvent, PipelineEventKind, PipelineStatus, StageResult};
use crate::errors::{NovelflowError, PersistenceError};
use crate::events::{emit_safely, ChannelEventSink, EventSink, FanoutEventSink, NoOpEventSink};
use crate::healing::{classify_error, HealingPlan, HealthMonitor, RecoveryAction, SelfHealingManager};
use crate::lock::LockManager;
use crate::persistence::{ExecutionFilter, ExecutionPage};
use crate::pipeline::{run_stage_with_retry, Pipeline, PipelineRegistry, StageOutcome};
use crate::state::{PipelineState, PipelineStateMachine};
use crate::telemetry::execution_span;
use crate::utils::generate_id;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Cancellation handle of a run in flight.
#[derive(Debug)]
struct ActiveRun {
    token: Arc<CancellationToken>,
    pause_requested: AtomicBool,
}

/// Emits events for one execution.
struct Emitter<'a> {
    sink: &'a Arc<dyn EventSink>,
    execution_id: &'a str,
    pipeline_type: &'a str,
}

impl Emitter<'_> {
    fn emit(&self, kind: PipelineEventKind) {
        let event = PipelineEvent::new(self.execution_id, self.pipeline_type, kind);
        emit_safely(self.sink.as_ref(), &event);
    }
}

/// How a stage left the run loop.
enum StageStep {
    Next,
    Stop,
    RollbackTo(usize),
    Finished(ExecutionResult),
}

/// Orchestrates pipeline executions.
///
/// Construct once and share; all methods take `&self`.
pub struct PipelineEngine {
    registry: Arc<PipelineRegistry>,
    config: EngineConfig,
    locks: LockManager,
    executions: ExecutionPersistence,
    checkpoints: CheckpointManager,
    recovery: RecoveryManager,
    sink: Arc<dyn EventSink>,
    health: Option<Arc<HealthMonitor>>,
    healing: Option<Arc<SelfHealingManager>>,
    active: dashmap::DashMap<String, Arc<ActiveRun>>,
}

impl PipelineEngine {
    /// Creates an engine over `stores`.
    pub fn new(registry: Arc<PipelineRegistry>, stores: EngineStores, config: EngineConfig) -> Self {
        let mut locks = LockManager::new(stores.locks).with_reentry(config.allow_lock_reentry);
        if let Some(owner) = &config.owner_id {
            locks = locks.with_owner_id(owner.clone());
        }
        let executions = ExecutionPersistence::new(stores.executions);
        let checkpoints = CheckpointManager::new(stores.checkpoints);
        let recovery = RecoveryManager::new(executions.clone(), checkpoints.clone());

        Self {
            registry,
            config,
            locks,
            executions,
            checkpoints,
            recovery,
            sink: Arc::new(NoOpEventSink),
            health: None,
            healing: None,
            active: dashmap::DashMap::new(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Records outcomes into `monitor` and, when the engine config enforces
    /// it, refuses executions of unhealthy pipeline types.
    #[must_use]
    pub fn with_health_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    /// Consults `manager` before failing a stage, for pipelines with healing enabled.
    #[must_use]
    pub fn with_healing(mut self, manager: Arc<SelfHealingManager>) -> Self {
        self.healing = Some(manager);
        self
    }

    /// The lock owner id of this engine.
    pub fn owner_id(&self) -> &str {
        self.locks.owner_id()
    }

    /// The pipeline registry.
    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Executions currently running in this engine.
    pub fn active_executions(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Runs `pipeline_type` to a terminal status.
    ///
    /// Returns `Err` only for programmer errors (unknown pipeline type,
    /// missing target) and an open circuit; every runtime failure ends up in
    /// the returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        pipeline_type: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, NovelflowError> {
        let sink = Arc::clone(&self.sink);
        self.execute_with_sink(pipeline_type, options, sink).await
    }

    /// Like [`Self::execute`], but cancels the run once the configured
    /// `timeout_ms` passes. The run then stops at the next stage boundary.
    pub async fn execute_with_timeout(
        &self,
        pipeline_type: &str,
        mut options: ExecuteOptions,
    ) -> Result<ExecutionResult, NovelflowError> {
        let pipeline = self.registry.resolve(pipeline_type)?;
        let timeout_ms = self.effective_config(&pipeline, &options).timeout_ms;
        let Some(timeout_ms) = timeout_ms else {
            return self.execute(pipeline_type, options).await;
        };

        let token = Arc::clone(options.cancellation.get_or_insert_with(CancellationToken::shared));
        let run = self.execute(pipeline_type, options);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                warn!(pipeline_type, timeout_ms, "Pipeline timed out, cancelling");
                token.cancel(format!("Pipeline timed out after {timeout_ms}ms"));
            }
        }
        run.await
    }

    /// Runs `pipeline_type` in the background and streams its events.
    ///
    /// Events produced before the consumer polls are buffered. The stream
    /// ends when the execution settles.
    pub fn execute_with_stream(
        self: &Arc<Self>,
        pipeline_type: &str,
        options: ExecuteOptions,
    ) -> Result<BoxStream<'static, PipelineEvent>, NovelflowError> {
        self.registry.resolve(pipeline_type)?;

        let (channel, rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutEventSink::new()
                .with_sink(Arc::clone(&self.sink))
                .with_sink(Arc::new(channel)),
        );

        let engine = Arc::clone(self);
        let pipeline_type = pipeline_type.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.execute_with_sink(&pipeline_type, options, sink).await {
                warn!(pipeline_type = %pipeline_type, error = %err, "Streamed execution rejected");
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }

    /// Asks a running execution to pause at the next stage boundary.
    ///
    /// For an execution not running here, a stale `running` record is moved
    /// to `paused` directly. Returns whether anything changed.
    pub async fn pause(&self, execution_id: &str) -> Result<bool, NovelflowError> {
        if let Some(run) = self.active_run(execution_id) {
            info!(execution_id, "Pause requested");
            run.pause_requested.store(true, Ordering::SeqCst);
            run.token.cancel("paused");
            return Ok(true);
        }

        let mut machine = PipelineStateMachine::new(self.executions.require(execution_id).await?);
        if !machine.pause() {
            return Ok(false);
        }
        self.executions.save(machine.state()).await?;
        self.emit_detached(machine.state(), PipelineEventKind::PipelinePaused);
        Ok(true)
    }

    /// Asks a running execution to cancel at the next stage boundary.
    ///
    /// For an execution not running here, a `running` or `paused` record is
    /// moved to `cancelled` directly. Returns whether anything changed.
    pub async fn cancel(&self, execution_id: &str, reason: impl Into<String>) -> Result<bool, NovelflowError> {
        let reason = reason.into();
        if let Some(run) = self.active_run(execution_id) {
            info!(execution_id, reason = %reason, "Cancel requested");
            run.token.cancel(reason);
            return Ok(true);
        }

        let mut machine = PipelineStateMachine::new(self.executions.require(execution_id).await?);
        if !machine.cancel() {
            return Ok(false);
        }
        self.executions.save(machine.state()).await?;
        self.emit_detached(machine.state(), PipelineEventKind::PipelineCancelled { reason });
        Ok(true)
    }

    /// Continues a failed or paused execution from its latest checkpoint.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionResult, NovelflowError> {
        if self.active.contains_key(execution_id) {
            return Err(NovelflowError::NotRecoverable {
                execution_id: execution_id.to_string(),
                reason: "execution is still running".to_string(),
            });
        }
        if !self.recovery.can_recover(execution_id).await? {
            return Err(NovelflowError::NotRecoverable {
                execution_id: execution_id.to_string(),
                reason: "not failed or paused, or no checkpoint".to_string(),
            });
        }

        let state = self.recovery.prepare_recovery(execution_id).await?;
        if let Some(healing) = &self.healing {
            healing.reset(execution_id);
        }
        let pipeline_type = state.pipeline_type.clone();
        info!(execution_id, pipeline_type = %pipeline_type, "Resuming execution");
        self.execute(&pipeline_type, ExecuteOptions::resume(state)).await
    }

    /// The persisted state of an execution.
    pub async fn get_status(&self, execution_id: &str) -> Result<PipelineState, NovelflowError> {
        self.executions.require(execution_id).await
    }

    /// Lists persisted executions.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ExecutionPage, NovelflowError> {
        self.executions.list(filter, cursor, limit).await
    }

    fn active_run(&self, execution_id: &str) -> Option<Arc<ActiveRun>> {
        self.active.get(execution_id).map(|r| Arc::clone(r.value()))
    }

    fn emit_detached(&self, state: &PipelineState, kind: PipelineEventKind) {
        let event = PipelineEvent::new(&state.execution_id, &state.pipeline_type, kind);
        emit_safely(self.sink.as_ref(), &event);
    }

    fn effective_config(&self, pipeline: &Pipeline, options: &ExecuteOptions) -> PipelineConfig {
        options
            .config
            .clone()
            .or_else(|| options.resume_state.as_ref().map(|s| s.config.clone()))
            .or_else(|| pipeline.config().cloned())
            .unwrap_or_else(|| self.config.pipeline_defaults.clone())
    }

    fn check_circuit(&self, pipeline_type: &str) -> Result<(), NovelflowError> {
        if !self.config.enforce_circuit_breaker {
            return Ok(());
        }
        match &self.health {
            Some(monitor) if !monitor.is_healthy(pipeline_type) => {
                let failures = monitor.failure_count(pipeline_type);
                warn!(pipeline_type, failures, "Circuit open, refusing execution");
                Err(NovelflowError::CircuitOpen {
                    pipeline_type: pipeline_type.to_string(),
                    failures,
                })
            }
            _ => Ok(()),
        }
    }

    async fn execute_with_sink(
        &self,
        pipeline_type: &str,
        options: ExecuteOptions,
        sink: Arc<dyn EventSink>,
    ) -> Result<ExecutionResult, NovelflowError> {
        let pipeline = self.registry.resolve(pipeline_type)?;
        let target = options
            .resume_state
            .as_ref()
            .map_or_else(|| options.target.clone(), |s| s.target.clone());
        let resource = target
            .resource_id()
            .ok_or_else(|| NovelflowError::MissingTarget("novel_id or chapter_id is required".to_string()))?
            .to_string();
        self.check_circuit(pipeline_type)?;

        let config = self.effective_config(&pipeline, &options);
        let execution_id = options
            .resume_state
            .as_ref()
            .map(|s| s.execution_id.clone())
            .or_else(|| options.execution_id.clone())
            .unwrap_or_else(generate_id);
        let lock_key = format!("pipeline:{pipeline_type}:{resource}");

        let token = options.cancellation.clone().unwrap_or_else(CancellationToken::shared);
        let run = Arc::new(ActiveRun {
            token,
            pause_requested: AtomicBool::new(false),
        });
        let claimed = match self.active.entry(execution_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&run));
                true
            }
        };
        if !claimed {
            let reason = format!("Execution {execution_id} is already running");
            warn!(pipeline_type, execution_id = %execution_id, "Execution rejected");
            let state = PipelineState::new(&execution_id, pipeline_type, target, options.input, config);
            return Ok(rejected(PipelineStateMachine::new(state), reason));
        }

        let acquired = self
            .locks
            .acquire(&lock_key, self.config.lock_ttl(), &self.config.lock_retry)
            .await;
        let rejection = match acquired {
            Ok(Some(_)) => None,
            Ok(None) => Some(format!("Pipeline already running for resource {resource}")),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = rejection {
            self.active.remove(&execution_id);
            warn!(pipeline_type, resource = %resource, reason = %reason, "Execution rejected");
            let state = PipelineState::new(&execution_id, pipeline_type, target, options.input, config);
            return Ok(rejected(PipelineStateMachine::new(state), reason));
        }

        let span = execution_span(&execution_id, pipeline_type);
        let result = self
            .run_pipeline(&pipeline, &lock_key, &execution_id, config, options, &run, &sink)
            .instrument(span)
            .await;

        self.active.remove(&execution_id);
        match self.locks.release(&lock_key).await {
            Ok(true) => debug!(lock_key = %lock_key, "Lock released"),
            Ok(false) => debug!(lock_key = %lock_key, "Lock already gone at release"),
            Err(err) => warn!(lock_key = %lock_key, error = %err, "Failed to release lock"),
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        lock_key: &str,
        execution_id: &str,
        config: PipelineConfig,
        options: ExecuteOptions,
        run: &ActiveRun,
        sink: &Arc<dyn EventSink>,
    ) -> ExecutionResult {
        let pipeline_type = pipeline.pipeline_type();
        let emitter = Emitter {
            sink,
            execution_id,
            pipeline_type,
        };

        let resumed = options.resume_state.is_some();
        let state = match options.resume_state {
            Some(mut state) => {
                state.config = config.clone();
                state
            }
            None => {
                let mut state = PipelineState::new(
                    execution_id,
                    pipeline_type,
                    options.target,
                    options.input,
                    config.clone(),
                );
                if let Some(context) = options.context {
                    state.context = context;
                }
                state
            }
        };

        let mut machine = PipelineStateMachine::new(state);
        if !(machine.start() || machine.resume() || machine.recover()) {
            let reason = format!("Cannot run execution in status {}", machine.status());
            warn!(reason = %reason, "Execution rejected");
            return rejected(machine, reason);
        }

        let persisted = if resumed {
            self.executions.save(machine.state()).await
        } else {
            self.executions.create(machine.state()).await
        };
        match persisted {
            Ok(()) => {}
            Err(NovelflowError::Persistence(PersistenceError::Conflict(_))) if !resumed => {
                let reason = format!("Execution {execution_id} already exists");
                warn!(reason = %reason, "Execution rejected");
                return rejected(machine, reason);
            }
            Err(err) if !resumed => {
                let reason = format!("Persistence failed: {err}");
                warn!(reason = %reason, "Execution record not created");
                return rejected(machine, reason);
            }
            Err(err) => {
                let reason = format!("Persistence failed: {err}");
                return self.finish_failed(machine, &emitter, reason, None, false).await;
            }
        }

        let mut index = machine.state().resume_index();
        if resumed {
            info!(from_stage_index = index, "Pipeline resumed");
            emitter.emit(PipelineEventKind::PipelineResumed { from_stage_index: index });
        } else {
            info!(total_stages = pipeline.len(), "Pipeline started");
            emitter.emit(PipelineEventKind::PipelineStarted {
                total_stages: pipeline.len(),
                resource_id: machine.state().target.resource_id().unwrap_or_default().to_string(),
            });
        }

        while index < pipeline.len() {
            let step = self
                .run_stage(pipeline, index, lock_key, &config, &mut machine, run, &emitter)
                .await;
            match step {
                StageStep::Next => index += 1,
                StageStep::RollbackTo(target) => index = target,
                StageStep::Stop => break,
                StageStep::Finished(result) => return result,
            }
        }

        machine.complete();
        if let Err(err) = self.executions.save(machine.state()).await {
            warn!(error = %err, "Failed to persist completed execution");
        }
        if config.enable_checkpoints && config.cleanup_checkpoints_on_success {
            if let Err(err) = self.checkpoints.cleanup(execution_id).await {
                warn!(error = %err, "Failed to clean up checkpoints");
            }
        }
        if let Some(monitor) = &self.health {
            monitor.record_success(pipeline_type);
        }
        if let Some(healing) = &self.healing {
            healing.reset(execution_id);
        }

        let duration_ms = machine.state().duration_ms.unwrap_or_default();
        info!(duration_ms, "Pipeline completed");
        emitter.emit(PipelineEventKind::PipelineCompleted { duration_ms });
        ExecutionResult {
            status: PipelineStatus::Completed,
            error: None,
            state: machine.into_state(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        index: usize,
        lock_key: &str,
        config: &PipelineConfig,
        machine: &mut PipelineStateMachine,
        run: &ActiveRun,
        emitter: &Emitter<'_>,
    ) -> StageStep {
        let stage = &pipeline.stages()[index];
        let stage_id = stage.id().to_string();

        if run.token.is_cancelled() {
            return StageStep::Finished(self.finish_stopped(machine.clone(), emitter, run).await);
        }

        match self.locks.extend(lock_key, self.config.lock_ttl()).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                error!(lock_key, stage_id = %stage_id, "Lock lost, aborting execution");
                emitter.emit(PipelineEventKind::LockLost {
                    resource_id: lock_key.to_string(),
                });
                let result = self
                    .finish_failed(
                        machine.clone(),
                        emitter,
                        "lock lost".to_string(),
                        Some((stage_id, index)),
                        config.enable_checkpoints,
                    )
                    .await;
                return StageStep::Finished(result);
            }
        }

        let mut input = machine.state().input.clone();
        machine.begin_stage(&stage_id, stage.name(), index, input.clone());
        if let Err(err) = self.executions.save(machine.state()).await {
            let reason = format!("Persistence failed: {err}");
            let result = self
                .finish_failed(machine.clone(), emitter, reason, Some((stage_id, index)), config.enable_checkpoints)
                .await;
            return StageStep::Finished(result);
        }
        emitter.emit(PipelineEventKind::StageStarted {
            stage_id: stage_id.clone(),
            stage_index: index,
            stage_name: stage.name().to_string(),
        });

        let policy = config.retry_for(&stage_id, stage.retry_override());
        let mut retries = 0u32;
        let mut duration_ms = 0u64;
        let mut rollback = None;

        let outcome: StageOutcome = loop {
            let ctx = StageContext::new(emitter.execution_id, emitter.pipeline_type, &stage_id, index)
                .with_target(machine.state().target.clone())
                .with_input(input.clone())
                .with_context(Arc::new(machine.state().context.clone()))
                .with_retry(policy.clone())
                .with_cancellation(Arc::clone(&run.token))
                .with_sink(Arc::clone(emitter.sink));

            let outcome = run_stage_with_retry(stage.as_ref(), ctx, &policy, emitter.sink.as_ref()).await;
            retries += outcome.retry_count;
            duration_ms += outcome.duration_ms;

            if outcome.result.success || run.token.is_cancelled() || !config.enable_healing {
                break outcome;
            }
            let Some(healing) = &self.healing else {
                break outcome;
            };

            let message = outcome.result.error_message().to_string();
            let Some(action) = healing.decide(machine.state(), &stage_id, index, &message) else {
                break outcome;
            };

            info!(stage_id = %stage_id, action = action.name(), "Self-healing");
            emitter.emit(PipelineEventKind::HealingAttempted {
                stage_id: stage_id.clone(),
                attempt: healing.attempts(emitter.execution_id),
                category: classify_error(&message).to_string(),
                action: action.name().to_string(),
            });

            match action {
                RecoveryAction::Retry {
                    context_update,
                    modified_input,
                } => {
                    if let Some(update) = context_update {
                        machine.merge_context(&update);
                    }
                    if let Some(new_input) = modified_input {
                        input = new_input;
                    }
                }
                RecoveryAction::Heal { steps } => {
                    let plan = HealingPlan::from_steps(&steps);
                    if plan.refresh_context {
                        match self.executions.load(emitter.execution_id).await {
                            Ok(Some(stored)) => machine.replace_context(stored.context),
                            Ok(None) => {}
                            Err(err) => warn!(error = %err, "Failed to refresh context"),
                        }
                    }
                    if !plan.context_update.is_empty() {
                        machine.merge_context(&plan.context_update);
                    }
                    if !plan.wait.is_zero() {
                        tokio::select! {
                            () = tokio::time::sleep(plan.wait) => {}
                            () = run.token.cancelled() => break outcome,
                        }
                    }
                }
                RecoveryAction::Skip => {
                    break StageOutcome {
                        result: StageResult::skipped(),
                        ..outcome
                    };
                }
                RecoveryAction::Rollback { stage_index } if stage_index <= index => {
                    rollback = Some(stage_index);
                    break outcome;
                }
                RecoveryAction::Rollback { .. } | RecoveryAction::Abort { .. } => break outcome,
            }
            retries += 1;
        };

        if outcome.result.success {
            return self
                .complete_stage(outcome.result, &stage_id, index, retries, duration_ms, config, machine, emitter)
                .await;
        }

        let error = outcome.result.error_message().to_string();
        machine.fail_stage(error.clone(), retries);

        if run.token.is_cancelled() {
            return StageStep::Finished(self.finish_stopped(machine.clone(), emitter, run).await);
        }

        warn!(stage_id = %stage_id, retry_count = retries, error = %error, "Stage failed");
        emitter.emit(PipelineEventKind::StageFailed {
            stage_id: stage_id.clone(),
            stage_index: index,
            error: error.clone(),
            retry_count: retries,
            duration_ms,
        });

        if let Some(target) = rollback {
            info!(stage_id = %stage_id, to_stage_index = target, "Rolling back");
            if let Err(err) = self.executions.save(machine.state()).await {
                warn!(error = %err, "Failed to persist rolled back stage");
            }
            return StageStep::RollbackTo(target);
        }

        let result = self
            .finish_failed(machine.clone(), emitter, error, Some((stage_id, index)), config.enable_checkpoints)
            .await;
        StageStep::Finished(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_stage(
        &self,
        result: StageResult,
        stage_id: &str,
        index: usize,
        retries: u32,
        duration_ms: u64,
        config: &PipelineConfig,
        machine: &mut PipelineStateMachine,
        emitter: &Emitter<'_>,
    ) -> StageStep {
        if result.skipped {
            machine.skip_stage(retries);
        } else {
            machine.complete_stage(result.output.clone(), retries, result.metrics.clone());
        }
        if let Some(update) = &result.context_update {
            machine.merge_context(update);
        }

        if config.enable_checkpoints {
            let saved = self
                .checkpoints
                .save(emitter.execution_id, stage_id, index, machine.state(), Some(result.output.clone()), None)
                .await;
            match saved {
                Ok(checkpoint) => {
                    machine.set_checkpoint(checkpoint.id);
                    emitter.emit(PipelineEventKind::CheckpointSaved {
                        stage_id: stage_id.to_string(),
                        stage_index: index,
                    });
                }
                Err(err) => warn!(stage_id, error = %err, "Failed to save checkpoint"),
            }
        }

        if let Err(err) = self.executions.save(machine.state()).await {
            let reason = format!("Persistence failed: {err}");
            let failed = self
                .finish_failed(
                    machine.clone(),
                    emitter,
                    reason,
                    Some((stage_id.to_string(), index)),
                    config.enable_checkpoints,
                )
                .await;
            return StageStep::Finished(failed);
        }

        if result.skipped {
            debug!(stage_id, "Stage skipped");
            emitter.emit(PipelineEventKind::StageSkipped {
                stage_id: stage_id.to_string(),
                stage_index: index,
                reason: result.error.clone().unwrap_or_else(|| "skipped by error handler".to_string()),
            });
        } else {
            debug!(stage_id, duration_ms, retry_count = retries, "Stage completed");
            emitter.emit(PipelineEventKind::StageCompleted {
                stage_id: stage_id.to_string(),
                stage_index: index,
                duration_ms,
                retry_count: retries,
                metrics: result.metrics.clone(),
            });
        }

        if result.skip_remaining {
            info!(stage_id, "Stage requested to skip remaining stages");
            StageStep::Stop
        } else {
            StageStep::Next
        }
    }

    async fn finish_failed(
        &self,
        mut machine: PipelineStateMachine,
        emitter: &Emitter<'_>,
        error: String,
        failed_stage: Option<(String, usize)>,
        recoverable: bool,
    ) -> ExecutionResult {
        machine.fail(error.clone());
        if let Err(err) = self.executions.save(machine.state()).await {
            warn!(error = %err, "Failed to persist failed execution");
        }
        if let Some(monitor) = &self.health {
            monitor.record_failure(emitter.pipeline_type);
        }

        let (failed_stage_id, failed_stage_index) = failed_stage.unzip();
        error!(error = %error, failed_stage_index = ?failed_stage_index, recoverable, "Pipeline failed");
        emitter.emit(PipelineEventKind::PipelineFailed {
            error: error.clone(),
            failed_stage_id,
            failed_stage_index,
            recoverable,
        });
        ExecutionResult {
            status: machine.status(),
            error: Some(error),
            state: machine.into_state(),
        }
    }

    async fn finish_stopped(
        &self,
        mut machine: PipelineStateMachine,
        emitter: &Emitter<'_>,
        run: &ActiveRun,
    ) -> ExecutionResult {
        let reason = run.token.reason().unwrap_or_else(|| "cancelled".to_string());
        let paused = run.pause_requested.load(Ordering::SeqCst) && machine.pause();
        if !paused {
            machine.cancel();
        }
        if let Err(err) = self.executions.save(machine.state()).await {
            warn!(error = %err, "Failed to persist stopped execution");
        }

        if paused {
            info!("Pipeline paused");
            emitter.emit(PipelineEventKind::PipelinePaused);
        } else {
            info!(reason = %reason, "Pipeline cancelled");
            emitter.emit(PipelineEventKind::PipelineCancelled { reason: reason.clone() });
        }
        ExecutionResult {
            status: machine.status(),
            error: Some(reason),
            state: machine.into_state(),
        }
    }
}

/// A run that never got a persisted record: failed in memory only, with no
/// events and no health outcome.
fn rejected(mut machine: PipelineStateMachine, reason: String) -> ExecutionResult {
    machine.start();
    machine.fail(reason.clone());
    ExecutionResult {
        status: PipelineStatus::Failed,
        error: Some(reason),
        state: machine.into_state(),
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("owner_id", &self.locks.owner_id())
            .field("pipelines", &self.registry.types())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
