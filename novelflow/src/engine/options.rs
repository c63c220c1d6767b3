//! Inputs and outputs of [`super::PipelineEngine::execute`].

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::{PipelineContext, StageTarget};
use crate::core::PipelineStatus;
use crate::persistence::{
    CheckpointStore, ExecutionStore, InMemoryCheckpointStore, InMemoryExecutionStore,
    InMemoryLockTable, LockTable,
};
use crate::state::PipelineState;
use std::sync::Arc;

/// Options for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Resource the execution works on; locked for the duration.
    pub target: StageTarget,
    /// Input handed to every stage.
    pub input: serde_json::Value,
    /// Overrides the pipeline's configuration.
    pub config: Option<PipelineConfig>,
    /// Initial context. Defaults to an empty one.
    pub context: Option<PipelineContext>,
    /// Id to use instead of a generated one.
    pub execution_id: Option<String>,
    /// External cancellation token.
    pub cancellation: Option<Arc<CancellationToken>>,
    /// State rebuilt by the recovery manager; continues that execution.
    pub resume_state: Option<PipelineState>,
}

impl ExecuteOptions {
    /// Options for a fresh execution on `target`.
    #[must_use]
    pub fn new(target: StageTarget) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Options that continue a recovered execution.
    #[must_use]
    pub fn resume(state: PipelineState) -> Self {
        Self {
            target: state.target.clone(),
            input: state.input.clone(),
            resume_state: Some(state),
            ..Self::default()
        }
    }

    /// Sets the stage input.
    #[must_use]
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Overrides the pipeline configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Seeds the pipeline context.
    #[must_use]
    pub fn with_context(mut self, context: PipelineContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Uses a caller-chosen execution id.
    #[must_use]
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    /// Uses an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// What `execute` hands back. Stage failures end up here, not in `Err`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Final status.
    pub status: PipelineStatus,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Final state of the execution.
    pub state: PipelineState,
}

impl ExecutionResult {
    /// Whether the execution completed.
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Execution id.
    pub fn execution_id(&self) -> &str {
        &self.state.execution_id
    }
}

/// Storage backends the engine runs against.
#[derive(Clone)]
pub struct EngineStores {
    /// Execution records.
    pub executions: Arc<dyn ExecutionStore>,
    /// Checkpoints.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Lock rows.
    pub locks: Arc<dyn LockTable>,
}

impl EngineStores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            executions: Arc::new(InMemoryExecutionStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            locks: Arc::new(InMemoryLockTable::new()),
        }
    }
}

impl std::fmt::Debug for EngineStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineStores").finish_non_exhaustive()
    }
}
