//! An engine wired to in-memory stores for tests.

use crate::config::EngineConfig;
use crate::context::StageTarget;
use crate::engine::{EngineStores, ExecuteOptions, ExecutionResult, PipelineEngine};
use crate::errors::NovelflowError;
use crate::events::{CollectingEventSink, EventSink};
use crate::persistence::{InMemoryCheckpointStore, InMemoryExecutionStore, InMemoryLockTable};
use crate::pipeline::{Pipeline, PipelineRegistry};
use std::sync::Arc;

/// A [`PipelineEngine`] over in-memory stores that records every event.
///
/// Pipelines can be registered after construction; the registry is shared
/// with the engine.
pub struct TestHarness {
    registry: Arc<PipelineRegistry>,
    events: Arc<CollectingEventSink>,
    executions: InMemoryExecutionStore,
    checkpoints: InMemoryCheckpointStore,
    locks: InMemoryLockTable,
    engine: Arc<PipelineEngine>,
}

impl TestHarness {
    /// Creates a harness with the default engine configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a harness with `config`.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, |engine| engine)
    }

    /// Creates a harness and lets `customize` add monitors or healing to the engine.
    ///
    /// The engine's sink is already set to the harness collector.
    pub fn build(config: EngineConfig, customize: impl FnOnce(PipelineEngine) -> PipelineEngine) -> Self {
        let registry = Arc::new(PipelineRegistry::new());
        let events = Arc::new(CollectingEventSink::new());
        let executions = InMemoryExecutionStore::new();
        let checkpoints = InMemoryCheckpointStore::new();
        let locks = InMemoryLockTable::new();

        let stores = EngineStores {
            executions: Arc::new(executions.clone()),
            checkpoints: Arc::new(checkpoints.clone()),
            locks: Arc::new(locks.clone()),
        };
        let sink: Arc<dyn EventSink> = events.clone();
        let engine = PipelineEngine::new(Arc::clone(&registry), stores, config).with_sink(sink);

        Self {
            registry,
            events,
            executions,
            checkpoints,
            locks,
            engine: Arc::new(customize(engine)),
        }
    }

    /// Registers a pipeline.
    pub fn register(&self, pipeline: Pipeline) -> Result<(), NovelflowError> {
        self.registry.register(pipeline)
    }

    /// The engine under test.
    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Every event emitted so far.
    pub fn events(&self) -> &CollectingEventSink {
        &self.events
    }

    /// The execution store behind the engine.
    pub fn executions(&self) -> &InMemoryExecutionStore {
        &self.executions
    }

    /// The checkpoint store behind the engine.
    pub fn checkpoints(&self) -> &InMemoryCheckpointStore {
        &self.checkpoints
    }

    /// The lock table behind the engine.
    pub fn locks(&self) -> &InMemoryLockTable {
        &self.locks
    }

    /// Executes `pipeline_type` on a chapter of a novel.
    pub async fn run_chapter(
        &self,
        pipeline_type: &str,
        novel_id: &str,
        chapter_id: &str,
    ) -> Result<ExecutionResult, NovelflowError> {
        let target = StageTarget::novel(novel_id).with_chapter(chapter_id);
        self.engine.execute(pipeline_type, ExecuteOptions::new(target)).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("engine", &self.engine)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}
