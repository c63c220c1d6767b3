//! Storage contracts the engine depends on.
//!
//! The engine never talks to a database directly. It talks to the four
//! traits below; [`memory`] provides in-process implementations used by
//! tests and single-process deployments.

pub mod memory;
mod records;

pub use memory::{
    InMemoryCheckpointStore, InMemoryExecutionStore, InMemoryLockTable, InMemoryMetricsStore,
};
pub use records::{Checkpoint, DistributedLock, ExecutionFilter, ExecutionPage};

use crate::core::PipelineEvent;
use crate::errors::PersistenceError;
use crate::observability::ExecutionMetrics;
use crate::state::{PipelineState, StageExecution};
use crate::utils::Timestamp;
use async_trait::async_trait;

/// Canonical execution records and their stage-history rows.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new execution. Fails with `Conflict` if the id exists.
    async fn create_execution(&self, state: &PipelineState) -> Result<(), PersistenceError>;

    /// Reads an execution by id.
    async fn get_execution(&self, execution_id: &str) -> Result<Option<PipelineState>, PersistenceError>;

    /// Overwrites an existing execution. Fails with `NotFound` if absent.
    async fn update_execution(&self, state: &PipelineState) -> Result<(), PersistenceError>;

    /// Inserts or replaces the row for `(execution_id, record.stage_id)`.
    async fn upsert_stage_execution(
        &self,
        execution_id: &str,
        record: &StageExecution,
    ) -> Result<(), PersistenceError>;

    /// Stage rows of one execution, ordered by stage index.
    async fn list_stage_executions(&self, execution_id: &str) -> Result<Vec<StageExecution>, PersistenceError>;

    /// Lists executions matching `filter`, newest first.
    ///
    /// `cursor` is the `next_cursor` of a previous page.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ExecutionPage, PersistenceError>;
}

/// Checkpoints keyed by `(execution_id, stage_id)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Inserts or replaces the checkpoint for its `(execution, stage)` pair.
    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    /// Most recent checkpoint of an execution.
    async fn get_latest_checkpoint(&self, execution_id: &str) -> Result<Option<Checkpoint>, PersistenceError>;

    /// Checkpoint taken at a specific stage.
    async fn get_checkpoint_at_stage(
        &self,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<Option<Checkpoint>, PersistenceError>;

    /// Deletes every checkpoint of an execution, returning how many were removed.
    async fn delete_checkpoints(&self, execution_id: &str) -> Result<usize, PersistenceError>;
}

/// The five storage operations the lock manager needs.
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Inserts `lock` unless a row for its resource exists. Returns whether it was inserted.
    async fn insert_if_absent(&self, lock: &DistributedLock) -> Result<bool, PersistenceError>;

    /// Reads the row for a resource.
    async fn get(&self, resource_id: &str) -> Result<Option<DistributedLock>, PersistenceError>;

    /// Rewrites the expiry if `owner_id` still owns the row.
    async fn update_expiry_if_owner(
        &self,
        resource_id: &str,
        owner_id: &str,
        expires_at_ms: u64,
    ) -> Result<bool, PersistenceError>;

    /// Deletes the row if `owner_id` owns it.
    async fn delete_if_owner(&self, resource_id: &str, owner_id: &str) -> Result<bool, PersistenceError>;

    /// Deletes every row whose expiry is at or before `now_ms`.
    async fn delete_expired(&self, now_ms: u64) -> Result<usize, PersistenceError>;
}

/// Event log and per-execution metrics.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Appends an event to the durable log.
    async fn append_event(&self, event: &PipelineEvent) -> Result<(), PersistenceError>;

    /// Inserts or replaces the metrics of an execution.
    async fn save_metrics(&self, metrics: &ExecutionMetrics) -> Result<(), PersistenceError>;

    /// Metrics of executions started at or after `since`, optionally for one pipeline type.
    async fn list_metrics_since(
        &self,
        since: Timestamp,
        pipeline_type: Option<&str>,
    ) -> Result<Vec<ExecutionMetrics>, PersistenceError>;
}
