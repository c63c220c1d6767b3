//! In-memory store implementations.

use super::{
    Checkpoint, CheckpointStore, DistributedLock, ExecutionFilter, ExecutionPage, ExecutionStore,
    LockTable, MetricsStore,
};
use crate::core::PipelineEvent;
use crate::errors::PersistenceError;
use crate::observability::ExecutionMetrics;
use crate::state::{PipelineState, StageExecution};
use crate::utils::Timestamp;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn check_failing(flag: &AtomicBool) -> Result<(), PersistenceError> {
    if flag.load(Ordering::SeqCst) {
        Err(PersistenceError::Backend("store unavailable".to_string()))
    } else {
        Ok(())
    }
}

/// In-memory [`ExecutionStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<Mutex<HashMap<String, PipelineState>>>,
    stages: Arc<Mutex<HashMap<String, Vec<StageExecution>>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored executions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executions.lock().len()
    }

    /// Returns true if no executions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executions.lock().is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, state: &PipelineState) -> Result<(), PersistenceError> {
        check_failing(&self.failing)?;
        let mut executions = self.executions.lock();
        if executions.contains_key(&state.execution_id) {
            return Err(PersistenceError::Conflict(state.execution_id.clone()));
        }
        executions.insert(state.execution_id.clone(), state.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<PipelineState>, PersistenceError> {
        check_failing(&self.failing)?;
        Ok(self.executions.lock().get(execution_id).cloned())
    }

    async fn update_execution(&self, state: &PipelineState) -> Result<(), PersistenceError> {
        check_failing(&self.failing)?;
        let mut executions = self.executions.lock();
        match executions.get_mut(&state.execution_id) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound(state.execution_id.clone())),
        }
    }

    async fn upsert_stage_execution(
        &self,
        execution_id: &str,
        record: &StageExecution,
    ) -> Result<(), PersistenceError> {
        check_failing(&self.failing)?;
        let mut stages = self.stages.lock();
        let rows = stages.entry(execution_id.to_string()).or_default();
        match rows.iter_mut().find(|r| r.stage_id == record.stage_id) {
            Some(row) => *row = record.clone(),
            None => rows.push(record.clone()),
        }
        rows.sort_by_key(|r| r.stage_index);
        Ok(())
    }

    async fn list_stage_executions(&self, execution_id: &str) -> Result<Vec<StageExecution>, PersistenceError> {
        check_failing(&self.failing)?;
        Ok(self.stages.lock().get(execution_id).cloned().unwrap_or_default())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ExecutionPage, PersistenceError> {
        check_failing(&self.failing)?;
        let mut matching: Vec<PipelineState> = self
            .executions
            .lock()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });

        let start = match cursor {
            Some(c) => {
                matching
                    .iter()
                    .position(|s| s.execution_id == c)
                    .ok_or_else(|| PersistenceError::NotFound(format!("cursor {c}")))?
                    + 1
            }
            None => 0,
        };

        let limit = limit.max(1);
        let items: Vec<PipelineState> = matching.iter().skip(start).take(limit).cloned().collect();
        let next_cursor = if start + items.len() < matching.len() {
            items.last().map(|s| s.execution_id.clone())
        } else {
            None
        };

        Ok(ExecutionPage { items, next_cursor })
    }
}

/// In-memory [`CheckpointStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<Mutex<HashMap<(String, String), Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    /// Returns true if no checkpoints are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let key = (checkpoint.execution_id.clone(), checkpoint.stage_id.clone());
        self.checkpoints.lock().insert(key, checkpoint.clone());
        Ok(())
    }

    async fn get_latest_checkpoint(&self, execution_id: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        Ok(self
            .checkpoints
            .lock()
            .values()
            .filter(|c| c.execution_id == execution_id)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.stage_index.cmp(&b.stage_index))
            })
            .cloned())
    }

    async fn get_checkpoint_at_stage(
        &self,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<Option<Checkpoint>, PersistenceError> {
        let key = (execution_id.to_string(), stage_id.to_string());
        Ok(self.checkpoints.lock().get(&key).cloned())
    }

    async fn delete_checkpoints(&self, execution_id: &str) -> Result<usize, PersistenceError> {
        let mut checkpoints = self.checkpoints.lock();
        let before = checkpoints.len();
        checkpoints.retain(|(exec, _), _| exec != execution_id);
        Ok(before - checkpoints.len())
    }
}

/// In-memory [`LockTable`]. Shared clones see the same rows, so two
/// lock managers over one table behave like two processes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockTable {
    rows: Arc<Mutex<HashMap<String, DistributedLock>>>,
}

impl InMemoryLockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl LockTable for InMemoryLockTable {
    async fn insert_if_absent(&self, lock: &DistributedLock) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&lock.resource_id) {
            return Ok(false);
        }
        rows.insert(lock.resource_id.clone(), lock.clone());
        Ok(true)
    }

    async fn get(&self, resource_id: &str) -> Result<Option<DistributedLock>, PersistenceError> {
        Ok(self.rows.lock().get(resource_id).cloned())
    }

    async fn update_expiry_if_owner(
        &self,
        resource_id: &str,
        owner_id: &str,
        expires_at_ms: u64,
    ) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(resource_id) {
            Some(row) if row.owner_id == owner_id => {
                row.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, resource_id: &str, owner_id: &str) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock();
        if rows.get(resource_id).is_some_and(|r| r.owner_id == owner_id) {
            rows.remove(resource_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete_expired(&self, now_ms: u64) -> Result<usize, PersistenceError> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| !row.is_expired(now_ms));
        Ok(before - rows.len())
    }
}

/// In-memory [`MetricsStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsStore {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    metrics: Arc<Mutex<HashMap<String, ExecutionMetrics>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryMetricsStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Logged events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    /// Stored metrics of one execution.
    #[must_use]
    pub fn metrics_for(&self, execution_id: &str) -> Option<ExecutionMetrics> {
        self.metrics.lock().get(execution_id).cloned()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn append_event(&self, event: &PipelineEvent) -> Result<(), PersistenceError> {
        check_failing(&self.failing)?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn save_metrics(&self, metrics: &ExecutionMetrics) -> Result<(), PersistenceError> {
        check_failing(&self.failing)?;
        self.metrics
            .lock()
            .insert(metrics.execution_id.clone(), metrics.clone());
        Ok(())
    }

    async fn list_metrics_since(
        &self,
        since: Timestamp,
        pipeline_type: Option<&str>,
    ) -> Result<Vec<ExecutionMetrics>, PersistenceError> {
        let mut items: Vec<ExecutionMetrics> = self
            .metrics
            .lock()
            .values()
            .filter(|m| m.started_at >= since)
            .filter(|m| pipeline_type.map_or(true, |t| m.pipeline_type == t))
            .cloned()
            .collect();
        items.sort_by_key(|m| m.started_at);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::StageTarget;
    use crate::core::PipelineStatus;
    use pretty_assertions::assert_eq;

    fn state(id: &str, novel: &str) -> PipelineState {
        PipelineState::new(
            id,
            "chapter",
            StageTarget::novel(novel),
            serde_json::Value::Null,
            PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let store = InMemoryExecutionStore::new();
        store.create_execution(&state("e1", "n1")).await.unwrap();
        let err = store.create_execution(&state("e1", "n1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_requires_existing() {
        let store = InMemoryExecutionStore::new();
        let err = store.update_execution(&state("e1", "n1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stage_rows_upsert_by_stage() {
        let store = InMemoryExecutionStore::new();
        let mut row = StageExecution::new("draft", "Draft", 1, serde_json::Value::Null);
        store.upsert_stage_execution("e1", &row).await.unwrap();
        row.retry_count = 2;
        store.upsert_stage_execution("e1", &row).await.unwrap();
        store
            .upsert_stage_execution("e1", &StageExecution::new("outline", "Outline", 0, serde_json::Value::Null))
            .await
            .unwrap();

        let rows = store.list_stage_executions("e1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stage_id, "outline");
        assert_eq!(rows[1].retry_count, 2);
    }

    #[tokio::test]
    async fn test_list_paginates_with_cursor() {
        let store = InMemoryExecutionStore::new();
        for i in 0..5 {
            store.create_execution(&state(&format!("e{i}"), "n1")).await.unwrap();
        }
        let mut other = state("x", "n2");
        other.status = PipelineStatus::Running;
        store.create_execution(&other).await.unwrap();

        let filter = ExecutionFilter::new().novel("n1");
        let first = store.list_executions(&filter, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();

        let second = store.list_executions(&filter, Some(&cursor), 2).await.unwrap();
        let third = store
            .list_executions(&filter, second.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());

        let mut seen: Vec<String> = first
            .items
            .iter()
            .chain(&second.items)
            .chain(&third.items)
            .map(|s| s.execution_id.clone())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["e0", "e1", "e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = InMemoryExecutionStore::new();
        store.set_failing(true);
        assert!(store.get_execution("e1").await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_and_latest() {
        let store = InMemoryCheckpointStore::new();
        let first = Checkpoint::new("e1", "outline", 0, state("e1", "n1"));
        let second = Checkpoint::new("e1", "draft", 1, state("e1", "n1"));
        store.upsert_checkpoint(&first).await.unwrap();
        store.upsert_checkpoint(&second).await.unwrap();
        store
            .upsert_checkpoint(&Checkpoint::new("e1", "draft", 1, state("e1", "n1")).with_recovery_hint("again"))
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        let latest = store.get_latest_checkpoint("e1").await.unwrap().unwrap();
        assert_eq!(latest.stage_id, "draft");
        assert_eq!(latest.recovery_hint.as_deref(), Some("again"));
        assert!(store.get_checkpoint_at_stage("e1", "outline").await.unwrap().is_some());

        assert_eq!(store.delete_checkpoints("e1").await.unwrap(), 2);
        assert!(store.get_latest_checkpoint("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_table_ownership() {
        let table = InMemoryLockTable::new();
        assert!(table.insert_if_absent(&DistributedLock::new("r", "a", 0, 100)).await.unwrap());
        assert!(!table.insert_if_absent(&DistributedLock::new("r", "b", 0, 100)).await.unwrap());

        assert!(!table.update_expiry_if_owner("r", "b", 500).await.unwrap());
        assert!(table.update_expiry_if_owner("r", "a", 500).await.unwrap());
        assert!(!table.delete_if_owner("r", "b").await.unwrap());

        assert_eq!(table.delete_expired(499).await.unwrap(), 0);
        assert_eq!(table.delete_expired(500).await.unwrap(), 1);
        assert!(table.is_empty());
    }
}
