//! Canonical execution records.

use crate::core::PipelineStatus;
use crate::errors::NovelflowError;
use crate::persistence::{ExecutionFilter, ExecutionPage, ExecutionStore};
use crate::state::{PipelineState, StageExecution};
use crate::utils::now_utc;
use std::sync::Arc;

/// Owns the execution record and its stage-history rows.
///
/// The record is authoritative for status and history queries; checkpoints
/// only exist to resume.
#[derive(Clone)]
pub struct ExecutionPersistence {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionPersistence {
    /// Creates persistence over `store`.
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Inserts a new record.
    pub async fn create(&self, state: &PipelineState) -> Result<(), NovelflowError> {
        Ok(self.store.create_execution(state).await?)
    }

    /// Reads a record.
    pub async fn load(&self, execution_id: &str) -> Result<Option<PipelineState>, NovelflowError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Reads a record, failing if absent.
    pub async fn require(&self, execution_id: &str) -> Result<PipelineState, NovelflowError> {
        self.load(execution_id)
            .await?
            .ok_or_else(|| NovelflowError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Overwrites the record and the row of its latest stage.
    pub async fn save(&self, state: &PipelineState) -> Result<(), NovelflowError> {
        self.store.update_execution(state).await?;
        if let Some(last) = state.history.last() {
            self.store
                .upsert_stage_execution(&state.execution_id, last)
                .await?;
        }
        Ok(())
    }

    /// Writes one stage row.
    pub async fn record_stage(&self, execution_id: &str, record: &StageExecution) -> Result<(), NovelflowError> {
        Ok(self.store.upsert_stage_execution(execution_id, record).await?)
    }

    /// Stage rows of an execution.
    pub async fn stage_history(&self, execution_id: &str) -> Result<Vec<StageExecution>, NovelflowError> {
        Ok(self.store.list_stage_executions(execution_id).await?)
    }

    /// Sets the status of a stored record outside a running engine loop.
    pub async fn update_status(
        &self,
        execution_id: &str,
        status: PipelineStatus,
        error: Option<String>,
    ) -> Result<PipelineState, NovelflowError> {
        let mut state = self.require(execution_id).await?;
        state.status = status;
        if error.is_some() {
            state.error = error;
        }
        if status.is_terminal() && state.completed_at.is_none() {
            state.completed_at = Some(now_utc());
        }
        state.touch();
        self.store.update_execution(&state).await?;
        Ok(state)
    }

    /// Lists records matching `filter`.
    pub async fn list(
        &self,
        filter: &ExecutionFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ExecutionPage, NovelflowError> {
        Ok(self.store.list_executions(filter, cursor, limit).await?)
    }
}

impl std::fmt::Debug for ExecutionPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPersistence").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::StageTarget;
    use crate::persistence::InMemoryExecutionStore;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_writes_latest_stage_row() {
        let persistence = ExecutionPersistence::new(Arc::new(InMemoryExecutionStore::new()));
        let mut state = PipelineState::new(
            "e1",
            "chapter",
            StageTarget::novel("n1"),
            serde_json::Value::Null,
            PipelineConfig::default(),
        );
        persistence.create(&state).await.unwrap();

        state
            .history
            .push(StageExecution::new("outline", "Outline", 0, serde_json::Value::Null));
        persistence.save(&state).await.unwrap();

        let rows = persistence.stage_history("e1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(persistence.require("e1").await.unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_and_missing() {
        let persistence = ExecutionPersistence::new(Arc::new(InMemoryExecutionStore::new()));
        let state = PipelineState::new(
            "e1",
            "chapter",
            StageTarget::novel("n1"),
            serde_json::Value::Null,
            PipelineConfig::default(),
        );
        persistence.create(&state).await.unwrap();

        let updated = persistence
            .update_status("e1", PipelineStatus::Cancelled, Some("user".into()))
            .await
            .unwrap();
        assert_eq!(updated.status, PipelineStatus::Cancelled);
        assert!(updated.completed_at.is_some());

        let err = persistence.require("missing").await.unwrap_err();
        assert!(matches!(err, NovelflowError::ExecutionNotFound(_)));
    }
}
