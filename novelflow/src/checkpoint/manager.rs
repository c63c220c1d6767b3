//! Checkpoint manager.

use crate::errors::NovelflowError;
use crate::persistence::{Checkpoint, CheckpointStore};
use crate::state::PipelineState;
use std::sync::Arc;
use tracing::debug;

/// Saves and loads checkpoints keyed by `(execution, stage)`.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    /// Creates a manager over `store`.
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Upserts the checkpoint for `(execution_id, stage_id)`.
    ///
    /// Saving twice at the same stage replaces the earlier checkpoint.
    pub async fn save(
        &self,
        execution_id: &str,
        stage_id: &str,
        stage_index: usize,
        state: &PipelineState,
        partial_output: Option<serde_json::Value>,
        hint: Option<String>,
    ) -> Result<Checkpoint, NovelflowError> {
        let mut checkpoint = Checkpoint::new(execution_id, stage_id, stage_index, state.clone());
        checkpoint.partial_output = partial_output;
        checkpoint.recovery_hint = hint;

        self.store.upsert_checkpoint(&checkpoint).await?;
        debug!(execution_id, stage_id, stage_index, checkpoint_id = %checkpoint.id, "Checkpoint saved");
        Ok(checkpoint)
    }

    /// Most recent checkpoint of an execution.
    pub async fn get_latest(&self, execution_id: &str) -> Result<Option<Checkpoint>, NovelflowError> {
        Ok(self.store.get_latest_checkpoint(execution_id).await?)
    }

    /// Checkpoint taken at `stage_id`.
    pub async fn get_at_stage(
        &self,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<Option<Checkpoint>, NovelflowError> {
        Ok(self.store.get_checkpoint_at_stage(execution_id, stage_id).await?)
    }

    /// Deletes every checkpoint of an execution.
    pub async fn cleanup(&self, execution_id: &str) -> Result<usize, NovelflowError> {
        let removed = self.store.delete_checkpoints(execution_id).await?;
        debug!(execution_id, removed, "Checkpoints cleaned up");
        Ok(removed)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}
