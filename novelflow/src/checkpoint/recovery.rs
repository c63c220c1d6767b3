//! Rebuilding executions from checkpoints.

use super::{CheckpointManager, ExecutionPersistence};
use crate::core::PipelineStatus;
use crate::errors::NovelflowError;
use crate::state::PipelineState;
use tracing::info;

/// Decides whether an execution can resume and rebuilds its state.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    executions: ExecutionPersistence,
    checkpoints: CheckpointManager,
}

impl RecoveryManager {
    /// Creates a recovery manager.
    pub fn new(executions: ExecutionPersistence, checkpoints: CheckpointManager) -> Self {
        Self {
            executions,
            checkpoints,
        }
    }

    /// True if the stored status is failed or paused and a checkpoint exists.
    pub async fn can_recover(&self, execution_id: &str) -> Result<bool, NovelflowError> {
        let Some(state) = self.executions.load(execution_id).await? else {
            return Ok(false);
        };
        if !state.status.is_resumable() {
            return Ok(false);
        }
        Ok(self.checkpoints.get_latest(execution_id).await?.is_some())
    }

    /// Rebuilds the state captured by the latest checkpoint, reset to pending.
    pub async fn prepare_recovery(&self, execution_id: &str) -> Result<PipelineState, NovelflowError> {
        let stored = self.executions.require(execution_id).await?;
        if !stored.status.is_resumable() {
            return Err(NovelflowError::NotRecoverable {
                execution_id: execution_id.to_string(),
                reason: format!("status is {}", stored.status),
            });
        }

        let checkpoint = self
            .checkpoints
            .get_latest(execution_id)
            .await?
            .ok_or_else(|| NovelflowError::NotRecoverable {
                execution_id: execution_id.to_string(),
                reason: "no checkpoint".to_string(),
            })?;

        let mut state = checkpoint.state;
        state.status = PipelineStatus::Pending;
        state.error = None;
        state.completed_at = None;
        state.duration_ms = None;
        state.checkpoint_id = Some(checkpoint.id);
        state.touch();

        info!(
            execution_id,
            stage_index = checkpoint.stage_index,
            resume_index = state.resume_index(),
            "Prepared recovery"
        );
        Ok(state)
    }
}
