//! Persisted execution records.

use crate::config::PipelineConfig;
use crate::context::{PipelineContext, StageTarget};
use crate::core::{PipelineStatus, StageMetrics, StageStatus};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// One stage attempt-group inside an execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// Stage id.
    pub stage_id: String,
    /// Stage display name.
    pub stage_name: String,
    /// Position of the stage in the pipeline.
    pub stage_index: usize,
    /// Current status.
    pub status: StageStatus,
    /// Input snapshot.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Output snapshot once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retries used.
    #[serde(default)]
    pub retry_count: u32,
    /// When the stage began.
    pub started_at: Timestamp,
    /// When the stage resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Wall time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Metrics reported by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageMetrics>,
}

impl StageExecution {
    /// Creates a pending record.
    pub fn new(
        stage_id: impl Into<String>,
        stage_name: impl Into<String>,
        stage_index: usize,
        input: serde_json::Value,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            stage_name: stage_name.into(),
            stage_index,
            status: StageStatus::Pending,
            input,
            output: None,
            error: None,
            retry_count: 0,
            started_at: now_utc(),
            completed_at: None,
            duration_ms: None,
            metrics: None,
        }
    }
}

/// Authoritative state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution id.
    pub execution_id: String,
    /// Pipeline type.
    pub pipeline_type: String,
    /// Target ids.
    pub target: StageTarget,
    /// Stage currently running (or last run).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage_id: Option<String>,
    /// Index of `current_stage_id`.
    #[serde(default)]
    pub current_stage_index: usize,
    /// Lifecycle status.
    pub status: PipelineStatus,
    /// Original execution input, fed to every stage.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Accumulated context.
    #[serde(default)]
    pub context: PipelineContext,
    /// Stage history in execution order.
    #[serde(default)]
    pub history: Vec<StageExecution>,
    /// Effective configuration.
    #[serde(default)]
    pub config: PipelineConfig,
    /// Latest checkpoint taken for this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// When the record was created.
    pub created_at: Timestamp,
    /// Last mutation.
    pub updated_at: Timestamp,
    /// When the run first started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Total wall time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineState {
    /// Creates a pending state.
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_type: impl Into<String>,
        target: StageTarget,
        input: serde_json::Value,
        config: PipelineConfig,
    ) -> Self {
        let now = now_utc();
        Self {
            execution_id: execution_id.into(),
            pipeline_type: pipeline_type.into(),
            target,
            current_stage_id: None,
            current_stage_index: 0,
            status: PipelineStatus::Pending,
            input,
            context: PipelineContext::default(),
            history: Vec::new(),
            config,
            checkpoint_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Index of the first stage a resumed run should execute.
    ///
    /// A stage that resolved successfully is not re-run.
    #[must_use]
    pub fn resume_index(&self) -> usize {
        match self.history.last() {
            Some(last)
                if last.stage_index == self.current_stage_index && last.status.is_success() =>
            {
                self.current_stage_index + 1
            }
            _ => self.current_stage_index,
        }
    }

    /// The most recent history entry for a stage.
    #[must_use]
    pub fn stage_execution(&self, stage_id: &str) -> Option<&StageExecution> {
        self.history.iter().rev().find(|e| e.stage_id == stage_id)
    }

    /// Number of completed or skipped stages.
    #[must_use]
    pub fn completed_stages(&self) -> usize {
        self.history.iter().filter(|e| e.status.is_success()).count()
    }

    /// Stamps `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state_with(history: Vec<(usize, StageStatus)>, current: usize) -> PipelineState {
        let mut state = PipelineState::new(
            "exec-1",
            "chapter",
            StageTarget::novel("n1"),
            serde_json::Value::Null,
            PipelineConfig::default(),
        );
        state.current_stage_index = current;
        state.history = history
            .into_iter()
            .map(|(index, status)| {
                let mut exec = StageExecution::new(format!("s{index}"), "stage", index, serde_json::Value::Null);
                exec.status = status;
                exec
            })
            .collect();
        state
    }

    #[test]
    fn test_resume_index_skips_completed_stage() {
        let state = state_with(vec![(0, StageStatus::Completed), (1, StageStatus::Completed)], 1);
        assert_eq!(state.resume_index(), 2);
    }

    #[test]
    fn test_resume_index_reruns_failed_stage() {
        let state = state_with(vec![(0, StageStatus::Completed), (1, StageStatus::Failed)], 1);
        assert_eq!(state.resume_index(), 1);
        assert_eq!(state.completed_stages(), 1);
    }

    #[test]
    fn test_resume_index_fresh_state() {
        let state = state_with(vec![], 0);
        assert_eq!(state.resume_index(), 0);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let state = state_with(vec![(0, StageStatus::Completed)], 0);
        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
