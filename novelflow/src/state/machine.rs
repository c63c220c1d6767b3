//! Table-driven state machine for executions and stages.
//!
//! Transitions are looked up in static `(from, event, to)` tables. An event
//! missing from the table is rejected: the call returns `false` and the
//! state is left untouched. The machine never persists anything itself.

use super::{PipelineState, StageExecution};
use crate::context::{ContextUpdate, PipelineContext};
use crate::core::{PipelineStatus, StageMetrics, StageStatus};
use crate::errors::NovelflowError;
use crate::utils::{elapsed_ms, now_utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events that move an execution between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineTransition {
    /// pending -> running
    Start,
    /// running -> paused
    Pause,
    /// paused -> running
    Resume,
    /// running -> completed
    Complete,
    /// running -> failed
    Fail,
    /// running | paused -> cancelled
    Cancel,
    /// failed -> running
    Recover,
}

impl fmt::Display for PipelineTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Cancel => "CANCEL",
            Self::Recover => "RECOVER",
        };
        f.write_str(name)
    }
}

/// Events that move a stage between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageTransition {
    /// pending -> running
    Start,
    /// running -> completed
    Complete,
    /// running -> failed
    Fail,
    /// pending | running -> skipped
    Skip,
    /// failed -> running
    Retry,
}

const PIPELINE_TABLE: &[(PipelineStatus, PipelineTransition, PipelineStatus)] = &[
    (PipelineStatus::Pending, PipelineTransition::Start, PipelineStatus::Running),
    (PipelineStatus::Running, PipelineTransition::Pause, PipelineStatus::Paused),
    (PipelineStatus::Running, PipelineTransition::Complete, PipelineStatus::Completed),
    (PipelineStatus::Running, PipelineTransition::Fail, PipelineStatus::Failed),
    (PipelineStatus::Running, PipelineTransition::Cancel, PipelineStatus::Cancelled),
    (PipelineStatus::Paused, PipelineTransition::Resume, PipelineStatus::Running),
    (PipelineStatus::Paused, PipelineTransition::Cancel, PipelineStatus::Cancelled),
    (PipelineStatus::Failed, PipelineTransition::Recover, PipelineStatus::Running),
];

const STAGE_TABLE: &[(StageStatus, StageTransition, StageStatus)] = &[
    (StageStatus::Pending, StageTransition::Start, StageStatus::Running),
    (StageStatus::Pending, StageTransition::Skip, StageStatus::Skipped),
    (StageStatus::Running, StageTransition::Complete, StageStatus::Completed),
    (StageStatus::Running, StageTransition::Fail, StageStatus::Failed),
    (StageStatus::Running, StageTransition::Skip, StageStatus::Skipped),
    (StageStatus::Failed, StageTransition::Retry, StageStatus::Running),
];

/// Looks up the target status of an execution transition.
#[must_use]
pub fn pipeline_transition(from: PipelineStatus, event: PipelineTransition) -> Option<PipelineStatus> {
    PIPELINE_TABLE
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// Looks up the target status of a stage transition.
#[must_use]
pub fn stage_transition(from: StageStatus, event: StageTransition) -> Option<StageStatus> {
    STAGE_TABLE
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// In-memory state machine wrapping one [`PipelineState`].
#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    state: PipelineState,
}

impl PipelineStateMachine {
    /// Wraps a state.
    #[must_use]
    pub fn new(state: PipelineState) -> Self {
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Unwraps the state.
    pub fn into_state(self) -> PipelineState {
        self.state
    }

    /// Current status.
    pub fn status(&self) -> PipelineStatus {
        self.state.status
    }

    /// Whether `event` is allowed from the current status.
    pub fn can(&self, event: PipelineTransition) -> bool {
        pipeline_transition(self.state.status, event).is_some()
    }

    /// Applies `event`. Returns `false` and changes nothing if it is not in the table.
    pub fn transition(&mut self, event: PipelineTransition) -> bool {
        let Some(next) = pipeline_transition(self.state.status, event) else {
            tracing::debug!(
                execution_id = %self.state.execution_id,
                from = %self.state.status,
                event = %event,
                "Rejected pipeline transition"
            );
            return false;
        };

        self.state.status = next;
        match event {
            PipelineTransition::Start if self.state.started_at.is_none() => {
                self.state.started_at = Some(now_utc());
            }
            PipelineTransition::Complete | PipelineTransition::Fail | PipelineTransition::Cancel => {
                self.stamp_completion();
            }
            PipelineTransition::Recover => {
                self.state.error = None;
                self.state.completed_at = None;
                self.state.duration_ms = None;
            }
            _ => {}
        }
        self.state.touch();
        true
    }

    /// Like [`Self::transition`] but reports rejection as an error.
    pub fn try_transition(&mut self, event: PipelineTransition) -> Result<(), NovelflowError> {
        if self.transition(event) {
            Ok(())
        } else {
            Err(NovelflowError::InvalidTransition {
                from: self.state.status.to_string(),
                event: event.to_string(),
            })
        }
    }

    /// pending -> running.
    pub fn start(&mut self) -> bool {
        self.transition(PipelineTransition::Start)
    }

    /// running -> paused.
    pub fn pause(&mut self) -> bool {
        self.transition(PipelineTransition::Pause)
    }

    /// paused -> running.
    pub fn resume(&mut self) -> bool {
        self.transition(PipelineTransition::Resume)
    }

    /// running -> completed.
    pub fn complete(&mut self) -> bool {
        self.transition(PipelineTransition::Complete)
    }

    /// running -> failed, recording `error`.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(PipelineTransition::Fail) {
            return false;
        }
        self.state.error = Some(error.into());
        true
    }

    /// running | paused -> cancelled.
    pub fn cancel(&mut self) -> bool {
        self.transition(PipelineTransition::Cancel)
    }

    /// failed -> running, clearing error and completion fields.
    pub fn recover(&mut self) -> bool {
        self.transition(PipelineTransition::Recover)
    }

    /// Appends a running history entry for a stage and makes it current.
    pub fn begin_stage(
        &mut self,
        stage_id: &str,
        stage_name: &str,
        stage_index: usize,
        input: serde_json::Value,
    ) -> bool {
        let mut record = StageExecution::new(stage_id, stage_name, stage_index, input);
        let Some(next) = stage_transition(record.status, StageTransition::Start) else {
            return false;
        };
        record.status = next;

        self.state.current_stage_id = Some(stage_id.to_string());
        self.state.current_stage_index = stage_index;
        self.state.history.push(record);
        self.state.touch();
        true
    }

    /// Resolves the current stage as completed.
    pub fn complete_stage(
        &mut self,
        output: serde_json::Value,
        retry_count: u32,
        metrics: Option<StageMetrics>,
    ) -> bool {
        self.resolve_stage(StageTransition::Complete, |record| {
            record.output = Some(output);
            record.retry_count = retry_count;
            record.metrics = metrics;
        })
    }

    /// Resolves the current stage as skipped (soft success).
    pub fn skip_stage(&mut self, retry_count: u32) -> bool {
        self.resolve_stage(StageTransition::Skip, |record| {
            record.output = Some(serde_json::Value::Null);
            record.retry_count = retry_count;
        })
    }

    /// Resolves the current stage as failed.
    pub fn fail_stage(&mut self, error: impl Into<String>, retry_count: u32) -> bool {
        let error = error.into();
        self.resolve_stage(StageTransition::Fail, |record| {
            record.error = Some(error);
            record.retry_count = retry_count;
        })
    }

    /// Replaces the context with the merge of `update`.
    pub fn merge_context(&mut self, update: &ContextUpdate) {
        self.state.context = self.state.context.merge(update);
        self.state.touch();
    }

    /// Swaps in a context loaded from elsewhere, keeping the higher version.
    pub fn replace_context(&mut self, context: PipelineContext) {
        if context.version() >= self.state.context.version() {
            self.state.context = context;
        }
        self.state.touch();
    }

    /// Records the latest checkpoint id.
    pub fn set_checkpoint(&mut self, checkpoint_id: impl Into<String>) {
        self.state.checkpoint_id = Some(checkpoint_id.into());
        self.state.touch();
    }

    fn resolve_stage(&mut self, event: StageTransition, apply: impl FnOnce(&mut StageExecution)) -> bool {
        let Some(record) = self.state.history.last_mut() else {
            return false;
        };
        let Some(next) = stage_transition(record.status, event) else {
            return false;
        };

        let now = now_utc();
        record.status = next;
        record.completed_at = Some(now);
        record.duration_ms = Some(elapsed_ms(record.started_at, now));
        apply(record);
        self.state.touch();
        true
    }

    fn stamp_completion(&mut self) {
        let now = now_utc();
        self.state.completed_at = Some(now);
        let started = self.state.started_at.unwrap_or(self.state.created_at);
        self.state.duration_ms = Some(elapsed_ms(started, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::StageTarget;
    use pretty_assertions::assert_eq;

    const ALL_STATUSES: [PipelineStatus; 6] = [
        PipelineStatus::Pending,
        PipelineStatus::Running,
        PipelineStatus::Paused,
        PipelineStatus::Completed,
        PipelineStatus::Failed,
        PipelineStatus::Cancelled,
    ];

    const ALL_EVENTS: [PipelineTransition; 7] = [
        PipelineTransition::Start,
        PipelineTransition::Pause,
        PipelineTransition::Resume,
        PipelineTransition::Complete,
        PipelineTransition::Fail,
        PipelineTransition::Cancel,
        PipelineTransition::Recover,
    ];

    fn machine_in(status: PipelineStatus) -> PipelineStateMachine {
        let mut state = PipelineState::new(
            "exec-1",
            "chapter",
            StageTarget::novel("n1"),
            serde_json::Value::Null,
            PipelineConfig::default(),
        );
        state.status = status;
        PipelineStateMachine::new(state)
    }

    #[test]
    fn test_happy_path() {
        let mut machine = machine_in(PipelineStatus::Pending);
        assert!(machine.start());
        assert!(machine.state().started_at.is_some());
        assert!(machine.complete());
        assert_eq!(machine.status(), PipelineStatus::Completed);
        assert!(machine.state().completed_at.is_some());
        assert!(machine.state().duration_ms.is_some());
    }

    #[test]
    fn test_running_can_cancel() {
        let mut machine = machine_in(PipelineStatus::Running);
        assert!(machine.cancel());
        assert_eq!(machine.status(), PipelineStatus::Cancelled);
    }

    #[test]
    fn test_pairs_outside_table_are_rejected() {
        for from in ALL_STATUSES {
            for event in ALL_EVENTS {
                let allowed = PIPELINE_TABLE.iter().any(|(f, e, _)| *f == from && *e == event);
                let mut machine = machine_in(from);
                let before = machine.state().clone();

                assert_eq!(machine.transition(event), allowed, "{from} on {event}");
                if !allowed {
                    assert_eq!(machine.state(), &before);
                }
            }
        }
    }

    #[test]
    fn test_try_transition_reports_error() {
        let mut machine = machine_in(PipelineStatus::Completed);
        let err = machine.try_transition(PipelineTransition::Start).unwrap_err();
        assert_eq!(err.to_string(), "Invalid transition from 'completed' on 'START'");
    }

    #[test]
    fn test_recover_clears_failure() {
        let mut machine = machine_in(PipelineStatus::Running);
        assert!(machine.fail("503 service unavailable"));
        assert_eq!(machine.state().error.as_deref(), Some("503 service unavailable"));

        assert!(machine.recover());
        assert_eq!(machine.status(), PipelineStatus::Running);
        assert!(machine.state().error.is_none());
        assert!(machine.state().completed_at.is_none());
        assert!(machine.state().duration_ms.is_none());
    }

    #[test]
    fn test_fail_from_pending_leaves_error_unset() {
        let mut machine = machine_in(PipelineStatus::Pending);
        assert!(!machine.fail("nope"));
        assert!(machine.state().error.is_none());
    }

    #[test]
    fn test_stage_lifecycle() {
        let mut machine = machine_in(PipelineStatus::Running);
        assert!(machine.begin_stage("outline", "Outline", 0, serde_json::json!({"n": 1})));
        assert!(machine.complete_stage(serde_json::json!("ok"), 1, None));
        assert!(!machine.complete_stage(serde_json::json!("again"), 1, None));

        assert!(machine.begin_stage("draft", "Draft", 1, serde_json::Value::Null));
        assert!(machine.fail_stage("timeout", 2));

        let history = &machine.state().history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, StageStatus::Completed);
        assert_eq!(history[0].retry_count, 1);
        assert_eq!(history[1].status, StageStatus::Failed);
        assert_eq!(history[1].error.as_deref(), Some("timeout"));
        assert_eq!(machine.state().current_stage_index, 1);
    }

    #[test]
    fn test_stage_table() {
        assert_eq!(
            stage_transition(StageStatus::Failed, StageTransition::Retry),
            Some(StageStatus::Running)
        );
        assert_eq!(stage_transition(StageStatus::Completed, StageTransition::Fail), None);
        assert_eq!(stage_transition(StageStatus::Skipped, StageTransition::Start), None);
    }

    #[test]
    fn test_merge_context_bumps_version() {
        let mut machine = machine_in(PipelineStatus::Running);
        machine.merge_context(&ContextUpdate::new().chapter_content("text"));
        assert_eq!(machine.state().context.version(), 1);
        assert_eq!(machine.state().context.chapter_content(), Some("text"));
    }
}
