//! Pipeline lifecycle events.
//!
//! One channel, many event shapes: every notification the engine emits is a
//! [`PipelineEvent`] whose [`PipelineEventKind`] is a closed enum, so
//! consumers handle each shape exhaustively.

use super::{StageMetrics, TokenUsage};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// A timestamped notification about one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The execution the event belongs to.
    pub execution_id: String,
    /// The pipeline type of the execution.
    pub pipeline_type: String,
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// The event payload.
    pub kind: PipelineEventKind,
}

impl PipelineEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_type: impl Into<String>,
        kind: PipelineEventKind,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            pipeline_type: pipeline_type.into(),
            timestamp: now_utc(),
            kind,
        }
    }

    /// Returns the wire name of the event (e.g. `"stage:started"`).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Returns true for events after which no further events are emitted
    /// for the execution.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// The discriminated payload of a [`PipelineEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// The run began (fresh start).
    PipelineStarted {
        /// Number of declared stages.
        total_stages: usize,
        /// Target resource of the run.
        resource_id: String,
    },
    /// The run began from a recovered state.
    PipelineResumed {
        /// Index of the first stage that will run.
        from_stage_index: usize,
    },
    /// The run was paused.
    PipelinePaused,
    /// The run was cancelled.
    PipelineCancelled {
        /// Cancellation reason.
        reason: String,
    },
    /// All stages finished.
    PipelineCompleted {
        /// Total wall time.
        duration_ms: u64,
    },
    /// The run failed.
    PipelineFailed {
        /// Human-readable failure.
        error: String,
        /// Stage that failed, if the failure is stage-scoped.
        failed_stage_id: Option<String>,
        /// Index of that stage.
        failed_stage_index: Option<usize>,
        /// Whether a checkpoint-based resume is possible.
        recoverable: bool,
    },
    /// A stage began.
    StageStarted {
        /// Stage id.
        stage_id: String,
        /// Stage position in the pipeline.
        stage_index: usize,
        /// Display name.
        stage_name: String,
    },
    /// A stage reported progress.
    StageProgress {
        /// Stage id.
        stage_id: String,
        /// Fraction complete, 0.0 to 1.0.
        progress: f64,
        /// Optional status line.
        message: Option<String>,
    },
    /// A stage attempt failed and will be retried.
    StageRetry {
        /// Stage id.
        stage_id: String,
        /// The retry about to run (1-based).
        attempt: u32,
        /// Backoff before the retry.
        delay_ms: u64,
        /// The error that triggered it.
        error: String,
    },
    /// A stage finished successfully.
    StageCompleted {
        /// Stage id.
        stage_id: String,
        /// Stage position.
        stage_index: usize,
        /// Stage wall time including retries.
        duration_ms: u64,
        /// Retries performed.
        retry_count: u32,
        /// Metrics reported by the stage.
        metrics: Option<StageMetrics>,
    },
    /// A stage failed for good.
    StageFailed {
        /// Stage id.
        stage_id: String,
        /// Stage position.
        stage_index: usize,
        /// Final error.
        error: String,
        /// Retries performed.
        retry_count: u32,
        /// Stage wall time including retries.
        duration_ms: u64,
    },
    /// A stage was skipped.
    StageSkipped {
        /// Stage id.
        stage_id: String,
        /// Stage position.
        stage_index: usize,
        /// Why it was skipped.
        reason: String,
    },
    /// A checkpoint was written.
    CheckpointSaved {
        /// Stage the checkpoint was taken at.
        stage_id: String,
        /// Stage position.
        stage_index: usize,
    },
    /// A generation call streamed a chunk.
    TokenGenerated {
        /// Stage id.
        stage_id: String,
        /// The chunk.
        token: String,
        /// Running usage, if known.
        usage: Option<TokenUsage>,
    },
    /// The self-healing layer chose an action.
    HealingAttempted {
        /// Stage id.
        stage_id: String,
        /// Attempt number for this execution.
        attempt: u32,
        /// Error classification.
        category: String,
        /// Chosen action, as a short label.
        action: String,
    },
    /// The resource lease could not be renewed.
    LockLost {
        /// The resource whose lease was lost.
        resource_id: String,
    },
}

impl PipelineEventKind {
    /// Returns the wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline:started",
            Self::PipelineResumed { .. } => "pipeline:resumed",
            Self::PipelinePaused => "pipeline:paused",
            Self::PipelineCancelled { .. } => "pipeline:cancelled",
            Self::PipelineCompleted { .. } => "pipeline:completed",
            Self::PipelineFailed { .. } => "pipeline:failed",
            Self::StageStarted { .. } => "stage:started",
            Self::StageProgress { .. } => "stage:progress",
            Self::StageRetry { .. } => "stage:retry",
            Self::StageCompleted { .. } => "stage:completed",
            Self::StageFailed { .. } => "stage:failed",
            Self::StageSkipped { .. } => "stage:skipped",
            Self::CheckpointSaved { .. } => "checkpoint:saved",
            Self::TokenGenerated { .. } => "token:generated",
            Self::HealingAttempted { .. } => "healing:attempted",
            Self::LockLost { .. } => "lock:lost",
        }
    }

    /// Returns true for completed/failed/cancelled/paused.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PipelineCompleted { .. }
                | Self::PipelineFailed { .. }
                | Self::PipelineCancelled { .. }
                | Self::PipelinePaused
        )
    }

    /// Returns the stage id for stage-scoped events.
    #[must_use]
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage_id, .. }
            | Self::StageProgress { stage_id, .. }
            | Self::StageRetry { stage_id, .. }
            | Self::StageCompleted { stage_id, .. }
            | Self::StageFailed { stage_id, .. }
            | Self::StageSkipped { stage_id, .. }
            | Self::CheckpointSaved { stage_id, .. }
            | Self::TokenGenerated { stage_id, .. }
            | Self::HealingAttempted { stage_id, .. } => Some(stage_id),
            Self::PipelineFailed {
                failed_stage_id, ..
            } => failed_stage_id.as_deref(),
            Self::PipelineStarted { .. }
            | Self::PipelineResumed { .. }
            | Self::PipelinePaused
            | Self::PipelineCancelled { .. }
            | Self::PipelineCompleted { .. }
            | Self::LockLost { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let started = PipelineEventKind::StageStarted {
            stage_id: "draft".into(),
            stage_index: 0,
            stage_name: "Draft".into(),
        };
        assert_eq!(started.name(), "stage:started");
        assert_eq!(started.stage_id(), Some("draft"));
        assert!(!started.is_terminal());

        let failed = PipelineEventKind::PipelineFailed {
            error: "boom".into(),
            failed_stage_id: Some("review".into()),
            failed_stage_index: Some(1),
            recoverable: true,
        };
        assert_eq!(failed.name(), "pipeline:failed");
        assert!(failed.is_terminal());
        assert_eq!(failed.stage_id(), Some("review"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = PipelineEvent::new(
            "exec-1",
            "chapter",
            PipelineEventKind::PipelineCompleted { duration_ms: 42 },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "pipeline_completed");
        assert_eq!(json["kind"]["duration_ms"], 42);

        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
