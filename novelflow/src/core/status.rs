//! Pipeline status, stage status and stage category enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs in a novel pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCategory {
    /// World, character and premise setup.
    Setup,
    /// Outline creation or expansion.
    Outline,
    /// Text generation (chapter drafting).
    #[default]
    Generation,
    /// Quality review and scoring.
    Review,
    /// Final assembly and polishing.
    Finalize,
    /// Anything else (bookkeeping, notifications).
    Utility,
}

impl fmt::Display for StageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Outline => write!(f, "outline"),
            Self::Generation => write!(f, "generation"),
            Self::Review => write!(f, "review"),
            Self::Finalize => write!(f, "finalize"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

/// The status of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, not yet started.
    #[default]
    Pending,
    /// Stages are being executed.
    Running,
    /// Suspended by request; resumable.
    Paused,
    /// All stages finished.
    Completed,
    /// A stage failed or the lease was lost.
    Failed,
    /// Stopped by request.
    Cancelled,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PipelineStatus {
    /// Returns true if no further stages will run without an explicit resume.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a checkpoint-based resume is allowed from this status.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::Paused)
    }
}

/// The status of a single stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not started.
    #[default]
    Pending,
    /// In progress (including retries).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Skipped by an error handler or a healing decision.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the stage counts as done for resumption purposes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_status_display() {
        assert_eq!(PipelineStatus::Running.to_string(), "running");
        assert_eq!(PipelineStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_pipeline_status_terminal() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(!PipelineStatus::Paused.is_terminal());
        assert!(PipelineStatus::Paused.is_resumable());
        assert!(!PipelineStatus::Completed.is_resumable());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Skipped).unwrap();
        assert_eq!(json, r#""skipped""#);

        let back: StageStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageStatus::Skipped);
    }

    #[test]
    fn test_stage_category_default() {
        assert_eq!(StageCategory::default(), StageCategory::Generation);
        assert_eq!(StageCategory::Review.to_string(), "review");
    }
}
