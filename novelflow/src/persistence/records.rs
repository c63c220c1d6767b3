//! Persisted record types.

use crate::core::PipelineStatus;
use crate::state::PipelineState;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// Snapshot of an execution taken at a stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id.
    pub id: String,
    /// Execution the checkpoint belongs to.
    pub execution_id: String,
    /// Stage after which it was taken.
    pub stage_id: String,
    /// Index of that stage.
    pub stage_index: usize,
    /// When it was taken.
    pub created_at: Timestamp,
    /// Full state copy, without its own `checkpoint_id`.
    pub state: PipelineState,
    /// Output produced so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<serde_json::Value>,
    /// Free-form hint for whoever resumes the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_hint: Option<String>,
}

impl Checkpoint {
    /// Builds a checkpoint from a state copy.
    pub fn new(
        execution_id: impl Into<String>,
        stage_id: impl Into<String>,
        stage_index: usize,
        mut state: PipelineState,
    ) -> Self {
        state.checkpoint_id = None;
        Self {
            id: generate_id(),
            execution_id: execution_id.into(),
            stage_id: stage_id.into(),
            stage_index,
            created_at: now_utc(),
            state,
            partial_output: None,
            recovery_hint: None,
        }
    }

    /// Attaches partial output.
    #[must_use]
    pub fn with_partial_output(mut self, output: serde_json::Value) -> Self {
        self.partial_output = Some(output);
        self
    }

    /// Attaches a recovery hint.
    #[must_use]
    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }
}

/// A lease on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    /// Lock id.
    pub id: String,
    /// Locked resource (unique per table).
    pub resource_id: String,
    /// Owning process instance.
    pub owner_id: String,
    /// Unix milliseconds after which the lease is void.
    pub expires_at_ms: u64,
    /// Unix milliseconds of acquisition.
    pub acquired_at_ms: u64,
}

impl DistributedLock {
    /// Creates a lease starting at `now_ms`.
    pub fn new(resource_id: impl Into<String>, owner_id: impl Into<String>, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            id: generate_id(),
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            acquired_at_ms: now_ms,
        }
    }

    /// Whether the lease has lapsed at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Filter for listing executions. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    /// Novel id.
    pub novel_id: Option<String>,
    /// Chapter id.
    pub chapter_id: Option<String>,
    /// Status.
    pub status: Option<PipelineStatus>,
    /// Pipeline type.
    pub pipeline_type: Option<String>,
}

impl ExecutionFilter {
    /// Matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one novel.
    #[must_use]
    pub fn novel(mut self, novel_id: impl Into<String>) -> Self {
        self.novel_id = Some(novel_id.into());
        self
    }

    /// Restricts to one chapter.
    #[must_use]
    pub fn chapter(mut self, chapter_id: impl Into<String>) -> Self {
        self.chapter_id = Some(chapter_id.into());
        self
    }

    /// Restricts to one status.
    #[must_use]
    pub fn status(mut self, status: PipelineStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to one pipeline type.
    #[must_use]
    pub fn pipeline_type(mut self, pipeline_type: impl Into<String>) -> Self {
        self.pipeline_type = Some(pipeline_type.into());
        self
    }

    /// Whether `state` passes the filter.
    #[must_use]
    pub fn matches(&self, state: &PipelineState) -> bool {
        fn field_matches(want: Option<&String>, have: Option<&String>) -> bool {
            want.map_or(true, |w| have == Some(w))
        }

        field_matches(self.novel_id.as_ref(), state.target.novel_id.as_ref())
            && field_matches(self.chapter_id.as_ref(), state.target.chapter_id.as_ref())
            && self.status.map_or(true, |s| s == state.status)
            && field_matches(self.pipeline_type.as_ref(), Some(&state.pipeline_type))
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPage {
    /// Matching executions.
    pub items: Vec<PipelineState>,
    /// Cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}
