//! Per-execution metrics folded from events.

use super::CostTable;
use crate::core::{PipelineEvent, PipelineEventKind, PipelineStatus, StageStatus, TokenUsage};
use crate::utils::{elapsed_ms, Timestamp};
use serde::{Deserialize, Serialize};

/// Metrics of one stage inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetricsEntry {
    /// Stage id.
    pub stage_id: String,
    /// Stage position.
    pub stage_index: usize,
    /// Latest status.
    pub status: StageStatus,
    /// Wall time including retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Retries performed.
    #[serde(default)]
    pub retry_count: u32,
    /// Final error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Accumulated metrics of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Execution id.
    pub execution_id: String,
    /// Pipeline type.
    pub pipeline_type: String,
    /// Latest known status.
    pub status: PipelineStatus,
    /// First event seen.
    pub started_at: Timestamp,
    /// Terminal event time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Latest event seen.
    pub last_event_at: Timestamp,
    /// Total wall time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Declared stage count.
    #[serde(default)]
    pub total_stages: usize,
    /// Stages in the order they started.
    #[serde(default)]
    pub stages: Vec<StageMetricsEntry>,
    /// Token usage summed over stages.
    #[serde(default)]
    pub token_usage: TokenUsage,
    /// Streamed token events.
    #[serde(default)]
    pub tokens_streamed: u64,
    /// Last model reported by a stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Cost reported by stages themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_cost: Option<f64>,
    /// Final cost, set on flush.
    #[serde(default)]
    pub cost: f64,
    /// Failed attempts, including retried ones.
    #[serde(default)]
    pub error_count: u32,
    /// Retries across all stages.
    #[serde(default)]
    pub retry_count: u32,
    /// Self-healing actions taken.
    #[serde(default)]
    pub healing_attempts: u32,
    /// Terminal error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionMetrics {
    /// Starts an accumulator.
    pub fn new(execution_id: impl Into<String>, pipeline_type: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            execution_id: execution_id.into(),
            pipeline_type: pipeline_type.into(),
            status: PipelineStatus::Running,
            started_at,
            completed_at: None,
            last_event_at: started_at,
            duration_ms: None,
            total_stages: 0,
            stages: Vec::new(),
            token_usage: TokenUsage::default(),
            tokens_streamed: 0,
            model: None,
            reported_cost: None,
            cost: 0.0,
            error_count: 0,
            retry_count: 0,
            healing_attempts: 0,
            error: None,
        }
    }

    /// Starts an accumulator from the first event of an execution.
    pub fn from_event(event: &PipelineEvent) -> Self {
        Self::new(&event.execution_id, &event.pipeline_type, event.timestamp)
    }

    fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageMetricsEntry> {
        self.stages.iter_mut().rev().find(|s| s.stage_id == stage_id)
    }

    /// Folds one event in.
    pub fn apply(&mut self, event: &PipelineEvent) {
        self.last_event_at = event.timestamp;

        match &event.kind {
            PipelineEventKind::PipelineStarted { total_stages, .. } => {
                self.status = PipelineStatus::Running;
                self.total_stages = *total_stages;
            }
            PipelineEventKind::PipelineResumed { .. } => {
                self.status = PipelineStatus::Running;
            }
            PipelineEventKind::PipelinePaused => {
                self.status = PipelineStatus::Paused;
            }
            PipelineEventKind::PipelineCancelled { .. } => {
                self.finish(PipelineStatus::Cancelled, event.timestamp);
            }
            PipelineEventKind::PipelineCompleted { duration_ms } => {
                self.finish(PipelineStatus::Completed, event.timestamp);
                self.duration_ms = Some(*duration_ms);
            }
            PipelineEventKind::PipelineFailed { error, .. } => {
                self.finish(PipelineStatus::Failed, event.timestamp);
                self.error = Some(error.clone());
            }
            PipelineEventKind::StageStarted {
                stage_id,
                stage_index,
                ..
            } => {
                self.stages.push(StageMetricsEntry {
                    stage_id: stage_id.clone(),
                    stage_index: *stage_index,
                    status: StageStatus::Running,
                    duration_ms: None,
                    retry_count: 0,
                    error: None,
                });
            }
            PipelineEventKind::StageRetry { .. } => {
                self.retry_count += 1;
                self.error_count += 1;
            }
            PipelineEventKind::StageCompleted {
                stage_id,
                duration_ms,
                retry_count,
                metrics,
                ..
            } => {
                if let Some(stage) = self.stage_mut(stage_id) {
                    stage.status = StageStatus::Completed;
                    stage.duration_ms = Some(*duration_ms);
                    stage.retry_count = *retry_count;
                }
                if let Some(m) = metrics {
                    if let Some(usage) = &m.token_usage {
                        self.token_usage.accumulate(usage);
                    }
                    if let Some(model) = &m.model {
                        self.model = Some(model.clone());
                    }
                    if let Some(cost) = m.cost {
                        *self.reported_cost.get_or_insert(0.0) += cost;
                    }
                }
            }
            PipelineEventKind::StageFailed {
                stage_id,
                error,
                retry_count,
                duration_ms,
                ..
            } => {
                self.error_count += 1;
                if let Some(stage) = self.stage_mut(stage_id) {
                    stage.status = StageStatus::Failed;
                    stage.duration_ms = Some(*duration_ms);
                    stage.retry_count = *retry_count;
                    stage.error = Some(error.clone());
                }
            }
            PipelineEventKind::StageSkipped {
                stage_id,
                stage_index,
                ..
            } => match self.stage_mut(stage_id) {
                Some(stage) => stage.status = StageStatus::Skipped,
                None => self.stages.push(StageMetricsEntry {
                    stage_id: stage_id.clone(),
                    stage_index: *stage_index,
                    status: StageStatus::Skipped,
                    duration_ms: None,
                    retry_count: 0,
                    error: None,
                }),
            },
            PipelineEventKind::TokenGenerated { .. } => {
                self.tokens_streamed += 1;
            }
            PipelineEventKind::HealingAttempted { .. } => {
                self.healing_attempts += 1;
            }
            PipelineEventKind::LockLost { .. } => {
                self.error_count += 1;
            }
            PipelineEventKind::StageProgress { .. } | PipelineEventKind::CheckpointSaved { .. } => {}
        }
    }

    fn finish(&mut self, status: PipelineStatus, at: Timestamp) {
        self.status = status;
        self.completed_at = Some(at);
        if self.duration_ms.is_none() {
            self.duration_ms = Some(elapsed_ms(self.started_at, at));
        }
    }

    /// Sets `cost`: the stage-reported cost when present, else the table estimate.
    pub fn finalize_cost(&mut self, table: &CostTable) {
        self.cost = self
            .reported_cost
            .unwrap_or_else(|| table.estimate(self.model.as_deref(), &self.token_usage));
    }

    /// Whether the execution reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageMetrics;
    use pretty_assertions::assert_eq;

    fn event(kind: PipelineEventKind) -> PipelineEvent {
        PipelineEvent::new("e1", "chapter", kind)
    }

    #[test]
    fn test_fold_successful_run() {
        let start = event(PipelineEventKind::PipelineStarted {
            total_stages: 2,
            resource_id: "c1".into(),
        });
        let mut metrics = ExecutionMetrics::from_event(&start);
        metrics.apply(&start);
        metrics.apply(&event(PipelineEventKind::StageStarted {
            stage_id: "draft".into(),
            stage_index: 0,
            stage_name: "Draft".into(),
        }));
        metrics.apply(&event(PipelineEventKind::StageRetry {
            stage_id: "draft".into(),
            attempt: 1,
            delay_ms: 100,
            error: "503".into(),
        }));
        metrics.apply(&event(PipelineEventKind::StageCompleted {
            stage_id: "draft".into(),
            stage_index: 0,
            duration_ms: 250,
            retry_count: 1,
            metrics: Some(StageMetrics {
                token_usage: Some(TokenUsage::new(1000, 500)),
                model: Some("gpt-4o".into()),
                ..StageMetrics::default()
            }),
        }));
        metrics.apply(&event(PipelineEventKind::PipelineCompleted { duration_ms: 300 }));

        assert_eq!(metrics.status, PipelineStatus::Completed);
        assert_eq!(metrics.duration_ms, Some(300));
        assert_eq!(metrics.retry_count, 1);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.token_usage.total_tokens, 1500);
        assert_eq!(metrics.stages[0].status, StageStatus::Completed);
        assert_eq!(metrics.stages[0].retry_count, 1);

        metrics.finalize_cost(&CostTable::new());
        assert!((metrics.cost - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn test_fold_failure() {
        let start = event(PipelineEventKind::StageStarted {
            stage_id: "review".into(),
            stage_index: 3,
            stage_name: "Review".into(),
        });
        let mut metrics = ExecutionMetrics::from_event(&start);
        metrics.apply(&start);
        metrics.apply(&event(PipelineEventKind::StageFailed {
            stage_id: "review".into(),
            stage_index: 3,
            error: "timeout".into(),
            retry_count: 2,
            duration_ms: 900,
        }));
        metrics.apply(&event(PipelineEventKind::PipelineFailed {
            error: "timeout".into(),
            failed_stage_id: Some("review".into()),
            failed_stage_index: Some(3),
            recoverable: true,
        }));

        assert!(metrics.is_finished());
        assert_eq!(metrics.status, PipelineStatus::Failed);
        assert_eq!(metrics.error.as_deref(), Some("timeout"));
        assert_eq!(metrics.stages[0].error.as_deref(), Some("timeout"));
        assert!(metrics.duration_ms.is_some());
    }

    #[test]
    fn test_reported_cost_wins() {
        let mut metrics = ExecutionMetrics::new("e1", "chapter", crate::utils::now_utc());
        metrics.apply(&event(PipelineEventKind::StageCompleted {
            stage_id: "draft".into(),
            stage_index: 0,
            duration_ms: 1,
            retry_count: 0,
            metrics: Some(StageMetrics {
                token_usage: Some(TokenUsage::new(1_000_000, 0)),
                cost: Some(0.42),
                ..StageMetrics::default()
            }),
        }));
        metrics.finalize_cost(&CostTable::new());
        assert!((metrics.cost - 0.42).abs() < 1e-9);
    }
}
