//! Per-invocation stage context.

use super::PipelineContext;
use crate::cancellation::CancellationToken;
use crate::config::StageRetryPolicy;
use crate::core::{PipelineEvent, PipelineEventKind, TokenUsage};
use crate::events::{emit_safely, EventSink, NoOpEventSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Span;

/// The resource an execution works on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTarget {
    /// Novel the run belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novel_id: Option<String>,
    /// User who requested the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Chapter, for chapter-scoped pipelines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
}

impl StageTarget {
    /// Targets a whole novel.
    #[must_use]
    pub fn novel(novel_id: impl Into<String>) -> Self {
        Self {
            novel_id: Some(novel_id.into()),
            ..Self::default()
        }
    }

    /// Narrows the target to one chapter.
    #[must_use]
    pub fn with_chapter(mut self, chapter_id: impl Into<String>) -> Self {
        self.chapter_id = Some(chapter_id.into());
        self
    }

    /// Records the requesting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The id the resource lock is scoped to: the chapter if present, else the novel.
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        self.chapter_id.as_deref().or(self.novel_id.as_deref())
    }
}

/// Emits progress and token events for the running stage.
#[derive(Clone)]
pub struct ProgressReporter {
    execution_id: String,
    pipeline_type: String,
    stage_id: String,
    sink: Arc<dyn EventSink>,
}

impl ProgressReporter {
    /// Creates a reporter bound to one stage.
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_type: impl Into<String>,
        stage_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            pipeline_type: pipeline_type.into(),
            stage_id: stage_id.into(),
            sink,
        }
    }

    /// Reports fractional progress, clamped to `0.0..=1.0`.
    pub fn report(&self, progress: f64, message: Option<&str>) {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        self.emit(PipelineEventKind::StageProgress {
            stage_id: self.stage_id.clone(),
            progress,
            message: message.map(str::to_string),
        });
    }

    /// Reports a generated token (or chunk).
    pub fn token(&self, token: impl Into<String>, usage: Option<TokenUsage>) {
        self.emit(PipelineEventKind::TokenGenerated {
            stage_id: self.stage_id.clone(),
            token: token.into(),
            usage,
        });
    }

    /// The sink events are routed to.
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    fn emit(&self, kind: PipelineEventKind) {
        let event = PipelineEvent::new(&self.execution_id, &self.pipeline_type, kind);
        emit_safely(self.sink.as_ref(), &event);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("execution_id", &self.execution_id)
            .field("stage_id", &self.stage_id)
            .finish_non_exhaustive()
    }
}

/// Everything one stage invocation can see.
///
/// Built by the engine (or parallel executor) per invocation and never
/// shared between concurrent stages.
#[derive(Debug, Clone)]
pub struct StageContext {
    execution_id: String,
    pipeline_type: String,
    stage_id: String,
    stage_index: usize,
    target: StageTarget,
    input: serde_json::Value,
    context: Arc<PipelineContext>,
    retry: StageRetryPolicy,
    cancel: Arc<CancellationToken>,
    progress: ProgressReporter,
    span: Span,
}

impl StageContext {
    /// Creates a context with an empty pipeline context and a no-op sink.
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_type: impl Into<String>,
        stage_id: impl Into<String>,
        stage_index: usize,
    ) -> Self {
        let execution_id = execution_id.into();
        let pipeline_type = pipeline_type.into();
        let stage_id = stage_id.into();
        let progress = ProgressReporter::new(
            &execution_id,
            &pipeline_type,
            &stage_id,
            Arc::new(NoOpEventSink),
        );
        let span = crate::telemetry::stage_span(&execution_id, &stage_id, stage_index);

        Self {
            execution_id,
            pipeline_type,
            stage_id,
            stage_index,
            target: StageTarget::default(),
            input: serde_json::Value::Null,
            context: Arc::new(PipelineContext::default()),
            retry: StageRetryPolicy::default(),
            cancel: CancellationToken::shared(),
            progress,
            span,
        }
    }

    /// Sets the target ids.
    #[must_use]
    pub fn with_target(mut self, target: StageTarget) -> Self {
        self.target = target;
        self
    }

    /// Replaces the stage input.
    #[must_use]
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Sets the pipeline context snapshot.
    #[must_use]
    pub fn with_context(mut self, context: Arc<PipelineContext>) -> Self {
        self.context = context;
        self
    }

    /// Sets the effective retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Routes progress events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.progress = ProgressReporter::new(
            &self.execution_id,
            &self.pipeline_type,
            &self.stage_id,
            sink,
        );
        self
    }

    /// Execution id.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Pipeline type.
    pub fn pipeline_type(&self) -> &str {
        &self.pipeline_type
    }

    /// Stage id.
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Position of the stage in its pipeline.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Target ids.
    pub fn target(&self) -> &StageTarget {
        &self.target
    }

    /// Novel id shortcut.
    pub fn novel_id(&self) -> Option<&str> {
        self.target.novel_id.as_deref()
    }

    /// Chapter id shortcut.
    pub fn chapter_id(&self) -> Option<&str> {
        self.target.chapter_id.as_deref()
    }

    /// User id shortcut.
    pub fn user_id(&self) -> Option<&str> {
        self.target.user_id.as_deref()
    }

    /// Stage input.
    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Accumulated pipeline context.
    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Shared handle to the context snapshot.
    pub fn context_handle(&self) -> Arc<PipelineContext> {
        Arc::clone(&self.context)
    }

    /// Effective retry policy.
    pub fn retry(&self) -> &StageRetryPolicy {
        &self.retry
    }

    /// Cancellation token of the run.
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Shortcut for `cancellation().is_cancelled()`.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Progress reporter.
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Span stage bodies should log under.
    pub fn span(&self) -> &Span {
        &self.span
    }
}
