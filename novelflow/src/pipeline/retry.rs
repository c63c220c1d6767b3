//! Per-stage retry wrapper.
//!
//! Runs one stage through its hooks (`pre_check`, `execute`, `on_error`,
//! `validate`, `post_process`) and retries failures whose message matches a
//! transient-error pattern.

use crate::config::StageRetryPolicy;
use crate::context::StageContext;
use crate::core::{PipelineEvent, PipelineEventKind, StageResult};
use crate::events::{emit_safely, EventSink};
use crate::stages::{ErrorHandling, Stage};
use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, Instrument};

static RETRYABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(rate.?limit|too many requests|timed?.?out|econnreset|connection reset|\b429\b|\b502\b|\b503\b|overloaded)",
    )
    .expect("valid retryable-error regex")
});

/// Whether an error message describes a transient failure worth retrying.
pub fn is_retryable_error(message: &str) -> bool {
    RETRYABLE.is_match(message)
}

/// What the retry wrapper hands back to the engine.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Final result after retries and post-processing.
    pub result: StageResult,
    /// Retries performed after the first attempt.
    pub retry_count: u32,
    /// Wall time across all attempts.
    pub duration_ms: u64,
}

impl StageOutcome {
    fn new(result: StageResult, retry_count: u32, started: Instant) -> Self {
        Self {
            result,
            retry_count,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Runs `stage` under `policy`, emitting `stage:retry` events to `sink`.
///
/// A declined pre-check, a validation failure, and a failure whose message
/// does not look transient are returned without retrying. Backoff sleeps end
/// early when the context's cancellation token fires.
pub async fn run_stage_with_retry(
    stage: &dyn Stage,
    ctx: StageContext,
    policy: &StageRetryPolicy,
    sink: &dyn EventSink,
) -> StageOutcome {
    let span = ctx.span().clone();
    run(stage, ctx, policy, sink).instrument(span).await
}

async fn run(
    stage: &dyn Stage,
    mut ctx: StageContext,
    policy: &StageRetryPolicy,
    sink: &dyn EventSink,
) -> StageOutcome {
    let started = Instant::now();

    if let Err(reason) = stage.pre_check(&ctx).await {
        let result = StageResult::fail(format!("Pre-check failed: {reason}"))
            .with_error_detail("retryable", serde_json::Value::Bool(false));
        return StageOutcome::new(result, 0, started);
    }

    let mut retry_count = 0u32;
    loop {
        let result = match stage.execute(&ctx).await {
            Ok(result) => result,
            Err(err) => match stage.on_error(&ctx, &err, retry_count).await {
                Some(ErrorHandling::Skip) => {
                    debug!(error = %err, "Stage error handled as skip");
                    return StageOutcome::new(StageResult::skipped(), retry_count, started);
                }
                Some(ErrorHandling::Fail { message }) => {
                    let result = StageResult::fail(message)
                        .with_error_detail("cause", serde_json::Value::String(err.message));
                    return StageOutcome::new(result, retry_count, started);
                }
                Some(ErrorHandling::Retry {
                    delay_ms,
                    modified_input,
                }) => {
                    if retry_count >= policy.max_retries {
                        return StageOutcome::new(thrown(err), retry_count, started);
                    }
                    if let Some(input) = modified_input {
                        ctx = ctx.with_input(input);
                    }
                    retry_count += 1;
                    let delay = delay_ms.map_or_else(|| policy.delay_for_retry(retry_count), Duration::from_millis);
                    if !backoff(&ctx, sink, retry_count, delay, &err.message).await {
                        return StageOutcome::new(cancelled(&ctx), retry_count, started);
                    }
                    continue;
                }
                None => thrown(err),
            },
        };

        if result.success {
            if let Err(reason) = stage.validate(&ctx, &result).await {
                let failed = StageResult::fail(format!("Validation failed: {reason}"))
                    .with_error_detail("retryable", serde_json::Value::Bool(false));
                return StageOutcome::new(failed, retry_count, started);
            }
            let result = stage.post_process(&ctx, result).await;
            return StageOutcome::new(result, retry_count, started);
        }

        let message = result.error_message().to_string();
        if !is_retryable_error(&message) {
            debug!(error = %message, "Non-retryable stage failure");
            return StageOutcome::new(result, retry_count, started);
        }
        if retry_count >= policy.max_retries {
            debug!(error = %message, retry_count, "Retries exhausted");
            return StageOutcome::new(result, retry_count, started);
        }

        retry_count += 1;
        let delay = policy.delay_for_retry(retry_count);
        if !backoff(&ctx, sink, retry_count, delay, &message).await {
            return StageOutcome::new(cancelled(&ctx), retry_count, started);
        }
    }
}

fn thrown(err: crate::errors::StageError) -> StageResult {
    let mut result = StageResult::fail(err.message);
    result.error_details.extend(err.details);
    result
}

fn cancelled(ctx: &StageContext) -> StageResult {
    let reason = ctx.cancellation().reason().unwrap_or_else(|| "cancelled".to_string());
    StageResult::fail(format!("Cancelled during retry backoff: {reason}"))
        .with_error_detail("cancelled", serde_json::Value::Bool(true))
}

/// Emits the retry event and sleeps. Returns `false` if cancelled while waiting.
async fn backoff(
    ctx: &StageContext,
    sink: &dyn EventSink,
    attempt: u32,
    delay: Duration,
    error: &str,
) -> bool {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    debug!(attempt, delay_ms, error, "Retrying stage");

    let event = PipelineEvent::new(
        ctx.execution_id(),
        ctx.pipeline_type(),
        PipelineEventKind::StageRetry {
            stage_id: ctx.stage_id().to_string(),
            attempt,
            delay_ms,
            error: error.to_string(),
        },
    );
    emit_safely(sink, &event);

    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = ctx.cancellation().cancelled() => false,
    }
}
