//! Mock stages for testing.

use crate::config::StageRetryPolicy;
use crate::context::{ContextUpdate, StageContext};
use crate::core::StageResult;
use crate::errors::StageError;
use crate::stages::{ErrorHandling, Stage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted response of a [`ScriptedStage`].
#[derive(Debug, Clone)]
pub enum Script {
    /// Return this result.
    Result(StageResult),
    /// Return `Err(StageError)` with this message.
    Throw(String),
}

impl Script {
    /// A successful result with `output`.
    pub fn ok(output: serde_json::Value) -> Self {
        Self::Result(StageResult::ok(output))
    }

    /// A failed result with `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Result(StageResult::fail(message))
    }

    /// An error thrown from `execute`.
    pub fn throw(message: impl Into<String>) -> Self {
        Self::Throw(message.into())
    }
}

/// A stage that plays back a script, repeating the last entry once exhausted.
#[derive(Debug)]
pub struct ScriptedStage {
    id: String,
    script: Vec<Script>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<serde_json::Value>>,
    retry: Option<StageRetryPolicy>,
    pre_check_error: Option<String>,
    validation_error: Option<String>,
    post_process_output: Option<serde_json::Value>,
    error_handling: Option<ErrorHandling>,
    context_update: Option<ContextUpdate>,
}

impl ScriptedStage {
    /// Creates a scripted stage.
    pub fn new(id: impl Into<String>, script: Vec<Script>) -> Self {
        Self {
            id: id.into(),
            script,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            retry: None,
            pre_check_error: None,
            validation_error: None,
            post_process_output: None,
            error_handling: None,
            context_update: None,
        }
    }

    /// Declines every pre-check with `reason`.
    #[must_use]
    pub fn with_pre_check_error(mut self, reason: impl Into<String>) -> Self {
        self.pre_check_error = Some(reason.into());
        self
    }

    /// Rejects every successful result with `reason`.
    #[must_use]
    pub fn with_validation_error(mut self, reason: impl Into<String>) -> Self {
        self.validation_error = Some(reason.into());
        self
    }

    /// Replaces the output of successful results in `post_process`.
    #[must_use]
    pub fn with_post_process_output(mut self, output: serde_json::Value) -> Self {
        self.post_process_output = Some(output);
        self
    }

    /// Answers every thrown error with `handling`.
    #[must_use]
    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.error_handling = Some(handling);
        self
    }

    /// Attaches `update` to every successful result.
    #[must_use]
    pub fn with_context_update(mut self, update: ContextUpdate) -> Self {
        self.context_update = Some(update);
        self
    }

    /// Sets a retry override.
    #[must_use]
    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Number of `execute` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inputs seen by each `execute` call.
    pub fn inputs(&self) -> Vec<serde_json::Value> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn retry_override(&self) -> Option<&StageRetryPolicy> {
        self.retry.as_ref()
    }

    async fn pre_check(&self, _ctx: &StageContext) -> Result<(), String> {
        match &self.pre_check_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(ctx.input().clone());

        let Some(step) = self.script.get(call).or_else(|| self.script.last()) else {
            return Ok(StageResult::ok_empty());
        };
        match step {
            Script::Result(result) => {
                let mut result = result.clone();
                if result.success && result.context_update.is_none() {
                    result.context_update = self.context_update.clone();
                }
                Ok(result)
            }
            Script::Throw(message) => Err(StageError::new(message.clone())),
        }
    }

    async fn validate(&self, _ctx: &StageContext, _result: &StageResult) -> Result<(), String> {
        match &self.validation_error {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn post_process(&self, _ctx: &StageContext, mut result: StageResult) -> StageResult {
        if let Some(output) = &self.post_process_output {
            result.output = output.clone();
        }
        result
    }

    async fn on_error(
        &self,
        _ctx: &StageContext,
        _error: &StageError,
        _retry_count: u32,
    ) -> Option<ErrorHandling> {
        self.error_handling.clone()
    }
}

/// Always succeeds with `{"stage": id}`.
#[derive(Debug)]
pub struct SuccessStage {
    id: String,
    update: Option<ContextUpdate>,
    calls: AtomicUsize,
}

impl SuccessStage {
    /// Creates a success stage.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            update: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Attaches `update` to every result.
    #[must_use]
    pub fn with_context_update(mut self, update: ContextUpdate) -> Self {
        self.update = Some(update);
        self
    }

    /// Number of `execute` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SuccessStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageResult, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = StageResult::ok(serde_json::json!({ "stage": self.id }));
        result.context_update = self.update.clone();
        Ok(result)
    }
}

/// Always fails with a fixed message.
#[derive(Debug)]
pub struct FailingStage {
    id: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a failing stage.
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `execute` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageResult, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StageResult::fail(self.message.clone()))
    }
}

/// Sleeps before succeeding; ends early with a failure if cancelled.
#[derive(Debug)]
pub struct SlowStage {
    id: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a slow stage.
    pub fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok(StageResult::ok(serde_json::json!({ "stage": self.id }))),
            () = ctx.cancellation().cancelled() => Ok(StageResult::fail("cancelled while working")),
        }
    }
}

/// What a [`RecordingStage`] saw.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Stage id.
    pub stage_id: String,
    /// Stage input.
    pub input: serde_json::Value,
    /// Context version at call time.
    pub context_version: u64,
    /// Branch seed in the context.
    pub seed: Option<u64>,
    /// Chapter target.
    pub chapter_id: Option<String>,
}

/// Call log shared between recording stages.
pub type CallLog = Arc<Mutex<Vec<RecordedCall>>>;

/// Appends every call to a shared [`CallLog`] and succeeds.
#[derive(Debug)]
pub struct RecordingStage {
    id: String,
    log: CallLog,
    update: Option<ContextUpdate>,
}

impl RecordingStage {
    /// Creates a recording stage writing to `log`.
    pub fn new(id: impl Into<String>, log: CallLog) -> Self {
        Self {
            id: id.into(),
            log,
            update: None,
        }
    }

    /// Attaches `update` to every result.
    #[must_use]
    pub fn with_context_update(mut self, update: ContextUpdate) -> Self {
        self.update = Some(update);
        self
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        self.log.lock().push(RecordedCall {
            stage_id: self.id.clone(),
            input: ctx.input().clone(),
            context_version: ctx.context().version(),
            seed: ctx.context().seed(),
            chapter_id: ctx.chapter_id().map(str::to_string),
        });

        let mut result = StageResult::ok(serde_json::json!({
            "stage": self.id,
            "seed": ctx.context().seed(),
        }));
        result.context_update = self.update.clone();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_entry() {
        let stage = ScriptedStage::new("s", vec![Script::fail("a"), Script::ok(serde_json::json!(1))]);
        let ctx = StageContext::new("e", "p", "s", 0);

        assert!(!stage.execute(&ctx).await.unwrap().success);
        assert!(stage.execute(&ctx).await.unwrap().success);
        assert!(stage.execute(&ctx).await.unwrap().success);
        assert_eq!(stage.calls(), 3);
    }

    #[tokio::test]
    async fn test_recording_stage_logs_calls() {
        let log = CallLog::default();
        let stage = RecordingStage::new("draft", log.clone());
        let ctx = StageContext::new("e", "p", "draft", 0).with_input(serde_json::json!("in"));

        stage.execute(&ctx).await.unwrap();
        let calls = log.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input, serde_json::json!("in"));
        assert_eq!(calls[0].context_version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_stage_observes_cancellation() {
        let stage = SlowStage::new("slow", Duration::from_secs(60));
        let ctx = StageContext::new("e", "p", "slow", 0);
        ctx.cancellation().cancel("stop");

        let result = stage.execute(&ctx).await.unwrap();
        assert!(!result.success);
    }
}
