//! Stage trait and function-backed stages.
//!
//! Stages are the pluggable units of work in a pipeline. The engine only
//! calls the hooks below; everything a stage may read arrives through
//! [`StageContext`].

use crate::config::StageRetryPolicy;
use crate::context::StageContext;
use crate::core::{StageCategory, StageResult};
use crate::errors::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// What a stage's `on_error` hook asks the retry wrapper to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Retry, optionally after a custom delay and with a new input.
    Retry {
        /// Overrides the policy delay.
        delay_ms: Option<u64>,
        /// Input for the next attempt.
        modified_input: Option<serde_json::Value>,
    },
    /// Treat the failure as a soft success with empty output.
    Skip,
    /// Fail with this message instead of the raw error.
    Fail {
        /// Replacement error message.
        message: String,
    },
}

/// Trait for pipeline stages.
///
/// Only [`Stage::execute`] is required. Returning `Err` from `execute`
/// signals an unexpected fault and routes through [`Stage::on_error`];
/// returning `Ok(StageResult::fail(..))` is an ordinary failure that goes
/// straight to retry classification.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Stable identifier, unique within a pipeline.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Stage category.
    fn category(&self) -> StageCategory {
        StageCategory::Generation
    }

    /// Retry policy that replaces the pipeline default for this stage.
    fn retry_override(&self) -> Option<&StageRetryPolicy> {
        None
    }

    /// Declines to run by returning `Err(reason)`. Never retried.
    async fn pre_check(&self, _ctx: &StageContext) -> Result<(), String> {
        Ok(())
    }

    /// Does the work.
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError>;

    /// Rejects a successful result by returning `Err(reason)`.
    async fn validate(&self, _ctx: &StageContext, _result: &StageResult) -> Result<(), String> {
        Ok(())
    }

    /// Transforms a validated result.
    async fn post_process(&self, _ctx: &StageContext, result: StageResult) -> StageResult {
        result
    }

    /// Handles an error returned by `execute`.
    async fn on_error(
        &self,
        _ctx: &StageContext,
        _error: &StageError,
        _retry_count: u32,
    ) -> Option<ErrorHandling> {
        None
    }
}

/// A stage backed by an async function.
pub struct FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    id: String,
    name: Option<String>,
    category: StageCategory,
    retry: Option<StageRetryPolicy>,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    /// Creates a function-backed stage.
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            name: None,
            category: StageCategory::default(),
            retry: None,
            func,
            _phantom: PhantomData,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: StageCategory) -> Self {
        self.category = category;
        self
    }

    /// Sets a retry override.
    #[must_use]
    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

impl<F, Fut> Debug for FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("id", &self.id)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Stage for FnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn category(&self) -> StageCategory {
        self.category
    }

    fn retry_override(&self) -> Option<&StageRetryPolicy> {
        self.retry.as_ref()
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        (self.func)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_stage_executes() {
        let stage = FnStage::new("outline", |ctx: StageContext| async move {
            Ok(StageResult::ok(serde_json::json!({"stage": ctx.stage_id()})))
        })
        .with_name("Outline")
        .with_category(StageCategory::Outline);

        let ctx = StageContext::new("exec-1", "novel", "outline", 0);
        let result = stage.execute(&ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output["stage"], "outline");
        assert_eq!(stage.name(), "Outline");
        assert_eq!(stage.category(), StageCategory::Outline);
    }

    #[tokio::test]
    async fn test_default_hooks() {
        let stage = FnStage::new("noop", |_ctx: StageContext| async { Ok(StageResult::ok_empty()) });
        let ctx = StageContext::new("exec-1", "novel", "noop", 0);

        assert!(stage.pre_check(&ctx).await.is_ok());
        assert!(stage.retry_override().is_none());
        assert!(stage
            .on_error(&ctx, &StageError::new("boom"), 0)
            .await
            .is_none());
        let result = stage.post_process(&ctx, StageResult::ok_empty()).await;
        assert!(result.success);
    }

    #[test]
    fn test_error_handling_serializes_tagged() {
        let json = serde_json::to_value(ErrorHandling::Skip).unwrap();
        assert_eq!(json, serde_json::json!({"action": "skip"}));
    }
}
