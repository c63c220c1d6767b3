//! Stage result type with factory methods.

use crate::context::ContextUpdate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token accounting reported by a generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt (input) tokens.
    pub prompt_tokens: u64,
    /// Completion (output) tokens.
    pub completion_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record; the total is derived.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Adds another usage record into this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Optional metrics attached to a stage result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Wall time of the stage body in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Cost reported by the stage, if it priced the call itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Model used for generation, consulted by the cost table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The result of one stage invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResult {
    /// Whether the stage succeeded.
    pub success: bool,
    /// Stage output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured error details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub error_details: HashMap<String, serde_json::Value>,
    /// Stop the pipeline after this stage and mark it completed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_remaining: bool,
    /// Set when an error handler turned a failure into a soft success.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Fields merged into the pipeline context after the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_update: Option<ContextUpdate>,
    /// Duration/token/cost metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageMetrics>,
}

impl StageResult {
    /// Creates a successful result with output.
    #[must_use]
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            ..Self::default()
        }
    }

    /// Creates a successful result with no output.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self::ok(serde_json::Value::Null)
    }

    /// Creates a failed result.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Creates the soft success produced when a stage is skipped.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::default()
        }
    }

    /// Attaches a context update.
    #[must_use]
    pub fn with_context_update(mut self, update: ContextUpdate) -> Self {
        self.context_update = Some(update);
        self
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds a single error detail entry.
    #[must_use]
    pub fn with_error_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.error_details.insert(key.into(), value);
        self
    }

    /// Requests that the remaining stages be skipped.
    #[must_use]
    pub fn stop_after(mut self) -> Self {
        self.skip_remaining = true;
        self
    }

    /// Returns the error message or an empty string.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulate() {
        let mut usage = TokenUsage::new(100, 50);
        usage.accumulate(&TokenUsage::new(10, 5));
        assert_eq!(usage, TokenUsage::new(110, 55));
        assert_eq!(usage.total_tokens, 165);
    }

    #[test]
    fn test_result_factories() {
        let ok = StageResult::ok(serde_json::json!({"text": "Once upon a time"}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let fail = StageResult::fail("timeout");
        assert!(!fail.success);
        assert_eq!(fail.error_message(), "timeout");

        let skipped = StageResult::skipped();
        assert!(skipped.success);
        assert!(skipped.skipped);
        assert!(skipped.output.is_null());
    }

    #[test]
    fn test_result_serialization_omits_defaults() {
        let json = serde_json::to_value(StageResult::ok_empty()).unwrap();
        assert!(json.get("skip_remaining").is_none());
        assert!(json.get("error").is_none());
    }
}
