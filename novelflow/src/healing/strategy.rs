//! Recovery strategies.

use super::classify::{classify_error, is_context_overflow, is_rate_limit, parse_retry_after, ErrorCategory};
use crate::config::HealingConfig;
use crate::context::ContextUpdate;
use crate::state::PipelineState;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

/// A failed stage handed to the healing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    /// Failed stage id.
    pub stage_id: String,
    /// Failed stage index.
    pub stage_index: usize,
    /// Final error message from the retry wrapper.
    pub message: String,
    /// Healing attempts already made for this execution.
    pub attempt: u32,
}

/// One remediation step of a heal action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum HealStep {
    /// Sleep before retrying.
    Wait {
        /// Wait in milliseconds.
        ms: u64,
    },
    /// Drop generated artifacts from the context.
    ClearCache,
    /// Reload the context from the execution record.
    RefreshContext,
    /// Ask stages to shrink requests.
    ReduceLoad,
}

/// What to do about a failed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run the stage, optionally with context changes or new input.
    Retry {
        /// Merged into the context before the retry.
        context_update: Option<ContextUpdate>,
        /// Input for the retry.
        modified_input: Option<serde_json::Value>,
    },
    /// Mark the stage skipped and continue.
    Skip,
    /// Re-run the pipeline from this stage index.
    Rollback {
        /// Index to restart from.
        stage_index: usize,
    },
    /// Run remediation steps, then re-run the stage.
    Heal {
        /// Steps in order.
        steps: Vec<HealStep>,
    },
    /// Give up.
    Abort {
        /// Why.
        reason: String,
    },
}

impl RecoveryAction {
    /// Short name used in events and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Skip => "skip",
            Self::Rollback { .. } => "rollback",
            Self::Heal { .. } => "heal",
            Self::Abort { .. } => "abort",
        }
    }
}

/// A pluggable recovery strategy.
pub trait RecoveryStrategy: Send + Sync + Debug {
    /// Strategy name.
    fn name(&self) -> &str;

    /// Whether this strategy handles the failure.
    fn should_recover(&self, state: &PipelineState, failure: &StageFailure) -> bool;

    /// The action to take. Only called after `should_recover` returned true.
    fn recovery_action(&self, state: &PipelineState, failure: &StageFailure) -> RecoveryAction;
}

fn backoff_ms(config: &HealingConfig, attempt: u32) -> u64 {
    let exponent = attempt.min(16);
    config
        .base_wait_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_wait_ms)
}

/// Waits out rate limits, honoring a "retry after" hint, then reduces load.
#[derive(Debug, Clone)]
pub struct RateLimitStrategy {
    config: HealingConfig,
}

impl RateLimitStrategy {
    /// Creates the strategy.
    pub fn new(config: HealingConfig) -> Self {
        Self { config }
    }
}

impl RecoveryStrategy for RateLimitStrategy {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn should_recover(&self, _state: &PipelineState, failure: &StageFailure) -> bool {
        is_rate_limit(&failure.message)
    }

    fn recovery_action(&self, _state: &PipelineState, failure: &StageFailure) -> RecoveryAction {
        let wait = parse_retry_after(&failure.message)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_else(|| backoff_ms(&self.config, failure.attempt))
            .min(self.config.max_wait_ms);

        RecoveryAction::Heal {
            steps: vec![HealStep::Wait { ms: wait }, HealStep::ReduceLoad],
        }
    }
}

/// Retries oversized prompts with a truncation budget, halving it each time.
#[derive(Debug, Clone)]
pub struct ContextOverflowStrategy {
    budget_tokens: u32,
}

impl ContextOverflowStrategy {
    /// Creates the strategy.
    pub fn new(budget_tokens: u32) -> Self {
        Self { budget_tokens }
    }
}

impl RecoveryStrategy for ContextOverflowStrategy {
    fn name(&self) -> &str {
        "context_overflow"
    }

    fn should_recover(&self, _state: &PipelineState, failure: &StageFailure) -> bool {
        is_context_overflow(&failure.message)
    }

    fn recovery_action(&self, state: &PipelineState, _failure: &StageFailure) -> RecoveryAction {
        let budget = match state.context.truncate_to_tokens() {
            Some(current) => (current / 2).min(self.budget_tokens),
            None => self.budget_tokens,
        };
        if budget == 0 {
            return RecoveryAction::Abort {
                reason: "context cannot be truncated further".to_string(),
            };
        }

        RecoveryAction::Retry {
            context_update: Some(ContextUpdate::new().truncate_to_tokens(budget)),
            modified_input: None,
        }
    }
}

/// Maps the error category to an action.
#[derive(Debug, Clone)]
pub struct DefaultStrategy {
    config: HealingConfig,
}

impl DefaultStrategy {
    /// Creates the strategy.
    pub fn new(config: HealingConfig) -> Self {
        Self { config }
    }
}

impl RecoveryStrategy for DefaultStrategy {
    fn name(&self) -> &str {
        "default"
    }

    fn should_recover(&self, _state: &PipelineState, _failure: &StageFailure) -> bool {
        true
    }

    fn recovery_action(&self, _state: &PipelineState, failure: &StageFailure) -> RecoveryAction {
        let wait = HealStep::Wait {
            ms: backoff_ms(&self.config, failure.attempt),
        };
        match classify_error(&failure.message) {
            ErrorCategory::Retryable => RecoveryAction::Heal { steps: vec![wait] },
            ErrorCategory::Transient => RecoveryAction::Heal {
                steps: vec![wait, HealStep::RefreshContext],
            },
            ErrorCategory::Content => RecoveryAction::Retry {
                context_update: Some(ContextUpdate::new().soften_content(true)),
                modified_input: None,
            },
            ErrorCategory::Permanent => RecoveryAction::Abort {
                reason: format!("permanent error: {}", failure.message),
            },
        }
    }
}

/// Converts a total wait into a [`Duration`].
pub(crate) fn total_wait(steps: &[HealStep]) -> Duration {
    let ms = steps
        .iter()
        .map(|s| match s {
            HealStep::Wait { ms } => *ms,
            _ => 0,
        })
        .fold(0u64, u64::saturating_add);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::context::StageTarget;
    use pretty_assertions::assert_eq;

    fn state() -> PipelineState {
        PipelineState::new(
            "e1",
            "chapter",
            StageTarget::novel("n1"),
            serde_json::Value::Null,
            PipelineConfig::default(),
        )
    }

    fn failure(message: &str) -> StageFailure {
        StageFailure {
            stage_id: "draft".into(),
            stage_index: 1,
            message: message.into(),
            attempt: 0,
        }
    }

    #[test]
    fn test_rate_limit_uses_hint_with_cap() {
        let config = HealingConfig::default().with_max_wait_ms(10_000);
        let strategy = RateLimitStrategy::new(config);

        let action = strategy.recovery_action(&state(), &failure("429: retry after 4 seconds"));
        assert_eq!(
            action,
            RecoveryAction::Heal {
                steps: vec![HealStep::Wait { ms: 4000 }, HealStep::ReduceLoad]
            }
        );

        let capped = strategy.recovery_action(&state(), &failure("rate limit, retry after 600 seconds"));
        assert_eq!(total_wait(match &capped {
            RecoveryAction::Heal { steps } => steps,
            _ => panic!("expected heal"),
        }), Duration::from_secs(10));
    }

    #[test]
    fn test_context_overflow_halves_budget() {
        let strategy = ContextOverflowStrategy::new(8000);
        let mut s = state();

        let first = strategy.recovery_action(&s, &failure("maximum context length exceeded"));
        assert_eq!(
            first,
            RecoveryAction::Retry {
                context_update: Some(ContextUpdate::new().truncate_to_tokens(8000)),
                modified_input: None,
            }
        );

        s.context = s.context.merge(&ContextUpdate::new().truncate_to_tokens(8000));
        let second = strategy.recovery_action(&s, &failure("maximum context length exceeded"));
        assert_eq!(
            second,
            RecoveryAction::Retry {
                context_update: Some(ContextUpdate::new().truncate_to_tokens(4000)),
                modified_input: None,
            }
        );
    }

    #[test]
    fn test_default_strategy_by_category() {
        let strategy = DefaultStrategy::new(HealingConfig::default().with_base_wait_ms(100));

        assert_eq!(
            strategy.recovery_action(&state(), &failure("503 service unavailable")),
            RecoveryAction::Heal {
                steps: vec![HealStep::Wait { ms: 100 }]
            }
        );
        assert_eq!(
            strategy.recovery_action(&state(), &failure("socket hang up")),
            RecoveryAction::Heal {
                steps: vec![HealStep::Wait { ms: 100 }, HealStep::RefreshContext]
            }
        );
        assert!(matches!(
            strategy.recovery_action(&state(), &failure("flagged by moderation")),
            RecoveryAction::Retry { context_update: Some(u), .. } if u.soften_content == Some(true)
        ));
        assert!(matches!(
            strategy.recovery_action(&state(), &failure("invalid api key")),
            RecoveryAction::Abort { .. }
        ));
    }
}
