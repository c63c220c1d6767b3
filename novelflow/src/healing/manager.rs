//! Self-healing manager.

use super::strategy::{
    total_wait, ContextOverflowStrategy, DefaultStrategy, HealStep, RateLimitStrategy,
    RecoveryAction, RecoveryStrategy, StageFailure,
};
use crate::config::HealingConfig;
use crate::context::ContextUpdate;
use crate::state::PipelineState;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    count: u32,
    last: Instant,
}

/// A heal action flattened into what the engine has to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealingPlan {
    /// Total time to wait before the retry.
    pub wait: Duration,
    /// Context changes to merge before the retry.
    pub context_update: ContextUpdate,
    /// Reload the context from the execution record first.
    pub refresh_context: bool,
}

impl HealingPlan {
    /// Flattens heal steps.
    pub fn from_steps(steps: &[HealStep]) -> Self {
        let mut plan = Self {
            wait: total_wait(steps),
            ..Self::default()
        };
        for step in steps {
            match step {
                HealStep::Wait { .. } => {}
                HealStep::ClearCache => plan.context_update = plan.context_update.clone().clear_cached(),
                HealStep::ReduceLoad => plan.context_update = plan.context_update.clone().reduce_load(true),
                HealStep::RefreshContext => plan.refresh_context = true,
            }
        }
        plan
    }
}

/// Picks recovery actions for failed stages, capped per execution.
///
/// Strategies are consulted in order; the first whose `should_recover`
/// returns true decides.
#[derive(Debug)]
pub struct SelfHealingManager {
    config: HealingConfig,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    attempts: DashMap<String, AttemptRecord>,
}

impl SelfHealingManager {
    /// Creates a manager with the built-in strategies: rate limit, context
    /// overflow, then the category default.
    pub fn new(config: HealingConfig) -> Self {
        let strategies: Vec<Box<dyn RecoveryStrategy>> = vec![
            Box::new(RateLimitStrategy::new(config.clone())),
            Box::new(ContextOverflowStrategy::new(config.truncate_budget_tokens)),
            Box::new(DefaultStrategy::new(config.clone())),
        ];
        Self {
            config,
            strategies,
            attempts: DashMap::new(),
        }
    }

    /// Adds a strategy ahead of the built-in ones.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn RecoveryStrategy>) -> Self {
        self.strategies.insert(0, strategy);
        self
    }

    /// Healing attempts made so far for an execution.
    pub fn attempts(&self, execution_id: &str) -> u32 {
        self.attempts.get(execution_id).map_or(0, |r| r.count)
    }

    /// Forgets an execution's attempts.
    pub fn reset(&self, execution_id: &str) {
        self.attempts.remove(execution_id);
    }

    /// Decides what to do about `failure`.
    ///
    /// Returns `None` when the attempt cap is reached or the cooldown since
    /// the previous attempt has not elapsed; the caller then lets the
    /// original failure stand. An `Abort` action does not count as an attempt.
    pub fn decide(
        &self,
        state: &PipelineState,
        stage_id: &str,
        stage_index: usize,
        message: &str,
    ) -> Option<RecoveryAction> {
        let execution_id = state.execution_id.as_str();
        let now = Instant::now();
        let previous = self.attempts.get(execution_id).map(|r| *r);

        if let Some(record) = previous {
            if record.count >= self.config.max_healing_attempts {
                debug!(execution_id, attempts = record.count, "Healing attempts exhausted");
                return None;
            }
            let since = now.duration_since(record.last);
            if since < Duration::from_millis(self.config.cooldown_ms) {
                debug!(execution_id, since = ?since, "Healing cooldown not elapsed");
                return None;
            }
        } else if self.config.max_healing_attempts == 0 {
            return None;
        }

        let failure = StageFailure {
            stage_id: stage_id.to_string(),
            stage_index,
            message: message.to_string(),
            attempt: previous.map_or(0, |r| r.count),
        };

        let strategy = self
            .strategies
            .iter()
            .find(|s| s.should_recover(state, &failure))?;
        let action = strategy.recovery_action(state, &failure);

        if !matches!(action, RecoveryAction::Abort { .. }) {
            let count = failure.attempt + 1;
            self.attempts
                .insert(execution_id.to_string(), AttemptRecord { count, last: now });
        }

        info!(
            execution_id,
            stage_id,
            strategy = strategy.name(),
            action = action.name(),
            "Healing action chosen"
        );
        Some(action)
    }
}

impl Default for SelfHealingManager {
    fn default() -> Self {
        Self::new(HealingConfig::default())
    }
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

    #[derive(Debug)]
    struct AlwaysSkip;

    impl RecoveryStrategy for AlwaysSkip {
        fn name(&self) -> &str {
            "always_skip"
        }

        fn should_recover(&self, _state: &PipelineState, failure: &StageFailure) -> bool {
            failure.stage_id == "optional"
        }

        fn recovery_action(&self, _state: &PipelineState, _failure: &StageFailure) -> RecoveryAction {
            RecoveryAction::Skip
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap() {
        let manager = SelfHealingManager::new(
            HealingConfig::default().with_max_attempts(2).with_cooldown_ms(0),
        );
        let s = state();

        assert!(manager.decide(&s, "draft", 1, "503").is_some());
        assert!(manager.decide(&s, "draft", 1, "503").is_some());
        assert!(manager.decide(&s, "draft", 1, "503").is_none());
        assert_eq!(manager.attempts("e1"), 2);

        manager.reset("e1");
        assert!(manager.decide(&s, "draft", 1, "503").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_rapid_attempts() {
        let manager = SelfHealingManager::new(HealingConfig::default().with_cooldown_ms(500));
        let s = state();

        assert!(manager.decide(&s, "draft", 1, "timeout").is_some());
        assert!(manager.decide(&s, "draft", 1, "timeout").is_none());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(manager.decide(&s, "draft", 1, "timeout").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_aborts_without_counting() {
        let manager = SelfHealingManager::default();
        let action = manager.decide(&state(), "draft", 1, "invalid api key");

        assert!(matches!(action, Some(RecoveryAction::Abort { .. })));
        assert_eq!(manager.attempts("e1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_strategy_goes_first() {
        let manager = SelfHealingManager::default().with_strategy(Box::new(AlwaysSkip));
        assert_eq!(
            manager.decide(&state(), "optional", 3, "invalid api key"),
            Some(RecoveryAction::Skip)
        );
    }

    #[test]
    fn test_plan_from_steps() {
        let plan = HealingPlan::from_steps(&[
            HealStep::Wait { ms: 200 },
            HealStep::ReduceLoad,
            HealStep::ClearCache,
            HealStep::Wait { ms: 50 },
        ]);

        assert_eq!(plan.wait, Duration::from_millis(250));
        assert_eq!(plan.context_update.reduce_load, Some(true));
        assert!(plan.context_update.clear_cached);
        assert!(!plan.refresh_context);
    }
}
