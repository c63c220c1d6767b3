//! Configuration types for the engine and its collaborators.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial JSON
//! document only overrides the fields it names.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retry behavior for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// delay = base * 2^(retry-1) when set, constant otherwise.
    pub backoff: bool,
    /// Upper bound on a single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Adds up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for StageRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            backoff: true,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl StageRetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Sets the retry cap.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_delay_ms(mut self, delay: u64) -> Self {
        self.delay_ms = delay;
        self
    }

    /// Enables or disables exponential backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: bool) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to sleep before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let base = if self.backoff {
            self.delay_ms.saturating_mul(1u64 << exponent)
        } else {
            self.delay_ms
        };
        let mut delay = base.min(self.max_delay_ms);

        if self.jitter && delay > 0 {
            let spread = delay / 10;
            if spread > 0 {
                delay += rand::thread_rng().gen_range(0..=spread);
            }
        }

        Duration::from_millis(delay)
    }
}

/// Per-pipeline defaults, overridable per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry policy for stages without an override.
    pub retry: StageRetryPolicy,
    /// Per-stage retry overrides keyed by stage id.
    pub stage_overrides: HashMap<String, StageRetryPolicy>,
    /// Save a checkpoint after every completed stage.
    pub enable_checkpoints: bool,
    /// Delete checkpoints once the execution completes.
    pub cleanup_checkpoints_on_success: bool,
    /// Route stage failures through the self-healing manager.
    pub enable_healing: bool,
    /// Overall deadline enforced by `execute_with_timeout`.
    pub timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: StageRetryPolicy::default(),
            stage_overrides: HashMap::new(),
            enable_checkpoints: true,
            cleanup_checkpoints_on_success: false,
            enable_healing: false,
            timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Creates the default pipeline configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the retry policy for one stage.
    #[must_use]
    pub fn with_stage_override(mut self, stage_id: impl Into<String>, retry: StageRetryPolicy) -> Self {
        self.stage_overrides.insert(stage_id.into(), retry);
        self
    }

    /// Enables or disables checkpointing.
    #[must_use]
    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.enable_checkpoints = enabled;
        self
    }

    /// Enables or disables checkpoint cleanup after success.
    #[must_use]
    pub fn with_checkpoint_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_checkpoints_on_success = enabled;
        self
    }

    /// Enables or disables self-healing.
    #[must_use]
    pub fn with_healing(mut self, enabled: bool) -> Self {
        self.enable_healing = enabled;
        self
    }

    /// Sets the overall timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }

    /// Resolves the retry policy for a stage.
    ///
    /// Precedence: configured override, then the stage's own override, then
    /// the pipeline default.
    #[must_use]
    pub fn retry_for(&self, stage_id: &str, stage_override: Option<&StageRetryPolicy>) -> StageRetryPolicy {
        self.stage_overrides
            .get(stage_id)
            .or(stage_override)
            .unwrap_or(&self.retry)
            .clone()
    }
}

/// How hard to try when a lock is held by someone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetryPolicy {
    /// Total acquisition attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 100,
        }
    }
}

impl LockRetryPolicy {
    /// A single attempt with no waiting.
    #[must_use]
    pub fn fail_fast() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the inter-attempt delay.
    #[must_use]
    pub fn with_delay_ms(mut self, delay: u64) -> Self {
        self.delay_ms = delay;
        self
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock owner id for this process. Generated when absent.
    pub owner_id: Option<String>,
    /// Lease length for the per-resource lock.
    pub lock_ttl_ms: u64,
    /// Acquisition policy for the per-resource lock.
    pub lock_retry: LockRetryPolicy,
    /// Whether the lock manager treats a lock already held by this owner as acquired.
    pub allow_lock_reentry: bool,
    /// Defaults applied to every pipeline unless the definition overrides them.
    pub pipeline_defaults: PipelineConfig,
    /// Refuse executions of pipeline types the health monitor reports unhealthy.
    pub enforce_circuit_breaker: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            lock_ttl_ms: 300_000,
            lock_retry: LockRetryPolicy::fail_fast(),
            allow_lock_reentry: false,
            pipeline_defaults: PipelineConfig::default(),
            enforce_circuit_breaker: true,
        }
    }
}

impl EngineConfig {
    /// Creates the default engine configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from JSON; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the owner id.
    #[must_use]
    pub fn with_owner_id(mut self, owner: impl Into<String>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    /// Sets the lock TTL.
    #[must_use]
    pub fn with_lock_ttl_ms(mut self, ttl: u64) -> Self {
        self.lock_ttl_ms = ttl;
        self
    }

    /// Sets the lock acquisition policy.
    #[must_use]
    pub fn with_lock_retry(mut self, policy: LockRetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    /// Sets lock re-entry.
    #[must_use]
    pub fn with_lock_reentry(mut self, allow: bool) -> Self {
        self.allow_lock_reentry = allow;
        self
    }

    /// Sets pipeline defaults.
    #[must_use]
    pub fn with_pipeline_defaults(mut self, defaults: PipelineConfig) -> Self {
        self.pipeline_defaults = defaults;
        self
    }

    /// Enables or disables circuit-breaker refusal.
    #[must_use]
    pub fn with_circuit_breaker(mut self, enforce: bool) -> Self {
        self.enforce_circuit_breaker = enforce;
        self
    }

    /// Lock TTL as a duration.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// Self-healing limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Recovery attempts allowed per execution.
    pub max_healing_attempts: u32,
    /// Minimum time between two attempts for the same execution.
    pub cooldown_ms: u64,
    /// Base wait for retryable errors.
    pub base_wait_ms: u64,
    /// Cap for any wait, including parsed "retry after" hints.
    pub max_wait_ms: u64,
    /// Token budget requested on context overflow.
    pub truncate_budget_tokens: u32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_healing_attempts: 3,
            cooldown_ms: 1000,
            base_wait_ms: 2000,
            max_wait_ms: 60_000,
            truncate_budget_tokens: 8000,
        }
    }
}

impl HealingConfig {
    /// Sets the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_healing_attempts = attempts;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown_ms(mut self, cooldown: u64) -> Self {
        self.cooldown_ms = cooldown;
        self
    }

    /// Sets the base wait.
    #[must_use]
    pub fn with_base_wait_ms(mut self, wait: u64) -> Self {
        self.base_wait_ms = wait;
        self
    }

    /// Sets the wait cap.
    #[must_use]
    pub fn with_max_wait_ms(mut self, wait: u64) -> Self {
        self.max_wait_ms = wait;
        self
    }
}

/// Sliding-window circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Failures within the window that mark a pipeline type unhealthy.
    pub failure_threshold: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 300_000,
        }
    }
}

/// Thresholds for the composite health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Minimum success rate (0.0-1.0) to pass.
    pub min_success_rate: f64,
    /// Maximum p95 duration in milliseconds to pass.
    pub max_p95_ms: u64,
    /// Maximum failed attempts per stage attempt to pass.
    pub max_error_rate: f64,
    /// Maximum failures among the most recent executions to pass.
    pub max_recent_failures: usize,
    /// How many recent executions the last check looks at.
    pub recent_window: usize,
    /// Fraction of a threshold at which a check warns instead of passing.
    pub warn_margin: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.9,
            max_p95_ms: 120_000,
            max_error_rate: 0.1,
            max_recent_failures: 3,
            recent_window: 10,
            warn_margin: 0.1,
        }
    }
}

/// Observability dashboard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Interval of the periodic flush in milliseconds.
    pub flush_interval_ms: u64,
    /// Accumulators idle longer than this are flushed by the periodic timer.
    pub stale_after_ms: u64,
    /// Size of the recent-event ring buffer.
    pub recent_events: usize,
    /// Queue depth of the background writer.
    pub writer_buffer: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 30_000,
            stale_after_ms: 60_000,
            recent_events: 200,
            writer_buffer: 1024,
        }
    }
}

/// Parallel executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum stages running at once.
    pub max_concurrency: usize,
    /// Per-stage hard deadline in milliseconds.
    pub stage_timeout_ms: u64,
    /// Abort pending work after the first failure.
    pub stop_on_first_failure: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            stage_timeout_ms: 300_000,
            stop_on_first_failure: false,
        }
    }
}

impl ParallelConfig {
    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Sets the per-stage timeout.
    #[must_use]
    pub fn with_stage_timeout_ms(mut self, timeout: u64) -> Self {
        self.stage_timeout_ms = timeout;
        self
    }

    /// Enables or disables stop-on-first-failure.
    #[must_use]
    pub fn with_stop_on_first_failure(mut self, stop: bool) -> Self {
        self.stop_on_first_failure = stop;
        self
    }

    /// Per-stage timeout as a duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exponential_delays() {
        let policy = StageRetryPolicy::new().with_delay_ms(100);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_constant_and_capped_delays() {
        let constant = StageRetryPolicy::new().with_delay_ms(250).with_backoff(false);
        assert_eq!(constant.delay_for_retry(4), Duration::from_millis(250));

        let capped = StageRetryPolicy::new().with_delay_ms(1000).with_max_delay_ms(3000);
        assert_eq!(capped.delay_for_retry(5), Duration::from_millis(3000));
        assert_eq!(capped.delay_for_retry(64), Duration::from_millis(3000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = StageRetryPolicy::new().with_delay_ms(1000).with_jitter(true);
        for _ in 0..20 {
            let delay = policy.delay_for_retry(1).as_millis();
            assert!((1000..=1100).contains(&delay));
        }
    }

    #[test]
    fn test_retry_precedence() {
        let stage_own = StageRetryPolicy::no_retry();
        let config = PipelineConfig::new()
            .with_stage_override("review", StageRetryPolicy::new().with_max_retries(7));

        assert_eq!(config.retry_for("review", Some(&stage_own)).max_retries, 7);
        assert_eq!(config.retry_for("outline", Some(&stage_own)).max_retries, 0);
        assert_eq!(config.retry_for("outline", None).max_retries, 3);
    }

    #[test]
    fn test_engine_config_from_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{"lock_ttl_ms": 5000, "pipeline_defaults": {"enable_checkpoints": false}}"#,
        )
        .unwrap();

        assert_eq!(config.lock_ttl_ms, 5000);
        assert!(!config.pipeline_defaults.enable_checkpoints);
        assert_eq!(config.lock_retry, LockRetryPolicy::fail_fast());
        assert_eq!(config.pipeline_defaults.retry.max_retries, 3);
    }
}
