//! Self-healing: error classification, recovery strategies, and the
//! per-pipeline-type health monitor.

mod classify;
mod health;
mod manager;
mod strategy;

pub use classify::{classify_error, is_context_overflow, is_rate_limit, parse_retry_after, ErrorCategory};
pub use health::HealthMonitor;
pub use manager::{HealingPlan, SelfHealingManager};
pub use strategy::{
    ContextOverflowStrategy, DefaultStrategy, HealStep, RateLimitStrategy, RecoveryAction,
    RecoveryStrategy, StageFailure,
};
