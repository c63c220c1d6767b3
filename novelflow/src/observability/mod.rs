//! Metrics, aggregation and health scoring over engine events.
//!
//! This module provides:
//! - [`ExecutionMetrics`], folded from the event stream per execution
//! - A static per-model [`CostTable`]
//! - Windowed [`AggregateMetrics`] with latency percentiles
//! - A composite [`HealthReport`]
//! - [`ObservabilityDashboard`], an event sink with a buffered background writer

mod aggregate;
mod cost;
mod dashboard;
mod health;
mod metrics;

pub use aggregate::{aggregate, categorize_error, percentile, AggregateMetrics, StageStats};
pub use cost::{CostTable, ModelPrice};
pub use dashboard::ObservabilityDashboard;
pub use health::{run_health_check, CheckStatus, HealthCheck, HealthReport};
pub use metrics::{ExecutionMetrics, StageMetricsEntry};
