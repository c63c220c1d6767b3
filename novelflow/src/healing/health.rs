//! Sliding-window failure counter per pipeline type.

use crate::config::HealthMonitorConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Reports a pipeline type unhealthy once its recent failures reach a threshold.
///
/// A success clears the type's window; failures older than the window stop
/// counting on their own.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    failures: DashMap<String, VecDeque<Instant>>,
}

impl HealthMonitor {
    /// Creates a monitor.
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    /// Records a failed execution.
    pub fn record_failure(&self, pipeline_type: &str) {
        let now = Instant::now();
        let window = self.window();
        let mut entry = self.failures.entry(pipeline_type.to_string()).or_default();
        prune(&mut entry, now, window);
        entry.push_back(now);

        if entry.len() == self.config.failure_threshold {
            warn!(
                pipeline_type,
                failures = entry.len(),
                window_ms = self.config.window_ms,
                "Pipeline type marked unhealthy"
            );
        }
    }

    /// Records a successful execution, closing the breaker.
    pub fn record_success(&self, pipeline_type: &str) {
        self.failures.remove(pipeline_type);
    }

    /// Failures inside the window.
    pub fn failure_count(&self, pipeline_type: &str) -> usize {
        let now = Instant::now();
        let window = self.window();
        match self.failures.get_mut(pipeline_type) {
            Some(mut entry) => {
                prune(&mut entry, now, window);
                entry.len()
            }
            None => 0,
        }
    }

    /// False once the failure count reaches the threshold.
    pub fn is_healthy(&self, pipeline_type: &str) -> bool {
        self.failure_count(pipeline_type) < self.config.failure_threshold
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}

fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = entries.front() {
        if now.duration_since(*oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}
