//! Composite health scoring.

use super::{percentile, ExecutionMetrics};
use crate::config::HealthThresholds;
use crate::core::PipelineStatus;
use serde::{Deserialize, Serialize};

/// Checks with fewer samples than this pass unconditionally.
const MIN_SAMPLES: usize = 5;

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Within threshold.
    Pass,
    /// Within the warn margin of the threshold.
    Warn,
    /// Threshold breached.
    Fail,
}

impl CheckStatus {
    fn score(self) -> f64 {
        match self {
            Self::Pass => 100.0,
            Self::Warn => 50.0,
            Self::Fail => 0.0,
        }
    }
}

/// One scored check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: String,
    /// Outcome.
    pub status: CheckStatus,
    /// Observed value.
    pub value: f64,
    /// Configured threshold.
    pub threshold: f64,
    /// Human-readable summary.
    pub message: String,
}

/// Result of [`run_health_check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when no check failed.
    pub healthy: bool,
    /// Mean check score, 0-100.
    pub score: f64,
    /// Individual checks.
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Finds a check by name.
    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

fn sparse(name: &str, samples: usize, threshold: f64) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        status: CheckStatus::Pass,
        value: 0.0,
        threshold,
        message: format!("insufficient data ({samples} samples)"),
    }
}

fn at_least(name: &str, value: f64, min: f64, margin: f64) -> HealthCheck {
    let status = if value < min {
        CheckStatus::Fail
    } else if value < min * (1.0 + margin) {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    HealthCheck {
        name: name.to_string(),
        status,
        value,
        threshold: min,
        message: format!("{name} {value:.3} (min {min:.3})"),
    }
}

fn at_most(name: &str, value: f64, max: f64, margin: f64) -> HealthCheck {
    let status = if value > max {
        CheckStatus::Fail
    } else if value > max * (1.0 - margin) {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    HealthCheck {
        name: name.to_string(),
        status,
        value,
        threshold: max,
        message: format!("{name} {value:.3} (max {max:.3})"),
    }
}

/// Scores recent executions against the thresholds.
///
/// `metrics` should be ordered oldest first; the recent-failure check looks
/// at the tail.
pub fn run_health_check(metrics: &[ExecutionMetrics], thresholds: &HealthThresholds) -> HealthReport {
    let margin = thresholds.warn_margin;
    let mut checks = Vec::with_capacity(4);

    let finished: Vec<_> = metrics.iter().filter(|m| m.is_finished()).collect();
    let succeeded = finished
        .iter()
        .filter(|m| m.status == PipelineStatus::Completed)
        .count();
    checks.push(if finished.len() < MIN_SAMPLES {
        sparse("success_rate", finished.len(), thresholds.min_success_rate)
    } else {
        let rate = succeeded as f64 / finished.len() as f64;
        at_least("success_rate", rate, thresholds.min_success_rate, margin)
    });

    let mut durations: Vec<u64> = metrics.iter().filter_map(|m| m.duration_ms).collect();
    durations.sort_unstable();
    let max_p95 = thresholds.max_p95_ms as f64;
    checks.push(if durations.len() < MIN_SAMPLES {
        sparse("p95_latency", durations.len(), max_p95)
    } else {
        at_most("p95_latency", percentile(&durations, 95.0) as f64, max_p95, margin)
    });

    let errors: u32 = metrics.iter().map(|m| m.error_count).sum();
    let attempts: usize = metrics
        .iter()
        .map(|m| m.stages.len() + m.retry_count as usize)
        .sum();
    checks.push(if attempts < MIN_SAMPLES {
        sparse("error_rate", attempts, thresholds.max_error_rate)
    } else {
        let rate = f64::from(errors) / attempts as f64;
        at_most("error_rate", rate, thresholds.max_error_rate, margin)
    });

    let window = thresholds.recent_window.min(finished.len());
    let recent = &finished[finished.len() - window..];
    let max_recent = thresholds.max_recent_failures as f64;
    checks.push(if recent.len() < MIN_SAMPLES {
        sparse("recent_failures", recent.len(), max_recent)
    } else {
        let failures = recent
            .iter()
            .filter(|m| m.status == PipelineStatus::Failed)
            .count();
        at_most("recent_failures", failures as f64, max_recent, margin)
    });

    let score = checks.iter().map(|c| c.status.score()).sum::<f64>() / checks.len() as f64;
    HealthReport {
        healthy: checks.iter().all(|c| c.status != CheckStatus::Fail),
        score,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::observability::StageMetricsEntry;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;

    fn run(status: PipelineStatus, duration_ms: u64) -> ExecutionMetrics {
        let mut m = ExecutionMetrics::new(crate::utils::generate_id(), "chapter", now_utc());
        m.status = status;
        m.duration_ms = Some(duration_ms);
        m.stages = vec![StageMetricsEntry {
            stage_id: "draft".into(),
            stage_index: 0,
            status: if status == PipelineStatus::Completed {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            },
            duration_ms: Some(duration_ms),
            retry_count: 0,
            error: None,
        }];
        if status == PipelineStatus::Failed {
            m.error_count = 1;
        }
        m
    }

    #[test]
    fn test_sparse_data_passes() {
        let runs = vec![run(PipelineStatus::Failed, 500_000); 3];
        let report = run_health_check(&runs, &HealthThresholds::default());

        assert!(report.healthy);
        assert!((report.score - 100.0).abs() < f64::EPSILON);
        assert!(report.checks.iter().all(|c| c.status == CheckStatus::Pass));
    }

    #[test]
    fn test_all_green() {
        let runs = vec![run(PipelineStatus::Completed, 1_000); 10];
        let report = run_health_check(&runs, &HealthThresholds::default());

        assert!(report.healthy);
        assert_eq!(report.check("success_rate").map(|c| c.status), Some(CheckStatus::Pass));
        assert_eq!(report.check("p95_latency").map(|c| c.status), Some(CheckStatus::Pass));
        assert_eq!(report.check("error_rate").map(|c| c.status), Some(CheckStatus::Pass));
        assert_eq!(report.check("recent_failures").map(|c| c.status), Some(CheckStatus::Pass));
        assert!((report.score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failures_trip_checks() {
        let mut runs = vec![run(PipelineStatus::Completed, 1_000); 5];
        runs.extend(vec![run(PipelineStatus::Failed, 1_000); 5]);
        let report = run_health_check(&runs, &HealthThresholds::default());

        assert!(!report.healthy);
        assert_eq!(report.check("success_rate").map(|c| c.status), Some(CheckStatus::Fail));
        assert_eq!(report.check("recent_failures").map(|c| c.status), Some(CheckStatus::Fail));
        assert!(report.score < 100.0);
    }

    #[test]
    fn test_latency_warn_band() {
        let runs = vec![run(PipelineStatus::Completed, 115_000); 6];
        let report = run_health_check(&runs, &HealthThresholds::default());

        assert!(report.healthy);
        assert_eq!(report.check("p95_latency").map(|c| c.status), Some(CheckStatus::Warn));
        assert!((report.score - 87.5).abs() < f64::EPSILON);
    }
}
