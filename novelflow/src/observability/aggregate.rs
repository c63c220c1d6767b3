//! Windowed aggregation over execution metrics.

use super::ExecutionMetrics;
use crate::core::{PipelineStatus, StageStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static ERROR_CATEGORIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("rate_limit", r"(?i)rate.?limit|too many requests|\b429\b"),
        ("timeout", r"(?i)timed?.?out|deadline exceeded"),
        (
            "network",
            r"(?i)econnreset|econnrefused|connection (reset|refused)|socket|network|dns",
        ),
        (
            "content_filter",
            r"(?i)content.?filter|safety|moderation|policy violation|blocked",
        ),
        (
            "context_overflow",
            r"(?i)context.?length|context window|too many tokens|maximum context",
        ),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid error-category regex")))
    .collect()
});

/// Buckets an error message into a reporting category.
pub fn categorize_error(message: &str) -> &'static str {
    ERROR_CATEGORIES
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map_or("other", |(name, _)| name)
}

/// Nearest-rank percentile over an ascending slice; 0 when empty.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Per-stage outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Completed or skipped.
    pub succeeded: usize,
    /// Failed.
    pub failed: usize,
}

/// Aggregate view over a set of executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Executions considered.
    pub total: usize,
    /// Completed executions.
    pub succeeded: usize,
    /// Failed executions.
    pub failed: usize,
    /// `succeeded / finished`; 1.0 when nothing finished.
    pub success_rate: f64,
    /// Mean duration of executions with a known duration.
    pub avg_duration_ms: f64,
    /// Median duration.
    pub p50_ms: u64,
    /// 95th percentile duration.
    pub p95_ms: u64,
    /// 99th percentile duration.
    pub p99_ms: u64,
    /// Tokens across all executions.
    pub total_tokens: u64,
    /// Cost across all executions.
    pub total_cost: f64,
    /// Failed executions by error category.
    pub error_categories: BTreeMap<String, usize>,
    /// Outcome counts by stage id.
    pub stage_stats: BTreeMap<String, StageStats>,
}

/// Computes aggregate metrics.
pub fn aggregate(metrics: &[ExecutionMetrics]) -> AggregateMetrics {
    let mut agg = AggregateMetrics {
        total: metrics.len(),
        ..AggregateMetrics::default()
    };

    let mut durations = Vec::with_capacity(metrics.len());
    for m in metrics {
        match m.status {
            PipelineStatus::Completed => agg.succeeded += 1,
            PipelineStatus::Failed => {
                agg.failed += 1;
                let category = m.error.as_deref().map_or("other", categorize_error);
                *agg.error_categories.entry(category.to_string()).or_default() += 1;
            }
            _ => {}
        }
        if let Some(d) = m.duration_ms {
            durations.push(d);
        }
        agg.total_tokens += m.token_usage.total_tokens;
        agg.total_cost += m.cost;

        for stage in &m.stages {
            let stats = agg.stage_stats.entry(stage.stage_id.clone()).or_default();
            match stage.status {
                StageStatus::Completed | StageStatus::Skipped => stats.succeeded += 1,
                StageStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
    }

    let finished = agg.succeeded + agg.failed;
    agg.success_rate = if finished == 0 {
        1.0
    } else {
        agg.succeeded as f64 / finished as f64
    };

    durations.sort_unstable();
    if !durations.is_empty() {
        agg.avg_duration_ms = durations.iter().sum::<u64>() as f64 / durations.len() as f64;
    }
    agg.p50_ms = percentile(&durations, 50.0);
    agg.p95_ms = percentile(&durations, 95.0);
    agg.p99_ms = percentile(&durations, 99.0);

    agg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::StageMetricsEntry;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;

    fn run(id: &str, status: PipelineStatus, duration_ms: u64, error: Option<&str>) -> ExecutionMetrics {
        let mut m = ExecutionMetrics::new(id, "chapter", now_utc());
        m.status = status;
        m.duration_ms = Some(duration_ms);
        m.error = error.map(String::from);
        m
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted = [100, 200, 300, 400, 500];
        assert_eq!(percentile(&sorted, 50.0), 300);
        assert_eq!(percentile(&sorted, 95.0), 500);
        assert_eq!(percentile(&sorted, 0.0), 100);
        assert_eq!(percentile(&[], 95.0), 0);
    }

    #[test]
    fn test_aggregate_durations() {
        let runs: Vec<_> = [100, 200, 300, 400, 500]
            .iter()
            .enumerate()
            .map(|(i, d)| run(&format!("e{i}"), PipelineStatus::Completed, *d, None))
            .collect();

        let agg = aggregate(&runs);
        assert_eq!(agg.total, 5);
        assert_eq!(agg.p50_ms, 300);
        assert_eq!(agg.p95_ms, 500);
        assert!((agg.avg_duration_ms - 300.0).abs() < f64::EPSILON);
        assert!((agg.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(categorize_error("429 Too Many Requests"), "rate_limit");
        assert_eq!(categorize_error("request timed out"), "timeout");
        assert_eq!(categorize_error("ECONNRESET"), "network");
        assert_eq!(categorize_error("blocked by safety system"), "content_filter");
        assert_eq!(categorize_error("maximum context length exceeded"), "context_overflow");
        assert_eq!(categorize_error("bad json"), "other");

        let runs = vec![
            run("a", PipelineStatus::Completed, 10, None),
            run("b", PipelineStatus::Failed, 10, Some("rate limit hit")),
            run("c", PipelineStatus::Failed, 10, Some("rate limit hit")),
            run("d", PipelineStatus::Failed, 10, Some("unexpected")),
        ];
        let agg = aggregate(&runs);
        assert_eq!(agg.failed, 3);
        assert_eq!(agg.error_categories.get("rate_limit"), Some(&2));
        assert_eq!(agg.error_categories.get("other"), Some(&1));
        assert!((agg.success_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stage_stats() {
        let mut m = run("a", PipelineStatus::Failed, 10, Some("x"));
        m.stages = vec![
            StageMetricsEntry {
                stage_id: "draft".into(),
                stage_index: 0,
                status: StageStatus::Completed,
                duration_ms: Some(5),
                retry_count: 0,
                error: None,
            },
            StageMetricsEntry {
                stage_id: "review".into(),
                stage_index: 1,
                status: StageStatus::Failed,
                duration_ms: Some(5),
                retry_count: 2,
                error: Some("x".into()),
            },
        ];

        let agg = aggregate(&[m]);
        assert_eq!(agg.stage_stats["draft"], StageStats { succeeded: 1, failed: 0 });
        assert_eq!(agg.stage_stats["review"], StageStats { succeeded: 0, failed: 1 });
    }
}
