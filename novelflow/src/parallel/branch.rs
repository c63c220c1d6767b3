//! N seeded runs of one stage, for picking the best candidate later.

use super::executor::{ParallelExecutor, ParallelTask, TaskReport};
use crate::cancellation::CancellationToken;
use crate::config::ParallelConfig;
use crate::context::{ContextUpdate, StageContext};
use crate::events::EventSink;
use crate::stages::Stage;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

/// One candidate produced by a [`BranchGenerator`].
#[derive(Debug, Clone)]
pub struct Branch {
    /// Seed placed in the branch's context.
    pub seed: u64,
    /// How the run went.
    pub report: TaskReport,
}

/// All branches of one generation, in seed order.
#[derive(Debug, Clone)]
pub struct BranchResult {
    /// One entry per branch.
    pub branches: Vec<Branch>,
    /// Branches that succeeded.
    pub succeeded: usize,
    /// Branches that failed or timed out.
    pub failed: usize,
    /// Branches stopped by an abort.
    pub aborted: usize,
    /// Wall time of the generation.
    pub duration_ms: u64,
}

impl BranchResult {
    /// Successful branches as `(seed, output)` pairs.
    pub fn candidates(&self) -> impl Iterator<Item = (u64, &serde_json::Value)> {
        self.branches
            .iter()
            .filter_map(|b| b.report.output().map(|output| (b.seed, output)))
    }
}

/// Runs the same stage several times, each with its own seed.
#[derive(Debug, Clone)]
pub struct BranchGenerator {
    stage: Arc<dyn Stage>,
    executor: ParallelExecutor,
    base_seed: Option<u64>,
}

impl BranchGenerator {
    /// Creates a generator for `stage`.
    pub fn new(stage: Arc<dyn Stage>, config: ParallelConfig) -> Self {
        Self {
            stage,
            executor: ParallelExecutor::new(config),
            base_seed: None,
        }
    }

    /// Uses seeds `base, base + 1, ...` instead of a random base.
    #[must_use]
    pub fn with_base_seed(mut self, base: u64) -> Self {
        self.base_seed = Some(base);
        self
    }

    /// Routes stage events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_sink(sink);
        self
    }

    /// Uses `token` as the shared abort signal.
    #[must_use]
    pub fn with_abort(mut self, token: Arc<CancellationToken>) -> Self {
        self.executor = self.executor.with_abort(token);
        self
    }

    /// Seeds for `count` branches.
    pub fn seeds(&self, count: usize) -> Vec<u64> {
        let base = self.base_seed.unwrap_or_else(|| rand::thread_rng().gen());
        (0..count as u64).map(|i| base.wrapping_add(i)).collect()
    }

    /// Runs `count` branches. Each gets `template` with the seed merged into
    /// its pipeline context.
    pub async fn run(&self, template: &StageContext, count: usize) -> BranchResult {
        let seeds = self.seeds(count);
        info!(stage_id = self.stage.id(), branches = count, "Generating branches");

        let tasks: Vec<ParallelTask> = seeds
            .iter()
            .map(|seed| {
                let context = template.context().merge(&ContextUpdate::new().seed(*seed));
                let ctx = template.clone().with_context(Arc::new(context));
                (Arc::clone(&self.stage), ctx)
            })
            .collect();
        let result = self.executor.run(tasks).await;

        BranchResult {
            branches: seeds
                .into_iter()
                .zip(result.results)
                .map(|(seed, report)| Branch { seed, report })
                .collect(),
            succeeded: result.succeeded,
            failed: result.failed,
            aborted: result.aborted,
            duration_ms: result.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, RecordingStage};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_each_branch_sees_its_seed() {
        let log = CallLog::default();
        let generator = BranchGenerator::new(
            Arc::new(RecordingStage::new("draft", log.clone())),
            ParallelConfig::default(),
        )
        .with_base_seed(40);
        let template = StageContext::new("e1", "branch", "draft", 0);

        let result = generator.run(&template, 3).await;

        assert_eq!(result.succeeded, 3);
        let seeds: Vec<u64> = result.branches.iter().map(|b| b.seed).collect();
        assert_eq!(seeds, vec![40, 41, 42]);

        let mut seen: Vec<Option<u64>> = log.lock().iter().map(|c| c.seed).collect();
        seen.sort();
        assert_eq!(seen, vec![Some(40), Some(41), Some(42)]);

        let candidates: Vec<(u64, serde_json::Value)> =
            result.candidates().map(|(seed, output)| (seed, output.clone())).collect();
        assert_eq!(candidates[1], (41, serde_json::json!({"stage": "draft", "seed": 41})));
    }

    #[test]
    fn test_random_seeds_are_distinct() {
        let generator = BranchGenerator::new(
            Arc::new(RecordingStage::new("draft", CallLog::default())),
            ParallelConfig::default(),
        );
        let seeds = generator.seeds(4);
        assert_eq!(seeds.len(), 4);
        assert_eq!(seeds[3], seeds[0].wrapping_add(3));
    }

    #[tokio::test]
    async fn test_zero_branches() {
        let generator = BranchGenerator::new(
            Arc::new(RecordingStage::new("draft", CallLog::default())),
            ParallelConfig::default(),
        );
        let result = generator.run(&StageContext::new("e1", "branch", "draft", 0), 0).await;
        assert!(result.branches.is_empty());
        assert_eq!(result.candidates().count(), 0);
    }
}
