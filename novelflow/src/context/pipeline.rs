//! Typed pipeline context.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Review scores produced by a quality-review stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewScores {
    /// Overall score (0-100 by convention).
    pub overall: f64,
    /// Per-dimension scores (pacing, prose, consistency...).
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    /// Reviewer feedback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Context accumulated across the stages of one execution.
///
/// The context is never mutated in place while a stage runs: each stage sees
/// an immutable snapshot, and the engine swaps in the result of
/// [`PipelineContext::merge`] between stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    setup: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outline: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chapter_outline: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chapter_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    review: Option<ReviewScores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    truncate_to_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    soften_content: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    reduce_load: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extensions: BTreeMap<String, serde_json::Value>,
}

impl PipelineContext {
    /// Creates an empty context at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of merges applied so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Novel setup data (premise, characters, world).
    #[must_use]
    pub fn setup(&self) -> Option<&serde_json::Value> {
        self.setup.as_ref()
    }

    /// Novel-level outline.
    #[must_use]
    pub fn outline(&self) -> Option<&serde_json::Value> {
        self.outline.as_ref()
    }

    /// Expanded outline for the current chapter.
    #[must_use]
    pub fn chapter_outline(&self) -> Option<&serde_json::Value> {
        self.chapter_outline.as_ref()
    }

    /// Generated chapter text.
    #[must_use]
    pub fn chapter_content(&self) -> Option<&str> {
        self.chapter_content.as_deref()
    }

    /// Latest review scores.
    #[must_use]
    pub fn review(&self) -> Option<&ReviewScores> {
        self.review.as_ref()
    }

    /// Output of the finalize stage.
    #[must_use]
    pub fn final_output(&self) -> Option<&serde_json::Value> {
        self.final_output.as_ref()
    }

    /// Token budget the next generation should truncate its input to.
    #[must_use]
    pub fn truncate_to_tokens(&self) -> Option<u32> {
        self.truncate_to_tokens
    }

    /// Whether the next generation should soften its prompt.
    #[must_use]
    pub fn soften_content(&self) -> bool {
        self.soften_content
    }

    /// Whether stages should reduce request size/concurrency.
    #[must_use]
    pub fn reduce_load(&self) -> bool {
        self.reduce_load
    }

    /// Variation seed for branch generation.
    #[must_use]
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Plugin-specific value.
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }

    /// Returns a new context with the update applied and the version bumped.
    #[must_use]
    pub fn merge(&self, update: &ContextUpdate) -> Self {
        let mut next = self.clone();
        next.version += 1;

        if let Some(v) = &update.setup {
            next.setup = Some(v.clone());
        }
        if let Some(v) = &update.outline {
            next.outline = Some(v.clone());
        }
        if let Some(v) = &update.chapter_outline {
            next.chapter_outline = Some(v.clone());
        }
        if let Some(v) = &update.chapter_content {
            next.chapter_content = Some(v.clone());
        }
        if let Some(v) = &update.review {
            next.review = Some(v.clone());
        }
        if let Some(v) = &update.final_output {
            next.final_output = Some(v.clone());
        }
        if let Some(v) = update.truncate_to_tokens {
            next.truncate_to_tokens = Some(v);
        }
        if let Some(v) = update.soften_content {
            next.soften_content = v;
        }
        if let Some(v) = update.reduce_load {
            next.reduce_load = v;
        }
        if let Some(v) = update.seed {
            next.seed = Some(v);
        }
        if update.clear_cached {
            next.chapter_content = None;
            next.review = None;
            next.final_output = None;
        }
        for (k, v) in &update.extensions {
            if v.is_null() {
                next.extensions.remove(k);
            } else {
                next.extensions.insert(k.clone(), v.clone());
            }
        }

        next
    }
}

/// Fields a stage (or the healing layer) contributes to the context.
///
/// `None` leaves a field untouched. A `null` extension value removes the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextUpdate {
    /// New setup data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<serde_json::Value>,
    /// New novel outline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<serde_json::Value>,
    /// New chapter outline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_outline: Option<serde_json::Value>,
    /// New chapter text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_content: Option<String>,
    /// New review scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewScores>,
    /// New final output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<serde_json::Value>,
    /// Truncation budget for the next generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_to_tokens: Option<u32>,
    /// Toggle prompt softening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soften_content: Option<bool>,
    /// Toggle load reduction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_load: Option<bool>,
    /// Branch seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Drop generated artifacts (content, review, final output).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_cached: bool,
    /// Plugin-specific values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ContextUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the novel outline.
    #[must_use]
    pub fn outline(mut self, outline: serde_json::Value) -> Self {
        self.outline = Some(outline);
        self
    }

    /// Sets the setup data.
    #[must_use]
    pub fn setup(mut self, setup: serde_json::Value) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Sets the chapter outline.
    #[must_use]
    pub fn chapter_outline(mut self, outline: serde_json::Value) -> Self {
        self.chapter_outline = Some(outline);
        self
    }

    /// Sets the chapter text.
    #[must_use]
    pub fn chapter_content(mut self, content: impl Into<String>) -> Self {
        self.chapter_content = Some(content.into());
        self
    }

    /// Sets review scores.
    #[must_use]
    pub fn review(mut self, review: ReviewScores) -> Self {
        self.review = Some(review);
        self
    }

    /// Sets the final output.
    #[must_use]
    pub fn final_output(mut self, output: serde_json::Value) -> Self {
        self.final_output = Some(output);
        self
    }

    /// Sets the truncation budget.
    #[must_use]
    pub fn truncate_to_tokens(mut self, budget: u32) -> Self {
        self.truncate_to_tokens = Some(budget);
        self
    }

    /// Sets the softening flag.
    #[must_use]
    pub fn soften_content(mut self, soften: bool) -> Self {
        self.soften_content = Some(soften);
        self
    }

    /// Sets the load-reduction flag.
    #[must_use]
    pub fn reduce_load(mut self, reduce: bool) -> Self {
        self.reduce_load = Some(reduce);
        self
    }

    /// Sets the branch seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Drops generated artifacts on merge.
    #[must_use]
    pub fn clear_cached(mut self) -> Self {
        self.clear_cached = true;
        self
    }

    /// Sets a plugin-specific value.
    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Returns true if applying the update changes nothing but the version.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_returns_new_version() {
        let ctx = PipelineContext::new();
        let next = ctx.merge(&ContextUpdate::new().chapter_content("It was a dark night."));

        assert_eq!(ctx.version(), 0);
        assert!(ctx.chapter_content().is_none());
        assert_eq!(next.version(), 1);
        assert_eq!(next.chapter_content(), Some("It was a dark night."));
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let ctx = PipelineContext::new()
            .merge(&ContextUpdate::new().outline(serde_json::json!({"acts": 3})));
        let next = ctx.merge(&ContextUpdate::new().review(ReviewScores {
            overall: 82.0,
            ..ReviewScores::default()
        }));

        assert_eq!(next.outline(), Some(&serde_json::json!({"acts": 3})));
        assert_eq!(next.review().map(|r| r.overall), Some(82.0));
    }

    #[test]
    fn test_clear_cached_and_extensions() {
        let ctx = PipelineContext::new().merge(
            &ContextUpdate::new()
                .chapter_content("draft")
                .outline(serde_json::json!("outline"))
                .extension("style", serde_json::json!("noir")),
        );
        let next = ctx.merge(
            &ContextUpdate::new()
                .clear_cached()
                .extension("style", serde_json::Value::Null),
        );

        assert!(next.chapter_content().is_none());
        assert!(next.outline().is_some());
        assert!(next.extension("style").is_none());
    }

    #[test]
    fn test_update_is_empty() {
        assert!(ContextUpdate::new().is_empty());
        assert!(!ContextUpdate::new().seed(7).is_empty());
    }

    #[test]
    fn test_context_serialization_round_trip() {
        let ctx = PipelineContext::new().merge(
            &ContextUpdate::new()
                .truncate_to_tokens(4000)
                .soften_content(true),
        );
        let json = serde_json::to_string(&ctx).unwrap();
        let back: PipelineContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
