//! Token cost estimation.

use crate::core::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Price per 1,000 tokens, in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Prompt (input) price.
    pub prompt_per_1k: f64,
    /// Completion (output) price.
    pub completion_per_1k: f64,
}

impl ModelPrice {
    /// Creates a price.
    pub const fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }
}

const BASELINE_MODEL: &str = "gpt-4o-mini";

/// Static price table with a baseline fallback for unknown models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTable {
    prices: HashMap<String, ModelPrice>,
    baseline: ModelPrice,
}

impl Default for CostTable {
    fn default() -> Self {
        let baseline = ModelPrice::new(0.000_15, 0.000_6);
        let prices = [
            ("gpt-4o", ModelPrice::new(0.0025, 0.01)),
            (BASELINE_MODEL, baseline),
            ("gpt-4-turbo", ModelPrice::new(0.01, 0.03)),
            ("claude-3-5-sonnet", ModelPrice::new(0.003, 0.015)),
            ("claude-3-haiku", ModelPrice::new(0.000_25, 0.001_25)),
            ("gemini-1.5-pro", ModelPrice::new(0.001_25, 0.005)),
        ]
        .into_iter()
        .map(|(model, price)| (model.to_string(), price))
        .collect();

        Self { prices, baseline }
    }
}

impl CostTable {
    /// The built-in table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a model price.
    #[must_use]
    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    /// Price of `model`, or the baseline when unknown or absent.
    pub fn price(&self, model: Option<&str>) -> ModelPrice {
        model
            .and_then(|m| self.prices.get(m))
            .copied()
            .unwrap_or(self.baseline)
    }

    /// Estimated dollar cost of `usage` on `model`.
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self, model: Option<&str>, usage: &TokenUsage) -> f64 {
        let price = self.price(model);
        (usage.prompt_tokens as f64 / 1000.0) * price.prompt_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * price.completion_per_1k
    }
}
