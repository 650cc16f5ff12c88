use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cumulative call and token counters for a single model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl ModelUsage {
    pub fn single_call(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            total_calls: 1,
            total_input_tokens: input_tokens,
            total_output_tokens: output_tokens,
        }
    }

    pub fn add(&mut self, other: &ModelUsage) {
        self.total_calls += other.total_calls;
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
    }
}

/// Per-model usage counters, merged by summation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub models: BTreeMap<String, ModelUsage>,
}

impl UsageSummary {
    pub fn record(&mut self, model: &str, usage: ModelUsage) {
        self.models.entry(model.to_string()).or_default().add(&usage);
    }

    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.models {
            self.models.entry(model.clone()).or_default().add(usage);
        }
    }

    pub fn total_calls(&self) -> u64 {
        self.models.values().map(|usage| usage.total_calls).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
