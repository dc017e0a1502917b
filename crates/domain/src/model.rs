//! Model catalog records advertised by provider adapters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::stream::TokenUsage;

/// Capabilities and pricing of one model within a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    /// Total context window in tokens. Zero disables overflow checks.
    #[serde(default = "d_context_limit")]
    pub context_limit: u64,
    #[serde(default = "d_output_limit")]
    pub output_limit: u64,
    #[serde(default = "d_true")]
    pub supports_tools: bool,
    #[serde(default = "d_true")]
    pub supports_streaming: bool,
    /// USD per 1M input tokens.
    #[serde(default)]
    pub cost_input: f64,
    /// USD per 1M output tokens.
    #[serde(default)]
    pub cost_output: f64,
}

impl ModelInfo {
    /// Estimated USD cost of a completed call at this model's rates.
    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / 1_000_000.0 * self.cost_input
            + usage.output_tokens as f64 / 1_000_000.0 * self.cost_output
    }
}

/// A provider and its model catalog, as surfaced to enumerating callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: HashMap<String, ModelInfo>,
}

fn d_context_limit() -> u64 {
    128_000
}
fn d_output_limit() -> u64 {
    8_192
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(cost_input: f64, cost_output: f64) -> ModelInfo {
        ModelInfo {
            id: "m".into(),
            name: "M".into(),
            provider_id: "p".into(),
            context_limit: 128_000,
            output_limit: 8_192,
            supports_tools: true,
            supports_streaming: true,
            cost_input,
            cost_output,
        }
    }

    #[test]
    fn cost_uses_per_million_rates() {
        let m = model(3.0, 15.0);
        let usage = TokenUsage {
            input_tokens: 1_000,
            output_tokens: 500,
        };
        // (1000/1M * 3) + (500/1M * 15) = 0.003 + 0.0075
        assert!((m.cost_of(&usage) - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn free_model_costs_nothing() {
        let m = model(0.0, 0.0);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        assert_eq!(m.cost_of(&usage), 0.0);
    }

    #[test]
    fn defaults_fill_in_on_deserialize() {
        let m: ModelInfo = serde_json::from_value(serde_json::json!({
            "id": "x", "name": "X", "provider_id": "p"
        }))
        .unwrap();
        assert_eq!(m.context_limit, 128_000);
        assert_eq!(m.output_limit, 8_192);
        assert!(m.supports_tools);
        assert!(m.supports_streaming);
        assert_eq!(m.cost_input, 0.0);
    }
}
