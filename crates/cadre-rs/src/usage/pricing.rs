//! Static per-model price table.
//!
//! Figures are approximate list prices in USD per million tokens. They exist
//! to surface runaway spend in status displays, not for billing.

/// Per-model pricing (USD per 1M tokens).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Estimate cost for given token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

#[derive(Clone, Copy)]
enum Rule {
    Contains(&'static str),
    StartsWith(&'static str),
}

impl Rule {
    fn matches(self, name: &str) -> bool {
        match self {
            Rule::Contains(needle) => name.contains(needle),
            Rule::StartsWith(prefix) => name.starts_with(prefix),
        }
    }
}

// First match wins, so narrower names come before their families.
const PRICE_TABLE: &[(Rule, ModelPricing)] = &[
    (Rule::Contains("opus"), ModelPricing::new(15.0, 75.0)),
    (Rule::Contains("sonnet"), ModelPricing::new(3.0, 15.0)),
    (Rule::Contains("haiku"), ModelPricing::new(0.25, 1.25)),
    (Rule::Contains("4o-mini"), ModelPricing::new(0.15, 0.60)),
    (Rule::Contains("gpt-4"), ModelPricing::new(2.50, 10.0)),
    (Rule::StartsWith("o1"), ModelPricing::new(15.0, 60.0)),
    (Rule::StartsWith("o3"), ModelPricing::new(15.0, 60.0)),
    (Rule::Contains("flash"), ModelPricing::new(0.075, 0.30)),
    (Rule::Contains("gemini"), ModelPricing::new(1.25, 5.0)),
    (Rule::Contains("deepseek"), ModelPricing::new(0.27, 1.10)),
];

/// Look up pricing by model id.
///
/// Only the segment after the last `/` is inspected, so organisation
/// prefixes such as `my-org/custom-sonnet` do not skew the match.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    PRICE_TABLE
        .iter()
        .find(|(rule, _)| rule.matches(&name))
        .map(|(_, pricing)| *pricing)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_estimation() {
        let cost = ModelPricing::new(3.0, 15.0).estimate_cost(1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 0.01);
    }

    #[test]
    fn known_models() {
        assert!(pricing_for_model("anthropic/claude-opus-4").input_per_million > 10.0);
        assert!(pricing_for_model("anthropic/claude-3.5-haiku").input_per_million < 1.0);
        assert_eq!(
            pricing_for_model("openai/gpt-4o-mini"),
            ModelPricing::new(0.15, 0.60)
        );
        assert_eq!(
            pricing_for_model("google/gemini-2.0-flash"),
            ModelPricing::new(0.075, 0.30)
        );
    }

    #[test]
    fn org_prefix_is_ignored() {
        assert_eq!(
            pricing_for_model("opus-labs/tiny-model"),
            ModelPricing::default()
        );
    }
}
