//! Per-model token prices used for cost accounting.

use patcher_core::resilience::TokenUsage;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_mtok
            + usage.completion_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Longest matching prefix wins, so list specific models before families.
const PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
    ("gpt-4o", ModelPrice::new(2.50, 10.00)),
    ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
    ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
    ("gpt-4.1", ModelPrice::new(2.00, 8.00)),
    ("o4-mini", ModelPrice::new(1.10, 4.40)),
    ("o3", ModelPrice::new(2.00, 8.00)),
];

/// Charged for models missing from the table, so unknown spend is never free.
pub const FALLBACK_PRICE: ModelPrice = ModelPrice::new(2.50, 10.00);

pub fn price_for(model: &str) -> ModelPrice {
    PRICES
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, price)| *price)
        .unwrap_or(FALLBACK_PRICE)
}

pub fn cost_of(model: &str, usage: &TokenUsage) -> f64 {
    price_for(model).cost(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), ModelPrice::new(0.15, 0.60));
        assert_eq!(price_for("gpt-4o-2024-08-06"), ModelPrice::new(2.50, 10.00));
        assert_eq!(price_for("gpt-4.1-mini"), ModelPrice::new(0.40, 1.60));
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        assert_eq!(price_for("local-coder"), FALLBACK_PRICE);
    }

    #[test]
    fn test_cost_of_usage() {
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 500_000,
        };
        let cost = cost_of("gpt-4o-mini", &usage);
        assert!((cost - 0.45).abs() < 1e-9);
    }
}
