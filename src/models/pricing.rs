use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::catalog::ModelId;
use crate::models::provider::TokenUsage;

/// Published USD rates per million tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
    pub context_window: u32,
    /// Premium tokens are metered separately for billing.
    pub premium: bool,
}

impl ModelPricing {
    const fn new(input_cents: u32, output_cents: u32, context_window: u32, premium: bool) -> Self {
        Self {
            input_per_million: Decimal::from_parts(input_cents, 0, 0, false, 2),
            output_per_million: Decimal::from_parts(output_cents, 0, 0, false, 2),
            context_window,
            premium,
        }
    }

    /// Mean of input and output rate, in cents per million tokens.
    pub fn blended_cents_per_million(&self) -> Decimal {
        (self.input_per_million + self.output_per_million) / Decimal::from(2) * Decimal::from(100)
    }
}

const MILLION: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Pricing for a model, `None` for the `auto` sentinel.
pub fn pricing_for(model: ModelId) -> Option<ModelPricing> {
    let pricing = match model {
        ModelId::Auto => return None,
        ModelId::ClaudeOpus => ModelPricing::new(1500, 7500, 200_000, true),
        ModelId::ClaudeSonnet => ModelPricing::new(300, 1500, 200_000, true),
        ModelId::ClaudeHaiku => ModelPricing::new(80, 400, 200_000, false),
        ModelId::Gpt4o => ModelPricing::new(250, 1000, 128_000, true),
        ModelId::Gpt4oMini => ModelPricing::new(15, 60, 128_000, false),
        ModelId::O3Mini => ModelPricing::new(110, 440, 200_000, true),
        ModelId::GeminiPro => ModelPricing::new(125, 1000, 1_000_000, true),
        ModelId::GeminiFlash => ModelPricing::new(10, 40, 1_000_000, false),
        ModelId::Presentation => ModelPricing::new(50, 200, 128_000, false),
    };
    Some(pricing)
}

/// `(input / 1e6) * input_rate + (output / 1e6) * output_rate`, in USD.
pub fn calculate_cost(model: ModelId, input_tokens: u64, output_tokens: u64) -> Decimal {
    let Some(pricing) = pricing_for(model) else {
        warn!("No pricing for model {}, treating cost as zero", model);
        return Decimal::ZERO;
    };

    let input_cost = Decimal::from(input_tokens) * pricing.input_per_million / MILLION;
    let output_cost = Decimal::from(output_tokens) * pricing.output_per_million / MILLION;
    input_cost + output_cost
}

/// Cost of a reported usage block; unknown usage counts as zero tokens.
pub fn cost_of_usage(model: ModelId, usage: Option<&TokenUsage>) -> Decimal {
    match usage {
        Some(usage) => calculate_cost(model, usage.input_tokens as u64, usage.output_tokens as u64),
        None => Decimal::ZERO,
    }
}

pub fn is_premium(model: ModelId) -> bool {
    pricing_for(model).map(|p| p.premium).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_one_million_tokens_costs_published_rate() {
        for model in ModelId::CONCRETE {
            let pricing = pricing_for(model).unwrap();
            assert_eq!(calculate_cost(model, 1_000_000, 0), pricing.input_per_million);
            assert_eq!(calculate_cost(model, 0, 1_000_000), pricing.output_per_million);
        }
    }

    #[test]
    fn test_cost_is_additive() {
        let model = ModelId::ClaudeSonnet;
        let combined = calculate_cost(model, 1_234, 5_678);
        let split = calculate_cost(model, 1_234, 0) + calculate_cost(model, 0, 5_678);
        assert_eq!(combined, split);
        assert_eq!(
            calculate_cost(model, 2_000, 0),
            calculate_cost(model, 1_000, 0) * Decimal::from(2)
        );
    }

    #[test]
    fn test_known_rates() {
        assert_eq!(
            pricing_for(ModelId::Gpt4oMini).unwrap().input_per_million,
            Decimal::from_str("0.15").unwrap()
        );
        assert_eq!(
            calculate_cost(ModelId::ClaudeOpus, 1_000, 1_000),
            Decimal::from_str("0.09").unwrap()
        );
    }

    #[test]
    fn test_auto_and_missing_usage_cost_nothing() {
        assert_eq!(calculate_cost(ModelId::Auto, 10_000, 10_000), Decimal::ZERO);
        assert_eq!(cost_of_usage(ModelId::ClaudeOpus, None), Decimal::ZERO);
        assert!(calculate_cost(ModelId::GeminiFlash, 0, 0) >= Decimal::ZERO);
    }

    #[test]
    fn test_blended_rate() {
        let flash = pricing_for(ModelId::GeminiFlash).unwrap();
        assert_eq!(flash.blended_cents_per_million(), Decimal::from(25));
    }
}
