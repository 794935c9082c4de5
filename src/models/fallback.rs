use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::catalog::ModelId;

/// Ordered, duplicate-free substitutes for a model, primary first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackChain {
    models: Vec<ModelId>,
}

impl FallbackChain {
    /// Forces `primary` to the front and removes repeats, keeping first
    /// occurrences.
    pub fn normalized(primary: ModelId, candidates: impl IntoIterator<Item = ModelId>) -> Self {
        let mut models = vec![primary];
        for model in candidates {
            if !models.contains(&model) {
                models.push(model);
            }
        }
        Self { models }
    }

    pub fn primary(&self) -> ModelId {
        self.models[0]
    }

    pub fn models(&self) -> &[ModelId] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, model: ModelId) -> bool {
        self.models.contains(&model)
    }
}

impl IntoIterator for FallbackChain {
    type Item = ModelId;
    type IntoIter = std::vec::IntoIter<ModelId>;

    fn into_iter(self) -> Self::IntoIter {
        self.models.into_iter()
    }
}

/// The curated chain for `model`: same vendor and price band first, then
/// cross-vendor, decreasing in capability.
pub fn get_fallback_chain(model: ModelId) -> FallbackChain {
    use ModelId::*;

    let substitutes: &[ModelId] = match model {
        ClaudeOpus => &[ClaudeSonnet, Gpt4o, GeminiPro],
        ClaudeSonnet => &[ClaudeHaiku, Gpt4o, GeminiPro],
        ClaudeHaiku => &[Gpt4oMini, GeminiFlash],
        Gpt4o => &[Gpt4oMini, ClaudeSonnet, GeminiPro],
        Gpt4oMini => &[GeminiFlash, ClaudeHaiku],
        O3Mini => &[Gpt4o, ClaudeSonnet],
        GeminiPro => &[GeminiFlash, Gpt4o],
        GeminiFlash => &[Gpt4oMini, ClaudeHaiku],
        // Single-purpose model with no substitute.
        Presentation => &[],
        Auto => &[ModelId::CHEAPEST_DEFAULT],
    };

    FallbackChain::normalized(model, substitutes.iter().copied())
}

/// Built-in chains with per-model overrides from configuration.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    overrides: HashMap<ModelId, Vec<ModelId>>,
}

impl FallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: HashMap<ModelId, Vec<ModelId>>) -> Self {
        Self { overrides }
    }

    pub fn chain_for(&self, model: ModelId) -> FallbackChain {
        match self.overrides.get(&model) {
            Some(custom) => {
                debug!("Using configured fallback chain for {}", model);
                FallbackChain::normalized(model, custom.iter().copied())
            }
            None => get_fallback_chain(model),
        }
    }
}
