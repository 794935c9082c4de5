//! Deterministic model selection.
//!
//! `select_best_model` is pure: the same messages, tier and context always
//! produce the same model. The caller's explicit preference wins outright,
//! a presentation request short-circuits to the presentation model, and
//! otherwise each tier walks its own decision tree.

use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::catalog::ModelId;
use crate::models::pricing::pricing_for;
use crate::models::provider::{ChatMessage, MessageRole};
use crate::quota::tier::UserTier;

const COMPLEX_MESSAGE_COUNT: usize = 10;
const COMPLEX_CHARACTER_COUNT: usize = 8_000;
const LONG_MESSAGE_CHARACTERS: usize = 2_000;

/// Per-request hints. Flags here are OR'ed with what the selector infers
/// from the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSelectionContext {
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub is_code_task: bool,
    #[serde(default)]
    pub requires_reasoning: bool,
    /// Ceiling on the blended (input + output) / 2 rate, in cents per
    /// million tokens.
    #[serde(default)]
    pub max_budget_cents_per_mtok: Option<Decimal>,
    #[serde(default)]
    pub user_preference: Option<ModelId>,
}

/// What the latest user message and the conversation shape suggest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSignals {
    pub code: bool,
    pub writing: bool,
    pub analysis: bool,
    pub reasoning: bool,
    pub presentation: bool,
    pub long_message: bool,
    pub complex_context: bool,
    pub tools: bool,
}

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("selector patterns are valid"))
}

fn code_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"(?i)```|\b(code|function|bugs?|debug\w*|compile\w*|errors?|exception|stack ?trace|refactor\w*|regex|sql|api|python|rust|javascript|typescript|java|golang|c\+\+)\b",
    )
}

fn writing_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"(?i)\b(write|rewrite|draft|essay|email|blog|article|story|poem|cover letter|proofread|edit my)\b",
    )
}

fn analysis_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"(?i)\b(analy[sz]e|analysis|compare|comparison|evaluate|assess|summari[sz]e|breakdown|trends?|insights?)\b",
    )
}

fn reasoning_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"(?i)\b(why|reason|reasoning|prove|proof|step by step|walk me through|think through|logic|logical|derive|explain how)\b",
    )
}

fn presentation_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(slides?|slide ?deck|deck|presentation|powerpoint|pptx|keynote)\b")
}

/// Classifies the most recent user message and the conversation as a whole.
/// An empty conversation carries no signal.
pub fn classify(messages: &[ChatMessage], context: &ModelSelectionContext) -> TaskSignals {
    let latest = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");

    let total_characters: usize = messages.iter().map(|m| m.content.chars().count()).sum();

    TaskSignals {
        code: context.is_code_task || code_pattern().is_match(latest),
        writing: writing_pattern().is_match(latest),
        analysis: analysis_pattern().is_match(latest),
        reasoning: context.requires_reasoning || reasoning_pattern().is_match(latest),
        presentation: presentation_pattern().is_match(latest),
        long_message: latest.chars().count() > LONG_MESSAGE_CHARACTERS,
        complex_context: messages.len() > COMPLEX_MESSAGE_COUNT || total_characters > COMPLEX_CHARACTER_COUNT,
        tools: context.has_tools,
    }
}

pub fn select_best_model(messages: &[ChatMessage], tier: UserTier, context: &ModelSelectionContext) -> ModelId {
    if let Some(preferred) = context.user_preference.filter(|m| !m.is_auto()) {
        debug!("Using caller preference {}", preferred);
        return preferred;
    }

    let signals = classify(messages, context);
    if signals.presentation {
        debug!("Presentation task detected, routing to {}", ModelId::Presentation);
        return ModelId::Presentation;
    }

    let chosen = match tier {
        UserTier::Free => select_free(&signals),
        UserTier::Pro => select_pro(&signals),
        UserTier::Business => select_business(&signals),
        UserTier::Enterprise => select_enterprise(&signals),
    };

    let selected = match context.max_budget_cents_per_mtok {
        Some(budget) => apply_budget(chosen, tier, budget),
        None => chosen,
    };
    debug!("Selected {} for tier {} ({:?})", selected, tier, signals);
    selected
}

/// Cheapest options only; long inputs go to the larger-context mini model.
fn select_free(s: &TaskSignals) -> ModelId {
    if s.code {
        ModelId::GeminiFlash
    } else if s.reasoning && s.complex_context {
        ModelId::Gpt4oMini
    } else if s.long_message {
        ModelId::Gpt4oMini
    } else if s.tools {
        ModelId::Gpt4oMini
    } else {
        ModelId::GeminiFlash
    }
}

fn select_pro(s: &TaskSignals) -> ModelId {
    if s.code {
        ModelId::ClaudeSonnet
    } else if s.reasoning && s.complex_context {
        ModelId::ClaudeSonnet
    } else if s.long_message {
        ModelId::GeminiPro
    } else if s.tools {
        ModelId::Gpt4o
    } else if s.analysis {
        ModelId::Gpt4o
    } else if s.writing {
        ModelId::ClaudeSonnet
    } else {
        ModelId::ClaudeHaiku
    }
}

fn select_business(s: &TaskSignals) -> ModelId {
    if s.code {
        ModelId::ClaudeSonnet
    } else if s.reasoning && s.complex_context {
        ModelId::O3Mini
    } else if s.reasoning {
        ModelId::ClaudeSonnet
    } else if s.long_message {
        ModelId::GeminiPro
    } else if s.tools {
        ModelId::ClaudeSonnet
    } else if s.analysis {
        ModelId::Gpt4o
    } else {
        ModelId::ClaudeSonnet
    }
}

fn select_enterprise(s: &TaskSignals) -> ModelId {
    if s.reasoning {
        ModelId::ClaudeOpus
    } else if s.code {
        ModelId::ClaudeOpus
    } else if s.long_message {
        ModelId::GeminiPro
    } else if s.tools {
        ModelId::ClaudeSonnet
    } else if s.analysis {
        ModelId::ClaudeOpus
    } else {
        ModelId::ClaudeSonnet
    }
}

fn blended_rate(model: ModelId) -> Decimal {
    pricing_for(model)
        .map(|p| p.blended_cents_per_million())
        .unwrap_or(Decimal::ZERO)
}

/// Keeps `chosen` if it fits the budget, else the priciest general-purpose
/// model the tier allows within budget, else the tier's cheapest.
fn apply_budget(chosen: ModelId, tier: UserTier, budget: Decimal) -> ModelId {
    if blended_rate(chosen) <= budget {
        return chosen;
    }

    let candidates = tier
        .allowed_models()
        .iter()
        .copied()
        .filter(|m| *m != ModelId::Presentation);

    let within_budget = candidates
        .clone()
        .filter(|m| blended_rate(*m) <= budget)
        .max_by_key(|m| blended_rate(*m));

    let replacement = within_budget
        .or_else(|| candidates.min_by_key(|m| blended_rate(*m)))
        .unwrap_or(ModelId::CHEAPEST_DEFAULT);

    debug!("{} exceeds budget of {} cents/Mtok, using {}", chosen, budget, replacement);
    replacement
}
