use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::models::catalog::ModelId;

/// Subscription level. Governs the selector's routing tree and quota limits.
///
/// Parsing never fails: unrecognized values resolve to `Free`, the lowest
/// privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UserTier {
    Free,
    Pro,
    Business,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub daily_tokens: u64,
    pub monthly_tokens: u64,
}

const FREE_MODELS: &[ModelId] = &[ModelId::GeminiFlash, ModelId::Gpt4oMini, ModelId::Presentation];

const PRO_MODELS: &[ModelId] = &[
    ModelId::GeminiFlash,
    ModelId::Gpt4oMini,
    ModelId::Presentation,
    ModelId::ClaudeHaiku,
    ModelId::ClaudeSonnet,
    ModelId::Gpt4o,
    ModelId::GeminiPro,
];

const BUSINESS_MODELS: &[ModelId] = &[
    ModelId::GeminiFlash,
    ModelId::Gpt4oMini,
    ModelId::Presentation,
    ModelId::ClaudeHaiku,
    ModelId::ClaudeSonnet,
    ModelId::Gpt4o,
    ModelId::GeminiPro,
    ModelId::O3Mini,
];

impl UserTier {
    pub const ALL: [UserTier; 4] = [UserTier::Free, UserTier::Pro, UserTier::Business, UserTier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Pro => "pro",
            UserTier::Business => "business",
            UserTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => UserTier::Free,
            "pro" => UserTier::Pro,
            "business" => UserTier::Business,
            "enterprise" => UserTier::Enterprise,
            other => {
                warn!("Unrecognized tier {:?}, treating as free", other);
                UserTier::Free
            }
        }
    }

    pub fn limits(&self) -> TierLimits {
        let (daily_tokens, monthly_tokens) = match self {
            UserTier::Free => (50_000, 1_000_000),
            UserTier::Pro => (500_000, 10_000_000),
            UserTier::Business => (2_000_000, 50_000_000),
            UserTier::Enterprise => (10_000_000, 250_000_000),
        };
        TierLimits { daily_tokens, monthly_tokens }
    }

    pub fn allowed_models(&self) -> &'static [ModelId] {
        match self {
            UserTier::Free => FREE_MODELS,
            UserTier::Pro => PRO_MODELS,
            UserTier::Business => BUSINESS_MODELS,
            UserTier::Enterprise => &ModelId::CONCRETE,
        }
    }

    pub fn allows(&self, model: ModelId) -> bool {
        self.allowed_models().contains(&model)
    }

    /// Free accounts never run into metered overage.
    pub fn supports_overage(&self) -> bool {
        !matches!(self, UserTier::Free)
    }
}

impl Default for UserTier {
    fn default() -> Self {
        UserTier::Free
    }
}

impl fmt::Display for UserTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for UserTier {
    fn from(value: String) -> Self {
        UserTier::parse(&value)
    }
}

impl From<UserTier> for String {
    fn from(tier: UserTier) -> Self {
        tier.as_str().to_string()
    }
}
