use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Every model the gateway can route to, plus the `auto` sentinel that asks
/// the selector to choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "claude-opus-4")]
    ClaudeOpus,
    #[serde(rename = "claude-sonnet-4")]
    ClaudeSonnet,
    #[serde(rename = "claude-3-5-haiku")]
    ClaudeHaiku,
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "o3-mini")]
    O3Mini,
    #[serde(rename = "gemini-2.5-pro")]
    GeminiPro,
    #[serde(rename = "gemini-2.0-flash")]
    GeminiFlash,
    #[serde(rename = "presentation-v1")]
    Presentation,
}

/// Backing provider families. Each one is served by a single
/// `StreamingProvider` registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    Google,
    Presentation,
}

impl ModelId {
    /// Concrete models, in declaration order.
    pub const CONCRETE: [ModelId; 9] = [
        ModelId::ClaudeOpus,
        ModelId::ClaudeSonnet,
        ModelId::ClaudeHaiku,
        ModelId::Gpt4o,
        ModelId::Gpt4oMini,
        ModelId::O3Mini,
        ModelId::GeminiPro,
        ModelId::GeminiFlash,
        ModelId::Presentation,
    ];

    /// The model every unknown chain degrades to.
    pub const CHEAPEST_DEFAULT: ModelId = ModelId::GeminiFlash;

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::Auto => "auto",
            ModelId::ClaudeOpus => "claude-opus-4",
            ModelId::ClaudeSonnet => "claude-sonnet-4",
            ModelId::ClaudeHaiku => "claude-3-5-haiku",
            ModelId::Gpt4o => "gpt-4o",
            ModelId::Gpt4oMini => "gpt-4o-mini",
            ModelId::O3Mini => "o3-mini",
            ModelId::GeminiPro => "gemini-2.5-pro",
            ModelId::GeminiFlash => "gemini-2.0-flash",
            ModelId::Presentation => "presentation-v1",
        }
    }

    /// Name the provider's API expects on the wire.
    pub fn api_name(&self) -> &'static str {
        match self {
            ModelId::Auto => "auto",
            ModelId::ClaudeOpus => "claude-opus-4-20250514",
            ModelId::ClaudeSonnet => "claude-sonnet-4-20250514",
            ModelId::ClaudeHaiku => "claude-3-5-haiku-20241022",
            ModelId::Gpt4o => "gpt-4o",
            ModelId::Gpt4oMini => "gpt-4o-mini",
            ModelId::O3Mini => "o3-mini",
            ModelId::GeminiPro => "gemini-2.5-pro",
            ModelId::GeminiFlash => "gemini-2.0-flash",
            ModelId::Presentation => "presentation-v1",
        }
    }

    /// `None` for the `auto` sentinel, which has no provider until resolved.
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            ModelId::Auto => None,
            ModelId::ClaudeOpus | ModelId::ClaudeSonnet | ModelId::ClaudeHaiku => {
                Some(ProviderKind::Anthropic)
            }
            ModelId::Gpt4o | ModelId::Gpt4oMini | ModelId::O3Mini => Some(ProviderKind::OpenAI),
            ModelId::GeminiPro | ModelId::GeminiFlash => Some(ProviderKind::Google),
            ModelId::Presentation => Some(ProviderKind::Presentation),
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, ModelId::Auto)
    }

    /// Reasoning models reject sampling parameters and use a different
    /// output-limit field.
    pub fn is_reasoning_model(&self) -> bool {
        matches!(self, ModelId::O3Mini)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        if normalized == "auto" {
            return Ok(ModelId::Auto);
        }
        ModelId::CONCRETE
            .iter()
            .copied()
            .find(|model| model.as_str() == normalized || model.api_name() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown model: {}", s)))
    }
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Presentation => "presentation",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAI),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "presentation" => Ok(ProviderKind::Presentation),
            other => Err(Error::validation(format!("Unknown provider: {}", other))),
        }
    }
}
