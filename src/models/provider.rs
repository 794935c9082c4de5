use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::catalog::ModelId;

#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// Opens a streaming generation against `model`. Errors raised here or
    /// from the returned stream are transport failures the router may fall
    /// back from.
    async fn stream_from_model(
        &self,
        model: ModelId,
        request: &ProviderRequest,
    ) -> Result<Box<dyn ChatStream>>;

    /// True when credentials for this provider are configured.
    fn is_configured(&self) -> bool;

    fn get_provider_name(&self) -> &str;
}

#[async_trait]
pub trait ChatStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>>;

    /// Usage the provider has reported so far, before the terminal chunk.
    /// Used to bill cancelled requests.
    fn usage_so_far(&self) -> Option<TokenUsage> {
        None
    }
}

/// Connection settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two reads of a response body.
    pub idle_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ProviderSettings {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Adapts a `ChatStream` into a `futures` stream of chunks.
pub fn into_stream(chat_stream: Box<dyn ChatStream>) -> impl Stream<Item = Result<StreamChunk>> + Send {
    stream::unfold(Some(chat_stream), |state| async move {
        let mut chat_stream = state?;
        match chat_stream.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(chat_stream))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Everything a provider needs for one generation, already resolved to a
/// concrete model by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

impl ProviderRequest {
    pub fn new(messages: Vec<ChatMessage>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            messages,
            tools,
            max_output_tokens: 4096,
            temperature: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Leading system messages joined for providers with a dedicated system
    /// channel, and the remaining conversation turns.
    pub fn split_system(&self) -> (Option<String>, &[ChatMessage]) {
        let leading = self
            .messages
            .iter()
            .take_while(|m| m.role == MessageRole::System)
            .count();

        if leading == 0 {
            return (None, &self.messages);
        }

        let system = self.messages[..leading]
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        (Some(system), &self.messages[leading..])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
}

/// Canonical tool definition; adapters convert it to the provider's own
/// schema at the request boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the arguments.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A fully reassembled tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments_json: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    pub fn is_billed(&self) -> bool {
        self.total_tokens > 0
    }
}

/// One increment of a response. `done` is set on exactly one chunk, the last.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub usage: Option<TokenUsage>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::default()
        }
    }

    pub fn done(usage: Option<TokenUsage>) -> Self {
        Self {
            done: true,
            usage,
            ..Self::default()
        }
    }
}
