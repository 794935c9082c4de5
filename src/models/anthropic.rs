use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::catalog::ModelId;
use crate::models::provider::{
    ChatMessage, ChatStream, MessageRole, ProviderRequest, ProviderSettings, StreamChunk,
    StreamingProvider, TokenUsage, ToolDefinition,
};
use crate::models::sse::{EventDecoder, SseChatStream, SseEvent, SseReader};
use crate::models::tool_calls::ToolCallAccumulator;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    idle_timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: settings.api_key,
            base_url: settings.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            idle_timeout: settings.idle_timeout,
        })
    }

    fn build_request(&self, model: ModelId, request: &ProviderRequest) -> AnthropicRequest {
        let (system, turns) = request.split_system();
        let mut messages = convert_messages(turns);

        // The API rejects an empty conversation; a system-only request becomes a user turn.
        if messages.is_empty() {
            if let Some(system) = &system {
                messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: system.clone(),
                });
            }
        }

        AnthropicRequest {
            model: model.api_name().to_string(),
            max_tokens: request.max_output_tokens,
            messages,
            system,
            tools: convert_tools(&request.tools),
            temperature: request.temperature,
            stream: true,
        }
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    messages
        .iter()
        .map(|message| AnthropicMessage {
            role: match message.role {
                MessageRole::Assistant => "assistant".to_string(),
                // Later system turns have no channel of their own here.
                MessageRole::User | MessageRole::System => "user".to_string(),
            },
            content: message.content.clone(),
        })
        .collect()
}

/// Canonical tool definitions to Anthropic's `input_schema` form.
pub fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<AnthropicTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.parameters.clone(),
            })
            .collect(),
    )
}

#[async_trait]
impl StreamingProvider for AnthropicProvider {
    async fn stream_from_model(
        &self,
        model: ModelId,
        request: &ProviderRequest,
    ) -> Result<Box<dyn ChatStream>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::model_provider("Anthropic API key is not configured"))?;

        let body = self.build_request(model, request);
        debug!("Starting streaming request to Anthropic: model={}, messages={}", body.model, body.messages.len());

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::model_provider(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Anthropic API error: {} - {}", status, error_text);
            return Err(Error::model_provider(format!("API error {}: {}", status, error_text)));
        }

        let reader = SseReader::from_response(response, self.idle_timeout);
        Ok(Box::new(SseChatStream::new(reader, AnthropicDecoder::new(), "anthropic")))
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    fn get_provider_name(&self) -> &str {
        "anthropic"
    }
}

/// Anthropic reports input tokens in `message_start` and a running output
/// count in `message_delta`; tool input arrives as `input_json_delta`
/// fragments keyed by content block index.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    tool_calls: ToolCallAccumulator<u32>,
    usage: Option<TokenUsage>,
    stopped: bool,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_usage(&mut self, input_tokens: Option<u32>, output_tokens: Option<u32>) {
        let current = self.usage.unwrap_or_default();
        self.usage = Some(TokenUsage::new(
            input_tokens.unwrap_or(current.input_tokens),
            output_tokens.unwrap_or(current.output_tokens),
        ));
    }
}

impl EventDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent, out: &mut VecDeque<StreamChunk>) -> Result<bool> {
        let parsed: AnthropicEvent = serde_json::from_str(&event.data).map_err(|e| {
            Error::model_provider(format!("Malformed Anthropic event {:?}: {}", event.event, e))
        })?;

        match parsed {
            AnthropicEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.update_usage(usage.input_tokens, usage.output_tokens);
                }
            }
            AnthropicEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name } => {
                    self.tool_calls.push_fragment(index, Some(id.as_str()), Some(name.as_str()), "");
                }
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        out.push_back(StreamChunk::text(text));
                    }
                }
                ContentBlock::Other => {}
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => out.push_back(StreamChunk::text(text)),
                BlockDelta::InputJsonDelta { partial_json } => {
                    self.tool_calls.push_fragment(index, None, None, &partial_json);
                }
                BlockDelta::Other => {}
            },
            AnthropicEvent::ContentBlockStop { index } => {
                if let Some(call) = self.tool_calls.complete(&index) {
                    out.push_back(StreamChunk::tool_calls(vec![call]));
                }
            }
            AnthropicEvent::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.update_usage(usage.input_tokens, usage.output_tokens);
                }
            }
            AnthropicEvent::MessageStop => {
                self.stopped = true;
                return Ok(true);
            }
            AnthropicEvent::Error { error } => {
                return Err(Error::model_provider(format!(
                    "Anthropic stream error ({}): {}",
                    error.error_type, error.message
                )));
            }
            AnthropicEvent::Ping | AnthropicEvent::Unknown => {}
        }
        Ok(false)
    }

    fn is_complete(&self) -> bool {
        self.stopped
    }

    fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn flush(&mut self, out: &mut VecDeque<StreamChunk>) {
        for call in self.tool_calls.drain() {
            out.push_back(StreamChunk::tool_calls(vec![call]));
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnthropicTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sse::test_support::collect;
    use serde_json::json;

    const TOOL_TRANSCRIPT: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":42,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Checking\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" now.\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_01\",\"name\":\"get_weather\",\"input\":{}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"city\\\": \"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"Oslo\\\"}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":57}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    #[tokio::test]
    async fn test_decodes_text_tool_use_and_usage() {
        let chunks = collect(AnthropicDecoder::new(), TOOL_TRANSCRIPT).await.unwrap();

        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Checking now.");

        let tool_chunks: Vec<_> = chunks.iter().filter(|c| c.tool_calls.is_some()).collect();
        assert_eq!(tool_chunks.len(), 1);
        let call = &tool_chunks[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_01");
        assert_eq!(call.name, "get_weather");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&call.arguments_json).unwrap(),
            json!({"city": "Oslo"})
        );

        let last = chunks.last().unwrap();
        assert!(last.done);
        assert_eq!(last.usage, Some(TokenUsage::new(42, 57)));
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    }

    #[tokio::test]
    async fn test_error_event_is_raised_not_emitted() {
        let transcript = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n",
            "event: error\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        let err = collect(AnthropicDecoder::new(), transcript).await.unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let transcript = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        );
        assert!(collect(AnthropicDecoder::new(), transcript).await.is_err());
    }

    #[test]
    fn test_tool_conversion_fixture() {
        let tools = vec![ToolDefinition::new(
            "get_weather",
            "Current weather for a city",
            json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}),
        )];

        let converted = serde_json::to_value(convert_tools(&tools).unwrap()).unwrap();
        assert_eq!(
            converted,
            json!([{
                "name": "get_weather",
                "description": "Current weather for a city",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
            }])
        );
        assert!(convert_tools(&[]).is_none());
    }

    #[test]
    fn test_system_prompt_uses_dedicated_channel() {
        let provider = AnthropicProvider::new(ProviderSettings::with_api_key("test-key")).unwrap();
        let request = ProviderRequest::new(
            vec![ChatMessage::system("You are terse."), ChatMessage::user("Hello!")],
            Vec::new(),
        );

        let body = provider.build_request(ModelId::ClaudeHaiku, &request);
        assert_eq!(body.system.as_deref(), Some("You are terse."));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.model, "claude-3-5-haiku-20241022");
        assert!(body.stream);
    }

    #[test]
    fn test_configuration_detection() {
        let configured = AnthropicProvider::new(ProviderSettings::with_api_key("test-key")).unwrap();
        assert!(configured.is_configured());
        assert_eq!(configured.get_provider_name(), "anthropic");

        let missing = AnthropicProvider::new(ProviderSettings::default()).unwrap();
        assert!(!missing.is_configured());
    }
}
