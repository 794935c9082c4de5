use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DONE_MARKER: &str = "[DONE]";

/// Chat-completions streaming client. Also serves the presentation model,
/// which is exposed through an OpenAI-compatible endpoint.
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    base_url: Option<String>,
    idle_timeout: Duration,
    name: &'static str,
}

impl OpenAIProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        let mut provider = Self::build(settings, "openai")?;
        if provider.base_url.is_none() {
            provider.base_url = Some(DEFAULT_BASE_URL.to_string());
        }
        Ok(provider)
    }

    /// The presentation service has no public default endpoint; it is only
    /// configured once a base URL is set.
    pub fn presentation(settings: ProviderSettings) -> Result<Self> {
        Self::build(settings, "presentation")
    }

    fn build(settings: ProviderSettings, name: &'static str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: settings.api_key,
            base_url: settings.base_url.map(|url| url.trim_end_matches('/').to_string()),
            idle_timeout: settings.idle_timeout,
            name,
        })
    }

    fn create_headers(&self, api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| Error::model_provider(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn build_request(&self, model: ModelId, request: &ProviderRequest) -> OpenAIRequest {
        // Reasoning models take a completion budget and reject temperature.
        let reasoning = model.is_reasoning_model();

        OpenAIRequest {
            model: model.api_name().to_string(),
            messages: convert_messages(&request.messages),
            stream: true,
            stream_options: StreamOptions { include_usage: true },
            tools: convert_tools(&request.tools),
            max_tokens: (!reasoning).then_some(request.max_output_tokens),
            max_completion_tokens: reasoning.then_some(request.max_output_tokens),
            temperature: if reasoning { None } else { request.temperature },
        }
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|msg| OpenAIMessage {
            role: match msg.role {
                MessageRole::User => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
                MessageRole::System => "system".to_string(),
            },
            content: msg.content.clone(),
        })
        .collect()
}

/// Canonical tool definitions to OpenAI's `function` tool form.
pub fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<OpenAITool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
    )
}

#[async_trait]
impl StreamingProvider for OpenAIProvider {
    async fn stream_from_model(
        &self,
        model: ModelId,
        request: &ProviderRequest,
    ) -> Result<Box<dyn ChatStream>> {
        let (Some(api_key), Some(base_url)) = (self.api_key.as_deref(), self.base_url.as_deref()) else {
            return Err(Error::model_provider(format!("{} provider is not configured", self.name)));
        };

        let body = self.build_request(model, request);
        debug!("Starting streaming request to {}: model={}, messages={}", self.name, body.model, body.messages.len());

        let response = self
            .client
            .post(format!("{}/chat/completions", base_url))
            .headers(self.create_headers(api_key)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::model_provider(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("{} API error: {} - {}", self.name, status, error_text);
            return Err(Error::model_provider(format!("API error {}: {}", status, error_text)));
        }

        let reader = SseReader::from_response(response, self.idle_timeout);
        Ok(Box::new(SseChatStream::new(reader, OpenAIDecoder::new(), self.name)))
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty()) && self.base_url.is_some()
    }

    fn get_provider_name(&self) -> &str {
        self.name
    }
}

/// Tool-call fragments are keyed by their `index`; they are flushed when the
/// choice reports a finish reason. Usage arrives on a trailing chunk with no
/// choices, before `[DONE]`.
#[derive(Debug, Default)]
pub struct OpenAIDecoder {
    tool_calls: ToolCallAccumulator<u32>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl OpenAIDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventDecoder for OpenAIDecoder {
    fn decode(&mut self, event: &SseEvent, out: &mut VecDeque<StreamChunk>) -> Result<bool> {
        if event.data.trim() == DONE_MARKER {
            self.finished = true;
            return Ok(true);
        }

        let chunk: OpenAIStreamChunk = serde_json::from_str(&event.data)
            .map_err(|e| Error::model_provider(format!("Malformed OpenAI chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(Error::model_provider(format!("OpenAI stream error: {}", error.message)));
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                out.push_back(StreamChunk::text(content));
            }
            for fragment in choice.delta.tool_calls.unwrap_or_default() {
                let function = fragment.function.unwrap_or_default();
                self.tool_calls.push_fragment(
                    fragment.index,
                    fragment.id.as_deref(),
                    function.name.as_deref(),
                    function.arguments.as_deref().unwrap_or(""),
                );
            }
            if choice.finish_reason.is_some() {
                self.finished = true;
                let calls = self.tool_calls.drain();
                if !calls.is_empty() {
                    out.push_back(StreamChunk::tool_calls(calls));
                }
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        Ok(false)
    }

    fn is_complete(&self) -> bool {
        self.finished
    }

    fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    fn flush(&mut self, out: &mut VecDeque<StreamChunk>) {
        let calls = self.tool_calls.drain();
        if !calls.is_empty() {
            out.push_back(StreamChunk::tool_calls(calls));
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAITool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAIFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAIFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}
