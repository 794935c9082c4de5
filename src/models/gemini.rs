use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::catalog::ModelId;
use crate::models::provider::{
    ChatMessage, ChatStream, MessageRole, ProviderRequest, ProviderSettings, StreamChunk,
    StreamingProvider, TokenUsage, ToolDefinition,
};
use crate::models::sse::{EventDecoder, SseChatStream, SseEvent, SseReader};
use crate::models::tool_calls::ToolCallAccumulator;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// JSON-Schema keywords the function-declaration schema rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "additionalProperties",
    "unevaluatedProperties",
    "patternProperties",
    "default",
    "examples",
    "const",
];

pub struct GeminiProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    idle_timeout: Duration,
}

impl GeminiProvider {
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

    fn stream_url(&self, model: ModelId) -> String {
        format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model.api_name())
    }

    fn build_request(&self, request: &ProviderRequest) -> GeminiRequest {
        let (system, turns) = request.split_system();

        GeminiRequest {
            contents: convert_messages(turns),
            system_instruction: system.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart::text(text)],
            }),
            tools: convert_tools(&request.tools),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_output_tokens,
                temperature: request.temperature,
            },
        }
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<GeminiContent> {
    messages
        .iter()
        .map(|message| GeminiContent {
            role: Some(
                match message.role {
                    MessageRole::Assistant => "model",
                    MessageRole::User | MessageRole::System => "user",
                }
                .to_string(),
            ),
            parts: vec![GeminiPart::text(message.content.clone())],
        })
        .collect()
}

/// Canonical tool definitions to a single `functionDeclarations` tool, with
/// parameter schemas reduced to the supported subset.
pub fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<GeminiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(vec![GeminiTool {
        function_declarations: tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: sanitize_schema(&tool.parameters),
            })
            .collect(),
    }])
}

/// Recursively drops unsupported keywords. Names under `properties` are user
/// data and are kept even when they collide with a keyword.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (key, value) in map {
                if UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let value = match (key.as_str(), value) {
                    ("properties", Value::Object(properties)) => Value::Object(
                        properties
                            .iter()
                            .map(|(name, property)| (name.clone(), sanitize_schema(property)))
                            .collect(),
                    ),
                    _ => sanitize_schema(value),
                };
                cleaned.insert(key.clone(), value);
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

#[async_trait]
impl StreamingProvider for GeminiProvider {
    async fn stream_from_model(
        &self,
        model: ModelId,
        request: &ProviderRequest,
    ) -> Result<Box<dyn ChatStream>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::model_provider("Gemini API key is not configured"))?;

        let body = self.build_request(request);
        debug!("Starting streaming request to Gemini: model={}, contents={}", model.api_name(), body.contents.len());

        // The key travels in a header so it never lands in request logs.
        let response = self
            .client
            .post(self.stream_url(model))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::model_provider(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Gemini API error: {} - {}", status, error_text);
            return Err(Error::model_provider(format!("API error {}: {}", status, error_text)));
        }

        let reader = SseReader::from_response(response, self.idle_timeout);
        Ok(Box::new(SseChatStream::new(reader, GeminiDecoder::new(), "gemini")))
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    fn get_provider_name(&self) -> &str {
        "gemini"
    }
}

/// Gemini sends whole function calls without ids, so they are keyed by the
/// order they appear in. `usageMetadata` is cumulative; the latest wins.
#[derive(Debug, Default)]
pub struct GeminiDecoder {
    tool_calls: ToolCallAccumulator<usize>,
    next_ordinal: usize,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl GeminiDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventDecoder for GeminiDecoder {
    fn decode(&mut self, event: &SseEvent, out: &mut VecDeque<StreamChunk>) -> Result<bool> {
        let response: GeminiStreamResponse = serde_json::from_str(&event.data)
            .map_err(|e| Error::model_provider(format!("Malformed Gemini chunk: {}", e)))?;

        if let Some(error) = response.error {
            return Err(Error::model_provider(format!(
                "Gemini stream error ({}): {}",
                error.status.unwrap_or_default(),
                error.message
            )));
        }

        for candidate in response.candidates {
            let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
            for part in parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    out.push_back(StreamChunk::text(text));
                }
                if let Some(call) = part.function_call {
                    let arguments = call.args.unwrap_or_else(|| Value::Object(Map::new()));
                    self.tool_calls.push_fragment(
                        self.next_ordinal,
                        call.id.as_deref(),
                        Some(call.name.as_str()),
                        &arguments.to_string(),
                    );
                    self.next_ordinal += 1;
                }
            }
            if candidate.finish_reason.is_some() {
                self.finished = true;
            }
        }

        if let Some(usage) = response.usage_metadata {
            self.usage = Some(TokenUsage::new(
                usage.prompt_token_count.unwrap_or(0),
                usage.candidates_token_count.unwrap_or(0),
            ));
        }

        // No terminal marker; the body simply ends.
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
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<StreamCandidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    /// Only some API versions send one.
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}
