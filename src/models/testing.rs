//! Scripted providers for routing tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::models::catalog::{ModelId, ProviderKind};
use crate::models::provider::{ChatStream, ProviderRequest, StreamChunk, StreamingProvider, TokenUsage};
use crate::models::registry::ProviderRegistry;

#[derive(Debug, Clone)]
pub enum Script {
    /// `stream_from_model` itself fails.
    OpenError(String),
    /// The opened stream yields these items, then ends.
    Items(Vec<std::result::Result<StreamChunk, String>>),
}

impl Script {
    pub fn reply(text: &str, usage: TokenUsage) -> Self {
        Script::Items(vec![
            Ok(StreamChunk::text(text)),
            Ok(StreamChunk::done(Some(usage))),
        ])
    }
}

pub struct ScriptedProvider {
    name: &'static str,
    configured: bool,
    scripts: Mutex<HashMap<ModelId, Script>>,
    calls: Mutex<Vec<ModelId>>,
}

impl ScriptedProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            configured: true,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unconfigured(name: &'static str) -> Self {
        Self {
            configured: false,
            ..Self::new(name)
        }
    }

    pub fn script(self, model: ModelId, script: Script) -> Self {
        self.scripts.lock().insert(model, script);
        self
    }

    pub fn calls(&self) -> Vec<ModelId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StreamingProvider for ScriptedProvider {
    async fn stream_from_model(&self, model: ModelId, _request: &ProviderRequest) -> Result<Box<dyn ChatStream>> {
        self.calls.lock().push(model);
        let script = self
            .scripts
            .lock()
            .get(&model)
            .cloned()
            .unwrap_or_else(|| Script::OpenError(format!("no script for {}", model)));

        match script {
            Script::OpenError(message) => Err(Error::model_provider(message)),
            Script::Items(items) => Ok(Box::new(ScriptedStream {
                items: items.into(),
                usage: None,
            })),
        }
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    fn get_provider_name(&self) -> &str {
        self.name
    }
}

pub struct ScriptedStream {
    items: VecDeque<std::result::Result<StreamChunk, String>>,
    usage: Option<TokenUsage>,
}

#[async_trait]
impl ChatStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        match self.items.pop_front() {
            Some(Ok(chunk)) => {
                if chunk.usage.is_some() {
                    self.usage = chunk.usage;
                }
                Ok(Some(chunk))
            }
            Some(Err(message)) => Err(Error::model_provider(message)),
            None => Ok(None),
        }
    }

    fn usage_so_far(&self) -> Option<TokenUsage> {
        self.usage
    }
}

/// One scripted provider per family, all configured, with handles kept for
/// call assertions.
pub struct ScriptedProviders {
    pub anthropic: Arc<ScriptedProvider>,
    pub openai: Arc<ScriptedProvider>,
    pub google: Arc<ScriptedProvider>,
}

impl ScriptedProviders {
    pub fn new(anthropic: ScriptedProvider, openai: ScriptedProvider, google: ScriptedProvider) -> Self {
        Self {
            anthropic: Arc::new(anthropic),
            openai: Arc::new(openai),
            google: Arc::new(google),
        }
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new()
            .with_provider(ProviderKind::Anthropic, self.anthropic.clone())
            .with_provider(ProviderKind::OpenAI, self.openai.clone())
            .with_provider(ProviderKind::Google, self.google.clone())
    }
}
