use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::catalog::ModelId;
use crate::models::events::{RoutingObserver, SkipReason};
use crate::models::fallback::{FallbackChain, FallbackTable};
use crate::models::provider::{
    ChatMessage, ChatStream, ProviderRequest, StreamChunk, TokenUsage, ToolDefinition,
};
use crate::models::registry::ProviderRegistry;
use crate::models::selector::{select_best_model, ModelSelectionContext};
use crate::quota::tier::UserTier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            temperature: None,
        }
    }
}

/// A resolved model and the candidates that will be tried for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub model: ModelId,
    pub chain: FallbackChain,
    /// Chain members dropped because the tier does not allow them.
    pub excluded: Vec<ModelId>,
}

impl RoutePlan {
    pub fn candidates(&self) -> impl Iterator<Item = ModelId> + '_ {
        self.chain
            .models()
            .iter()
            .copied()
            .filter(|m| !self.excluded.contains(m))
    }
}

/// Drives a fallback chain against the registered providers.
///
/// Candidates are tried one at a time. A candidate that fails before any
/// chunk has reached the caller is replaced by the next; once output has been
/// forwarded, a failure ends the stream with `Error::StreamInterrupted`.
pub struct Router {
    registry: Arc<ProviderRegistry>,
    fallbacks: FallbackTable,
    observer: Arc<dyn RoutingObserver>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        fallbacks: FallbackTable,
        observer: Arc<dyn RoutingObserver>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            fallbacks,
            observer,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn observer(&self) -> Arc<dyn RoutingObserver> {
        self.observer.clone()
    }

    /// Resolves `auto` through the selector, with `has_tools` taken from the
    /// request. Concrete models pass through unchanged.
    pub fn resolve_model(
        &self,
        model: ModelId,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tier: UserTier,
        context: Option<&ModelSelectionContext>,
    ) -> ModelId {
        if !model.is_auto() {
            return model;
        }

        let mut context = context.cloned().unwrap_or_default();
        context.has_tools |= !tools.is_empty();
        let selected = select_best_model(messages, tier, &context);
        self.observer.on_model_selected(model, selected, tier);
        selected
    }

    /// The chain for an already resolved model. The primary is always kept;
    /// substitutes outside the tier's allow-list are excluded.
    pub fn plan(&self, model: ModelId, tier: UserTier) -> RoutePlan {
        let chain = self.fallbacks.chain_for(model);
        let excluded = chain
            .models()
            .iter()
            .skip(1)
            .copied()
            .filter(|m| !tier.allows(*m))
            .collect();

        RoutePlan { model, chain, excluded }
    }

    /// Opens the first candidate that can serve the request. Every
    /// candidate being unavailable or failing to open is reported here,
    /// before any chunk exists.
    pub async fn stream_chat_completion(
        &self,
        model: ModelId,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        tier: UserTier,
        context: Option<ModelSelectionContext>,
    ) -> Result<RoutedStream> {
        let resolved = self.resolve_model(model, &messages, &tools, tier, context.as_ref());
        let plan = self.plan(resolved, tier);
        debug!("Routing {} via {:?}", resolved, plan.chain.models());

        for excluded in &plan.excluded {
            self.observer.on_candidate_skipped(*excluded, SkipReason::NotInTier);
        }

        let request = ProviderRequest::new(messages, tools)
            .with_max_output_tokens(self.settings.max_output_tokens)
            .with_temperature(self.settings.temperature);

        let mut stream = RoutedStream {
            registry: self.registry.clone(),
            observer: self.observer.clone(),
            request,
            candidates: plan.candidates().collect(),
            active: None,
            forwarded: false,
            finished: false,
            attempted: 0,
            skipped: plan.excluded.len(),
            last_error: None,
        };
        stream.open_next().await?;
        Ok(stream)
    }
}

struct ActiveCandidate {
    model: ModelId,
    stream: Box<dyn ChatStream>,
}

/// The caller-facing stream for one request. Chunks are passed through as
/// the active provider produces them, in order, without buffering.
pub struct RoutedStream {
    registry: Arc<ProviderRegistry>,
    observer: Arc<dyn RoutingObserver>,
    request: ProviderRequest,
    candidates: VecDeque<ModelId>,
    active: Option<ActiveCandidate>,
    forwarded: bool,
    finished: bool,
    attempted: usize,
    skipped: usize,
    last_error: Option<Error>,
}

impl RoutedStream {
    /// The model currently serving the request.
    pub fn active_model(&self) -> Option<ModelId> {
        self.active.as_ref().map(|a| a.model)
    }

    /// Candidates that were opened or failed to open.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    /// Stops the request and releases the provider connection. Returns the
    /// usage the provider had reported, if any.
    pub fn cancel(&mut self) -> Option<TokenUsage> {
        self.finished = true;
        let active = self.active.take()?;
        debug!("Cancelling stream from {}", active.model);
        active.stream.usage_so_far()
    }

    async fn open_next(&mut self) -> Result<()> {
        while let Some(model) = self.candidates.pop_front() {
            let provider = match self.registry.provider_for(model) {
                Some(provider) if self.registry.is_model_available(model) => provider,
                _ => {
                    self.skipped += 1;
                    self.observer.on_candidate_skipped(model, SkipReason::Unavailable);
                    continue;
                }
            };

            self.attempted += 1;
            match provider.stream_from_model(model, &self.request).await {
                Ok(stream) => {
                    info!("Streaming from {} via {}", model, provider.get_provider_name());
                    self.active = Some(ActiveCandidate { model, stream });
                    return Ok(());
                }
                Err(e) => {
                    self.observer.on_fallback(model, &e);
                    self.last_error = Some(e);
                }
            }
        }

        self.finished = true;
        self.observer.on_exhausted(self.attempted, self.skipped);
        Err(Error::FallbackExhausted {
            attempted: self.attempted,
            skipped: self.skipped,
            last_error: self.last_error.take().map(Box::new),
        })
    }
}

#[async_trait]
impl ChatStream for RoutedStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.active.is_none() {
                self.open_next().await?;
            }
            let Some(active) = self.active.as_mut() else {
                continue;
            };

            match active.stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    self.forwarded = true;
                    if chunk.done {
                        self.finished = true;
                    }
                    return Ok(Some(chunk));
                }
                Ok(None) => {
                    // Terminal chunk guaranteed even when a provider omits it.
                    self.finished = true;
                    return Ok(Some(StreamChunk::done(active.stream.usage_so_far())));
                }
                Err(e) if self.forwarded => {
                    let model = active.model;
                    warn!("Stream from {} failed after partial output: {}", model, e);
                    self.finished = true;
                    self.active = None;
                    return Err(Error::StreamInterrupted {
                        model: model.to_string(),
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let model = active.model;
                    self.observer.on_fallback(model, &e);
                    self.last_error = Some(e);
                    self.active = None;
                }
            }
        }
    }

    fn usage_so_far(&self) -> Option<TokenUsage> {
        self.active.as_ref().and_then(|a| a.stream.usage_so_far())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::recording::{RecordingObserver, RoutingEvent};
    use crate::models::provider::into_stream;
    use crate::models::testing::{Script, ScriptedProvider, ScriptedProviders};
    use futures_util::StreamExt;

    fn router(providers: &ScriptedProviders) -> (Router, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let router = Router::new(
            Arc::new(providers.registry()),
            FallbackTable::new(),
            observer.clone(),
            RouterSettings::default(),
        );
        (router, observer)
    }

    async fn drain(stream: RoutedStream) -> Vec<Result<StreamChunk>> {
        into_stream(Box::new(stream)).collect().await
    }

    fn hello() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hello")]
    }

    #[tokio::test]
    async fn test_primary_success_forwards_in_order() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic").script(
                ModelId::ClaudeSonnet,
                Script::Items(vec![
                    Ok(StreamChunk::text("one ")),
                    Ok(StreamChunk::text("two")),
                    Ok(StreamChunk::done(Some(TokenUsage::new(10, 2)))),
                ]),
            ),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        );
        let (router, observer) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::ClaudeSonnet, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();
        assert_eq!(stream.active_model(), Some(ModelId::ClaudeSonnet));

        let chunks: Vec<StreamChunk> = drain(stream).await.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "one ");
        assert_eq!(chunks[1].content, "two");
        assert!(chunks[2].done);
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        assert!(observer.events().is_empty());
        assert!(providers.openai.calls().is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_falls_back() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic")
                .script(ModelId::ClaudeSonnet, Script::OpenError("529 overloaded".into()))
                .script(ModelId::ClaudeHaiku, Script::reply("from haiku", TokenUsage::new(5, 3))),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        );
        let (router, observer) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::ClaudeSonnet, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();
        assert_eq!(stream.active_model(), Some(ModelId::ClaudeHaiku));

        let chunks = drain(stream).await;
        assert_eq!(chunks[0].as_ref().unwrap().content, "from haiku");
        assert_eq!(
            observer.events(),
            vec![RoutingEvent::Fallback { failed: ModelId::ClaudeSonnet }]
        );
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_falls_back() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai")
                .script(ModelId::Gpt4oMini, Script::Items(vec![Err("connection reset".into())])),
            ScriptedProvider::new("google").script(ModelId::GeminiFlash, Script::reply("flash", TokenUsage::new(1, 1))),
        );
        let (router, observer) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::Gpt4oMini, hello(), Vec::new(), UserTier::Free, None)
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = drain(stream).await.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks[0].content, "flash");
        assert!(chunks.last().unwrap().done);
        assert!(observer
            .events()
            .contains(&RoutingEvent::Fallback { failed: ModelId::Gpt4oMini }));
    }

    #[tokio::test]
    async fn test_failure_after_output_does_not_resume() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic").script(
                ModelId::ClaudeSonnet,
                Script::Items(vec![Ok(StreamChunk::text("partial")), Err("socket closed".into())]),
            ),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        );
        let (router, observer) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::ClaudeSonnet, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();
        let items = drain(stream).await;

        assert_eq!(items.len(), 2);
        assert!(!items[0].as_ref().unwrap().done);
        assert!(matches!(items[1], Err(Error::StreamInterrupted { .. })));
        // No substitute was opened.
        assert_eq!(providers.anthropic.calls(), vec![ModelId::ClaudeSonnet]);
        assert!(providers.openai.calls().is_empty());
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_all_unavailable_raises_before_any_chunk() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::unconfigured("anthropic"),
            ScriptedProvider::unconfigured("openai"),
            ScriptedProvider::unconfigured("google"),
        );
        let (router, observer) = router(&providers);

        let result = router
            .stream_chat_completion(ModelId::ClaudeSonnet, hello(), Vec::new(), UserTier::Enterprise, None)
            .await;

        match result {
            Err(Error::FallbackExhausted { attempted, skipped, last_error }) => {
                assert_eq!(attempted, 0);
                assert_eq!(skipped, 4);
                assert!(last_error.is_none());
            }
            _ => panic!("expected exhaustion"),
        }
        assert_eq!(observer.events().last(), Some(&RoutingEvent::Exhausted { attempted: 0, skipped: 4 }));
        assert!(providers.anthropic.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_names_last_error() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiPro, Script::OpenError("quota exceeded".into()))
                .script(ModelId::GeminiFlash, Script::OpenError("backend unavailable".into())),
        );
        let (router, _) = router(&providers);

        let err = router
            .stream_chat_completion(ModelId::GeminiPro, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .err()
            .unwrap();
        // gpt-4o has no script, so the openai mock fails last.
        assert!(matches!(err, Error::FallbackExhausted { attempted: 3, .. }));
        assert!(err.to_string().contains("no script for gpt-4o"));
    }

    #[tokio::test]
    async fn test_unavailable_candidate_is_skipped_not_failed() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::unconfigured("anthropic"),
            ScriptedProvider::new("openai").script(ModelId::Gpt4o, Script::reply("4o", TokenUsage::new(2, 2))),
            ScriptedProvider::new("google"),
        );
        let (router, observer) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::ClaudeSonnet, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();

        assert_eq!(stream.active_model(), Some(ModelId::Gpt4o));
        assert_eq!(stream.attempted(), 1);
        assert_eq!(
            observer.events(),
            vec![
                RoutingEvent::Skipped { model: ModelId::ClaudeSonnet, reason: SkipReason::Unavailable },
                RoutingEvent::Skipped { model: ModelId::ClaudeHaiku, reason: SkipReason::Unavailable },
            ]
        );
    }

    #[tokio::test]
    async fn test_substitutes_outside_tier_are_excluded() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai").script(ModelId::Gpt4oMini, Script::OpenError("down".into())),
            ScriptedProvider::new("google").script(ModelId::GeminiFlash, Script::OpenError("down".into())),
        );
        let (router, observer) = router(&providers);

        let plan = router.plan(ModelId::Gpt4oMini, UserTier::Free);
        assert_eq!(plan.excluded, vec![ModelId::ClaudeHaiku]);

        let result = router
            .stream_chat_completion(ModelId::Gpt4oMini, hello(), Vec::new(), UserTier::Free, None)
            .await;
        assert!(matches!(result, Err(Error::FallbackExhausted { attempted: 2, skipped: 1, .. })));
        assert!(providers.anthropic.calls().is_empty());
        assert_eq!(
            observer.events()[0],
            RoutingEvent::Skipped { model: ModelId::ClaudeHaiku, reason: SkipReason::NotInTier }
        );
    }

    #[tokio::test]
    async fn test_auto_resolves_with_tool_hint() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai").script(ModelId::Gpt4oMini, Script::reply("ok", TokenUsage::new(1, 1))),
            ScriptedProvider::new("google"),
        );
        let (router, observer) = router(&providers);
        let tools = vec![ToolDefinition::new("lookup", "Find", serde_json::json!({"type": "object"}))];

        let stream = router
            .stream_chat_completion(ModelId::Auto, hello(), tools, UserTier::Free, None)
            .await
            .unwrap();

        assert_eq!(stream.active_model(), Some(ModelId::Gpt4oMini));
        assert_eq!(
            observer.events()[0],
            RoutingEvent::Selected { requested: ModelId::Auto, selected: ModelId::Gpt4oMini }
        );
    }

    #[tokio::test]
    async fn test_missing_done_is_synthesized() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic")
                .script(ModelId::ClaudeHaiku, Script::Items(vec![Ok(StreamChunk::text("hi"))])),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        );
        let (router, _) = router(&providers);

        let stream = router
            .stream_chat_completion(ModelId::ClaudeHaiku, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();
        let chunks: Vec<StreamChunk> = drain(stream).await.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].done);
        assert_eq!(chunks[1].usage, None);
    }

    #[tokio::test]
    async fn test_cancel_releases_active_stream() {
        let providers = ScriptedProviders::new(
            ScriptedProvider::new("anthropic").script(
                ModelId::ClaudeHaiku,
                Script::Items(vec![
                    Ok(StreamChunk {
                        content: "a".into(),
                        usage: Some(TokenUsage::new(7, 1)),
                        ..Default::default()
                    }),
                    Ok(StreamChunk::text("b")),
                ]),
            ),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        );
        let (router, _) = router(&providers);

        let mut stream = router
            .stream_chat_completion(ModelId::ClaudeHaiku, hello(), Vec::new(), UserTier::Pro, None)
            .await
            .unwrap();
        stream.next_chunk().await.unwrap();

        assert_eq!(stream.cancel(), Some(TokenUsage::new(7, 1)));
        assert_eq!(stream.active_model(), None);
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
