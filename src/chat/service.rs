use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::catalog::ModelId;
use crate::models::pricing::cost_of_usage;
use crate::models::provider::{ChatMessage, ChatStream, StreamChunk, TokenUsage, ToolDefinition};
use crate::models::router::{RoutedStream, Router};
use crate::models::selector::ModelSelectionContext;
use crate::quota::estimate::estimate_tokens;
use crate::quota::manager::QuotaManager;
use crate::quota::tier::UserTier;
use crate::quota::types::{QuotaCheckResult, QuotaSubject, UsageContext, UsageOutcome};

/// One chat turn as the caller describes it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub subject: QuotaSubject,
    pub model: ModelId,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub context: Option<ModelSelectionContext>,
    pub usage: UsageContext,
}

impl ChatRequest {
    pub fn new(subject: QuotaSubject, model: ModelId, messages: Vec<ChatMessage>) -> Self {
        Self {
            subject,
            model,
            messages,
            tools: Vec::new(),
            context: None,
            usage: UsageContext::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_context(mut self, context: ModelSelectionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_usage_context(mut self, usage: UsageContext) -> Self {
        self.usage = usage;
        self
    }
}

pub enum ChatOutcome {
    Streaming(MeteredStream),
    Denied { model: ModelId, result: QuotaCheckResult },
}

/// Admission, routing and accounting for chat requests.
pub struct ChatService {
    router: Arc<Router>,
    quota: Arc<QuotaManager>,
}

impl ChatService {
    pub fn new(router: Arc<Router>, quota: Arc<QuotaManager>) -> Self {
        Self { router, quota }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    /// The account's tier, or free when the store cannot say.
    pub async fn resolve_tier(&self, user_id: &str) -> UserTier {
        match self.quota.store().get_or_create_quota(user_id).await {
            Ok(snapshot) => snapshot.tier,
            Err(e) => {
                warn!("Could not load tier for {}, using free: {}", user_id, e);
                UserTier::Free
            }
        }
    }

    pub async fn start_chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let ChatRequest {
            subject,
            model,
            messages,
            tools,
            context,
            usage,
        } = request;

        let tier = self.resolve_tier(&subject.user_id).await;
        let model = self
            .router
            .resolve_model(model, &messages, &tools, tier, context.as_ref());

        let estimated = estimate_tokens(&messages);
        let check = self
            .quota
            .check_quota_with_overage(&subject, &usage.request_id, estimated, model)
            .await;
        if !check.allowed {
            let reason = check.reason.as_deref().unwrap_or("quota exceeded");
            self.router.observer().on_quota_denied(&subject.user_id, model, reason);
            return Ok(ChatOutcome::Denied { model, result: check });
        }

        debug!(
            "Admitted {} on {} ({} estimated tokens, overage={})",
            subject.user_id,
            model,
            estimated,
            check.is_overage.unwrap_or(false)
        );

        let stream = match self
            .router
            .stream_chat_completion(model, messages, tools, tier, context)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.quota.release_reservation(&subject, &usage.request_id).await;
                return Err(e);
            }
        };

        Ok(ChatOutcome::Streaming(MeteredStream {
            active_model: stream.active_model(),
            inner: stream,
            quota: self.quota.clone(),
            subject,
            usage: Some(usage),
            last_usage: None,
        }))
    }
}

/// A routed stream that records usage once, against the model that actually
/// served the request.
pub struct MeteredStream {
    inner: RoutedStream,
    quota: Arc<QuotaManager>,
    subject: QuotaSubject,
    /// Taken when usage is recorded.
    usage: Option<UsageContext>,
    active_model: Option<ModelId>,
    last_usage: Option<TokenUsage>,
}

impl MeteredStream {
    pub fn active_model(&self) -> Option<ModelId> {
        self.active_model
    }

    pub fn request_id(&self) -> Option<&str> {
        self.usage.as_ref().map(|u| u.request_id.as_str())
    }

    /// Stops the request. Partial usage is recorded only when the provider
    /// had reported billed tokens; otherwise the admission's reservation is
    /// given back.
    pub async fn cancel(&mut self) -> Option<UsageOutcome> {
        let usage = self.inner.cancel().or(self.last_usage);
        match usage.filter(TokenUsage::is_billed) {
            Some(billed) => self.record(Some(billed)).await,
            None => {
                self.release().await;
                None
            }
        }
    }

    async fn release(&mut self) {
        if let Some(context) = self.usage.take() {
            self.quota.release_reservation(&self.subject, &context.request_id).await;
        }
    }

    async fn record(&mut self, usage: Option<TokenUsage>) -> Option<UsageOutcome> {
        let context = self.usage.take()?;
        let model = self.active_model?;
        let cost = cost_of_usage(model, usage.as_ref());
        let usage = usage.unwrap_or_default();

        let outcome = self
            .quota
            .record_usage(
                &self.subject,
                model,
                usage.input_tokens as u64,
                usage.output_tokens as u64,
                cost,
                context,
            )
            .await;
        Some(outcome)
    }
}

#[async_trait]
impl ChatStream for MeteredStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        let chunk = match self.inner.next_chunk().await {
            Ok(chunk) => chunk,
            Err(e) => {
                match self.last_usage.filter(TokenUsage::is_billed) {
                    Some(usage) => {
                        self.record(Some(usage)).await;
                    }
                    None => self.release().await,
                }
                return Err(e);
            }
        };

        if let Some(model) = self.inner.active_model() {
            self.active_model = Some(model);
        }
        if let Some(usage) = self.inner.usage_so_far() {
            self.last_usage = Some(usage);
        }

        if let Some(chunk) = &chunk {
            if chunk.done {
                let usage = chunk.usage.or(self.last_usage);
                if let Some(outcome) = self.record(usage).await {
                    if !outcome.is_clean() {
                        warn!("Usage accounting incomplete: {:?}", outcome.errors);
                    }
                }
            }
        }

        Ok(chunk)
    }

    fn usage_so_far(&self) -> Option<TokenUsage> {
        self.inner.usage_so_far().or(self.last_usage)
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        let Some(context) = self.usage.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Dropped stream outside a runtime, request {} not settled", context.request_id);
            return;
        };

        let quota = self.quota.clone();
        let subject = self.subject.clone();
        let (Some(model), Some(usage)) = (self.active_model, self.last_usage.filter(TokenUsage::is_billed)) else {
            debug!("Stream dropped before billing, releasing request {}", context.request_id);
            handle.spawn(async move {
                quota.release_reservation(&subject, &context.request_id).await;
            });
            return;
        };

        info!("Stream for {} dropped early, recording partial usage", model);
        handle.spawn(async move {
            let cost = cost_of_usage(model, Some(&usage));
            quota
                .record_usage(
                    &subject,
                    model,
                    usage.input_tokens as u64,
                    usage.output_tokens as u64,
                    cost,
                    context,
                )
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::recording::{RecordingObserver, RoutingEvent};
    use crate::models::fallback::FallbackTable;
    use crate::models::router::RouterSettings;
    use crate::models::testing::{Script, ScriptedProvider, ScriptedProviders};
    use crate::quota::manager::{PlanOverage, QuotaSettings};
    use crate::quota::types::{AlertSink, QuotaStore, UsageRecord};
    use crate::storage::memory::{InMemoryMeter, InMemoryQuotaStore};
    use chrono::Utc;
    use rust_decimal::Decimal;

    struct NoAlerts;

    #[async_trait]
    impl AlertSink for NoAlerts {
        async fn send_alert_notifications(&self, _org_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: ChatService,
        store: Arc<InMemoryQuotaStore>,
        observer: Arc<RecordingObserver>,
        providers: ScriptedProviders,
    }

    fn fixture(providers: ScriptedProviders) -> Fixture {
        let observer = Arc::new(RecordingObserver::default());
        let router = Router::new(
            Arc::new(providers.registry()),
            FallbackTable::new(),
            observer.clone(),
            RouterSettings::default(),
        );

        let store = Arc::new(InMemoryQuotaStore::new());
        let quota = QuotaManager::new(
            store.clone(),
            Arc::new(InMemoryMeter::new(1_000_000, Decimal::from(10))),
            Arc::new(NoAlerts),
            Arc::new(PlanOverage::new(store.clone())),
            QuotaSettings::default(),
        );

        Fixture {
            service: ChatService::new(Arc::new(router), Arc::new(quota)),
            store,
            observer,
            providers,
        }
    }

    fn streaming(outcome: ChatOutcome) -> MeteredStream {
        match outcome {
            ChatOutcome::Streaming(stream) => stream,
            ChatOutcome::Denied { result, .. } => panic!("unexpected denial: {:?}", result.reason),
        }
    }

    async fn drain(stream: &mut MeteredStream) -> String {
        let mut text = String::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            text.push_str(&chunk.content);
        }
        text
    }

    #[tokio::test]
    async fn test_usage_is_billed_to_the_serving_model() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai")
                .script(ModelId::Gpt4oMini, Script::reply("hello", TokenUsage::new(1_000, 1_000))),
            ScriptedProvider::new("google").script(ModelId::GeminiFlash, Script::OpenError("503".into())),
        ));

        let request = ChatRequest::new(
            QuotaSubject::new("u1"),
            ModelId::GeminiFlash,
            vec![ChatMessage::user("hi")],
        )
        .with_usage_context(UsageContext::with_request_id("req-1"));

        let mut stream = streaming(f.service.start_chat(request).await.unwrap());
        assert_eq!(drain(&mut stream).await, "hello");
        assert_eq!(stream.active_model(), Some(ModelId::Gpt4oMini));

        let records = f.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model, ModelId::Gpt4oMini);
        assert_eq!(records[0].request_id, "req-1");
        assert_eq!(records[0].total_tokens(), 2_000);
        // 1000 * 0.15/1M + 1000 * 0.60/1M
        assert_eq!(records[0].cost_usd, Decimal::new(75, 5));
    }

    #[tokio::test]
    async fn test_denied_request_never_reaches_a_provider() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiFlash, Script::reply("x", TokenUsage::new(1, 1))),
        ));
        f.store
            .record_ai_usage(&UsageRecord {
                request_id: "seed".into(),
                user_id: "u1".into(),
                org_id: None,
                model: ModelId::GeminiFlash,
                input_tokens: 50_000,
                output_tokens: 0,
                cost_usd: Decimal::ZERO,
                conversation_id: None,
                task_type: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user("hi")]);
        let outcome = f.service.start_chat(request).await.unwrap();

        assert!(matches!(outcome, ChatOutcome::Denied { model: ModelId::GeminiFlash, .. }));
        assert!(f.providers.google.calls().is_empty());
        assert!(f
            .observer
            .events()
            .contains(&RoutingEvent::QuotaDenied { user_id: "u1".into(), model: ModelId::GeminiFlash }));
    }

    #[tokio::test]
    async fn test_auto_resolves_within_tier_before_quota_check() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiFlash, Script::reply("ok", TokenUsage::new(3, 4))),
        ));

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::Auto, vec![ChatMessage::user("hi")]);
        let mut stream = streaming(f.service.start_chat(request).await.unwrap());
        drain(&mut stream).await;

        assert_eq!(f.store.records()[0].model, ModelId::GeminiFlash);
        assert!(matches!(f.observer.events().first(), Some(RoutingEvent::Selected { .. })));
    }

    #[tokio::test]
    async fn test_cancel_records_only_billed_usage() {
        let partial = StreamChunk {
            usage: Some(TokenUsage::new(40, 5)),
            ..StreamChunk::text("par")
        };
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai")
                .script(ModelId::Gpt4oMini, Script::Items(vec![Ok(StreamChunk::text("a")), Ok(StreamChunk::text("b"))])),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiFlash, Script::Items(vec![Ok(partial), Ok(StreamChunk::text("tial"))])),
        ));

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user("hi")]);
        let mut stream = streaming(f.service.start_chat(request).await.unwrap());
        stream.next_chunk().await.unwrap();
        let outcome = stream.cancel().await.unwrap();
        assert!(outcome.recorded);
        assert_eq!(f.store.records()[0].total_tokens(), 45);

        let request = ChatRequest::new(QuotaSubject::new("u2"), ModelId::Gpt4oMini, vec![ChatMessage::user("hi")]);
        let mut unbilled = streaming(f.service.start_chat(request).await.unwrap());
        unbilled.next_chunk().await.unwrap();
        assert!(unbilled.cancel().await.is_none());
        assert_eq!(f.store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_mid_stream_records_partial_usage() {
        let partial = StreamChunk {
            usage: Some(TokenUsage::new(10, 2)),
            ..StreamChunk::text("x")
        };
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiFlash, Script::Items(vec![Ok(partial), Ok(StreamChunk::text("y"))])),
        ));

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user("hi")]);
        let mut stream = streaming(f.service.start_chat(request).await.unwrap());
        stream.next_chunk().await.unwrap();
        drop(stream);

        for _ in 0..10 {
            if !f.store.records().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.store.records()[0].total_tokens(), 12);
    }

    #[tokio::test]
    async fn test_unbilled_endings_give_back_the_reservation() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google")
                .script(ModelId::GeminiFlash, Script::Items(vec![Ok(StreamChunk::text("a")), Ok(StreamChunk::text("b"))])),
        ));
        let prompt = "x".repeat(4_000);

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user(prompt.clone())]);
        let mut stream = streaming(f.service.start_chat(request).await.unwrap());
        assert!(f.store.get_or_create_quota("u1").await.unwrap().daily_used > 0);
        stream.next_chunk().await.unwrap();
        assert!(stream.cancel().await.is_none());
        assert_eq!(f.store.get_or_create_quota("u1").await.unwrap().daily_used, 0);

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user(prompt)]);
        let stream = streaming(f.service.start_chat(request).await.unwrap());
        drop(stream);
        for _ in 0..10 {
            if f.store.get_or_create_quota("u1").await.unwrap().daily_used == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.store.get_or_create_quota("u1").await.unwrap().daily_used, 0);
        assert!(f.store.records().is_empty());
    }

    #[tokio::test]
    async fn test_routing_failure_releases_the_reservation() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google").script(ModelId::GeminiFlash, Script::OpenError("503".into())),
        ));

        let request = ChatRequest::new(QuotaSubject::new("u1"), ModelId::GeminiFlash, vec![ChatMessage::user("hello there")]);
        assert!(f.service.start_chat(request).await.is_err());
        assert_eq!(f.store.get_or_create_quota("u1").await.unwrap().daily_used, 0);
    }

    #[tokio::test]
    async fn test_resolve_tier_reads_the_account() {
        let f = fixture(ScriptedProviders::new(
            ScriptedProvider::new("anthropic"),
            ScriptedProvider::new("openai"),
            ScriptedProvider::new("google"),
        ));
        assert_eq!(f.service.resolve_tier("new-user").await, UserTier::Free);

        f.store.set_tier("pro-user", UserTier::Pro).await.unwrap();
        assert_eq!(f.service.resolve_tier("pro-user").await, UserTier::Pro);
    }
}
