use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::config::AppConfig;
use crate::chat::ChatService;
use crate::error::Result;
use crate::models::catalog::ProviderKind;
use crate::models::events::{RoutingObserver, TracingObserver};
use crate::models::provider::StreamingProvider;
use crate::models::registry::ProviderRegistry;
use crate::models::router::Router;
use crate::models::{AnthropicProvider, GeminiProvider, OpenAIProvider};
use crate::platform::AppPaths;
use crate::quota::manager::{PlanOverage, QuotaManager};
use crate::quota::types::{MeteringSink, QuotaStore};
use crate::storage::cost_alerts::{CostAlert, QuotaAlerts};
use crate::storage::{Database, InMemoryMeter, InMemoryQuotaStore, SqliteMeter, SqliteQuotaStore};

/// Where accounts and metering live for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Sqlite,
    /// Nothing is persisted.
    Memory,
}

/// Everything the gateway needs, built once from configuration.
pub struct AppState {
    config: AppConfig,
    paths: AppPaths,
    database: Option<Database>,
    registry: Arc<ProviderRegistry>,
    router: Arc<Router>,
    quota: Arc<QuotaManager>,
    alerts: Arc<QuotaAlerts>,
    chat: ChatService,
}

impl AppState {
    pub async fn new(
        config: AppConfig,
        paths: AppPaths,
        mode: StorageMode,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CostAlert>)> {
        info!("Initializing application state ({:?} storage)", mode);
        config.validate()?;

        let registry = Arc::new(build_registry(&config)?);
        info!(
            "Providers ready: {} registered, {} models available",
            registry.len(),
            registry.available_models().len()
        );

        let observer: Arc<dyn RoutingObserver> = Arc::new(TracingObserver);
        let router = Arc::new(Router::new(
            registry.clone(),
            config.router.fallback_table()?,
            observer,
            config.router.to_router_settings(),
        ));

        let (database, store, metering): (Option<Database>, Arc<dyn QuotaStore>, Arc<dyn MeteringSink>) = match mode {
            StorageMode::Sqlite => {
                let database = Database::new(&paths).await?;
                let pool = database.pool().clone();
                let store: Arc<dyn QuotaStore> = Arc::new(SqliteQuotaStore::new(pool.clone()));
                let meter: Arc<dyn MeteringSink> = Arc::new(SqliteMeter::new(
                    pool,
                    config.quota.included_monthly_tokens,
                    config.quota.overage_rate_per_million_usd,
                ));
                (Some(database), store, meter)
            }
            StorageMode::Memory => {
                let store: Arc<dyn QuotaStore> = Arc::new(InMemoryQuotaStore::new());
                let meter: Arc<dyn MeteringSink> = Arc::new(InMemoryMeter::new(
                    config.quota.included_monthly_tokens,
                    config.quota.overage_rate_per_million_usd,
                ));
                (None, store, meter)
            }
        };

        let (alerts, alert_receiver) = QuotaAlerts::new(config.quota.to_alert_config(), metering.clone());
        let alerts = Arc::new(alerts);

        let quota = Arc::new(QuotaManager::new(
            store.clone(),
            metering,
            alerts.clone(),
            Arc::new(PlanOverage::new(store)),
            config.quota.to_quota_settings(),
        ));

        let chat = ChatService::new(router.clone(), quota.clone());

        let state = Self {
            config,
            paths,
            database,
            registry,
            router,
            quota,
            alerts,
            chat,
        };
        Ok((state, alert_receiver))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn alerts(&self) -> &QuotaAlerts {
        &self.alerts
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub async fn shutdown(self) {
        if let Some(database) = self.database {
            database.close().await;
        }
    }
}

/// One client per enabled provider family. A family without credentials is
/// still registered; the registry reports its models as unavailable.
pub fn build_registry(config: &AppConfig) -> Result<ProviderRegistry> {
    let idle_timeout = config.router.idle_timeout();
    let mut registry = ProviderRegistry::new();

    for kind in config.enabled_providers() {
        let settings = config.providers.get(kind).to_settings(idle_timeout);
        if settings.api_key.is_none() {
            warn!("No API key configured for {}, its models will be skipped", kind);
        }

        let provider: Arc<dyn StreamingProvider> = match kind {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)?),
            ProviderKind::OpenAI => Arc::new(OpenAIProvider::new(settings)?),
            ProviderKind::Google => Arc::new(GeminiProvider::new(settings)?),
            ProviderKind::Presentation => Arc::new(OpenAIProvider::presentation(settings)?),
        };
        debug!("Registered provider {} (configured: {})", kind, provider.is_configured());
        registry.register(kind, provider);
    }

    Ok(registry)
}
