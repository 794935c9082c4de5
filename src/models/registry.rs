use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::models::catalog::{ModelId, ProviderKind};
use crate::models::provider::StreamingProvider;

/// Provider clients keyed by family, built once at startup and shared by
/// every request.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn StreamingProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn StreamingProvider>) {
        debug!("Registering provider {} for {}", provider.get_provider_name(), kind);
        self.providers.insert(kind, provider);
    }

    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn StreamingProvider>) -> Self {
        self.register(kind, provider);
        self
    }

    pub fn provider_for(&self, model: ModelId) -> Option<Arc<dyn StreamingProvider>> {
        let kind = model.provider()?;
        self.providers.get(&kind).cloned()
    }

    /// True when the model's provider is registered and has credentials.
    pub fn is_model_available(&self, model: ModelId) -> bool {
        self.provider_for(model)
            .map(|provider| provider.is_configured())
            .unwrap_or(false)
    }

    pub fn available_models(&self) -> Vec<ModelId> {
        ModelId::CONCRETE
            .into_iter()
            .filter(|model| self.is_model_available(*model))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::OpenAIProvider;
    use crate::models::provider::ProviderSettings;

    #[test]
    fn test_availability_follows_credentials() {
        let registry = ProviderRegistry::new()
            .with_provider(
                ProviderKind::OpenAI,
                Arc::new(OpenAIProvider::new(ProviderSettings::with_api_key("sk-test")).unwrap()),
            )
            .with_provider(
                ProviderKind::Presentation,
                Arc::new(OpenAIProvider::presentation(ProviderSettings::with_api_key("key")).unwrap()),
            );

        assert!(registry.is_model_available(ModelId::Gpt4o));
        assert!(registry.is_model_available(ModelId::O3Mini));
        // Registered but missing its endpoint.
        assert!(!registry.is_model_available(ModelId::Presentation));
        // Never registered.
        assert!(!registry.is_model_available(ModelId::ClaudeSonnet));
        assert!(!registry.is_model_available(ModelId::Auto));

        assert_eq!(
            registry.available_models(),
            vec![ModelId::Gpt4o, ModelId::Gpt4oMini, ModelId::O3Mini]
        );
    }
}
