use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::models::catalog::{ModelId, ProviderKind};
use crate::models::fallback::FallbackTable;
use crate::models::provider::ProviderSettings;
use crate::models::router::RouterSettings;
use crate::platform::AppPaths;
use crate::quota::manager::QuotaSettings;
use crate::storage::cost_alerts::CostAlertConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: ProvidersConfig,
    pub router: RouterConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub google: ProviderConfig,
    pub presentation: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig::from_env("ANTHROPIC_API_KEY"),
            openai: ProviderConfig::from_env("OPENAI_API_KEY"),
            google: ProviderConfig::from_env("GEMINI_API_KEY"),
            presentation: ProviderConfig::from_env("PRESENTATION_API_KEY"),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::Google => &self.google,
            ProviderKind::Presentation => &self.presentation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Inline key; takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            api_key_env: None,
            base_url: None,
            timeout_seconds: 30,
        }
    }
}

impl ProviderConfig {
    fn from_env(var: &str) -> Self {
        Self {
            api_key_env: Some(var.to_string()),
            ..Self::default()
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Some(key.to_string());
        }
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn to_settings(&self, idle_timeout: Duration) -> ProviderSettings {
        ProviderSettings {
            api_key: self.resolve_api_key(),
            base_url: self.base_url.clone(),
            connect_timeout: Duration::from_secs(self.timeout_seconds),
            idle_timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub max_output_tokens: u32,
    pub idle_timeout_seconds: u64,
    pub temperature: Option<f32>,
    /// Replacement chains keyed by model name, e.g. `gpt-4o = ["claude-sonnet-4"]`.
    pub fallback_overrides: HashMap<String, Vec<String>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            idle_timeout_seconds: 60,
            temperature: None,
            fallback_overrides: HashMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn to_router_settings(&self) -> RouterSettings {
        RouterSettings {
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
        }
    }

    pub fn fallback_table(&self) -> Result<FallbackTable> {
        let mut overrides = HashMap::new();
        for (model, chain) in &self.fallback_overrides {
            let model = ModelId::from_str(model)?;
            let chain = chain
                .iter()
                .map(|m| ModelId::from_str(m))
                .collect::<Result<Vec<_>>>()?;
            if chain.contains(&ModelId::Auto) {
                return Err(Error::validation(format!("Fallback chain for {} cannot contain auto", model)));
            }
            overrides.insert(model, chain);
        }
        Ok(FallbackTable::with_overrides(overrides))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub overage_rate_per_million_usd: Decimal,
    pub included_monthly_tokens: u64,
    pub alert_warning_percent: u64,
    pub alert_critical_percent: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            overage_rate_per_million_usd: Decimal::from(10),
            included_monthly_tokens: 10_000_000,
            alert_warning_percent: 80,
            alert_critical_percent: 95,
        }
    }
}

impl QuotaConfig {
    pub fn to_quota_settings(&self) -> QuotaSettings {
        QuotaSettings {
            overage_rate_per_million_usd: self.overage_rate_per_million_usd,
        }
    }

    pub fn to_alert_config(&self) -> CostAlertConfig {
        CostAlertConfig {
            enabled: true,
            included_monthly_tokens: self.included_monthly_tokens,
            warning_percent: self.alert_warning_percent,
            critical_percent: self.alert_critical_percent,
        }
    }
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        Self::load_from(&paths.config_file()).await
    }

    /// Reads `config_file`, writing the defaults there first if it is missing.
    pub async fn load_from(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save_to(config_file).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(config_file).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;

        debug!("Configuration loaded: {:?}", config.enabled_providers());
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        self.save_to(&paths.config_file()).await
    }

    pub async fn save_to(&self, config_file: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(config_file, config_content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.router.max_output_tokens == 0 {
            return Err(Error::validation("max_output_tokens must be positive"));
        }
        if self.router.idle_timeout_seconds == 0 {
            return Err(Error::validation("idle_timeout_seconds must be positive"));
        }
        if let Some(temperature) = self.router.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(Error::validation("Temperature must be between 0 and 2"));
            }
        }
        self.router.fallback_table()?;

        for kind in [
            ProviderKind::Anthropic,
            ProviderKind::OpenAI,
            ProviderKind::Google,
            ProviderKind::Presentation,
        ] {
            if self.providers.get(kind).timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} has a zero timeout", kind)));
            }
        }

        let quota = &self.quota;
        if quota.overage_rate_per_million_usd.is_sign_negative() {
            return Err(Error::validation("Overage rate cannot be negative"));
        }
        if quota.alert_warning_percent == 0
            || quota.alert_warning_percent > quota.alert_critical_percent
            || quota.alert_critical_percent > 100
        {
            return Err(Error::validation(
                "Alert thresholds must satisfy 0 < warning <= critical <= 100",
            ));
        }

        Ok(())
    }

    pub fn enabled_providers(&self) -> Vec<ProviderKind> {
        [
            ProviderKind::Anthropic,
            ProviderKind::OpenAI,
            ProviderKind::Google,
            ProviderKind::Presentation,
        ]
        .into_iter()
        .filter(|kind| self.providers.get(*kind).enabled)
        .collect()
    }
}
