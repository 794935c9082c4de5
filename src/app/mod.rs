pub mod config;
pub mod state;

pub use config::{AppConfig, ProviderConfig, ProvidersConfig, QuotaConfig, RouterConfig};
pub use state::{build_registry, AppState, StorageMode};
