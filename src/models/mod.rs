pub mod anthropic;
pub mod catalog;
pub mod events;
pub mod fallback;
pub mod gemini;
pub mod openai;
pub mod pricing;
pub mod provider;
pub mod registry;
pub mod router;
pub mod selector;
pub mod sse;
pub mod tool_calls;

#[cfg(test)]
pub(crate) mod testing;

pub use anthropic::AnthropicProvider;
pub use catalog::{ModelId, ProviderKind};
pub use events::{RoutingObserver, SkipReason, TracingObserver};
pub use fallback::{get_fallback_chain, FallbackChain, FallbackTable};
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
pub use pricing::{calculate_cost, pricing_for, ModelPricing};
pub use provider::{
    ChatMessage, ChatStream, MessageRole, ProviderRequest, ProviderSettings, StreamChunk,
    StreamingProvider, TokenUsage, ToolCall, ToolDefinition,
};
pub use registry::ProviderRegistry;
pub use router::{RoutePlan, RoutedStream, Router, RouterSettings};
pub use selector::{select_best_model, ModelSelectionContext};
