//! Streaming LLM provider adapters.
//!
//! Two wire protocols, one event vocabulary: [`OpenAiProvider`] speaks the
//! Chat Completions SSE format used by OpenAI, DeepSeek, Groq, OpenRouter,
//! and most local servers; [`AnthropicProvider`] speaks Anthropic's typed
//! Messages events. Both translate into `aido_core::StreamEvent`.

pub mod anthropic;
pub mod openai;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;

use aido_core::provider::Provider;

/// Pick the adapter for a provider's configured client type
/// ("openai" | "anthropic").
pub fn provider_for(client_type: &str) -> Arc<dyn Provider> {
    if client_type == "anthropic" {
        Arc::new(AnthropicProvider::new())
    } else {
        Arc::new(OpenAiProvider::new())
    }
}
