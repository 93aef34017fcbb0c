//! Concrete provider executors and the outbound transport layer.

pub mod claude;
pub mod codex;
pub mod copilot;
pub mod electron;
pub mod gemini;
pub mod http_client;
pub mod no_proxy;
pub mod openai_compat;
pub mod sse_reader;
pub mod storage;
mod upstream;

use std::sync::Arc;

use mproxy_provider_core::ProviderExecutor;

pub use sse_reader::SseLineReader;
pub use storage::{atomic_write, FileAuthStore};
pub use upstream::retry_after_seconds;

/// The built-in executor set, one per supported provider.
pub fn default_executors() -> Vec<Arc<dyn ProviderExecutor>> {
    vec![
        Arc::new(codex::CodexExecutor::new()),
        Arc::new(copilot::CopilotExecutor::new()),
        Arc::new(claude::ClaudeExecutor::new()),
        Arc::new(gemini::GeminiExecutor::new()),
        Arc::new(openai_compat::OpenAICompatExecutor::openai()),
        Arc::new(openai_compat::OpenAICompatExecutor::chutes()),
    ]
}
