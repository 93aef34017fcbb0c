//! HTTP serving core: dialect routes, the SSE write-state normalizer,
//! stream assembly with keep-alive heartbeats, and the service wiring that
//! ties the auth manager, model registry, and provider executors together.

pub mod apikey;
pub mod chutes_priority;
pub mod error;
pub mod handler;
pub mod router;
pub mod service;
pub mod sse;
pub mod stream;

pub use chutes_priority::{ChutesPriorityHook, DEFAULT_DEBOUNCE};
pub use router::api_router;
pub use service::Service;
pub use sse::SseWriteState;
