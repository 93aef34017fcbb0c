//! Core provider abstractions for mproxy.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. It owns the auth manager, the model registry with its hook
//! protocol, and the executor trait; the `mproxy-providers` crate supplies
//! concrete executors and the transport layer on top of these types.

pub mod auth;
pub mod errors;
pub mod executor;
pub mod headers;
pub mod manager;
pub mod registry;

pub use auth::{
    Auth, AuthStatus, ATTR_ACCOUNT_ID, ATTR_ACCOUNT_TYPE, ATTR_API_KEY, ATTR_API_TYPE,
    ATTR_BASE_URL, ATTR_EXPIRES_AT, ATTR_PRIORITY, PRIORITY_FALLBACK,
};
pub use errors::{ExecutorError, ExecutorResult};
pub use executor::{
    ByteStream, ExecContext, ExecuteOptions, Initiator, ProviderExecutor, ProviderResponse,
    ProxyRequest, ResponseBody,
};
pub use headers::{header_append, header_get, header_remove, header_set, Headers};
pub use manager::{AuthManager, AuthSelector, RoundRobinSelector};
pub use registry::{ModelInfo, ModelRegistry, ModelRegistryHook, CHUTES_MODEL_PREFIX};
