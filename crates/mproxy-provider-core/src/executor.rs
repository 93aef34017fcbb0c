use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use mproxy_common::Config;
use mproxy_translator::Format;

use crate::auth::Auth;
use crate::errors::ExecutorResult;
use crate::headers::Headers;

/// Streamed response chunks, already translated to the client's dialect.
pub type ByteStream = tokio::sync::mpsc::Receiver<ExecutorResult<Bytes>>;

/// Who initiated the request, for providers that meter interactive and
/// automated traffic differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    User,
    Agent,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::User => "user",
            Initiator::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Initiator::User),
            "agent" => Some(Initiator::Agent),
            _ => None,
        }
    }
}

/// Per-request execution context handed to executors.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub trace_id: String,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    /// Explicit initiator override from the inbound request, if any.
    pub initiator: Option<Initiator>,
    pub config: Arc<Config>,
}

impl ExecContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            trace_id: String::new(),
            user_id: None,
            user_agent: None,
            initiator: None,
            config,
        }
    }
}

/// Request envelope: the raw client body plus the dialect it arrived in.
/// Executors own producing the upstream-native body from it.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub model: String,
    pub payload: Bytes,
    pub source_format: Format,
    pub stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Per-call deadline for non-streaming requests. Streaming requests must
    /// not get a whole-response timeout; they rely on context cancellation and
    /// the per-line idle budget instead.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum ResponseBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

/// Response handed back to the HTTP layer. Streaming bodies are dialect
/// chunks; the HTTP layer runs them through the SSE normalizer on the way out.
#[derive(Debug)]
pub struct ProviderResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: ResponseBody,
}

impl ProviderResponse {
    pub fn json(body: Bytes) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ResponseBody::Bytes(body),
        }
    }

    pub fn stream(stream: ByteStream) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: ResponseBody::Stream(stream),
        }
    }
}

/// One upstream provider backend: builds the native request, sends it via the
/// shared transport layer, and streams the response back through the
/// translator.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn identifier(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        req: ProxyRequest,
        opts: ExecuteOptions,
    ) -> ExecutorResult<ProviderResponse>;

    /// Provider-specific token refresh. Default: nothing to refresh.
    async fn refresh(&self, _ctx: &ExecContext, auth: &Auth) -> ExecutorResult<Auth> {
        Ok(auth.clone())
    }

    /// Models this executor advertises for a freshly registered auth.
    fn default_models(&self, _auth: &Auth) -> Vec<crate::registry::ModelInfo> {
        Vec::new()
    }
}
