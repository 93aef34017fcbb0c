//! GitHub Copilot executor: chat-completions upstream behind either the
//! Electron subprocess transport (TLS/HTTP parity) or the native client.
//!
//! Streaming uses the SSE line reader with an optional per-line idle budget;
//! retries only ever happen before the first event has been forwarded
//! downstream.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use mproxy_provider_core::{
    header_set, Auth, ExecContext, ExecuteOptions, ExecutorError, ExecutorResult, Headers,
    Initiator, ModelInfo, ProviderExecutor, ProviderResponse, ProxyRequest, ATTR_ACCOUNT_TYPE,
    ATTR_BASE_URL, ATTR_EXPIRES_AT,
};
use mproxy_translator::{
    translate_request_value, translate_response_value, Format, SseEvent, SseStreamParser,
    StreamTranslator, TranslateError,
};

use crate::electron;
use crate::http_client;
use crate::upstream;
use crate::sse_reader::SseLineReader;

const PROVIDER_NAME: &str = "copilot";
const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const EDITOR_VERSION: &str = "vscode/1.99.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.26.0";

const DEFAULT_STREAM_MAX_ATTEMPTS: u32 = 2;

/// Once the subprocess transport reports itself unavailable, stop probing it
/// for the rest of the process lifetime.
static ELECTRON_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

type IoByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;
type LineReader = SseLineReader<StreamReader<IoByteStream, Bytes>>;

fn stream_max_attempts() -> u32 {
    std::env::var("COPILOT_STREAM_MAX_ATTEMPTS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|n| (1..=5).contains(n))
        .unwrap_or(DEFAULT_STREAM_MAX_ATTEMPTS)
}

fn stream_idle_budget() -> Option<Duration> {
    std::env::var("COPILOT_STREAM_IDLE_BUDGET_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Interactive traffic unless the conversation already contains agent turns.
fn derive_initiator(chat_body: &Value) -> Initiator {
    let has_agent_turn = chat_body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages.iter().any(|message| {
                matches!(
                    message.get("role").and_then(Value::as_str),
                    Some("assistant") | Some("tool")
                )
            })
        })
        .unwrap_or(false);
    if has_agent_turn {
        Initiator::Agent
    } else {
        Initiator::User
    }
}

enum TransportResponse {
    Native(wreq::Response),
    Electron(electron::ElectronResponse),
}

impl TransportResponse {
    fn status(&self) -> u16 {
        match self {
            TransportResponse::Native(response) => response.status().as_u16(),
            TransportResponse::Electron(response) => response.status,
        }
    }

    fn headers(&self) -> Headers {
        match self {
            TransportResponse::Native(response) => upstream::headers_from_response(response),
            TransportResponse::Electron(response) => response.headers.clone(),
        }
    }

    fn into_byte_stream(self) -> IoByteStream {
        match self {
            TransportResponse::Native(response) => Box::pin(
                response
                    .bytes_stream()
                    .map(|item| item.map_err(io::Error::other)),
            ),
            TransportResponse::Electron(response) => Box::pin(ReceiverStream::new(response.body)),
        }
    }

    async fn collect_body(self) -> ExecutorResult<Bytes> {
        let mut stream = self.into_byte_stream();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ExecutorError::UpstreamTransient(err.to_string()))?;
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

#[derive(Debug, Default)]
pub struct CopilotExecutor;

impl CopilotExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(auth: &Auth) -> String {
        if let Some(base) = auth.attr(ATTR_BASE_URL) {
            return base.trim_end_matches('/').to_string();
        }
        match auth.attr(ATTR_ACCOUNT_TYPE).unwrap_or("individual") {
            "business" => "https://api.business.githubcopilot.com".to_string(),
            "enterprise" => "https://api.enterprise.githubcopilot.com".to_string(),
            _ => "https://api.githubcopilot.com".to_string(),
        }
    }

    fn request_headers(
        ctx: &ExecContext,
        auth: &Auth,
        chat_body: &Value,
        stream: bool,
    ) -> ExecutorResult<Headers> {
        let token = auth
            .attr("copilot_token")
            .ok_or(ExecutorError::MissingAuthAttribute("copilot_token"))?;
        let initiator = ctx.initiator.unwrap_or_else(|| derive_initiator(chat_body));

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Editor-Version", EDITOR_VERSION);
        header_set(&mut headers, "Editor-Plugin-Version", EDITOR_PLUGIN_VERSION);
        header_set(&mut headers, "Copilot-Integration-Id", "vscode-chat");
        header_set(&mut headers, "Openai-Intent", "conversation-panel");
        header_set(&mut headers, "X-Initiator", initiator.as_str());
        if stream {
            header_set(&mut headers, "Accept", "text/event-stream");
        } else {
            header_set(&mut headers, "Accept", "application/json");
        }
        Ok(headers)
    }

    async fn send(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        url: &str,
        headers: &Headers,
        body: Bytes,
        is_stream: bool,
        timeout: Option<Duration>,
    ) -> ExecutorResult<TransportResponse> {
        let electron_preferred =
            electron::prefer_electron_transport() && !ELECTRON_UNAVAILABLE.load(Ordering::Relaxed);
        if electron_preferred {
            let proxy = http_client::effective_proxy(
                &ctx.config,
                Some(auth),
                PROVIDER_NAME,
                crate::no_proxy::host_of(url).as_deref(),
            );
            match electron::fetch("POST", url, headers, Some(body.clone()), proxy.as_deref())
                .await
            {
                Ok(response) => return Ok(TransportResponse::Electron(response)),
                Err(ExecutorError::SubprocessUnavailable(reason)) => {
                    ELECTRON_UNAVAILABLE.store(true, Ordering::Relaxed);
                    debug!(reason = %reason, "copilot electron transport unavailable, using native client");
                }
                Err(err) => return Err(err),
            }
        }

        let client = http_client::client_for(&ctx.config, Some(auth), PROVIDER_NAME, url, None)?;
        let response = upstream::send_request(
            ctx,
            PROVIDER_NAME,
            client.post(url).body(body),
            headers,
            is_stream,
            timeout,
        )
        .await?;
        Ok(TransportResponse::Native(response))
    }

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        url: &str,
        headers: &Headers,
        body: Bytes,
        req: &ProxyRequest,
    ) -> ExecutorResult<ProviderResponse> {
        let attempts = stream_max_attempts();
        let idle_budget = stream_idle_budget();
        let mut last_error = ExecutorError::UpstreamTransient("no attempts made".to_string());

        for attempt in 1..=attempts {
            let response = match self
                .send(ctx, auth, url, headers, body.clone(), true, None)
                .await
            {
                Ok(response) => response,
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %err, "copilot stream attempt failed, retrying");
                    last_error = err;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let status = response.status();
            if !(200..300).contains(&status) {
                let response_headers = response.headers();
                let body_bytes = response.collect_body().await.unwrap_or_default();
                let err = upstream::classify_failure(status, response_headers, body_bytes);
                if err.is_retryable() && attempt < attempts {
                    warn!(attempt, status, "copilot stream upstream failure, retrying");
                    last_error = err;
                    continue;
                }
                return Err(err);
            }

            let mut reader: LineReader =
                SseLineReader::new(StreamReader::new(response.into_byte_stream()));
            let mut parser = SseStreamParser::new();
            match next_event(&mut reader, &mut parser, idle_budget).await {
                Ok(Some(first)) => {
                    // First payload is in hand: the response is committed and
                    // no further retry may happen.
                    let translator =
                        StreamTranslator::new(Format::OpenAI, req.source_format, &req.model)?;
                    let (tx, rx) = mpsc::channel::<ExecutorResult<Bytes>>(32);
                    tokio::spawn(pump_lines(reader, parser, translator, first, tx));
                    return Ok(ProviderResponse::stream(rx));
                }
                Ok(None) => {
                    last_error = ExecutorError::UpstreamTransient(
                        "stream ended before any event".to_string(),
                    );
                }
                Err(err) => {
                    last_error = ExecutorError::UpstreamTransient(err.to_string());
                }
            }
            if attempt < attempts {
                warn!(attempt, error = %last_error, "copilot stream produced no payload, retrying");
            }
        }
        Err(last_error)
    }
}

/// Reads lines until one full SSE event is assembled. The idle budget bounds
/// each line read; exceeding it surfaces as a timeout error.
async fn next_event(
    reader: &mut LineReader,
    parser: &mut SseStreamParser,
    idle_budget: Option<Duration>,
) -> io::Result<Option<SseEvent>> {
    loop {
        let line = match idle_budget {
            Some(budget) => tokio::time::timeout(budget, reader.read_line())
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "sse line idle budget exceeded")
                })??,
            None => reader.read_line().await?,
        };
        let Some(line) = line else {
            return Ok(parser.finish().into_iter().next());
        };
        let mut events = parser.push(&line);
        events.extend(parser.push(b"\n"));
        if let Some(event) = events.into_iter().next() {
            return Ok(Some(event));
        }
    }
}

async fn pump_lines(
    mut reader: LineReader,
    mut parser: SseStreamParser,
    mut translator: StreamTranslator,
    first: SseEvent,
    tx: mpsc::Sender<ExecutorResult<Bytes>>,
) {
    if !upstream::forward_event(&tx, &mut translator, &first).await {
        return;
    }
    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let _ = tx
                    .send(Err(ExecutorError::StreamAborted(err.to_string())))
                    .await;
                return;
            }
        };
        let mut events = parser.push(&line);
        events.extend(parser.push(b"\n"));
        for event in events {
            if !upstream::forward_event(&tx, &mut translator, &event).await {
                return;
            }
        }
    }
    for event in parser.finish() {
        if !upstream::forward_event(&tx, &mut translator, &event).await {
            return;
        }
    }
    upstream::flush_translator(&tx, &mut translator).await;
}

#[async_trait]
impl ProviderExecutor for CopilotExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        req: ProxyRequest,
        opts: ExecuteOptions,
    ) -> ExecutorResult<ProviderResponse> {
        let payload: Value = serde_json::from_slice(&req.payload)
            .map_err(|err| ExecutorError::Translation(TranslateError::InvalidPayload(err.to_string())))?;
        let mut body = translate_request_value(&payload, req.source_format, Format::OpenAI)?;
        body["model"] = json!(req.model);
        body["stream"] = json!(req.stream);

        let headers = Self::request_headers(ctx, auth, &body, req.stream)?;
        let url = format!("{}/chat/completions", Self::base_url(auth));
        let body_bytes = Bytes::from(
            serde_json::to_vec(&body)
                .map_err(|err| ExecutorError::other(format!("encode upstream body: {err}")))?,
        );

        if req.stream {
            return self
                .execute_stream(ctx, auth, &url, &headers, body_bytes, &req)
                .await;
        }

        let response = self
            .send(ctx, auth, &url, &headers, body_bytes, false, opts.timeout)
            .await?;
        let status = response.status();
        let response_headers = response.headers();
        let body = response.collect_body().await?;
        if !(200..300).contains(&status) {
            return Err(upstream::classify_failure(status, response_headers, body));
        }
        let upstream_value: Value = serde_json::from_slice(&body)
            .map_err(|err| ExecutorError::other(format!("decode upstream response: {err}")))?;
        let translated = translate_response_value(&upstream_value, Format::OpenAI, req.source_format)?;
        let bytes = serde_json::to_vec(&translated)
            .map_err(|err| ExecutorError::other(format!("encode response: {err}")))?;
        Ok(ProviderResponse::json(Bytes::from(bytes)))
    }

    async fn refresh(&self, ctx: &ExecContext, auth: &Auth) -> ExecutorResult<Auth> {
        let github_token = auth
            .attr("github_token")
            .ok_or(ExecutorError::MissingAuthAttribute("github_token"))?;
        let client =
            http_client::client_for(&ctx.config, Some(auth), PROVIDER_NAME, TOKEN_URL, None)?;
        let response = client
            .get(TOKEN_URL)
            .header("authorization", format!("token {github_token}"))
            .header("accept", "application/json")
            .header("editor-version", EDITOR_VERSION)
            .header("editor-plugin-version", EDITOR_PLUGIN_VERSION)
            .send()
            .await
            .map_err(|err| ExecutorError::UpstreamTransient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(upstream::fail_from_response(response).await);
        }
        let token: Value = response
            .json()
            .await
            .map_err(|err| ExecutorError::other(format!("decode token response: {err}")))?;

        let mut refreshed = auth.clone();
        if let Some(value) = token.get("token").and_then(Value::as_str) {
            // Short-lived bearer; held in memory only, never persisted.
            refreshed.set_attr("copilot_token", value);
        }
        if let Some(expires_at) = token.get("expires_at").and_then(Value::as_i64) {
            if let Ok(when) = time::OffsetDateTime::from_unix_timestamp(expires_at) {
                if let Ok(stamp) = when.format(&time::format_description::well_known::Rfc3339) {
                    refreshed.set_attr(ATTR_EXPIRES_AT, stamp);
                }
            }
        }
        Ok(refreshed)
    }

    fn default_models(&self, _auth: &Auth) -> Vec<ModelInfo> {
        [
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4.1",
            "o3-mini",
            "claude-sonnet-4",
            "gemini-2.5-pro",
        ]
        .iter()
        .map(|id| ModelInfo::new(*id).owned_by("github"))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn initiator_derivation_checks_agent_turns() {
        let interactive = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(derive_initiator(&interactive), Initiator::User);

        let agentic = json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "ok"},
            {"role": "tool", "tool_call_id": "c1", "content": "{}"},
        ]});
        assert_eq!(derive_initiator(&agentic), Initiator::Agent);

        assert_eq!(derive_initiator(&json!({})), Initiator::User);
    }

    #[test]
    fn stream_governors_read_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("COPILOT_STREAM_MAX_ATTEMPTS");
        std::env::remove_var("COPILOT_STREAM_IDLE_BUDGET_MS");
        assert_eq!(stream_max_attempts(), 2);
        assert_eq!(stream_idle_budget(), None);

        std::env::set_var("COPILOT_STREAM_MAX_ATTEMPTS", "3");
        std::env::set_var("COPILOT_STREAM_IDLE_BUDGET_MS", "1500");
        assert_eq!(stream_max_attempts(), 3);
        assert_eq!(stream_idle_budget(), Some(Duration::from_millis(1500)));

        // Out-of-range values fall back to the default.
        std::env::set_var("COPILOT_STREAM_MAX_ATTEMPTS", "99");
        assert_eq!(stream_max_attempts(), 2);

        std::env::remove_var("COPILOT_STREAM_MAX_ATTEMPTS");
        std::env::remove_var("COPILOT_STREAM_IDLE_BUDGET_MS");
    }

    #[test]
    fn endpoint_follows_account_type() {
        let individual = Auth::new("a", "copilot");
        assert_eq!(
            CopilotExecutor::base_url(&individual),
            "https://api.githubcopilot.com"
        );
        let business = Auth::new("b", "copilot").with_attr(ATTR_ACCOUNT_TYPE, "business");
        assert_eq!(
            CopilotExecutor::base_url(&business),
            "https://api.business.githubcopilot.com"
        );
        let pinned = Auth::new("c", "copilot").with_attr(ATTR_BASE_URL, "http://127.0.0.1:9/x/");
        assert_eq!(CopilotExecutor::base_url(&pinned), "http://127.0.0.1:9/x");
    }

    #[test]
    fn request_headers_carry_initiator_override() {
        let mut ctx = ExecContext::new(std::sync::Arc::new(mproxy_common::Config::default()));
        ctx.initiator = Some(Initiator::Agent);
        let auth = Auth::new("a", "copilot").with_attr("copilot_token", "tid");
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let headers = CopilotExecutor::request_headers(&ctx, &auth, &body, true).unwrap();
        assert_eq!(
            mproxy_provider_core::header_get(&headers, "x-initiator"),
            Some("agent")
        );
        assert_eq!(
            mproxy_provider_core::header_get(&headers, "accept"),
            Some("text/event-stream")
        );
    }

    #[test]
    fn missing_copilot_token_is_reported() {
        let ctx = ExecContext::new(std::sync::Arc::new(mproxy_common::Config::default()));
        let auth = Auth::new("a", "copilot");
        let err =
            CopilotExecutor::request_headers(&ctx, &auth, &json!({}), false).unwrap_err();
        assert!(matches!(err, ExecutorError::MissingAuthAttribute("copilot_token")));
    }

    #[tokio::test]
    async fn next_event_assembles_lines_and_honors_eof() {
        let input = b"event: x\ndata: {\"a\":1}\n\n".to_vec();
        let stream: IoByteStream =
            Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from(input))]));
        let mut reader: LineReader = SseLineReader::new(StreamReader::new(stream));
        let mut parser = SseStreamParser::new();
        let event = next_event(&mut reader, &mut parser, None).await.unwrap();
        assert_eq!(event, Some(SseEvent::named("x", "{\"a\":1}")));

        let empty: IoByteStream = Box::pin(futures_util::stream::iter(Vec::new()));
        let mut reader: LineReader = SseLineReader::new(StreamReader::new(empty));
        let mut parser = SseStreamParser::new();
        assert_eq!(next_event(&mut reader, &mut parser, None).await.unwrap(), None);
    }
}
