//! Anthropic messages executor.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use mproxy_provider_core::{
    header_set, Auth, ExecContext, ExecuteOptions, ExecutorError, ExecutorResult, Headers,
    ModelInfo, ProviderExecutor, ProviderResponse, ProxyRequest, ATTR_API_KEY, ATTR_BASE_URL,
};
use mproxy_translator::{
    translate_request_value, translate_response_value, Format, StreamTranslator, TranslateError,
};

use crate::http_client;
use crate::upstream;

const PROVIDER_NAME: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Default)]
pub struct ClaudeExecutor;

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
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
        let api_key = auth
            .attr(ATTR_API_KEY)
            .ok_or(ExecutorError::MissingAuthAttribute(ATTR_API_KEY))?;
        let payload: Value = serde_json::from_slice(&req.payload).map_err(|err| {
            ExecutorError::Translation(TranslateError::InvalidPayload(err.to_string()))
        })?;
        let mut body = translate_request_value(&payload, req.source_format, Format::Claude)?;
        body["model"] = json!(req.model);
        body["stream"] = json!(req.stream);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "x-api-key", api_key);
        header_set(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(&mut headers, "Content-Type", "application/json");
        if req.stream {
            header_set(&mut headers, "Accept", "text/event-stream");
        }

        let base = auth
            .attr(ATTR_BASE_URL)
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let url = format!("{base}/v1/messages");
        let client = http_client::client_for(&ctx.config, Some(auth), PROVIDER_NAME, &url, None)?;
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|err| ExecutorError::other(format!("encode upstream body: {err}")))?;
        let timeout = (!req.stream).then_some(opts.timeout).flatten();
        let response = upstream::send_request(
            ctx,
            PROVIDER_NAME,
            client.post(&url).body(body_bytes),
            &headers,
            req.stream,
            timeout,
        )
        .await?;
        if !response.status().is_success() {
            return Err(upstream::fail_from_response(response).await);
        }

        if req.stream {
            let translator = StreamTranslator::new(Format::Claude, req.source_format, &req.model)?;
            Ok(ProviderResponse::stream(upstream::spawn_sse_pump(
                response, translator,
            )))
        } else {
            let upstream_body = response
                .bytes()
                .await
                .map_err(|err| ExecutorError::UpstreamTransient(err.to_string()))?;
            let value: Value = serde_json::from_slice(&upstream_body)
                .map_err(|err| ExecutorError::other(format!("decode upstream response: {err}")))?;
            let translated = translate_response_value(&value, Format::Claude, req.source_format)?;
            let bytes = serde_json::to_vec(&translated)
                .map_err(|err| ExecutorError::other(format!("encode response: {err}")))?;
            Ok(ProviderResponse::json(Bytes::from(bytes)))
        }
    }

    fn default_models(&self, _auth: &Auth) -> Vec<ModelInfo> {
        [
            "claude-opus-4-5",
            "claude-sonnet-4-5",
            "claude-haiku-4-5",
            "claude-sonnet-4",
        ]
        .iter()
        .map(|id| ModelInfo::new(*id).owned_by("anthropic"))
        .collect()
    }
}
