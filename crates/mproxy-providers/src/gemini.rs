//! Google Gemini executor (generateContent / streamGenerateContent).

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use mproxy_provider_core::{
    header_set, Auth, ExecContext, ExecuteOptions, ExecutorError, ExecutorResult, Headers,
    ModelInfo, ProviderExecutor, ProviderResponse, ProxyRequest, ATTR_API_KEY, ATTR_BASE_URL,
};
use mproxy_translator::{
    translate_request_value, translate_response_value, Format, StreamTranslator, TranslateError,
};

use crate::http_client;
use crate::upstream;

const PROVIDER_NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Default)]
pub struct GeminiExecutor;

impl GeminiExecutor {
    pub fn new() -> Self {
        Self
    }

    /// `streamGenerateContent?alt=sse` keeps the stream in SSE framing, which
    /// the shared pump understands.
    fn url(auth: &Auth, model: &str, stream: bool) -> String {
        let base = auth
            .attr(ATTR_BASE_URL)
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        if stream {
            format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/v1beta/models/{model}:generateContent")
        }
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
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
        let body = translate_request_value(&payload, req.source_format, Format::Gemini)?;

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "x-goog-api-key", api_key);
        header_set(&mut headers, "Content-Type", "application/json");

        let url = Self::url(auth, &req.model, req.stream);
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
            let translator = StreamTranslator::new(Format::Gemini, req.source_format, &req.model)?;
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
            let translated = translate_response_value(&value, Format::Gemini, req.source_format)?;
            let bytes = serde_json::to_vec(&translated)
                .map_err(|err| ExecutorError::other(format!("encode response: {err}")))?;
            Ok(ProviderResponse::json(Bytes::from(bytes)))
        }
    }

    fn default_models(&self, _auth: &Auth) -> Vec<ModelInfo> {
        ["gemini-2.5-pro", "gemini-2.5-flash", "gemini-3-pro-preview"]
            .iter()
            .map(|id| ModelInfo::new(*id).owned_by("google"))
            .collect()
    }
}
