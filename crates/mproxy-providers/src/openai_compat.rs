//! Generic executor for OpenAI-compatible chat-completions upstreams.
//!
//! Serves both the plain `openai` provider and aggregators such as `chutes`
//! that expose the same wire surface under their own base URL.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use mproxy_provider_core::{
    header_set, Auth, ExecContext, ExecuteOptions, ExecutorError, ExecutorResult, Headers,
    ModelInfo, ProviderExecutor, ProviderResponse, ProxyRequest, ATTR_API_KEY, ATTR_BASE_URL,
    CHUTES_MODEL_PREFIX,
};
use mproxy_translator::{
    translate_request_value, translate_response_value, Format, StreamTranslator, TranslateError,
};

use crate::http_client;
use crate::upstream;

pub struct OpenAICompatExecutor {
    provider: &'static str,
    default_base_url: &'static str,
}

impl OpenAICompatExecutor {
    pub fn openai() -> Self {
        Self {
            provider: "openai",
            default_base_url: "https://api.openai.com/v1",
        }
    }

    pub fn chutes() -> Self {
        Self {
            provider: "chutes",
            default_base_url: "https://llm.chutes.ai/v1",
        }
    }

    fn base_url(&self, auth: &Auth) -> String {
        auth.attr(ATTR_BASE_URL)
            .unwrap_or(self.default_base_url)
            .trim_end_matches('/')
            .to_string()
    }

    /// Prefixed aliases resolve to the bare upstream model name.
    fn upstream_model<'a>(&self, model: &'a str) -> &'a str {
        if self.provider == "chutes" {
            model.strip_prefix(CHUTES_MODEL_PREFIX).unwrap_or(model)
        } else {
            model
        }
    }
}

#[async_trait]
impl ProviderExecutor for OpenAICompatExecutor {
    fn identifier(&self) -> &'static str {
        self.provider
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
        let mut body = translate_request_value(&payload, req.source_format, Format::OpenAI)?;
        body["model"] = json!(self.upstream_model(&req.model));
        body["stream"] = json!(req.stream);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {api_key}"));
        header_set(&mut headers, "Content-Type", "application/json");
        if req.stream {
            header_set(&mut headers, "Accept", "text/event-stream");
        }

        let url = format!("{}/chat/completions", self.base_url(auth));
        let client = http_client::client_for(&ctx.config, Some(auth), self.provider, &url, None)?;
        let body_bytes = serde_json::to_vec(&body)
            .map_err(|err| ExecutorError::other(format!("encode upstream body: {err}")))?;
        let timeout = (!req.stream).then_some(opts.timeout).flatten();
        let response = upstream::send_request(
            ctx,
            self.provider,
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
            let translator = StreamTranslator::new(Format::OpenAI, req.source_format, &req.model)?;
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
            let translated = translate_response_value(&value, Format::OpenAI, req.source_format)?;
            let bytes = serde_json::to_vec(&translated)
                .map_err(|err| ExecutorError::other(format!("encode response: {err}")))?;
            Ok(ProviderResponse::json(Bytes::from(bytes)))
        }
    }

    /// Chutes auths advertise their configured models both bare and behind
    /// the `chutes-` prefix; the bare IDs may later be hidden by the fallback
    /// priority filter, the prefixed aliases never are.
    fn default_models(&self, auth: &Auth) -> Vec<ModelInfo> {
        let configured: Vec<String> = auth
            .attr("models")
            .map(|raw| {
                raw.split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if self.provider != "chutes" {
            return configured.into_iter().map(ModelInfo::new).collect();
        }
        let mut models = Vec::with_capacity(configured.len() * 2);
        for id in configured {
            models.push(ModelInfo::new(id.clone()).owned_by("chutes"));
            if !id.starts_with(CHUTES_MODEL_PREFIX) {
                models.push(
                    ModelInfo::new(format!("{CHUTES_MODEL_PREFIX}{id}")).owned_by("chutes"),
                );
            }
        }
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chutes_aliases_resolve_to_bare_upstream_models() {
        let chutes = OpenAICompatExecutor::chutes();
        assert_eq!(chutes.upstream_model("chutes-gpt-4o"), "gpt-4o");
        assert_eq!(chutes.upstream_model("only-chutes-model"), "only-chutes-model");

        let openai = OpenAICompatExecutor::openai();
        assert_eq!(openai.upstream_model("chutes-gpt-4o"), "chutes-gpt-4o");
    }

    #[test]
    fn chutes_advertises_bare_and_prefixed_ids() {
        let chutes = OpenAICompatExecutor::chutes();
        let auth = Auth::new("c", "chutes").with_attr("models", "gpt-4o, only-chutes-model");
        let ids: Vec<String> = chutes
            .default_models(&auth)
            .into_iter()
            .map(|model| model.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "gpt-4o",
                "chutes-gpt-4o",
                "only-chutes-model",
                "chutes-only-chutes-model",
            ]
        );
    }
}
