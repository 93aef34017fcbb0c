//! Codex-family executor: OpenAI responses API upstream.
//!
//! Model aliases of the form `<base>-<effort>` resolve into a base model plus
//! `reasoning.effort`; the upstream is always driven in streaming mode
//! regardless of what the client asked for.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use mproxy_provider_core::{
    header_set, Auth, ExecContext, ExecuteOptions, ExecutorError, ExecutorResult, Headers,
    ModelInfo, ProviderExecutor, ProviderResponse, ProxyRequest, ATTR_ACCOUNT_ID, ATTR_API_KEY,
    ATTR_BASE_URL,
};
use mproxy_translator::{aggregate, translate_response_value, Format, StreamTranslator};

use crate::http_client;
use crate::upstream;

const PROVIDER_NAME: &str = "codex";
const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";

/// Bases the alias resolver recognizes. Order does not matter: the resolver
/// splits on the final dash, so the longest base wins by construction.
const RECOGNIZED_BASES: &[&str] = &[
    "gpt-5",
    "gpt-5-codex",
    "gpt-5-codex-mini",
    "gpt-5.1",
    "gpt-5.1-codex",
    "gpt-5.1-codex-max",
    "gpt-5.1-codex-mini",
    "gpt-5.2",
    "gpt-5.2-codex",
    "gpt-5.3-codex-spark",
];

const RECOGNIZED_EFFORTS: &[&str] = &["none", "minimal", "low", "medium", "high", "xhigh"];

/// Splits `<base>-<effort>` aliases. A bare base name is not an alias.
pub fn resolve_codex_alias(name: &str) -> Option<(&str, &str)> {
    let name = name.trim();
    let (base, effort) = name.rsplit_once('-')?;
    if !RECOGNIZED_EFFORTS.contains(&effort) {
        return None;
    }
    if !RECOGNIZED_BASES.contains(&base) {
        return None;
    }
    Some((base, effort))
}

/// Overwrites `model` and, when non-empty, `reasoning.effort` (trimmed,
/// lowercased) on the upstream payload.
pub fn set_reasoning_effort_by_alias(payload: &mut Value, base_model: &str, effort: &str) {
    payload["model"] = json!(base_model);
    let effort = effort.trim().to_ascii_lowercase();
    if effort.is_empty() {
        return;
    }
    match payload.get_mut("reasoning") {
        Some(Value::Object(reasoning)) => {
            reasoning.insert("effort".to_string(), json!(effort));
        }
        _ => {
            payload["reasoning"] = json!({ "effort": effort });
        }
    }
}

/// Stable prompt-cache key; identical inputs yield identical keys across
/// process restarts.
pub fn prompt_cache_key(model: &str, user_id: &str) -> String {
    format!("{model}-{user_id}")
}

fn user_id_from_payload(payload: &Value, ctx: &ExecContext) -> String {
    payload
        .get("metadata")
        .and_then(|metadata| metadata.get("user_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string())
}

#[derive(Debug, Default)]
pub struct CodexExecutor;

impl CodexExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(auth: &Auth) -> String {
        auth.attr(ATTR_BASE_URL)
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn bearer_token(auth: &Auth) -> ExecutorResult<&str> {
        auth.attr("access_token")
            .or_else(|| auth.attr(ATTR_API_KEY))
            .ok_or(ExecutorError::MissingAuthAttribute(ATTR_API_KEY))
    }

    /// Builds the upstream body and the session headers for one request.
    fn shape_request(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        req: &ProxyRequest,
    ) -> ExecutorResult<(Value, Headers)> {
        let payload: Value = serde_json::from_slice(&req.payload)
            .map_err(|err| ExecutorError::Translation(
                mproxy_translator::TranslateError::InvalidPayload(err.to_string()),
            ))?;
        let mut body =
            mproxy_translator::translate_request_value(&payload, req.source_format, Format::Codex)?;

        match resolve_codex_alias(&req.model) {
            Some((base, effort)) => set_reasoning_effort_by_alias(&mut body, base, effort),
            None => {
                body["model"] = json!(req.model);
            }
        }
        // The codex upstream only speaks SSE; the client's non-streaming wish
        // is honored by folding the stream afterwards.
        body["stream"] = json!(true);
        // Responses must stay non-persistent, and the upstream rejects both
        // max_output_tokens and stream_options.
        body["store"] = json!(false);
        if let Some(obj) = body.as_object_mut() {
            obj.remove("max_output_tokens");
            obj.remove("stream_options");
        }

        let cache_key = prompt_cache_key(&req.model, &user_id_from_payload(&payload, ctx));
        body["prompt_cache_key"] = json!(cache_key);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", format!("Bearer {}", Self::bearer_token(auth)?));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Accept", "text/event-stream");
        header_set(&mut headers, "Session_id", cache_key.clone());
        header_set(&mut headers, "Conversation_id", cache_key);
        if let Some(account_id) = auth.attr(ATTR_ACCOUNT_ID) {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        Ok((body, headers))
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
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
        let (body, headers) = self.shape_request(ctx, auth, &req)?;
        let url = format!("{}/responses", Self::base_url(auth));
        let client = http_client::client_for(&ctx.config, Some(auth), PROVIDER_NAME, &url, None)?;

        let body_bytes = serde_json::to_vec(&body)
            .map_err(|err| ExecutorError::other(format!("encode upstream body: {err}")))?;
        let timeout = (!req.stream).then_some(opts.timeout).flatten();
        let response = upstream::send_request(
            ctx,
            PROVIDER_NAME,
            client.post(&url).body(body_bytes),
            &headers,
            true,
            timeout,
        )
        .await?;
        if !response.status().is_success() {
            return Err(upstream::fail_from_response(response).await);
        }

        if req.stream {
            let translator = StreamTranslator::new(Format::Codex, req.source_format, &req.model)?;
            Ok(ProviderResponse::stream(upstream::spawn_sse_pump(
                response, translator,
            )))
        } else {
            let events = upstream::collect_sse_events(response).await?;
            let folded = aggregate::fold_responses_stream(&events)?;
            let translated =
                translate_response_value(&folded, Format::Codex, req.source_format)?;
            let bytes = serde_json::to_vec(&translated)
                .map_err(|err| ExecutorError::other(format!("encode response: {err}")))?;
            Ok(ProviderResponse::json(Bytes::from(bytes)))
        }
    }

    async fn refresh(&self, ctx: &ExecContext, auth: &Auth) -> ExecutorResult<Auth> {
        let Some(refresh_token) = auth.attr("refresh_token") else {
            // API-key auths have nothing to refresh.
            return Ok(auth.clone());
        };
        let client = http_client::client_for(
            &ctx.config,
            Some(auth),
            PROVIDER_NAME,
            "https://auth.openai.com/oauth/token",
            None,
        )?;
        let body = json!({
            "grant_type": "refresh_token",
            "client_id": auth.attr("client_id").unwrap_or_default(),
            "refresh_token": refresh_token,
        });
        let response = client
            .post("https://auth.openai.com/oauth/token")
            .header("content-type", "application/json")
            .body(body.to_string())
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
        if let Some(access_token) = token.get("access_token").and_then(Value::as_str) {
            refreshed.set_attr("access_token", access_token);
        }
        if let Some(new_refresh) = token.get("refresh_token").and_then(Value::as_str) {
            refreshed.set_attr("refresh_token", new_refresh);
        }
        if let Some(expires_in) = token.get("expires_in").and_then(Value::as_i64) {
            let expires_at = time::OffsetDateTime::now_utc() + time::Duration::seconds(expires_in);
            if let Ok(stamp) = expires_at.format(&time::format_description::well_known::Rfc3339) {
                refreshed.set_attr(mproxy_provider_core::ATTR_EXPIRES_AT, stamp);
            }
        }
        Ok(refreshed)
    }

    fn default_models(&self, _auth: &Auth) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        for base in RECOGNIZED_BASES {
            models.push(ModelInfo::new(*base).owned_by("openai"));
            for effort in RECOGNIZED_EFFORTS {
                models.push(ModelInfo::new(format!("{base}-{effort}")).owned_by("openai"));
            }
        }
        models
    }
}
