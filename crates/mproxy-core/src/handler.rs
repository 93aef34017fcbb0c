//! Public API handlers: one route per dialect, sharing a common pipeline of
//! authenticate → route by model → select auth → execute → respond.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use mproxy_provider_core::{
    ExecContext, ExecuteOptions, ExecutorError, Initiator, ProxyRequest,
};
use mproxy_translator::Format;

use crate::apikey;
use crate::error::{error_response, json_error};
use crate::service::Service;
use crate::stream::sse_response;

/// Per-request initiator override, honored by providers that meter
/// interactive and automated traffic differently.
const INITIATOR_OVERRIDE_HEADER: &str = "force-copilot-initiator";

/// Deadline for non-streaming calls. Streaming requests carry no whole-call
/// timeout; they rely on cancellation and the per-line idle budget.
const NON_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

pub async fn chat_completions(
    State(service): State<Arc<Service>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    handle_dialect(service, headers, body, Format::OpenAI).await
}

pub async fn messages(
    State(service): State<Arc<Service>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    handle_dialect(service, headers, body, Format::Claude).await
}

pub async fn responses(
    State(service): State<Arc<Service>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    handle_dialect(service, headers, body, Format::Codex).await
}

pub async fn list_models(
    State(service): State<Arc<Service>>,
    headers: HeaderMap,
) -> Response<Body> {
    let config = service.config();
    if apikey::authorize(&config, &headers).is_err() {
        return json_error(StatusCode::UNAUTHORIZED, "invalid api key", Format::OpenAI);
    }
    let data: Vec<Value> = service
        .registry
        .all_models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "created": model.created.unwrap_or(0),
                "owned_by": model.owned_by.unwrap_or_else(|| "mproxy".to_string()),
            })
        })
        .collect();
    let body = json!({"object": "list", "data": data}).to_string();
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn handle_dialect(
    service: Arc<Service>,
    headers: HeaderMap,
    body: Bytes,
    dialect: Format,
) -> Response<Body> {
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();
    let config = service.config();

    if apikey::authorize(&config, &headers).is_err() {
        return json_error(StatusCode::UNAUTHORIZED, "invalid api key", dialect);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
                dialect,
            )
        }
    };
    let Some(model) = payload.get("model").and_then(Value::as_str).map(str::to_string) else {
        return json_error(StatusCode::BAD_REQUEST, "missing model", dialect);
    };
    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);

    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        dialect = %dialect,
        model = %model,
        is_stream = stream
    );

    let Some(provider) = route_model(&service, &model) else {
        return json_error(
            StatusCode::NOT_FOUND,
            &format!("model {model:?} is not available"),
            dialect,
        );
    };
    let auth = match service.manager.select_for(&provider, &model).await {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, dialect),
    };
    let Some(executor) = service.executor_for(&provider) else {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("no executor for provider {provider:?}"),
            dialect,
        );
    };

    let ctx = ExecContext {
        trace_id: trace_id.clone(),
        user_id: user_id_from_payload(&payload),
        user_agent: headers
            .get("user-agent")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        initiator: headers
            .get(INITIATOR_OVERRIDE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(Initiator::parse),
        config: config.clone(),
    };
    let req = ProxyRequest {
        model: model.clone(),
        payload: body,
        source_format: dialect,
        stream,
    };
    let opts = ExecuteOptions {
        timeout: (!stream).then_some(NON_STREAM_TIMEOUT),
    };

    let mut result = executor.execute(&ctx, &auth, req.clone(), opts.clone()).await;
    if matches!(result, Err(ExecutorError::UpstreamAuthExpired(_))) {
        // Refresh the selected identity once, then retry once. No payload
        // byte has been sent at this point, so the retry is safe.
        warn!(trace_id = %trace_id, auth_id = %auth.id, "upstream auth expired, refreshing");
        match service.refresh_auth(&auth.id).await {
            Ok(refreshed) => {
                result = executor.execute(&ctx, &refreshed, req, opts).await;
            }
            Err(err) => {
                warn!(trace_id = %trace_id, auth_id = %auth.id, error = %err, "auth refresh failed");
            }
        }
    }

    match result {
        Ok(provider_response) => {
            info!(
                event = "downstream_responded",
                trace_id = %trace_id,
                provider = %provider,
                status = provider_response.status,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                is_stream = stream
            );
            match provider_response.body {
                mproxy_provider_core::ResponseBody::Bytes(bytes) => {
                    let mut response = Response::new(Body::from(bytes));
                    *response.status_mut() = StatusCode::from_u16(provider_response.status)
                        .unwrap_or(StatusCode::OK);
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    response
                }
                mproxy_provider_core::ResponseBody::Stream(body_stream) => {
                    sse_response(body_stream, &config.streaming, &trace_id)
                }
            }
        }
        Err(err) => {
            if let ExecutorError::UpstreamClientError {
                status: 429,
                headers: response_headers,
                ..
            } = &err
            {
                let seconds = mproxy_providers::retry_after_seconds(response_headers)
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_COOLDOWN);
                service
                    .manager
                    .mark_cooldown(&auth.id, SystemTime::now() + seconds)
                    .await;
            }
            warn!(
                event = "downstream_responded",
                trace_id = %trace_id,
                provider = %provider,
                error = %err,
                elapsed_ms = started_at.elapsed().as_millis() as u64
            );
            error_response(&err, dialect)
        }
    }
}

/// Picks the provider serving `model`. When several advertise it, prefer a
/// non-chutes provider; the fallback only serves what nobody else does.
fn route_model(service: &Service, model: &str) -> Option<String> {
    let clients = service.registry.clients_for_model(model);
    if clients.is_empty() {
        return None;
    }
    clients
        .iter()
        .map(|(_, provider)| provider)
        .find(|provider| !provider.eq_ignore_ascii_case("chutes"))
        .or_else(|| clients.first().map(|(_, provider)| provider))
        .cloned()
}

fn user_id_from_payload(payload: &Value) -> Option<String> {
    payload
        .get("metadata")
        .and_then(|metadata| metadata.get("user_id"))
        .and_then(Value::as_str)
        .or_else(|| payload.get("user").and_then(Value::as_str))
        .map(str::to_string)
}
