//! Shared upstream plumbing: request send, failure classification, and the
//! SSE pump that feeds translated chunks to the HTTP layer.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use mproxy_provider_core::{
    ByteStream, ExecContext, ExecutorError, ExecutorResult, Headers,
};
use mproxy_translator::{SseEvent, SseStreamParser, StreamTranslator};

pub(crate) async fn send_request(
    ctx: &ExecContext,
    provider: &str,
    mut request: wreq::RequestBuilder,
    headers: &Headers,
    is_stream: bool,
    timeout: Option<Duration>,
) -> ExecutorResult<wreq::Response> {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(agent) = ctx.user_agent.as_deref() {
        request = request.header("user-agent", agent);
    }
    if let Some(timeout) = timeout {
        // Whole-request deadline; only safe because this path never streams.
        request = request.timeout(timeout);
    }

    let started = std::time::Instant::now();
    info!(
        event = "upstream_request",
        trace_id = %ctx.trace_id,
        provider = %provider,
        is_stream = is_stream
    );
    let response = request.send().await.map_err(|err| {
        warn!(
            event = "upstream_response",
            trace_id = %ctx.trace_id,
            provider = %provider,
            status = "error",
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err
        );
        ExecutorError::UpstreamTransient(err.to_string())
    })?;
    info!(
        event = "upstream_response",
        trace_id = %ctx.trace_id,
        provider = %provider,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        is_stream = is_stream
    );
    Ok(response)
}

/// Consumes a non-2xx response into the error taxonomy.
pub(crate) async fn fail_from_response(response: wreq::Response) -> ExecutorError {
    let status = response.status().as_u16();
    let headers = headers_from_response(&response);
    let body = response.bytes().await.unwrap_or_default();
    classify_failure(status, headers, body)
}

pub(crate) fn classify_failure(status: u16, headers: Headers, body: Bytes) -> ExecutorError {
    match status {
        401 | 403 => {
            ExecutorError::UpstreamAuthExpired(String::from_utf8_lossy(&body).into_owned())
        }
        status if status >= 500 => ExecutorError::UpstreamTransient(format!(
            "upstream {status}: {}",
            String::from_utf8_lossy(&body)
        )),
        status => ExecutorError::UpstreamClientError {
            status,
            headers,
            body,
        },
    }
}

pub(crate) fn headers_from_response(response: &wreq::Response) -> Headers {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Cooldown hint from a 429, per the upstream's Retry-After header.
pub fn retry_after_seconds(headers: &Headers) -> Option<u64> {
    let value = mproxy_provider_core::header_get(headers, "retry-after")?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now())
        .ok()
        .map(|duration| duration.as_secs())
}

/// Streams the upstream SSE body through a dialect translator into a channel
/// consumed by the HTTP layer. Chunks stay in strict arrival order.
pub(crate) fn spawn_sse_pump(
    response: wreq::Response,
    translator: StreamTranslator,
) -> ByteStream {
    let (tx, rx) = mpsc::channel::<ExecutorResult<Bytes>>(32);
    tokio::spawn(async move {
        let mut translator = translator;
        let mut parser = SseStreamParser::new();
        let mut upstream = response.bytes_stream();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.push(&chunk) {
                        if !forward_event(&tx, &mut translator, &event).await {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(ExecutorError::StreamAborted(err.to_string())))
                        .await;
                    return;
                }
            }
        }
        for event in parser.finish() {
            if !forward_event(&tx, &mut translator, &event).await {
                return;
            }
        }
        flush_translator(&tx, &mut translator).await;
    });
    rx
}

pub(crate) async fn forward_event(
    tx: &mpsc::Sender<ExecutorResult<Bytes>>,
    translator: &mut StreamTranslator,
    event: &SseEvent,
) -> bool {
    match translator.push(event) {
        Ok(events) => {
            for event in events {
                if tx.send(Ok(event.to_bytes())).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(err) => {
            let _ = tx.send(Err(ExecutorError::Translation(err))).await;
            false
        }
    }
}

pub(crate) async fn flush_translator(
    tx: &mpsc::Sender<ExecutorResult<Bytes>>,
    translator: &mut StreamTranslator,
) {
    match translator.finish() {
        Ok(events) => {
            for event in events {
                if tx.send(Ok(event.to_bytes())).await.is_err() {
                    return;
                }
            }
        }
        Err(err) => {
            let _ = tx.send(Err(ExecutorError::Translation(err))).await;
        }
    }
}

/// Drains a streaming response into its parsed SSE events (non-streaming
/// client paths against always-streaming upstreams).
pub(crate) async fn collect_sse_events(response: wreq::Response) -> ExecutorResult<Vec<SseEvent>> {
    let mut parser = SseStreamParser::new();
    let mut events = Vec::new();
    let mut upstream = response.bytes_stream();
    while let Some(chunk) = upstream.next().await {
        let chunk = chunk.map_err(|err| ExecutorError::UpstreamTransient(err.to_string()))?;
        events.extend(parser.push(&chunk));
    }
    events.extend(parser.finish());
    Ok(events)
}
