//! Assembles a streaming HTTP response: executor chunks run through the SSE
//! normalizer, with optional keep-alive heartbeats on downstream idle.

use std::io;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use mproxy_common::StreamingConfig;
use mproxy_provider_core::ByteStream;

use crate::sse::SseWriteState;

const KEEPALIVE_COMMENT: &[u8] = b": keep-alive\n\n";

pub fn sse_response(
    upstream: ByteStream,
    streaming: &StreamingConfig,
    trace_id: &str,
) -> Response<Body> {
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(normalized_stream(
        upstream,
        streaming.keepalive_seconds,
        trace_id.to_string(),
    ))));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if streaming.disable_proxy_buffering {
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }
    response
}

/// Copies upstream chunks through one `SseWriteState` per response, injecting
/// heartbeat comments when the stream sits idle. Heartbeats bypass the
/// normalizer: comment lines are not event data, and executor chunks are
/// whole blocks so the normalizer is at a boundary between sends.
fn normalized_stream(
    mut upstream: ByteStream,
    keepalive_seconds: u64,
    trace_id: String,
) -> mpsc::Receiver<Result<Bytes, io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(32);
    tokio::spawn(async move {
        let mut normalizer = SseWriteState::new();
        let mut heartbeat = (keepalive_seconds > 0)
            .then(|| tokio::time::interval(std::time::Duration::from_secs(keepalive_seconds)));
        if let Some(heartbeat) = heartbeat.as_mut() {
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval is immediate; skip it.
            heartbeat.tick().await;
        }

        loop {
            let chunk = match heartbeat.as_mut() {
                Some(heartbeat) => {
                    tokio::select! {
                        chunk = upstream.recv() => chunk,
                        _ = heartbeat.tick() => {
                            if tx.send(Ok(Bytes::from_static(KEEPALIVE_COMMENT))).await.is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                }
                None => upstream.recv().await,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    let out = normalizer.write_chunk(&bytes);
                    if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                    if let Some(heartbeat) = heartbeat.as_mut() {
                        heartbeat.reset();
                    }
                }
                Some(Err(err)) => {
                    // Committed stream: surface the failure and stop; the
                    // request must not be retried once bytes have flowed.
                    warn!(trace_id = %trace_id, error = %err, "upstream stream failed mid-response");
                    let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                    return;
                }
                None => {
                    let out = normalizer.write_done();
                    if !out.is_empty() {
                        let _ = tx.send(Ok(out)).await;
                    }
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_provider_core::ExecutorResult;

    async fn collect(rx: &mut mpsc::Receiver<Result<Bytes, io::Error>>) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(_) => break,
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn normalizes_executor_chunks() {
        let (tx, upstream) = mpsc::channel::<ExecutorResult<Bytes>>(8);
        tx.send(Ok(Bytes::from_static(b"event: x\ndata: {\"a\":1}\n\n")))
            .await
            .unwrap();
        tx.send(Ok(Bytes::from_static(b"data: \n\n"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"data: {\"b\":2}\n\n")))
            .await
            .unwrap();
        drop(tx);

        let mut rx = normalized_stream(upstream, 0, "t".to_string());
        let out = collect(&mut rx).await;
        assert_eq!(out, "event: x\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
    }

    #[tokio::test]
    async fn idle_stream_gets_heartbeats() {
        let (tx, upstream) = mpsc::channel::<ExecutorResult<Bytes>>(8);
        let mut rx = normalized_stream(upstream, 1, "t".to_string());

        // Nothing flows for over a second: a keep-alive comment appears.
        let first = tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
            .await
            .expect("heartbeat within budget")
            .expect("stream open")
            .unwrap();
        assert_eq!(&first[..], KEEPALIVE_COMMENT);

        tx.send(Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")))
            .await
            .unwrap();
        drop(tx);
        let rest = collect(&mut rx).await;
        assert!(rest.contains("data: {\"a\":1}\n\n"));
    }
}
