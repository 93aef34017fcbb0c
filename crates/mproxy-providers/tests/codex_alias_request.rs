//! End-to-end codex executor test against an in-process upstream stub.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use mproxy_provider_core::{
    Auth, ExecContext, ExecuteOptions, ProviderExecutor, ProxyRequest, ResponseBody,
    ATTR_API_KEY, ATTR_BASE_URL,
};
use mproxy_providers::codex::CodexExecutor;
use mproxy_translator::Format;

#[derive(Clone)]
struct Captured {
    tx: mpsc::Sender<(HeaderMap, Bytes)>,
}

async fn responses_handler(
    State(captured): State<Captured>,
    headers: HeaderMap,
    body: Bytes,
) -> ([(&'static str, &'static str); 1], String) {
    captured.tx.send((headers, body)).await.unwrap();
    let completed = serde_json::json!({
        "type": "response.completed",
        "response": {
            "id": "r1",
            "model": "gpt-5.1-codex-max",
            "output": [],
            "usage": {"input_tokens": 1, "output_tokens": 1, "total_tokens": 2},
        },
    });
    (
        [("content-type", "text/event-stream")],
        format!("event: response.completed\ndata: {completed}\n\n"),
    )
}

async fn spawn_upstream() -> (String, mpsc::Receiver<(HeaderMap, Bytes)>) {
    let (tx, rx) = mpsc::channel(1);
    let app = axum::Router::new()
        .route("/responses", post(responses_handler))
        .with_state(Captured { tx });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rx)
}

#[tokio::test]
async fn alias_sets_model_and_reasoning_effort_in_upstream_request() {
    let (base_url, mut captured) = spawn_upstream().await;

    let executor = CodexExecutor::new();
    let ctx = ExecContext::new(Arc::new(mproxy_common::Config::default()));
    let auth = Auth::new("codex-auth-1", "codex")
        .with_attr(ATTR_API_KEY, "test")
        .with_attr(ATTR_BASE_URL, base_url);

    let req = ProxyRequest {
        model: "gpt-5.1-codex-max-xhigh".to_string(),
        payload: Bytes::from_static(br#"{"input":[]}"#),
        source_format: Format::Codex,
        stream: false,
    };
    let response = executor
        .execute(&ctx, &auth, req, ExecuteOptions::default())
        .await
        .expect("execute");

    let (headers, upstream_body) = captured.try_recv().expect("upstream request captured");
    let body: Value = serde_json::from_slice(&upstream_body).unwrap();
    assert_eq!(body["model"], "gpt-5.1-codex-max");
    assert_eq!(body["reasoning"]["effort"], "xhigh");
    // The upstream is always driven in streaming mode, whatever the client asked.
    assert_eq!(body["stream"], true);
    assert_eq!(body["store"], false);

    let cache_key = body["prompt_cache_key"].as_str().expect("cache key set");
    assert_eq!(
        headers.get("session_id").and_then(|v| v.to_str().ok()),
        Some(cache_key)
    );
    assert_eq!(
        headers.get("conversation_id").and_then(|v| v.to_str().ok()),
        Some(cache_key)
    );

    // The folded response comes back in the client's (codex) dialect.
    match response.body {
        ResponseBody::Bytes(bytes) => {
            let value: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["id"], "r1");
            assert_eq!(value["usage"]["total_tokens"], 2);
        }
        ResponseBody::Stream(_) => panic!("expected a buffered response for stream=false"),
    }
}

#[tokio::test]
async fn streaming_request_translates_to_chat_chunks() {
    let (base_url, mut captured) = spawn_upstream().await;

    let executor = CodexExecutor::new();
    let ctx = ExecContext::new(Arc::new(mproxy_common::Config::default()));
    let auth = Auth::new("codex-auth-2", "codex")
        .with_attr(ATTR_API_KEY, "test")
        .with_attr(ATTR_BASE_URL, base_url);

    let req = ProxyRequest {
        model: "gpt-5".to_string(),
        payload: Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi"}]}"#),
        source_format: Format::OpenAI,
        stream: true,
    };
    let response = executor
        .execute(&ctx, &auth, req, ExecuteOptions::default())
        .await
        .expect("execute");
    let _ = captured.try_recv().expect("upstream request captured");

    let ResponseBody::Stream(mut rx) = response.body else {
        panic!("expected a streaming body");
    };
    let mut collected = Vec::new();
    while let Some(chunk) = rx.recv().await {
        collected.extend_from_slice(&chunk.expect("stream chunk"));
    }
    let text = String::from_utf8(collected).unwrap();
    // Chat-completions framing: data-only chunks with the DONE sentinel.
    assert!(text.contains("chat.completion.chunk"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}
