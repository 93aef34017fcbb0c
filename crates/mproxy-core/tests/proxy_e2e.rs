//! End-to-end request flow against an in-process upstream stub: dialect
//! handler → registry routing → auth selection → executor → SSE normalizer.

use axum::routing::post;
use mproxy_common::Config;
use mproxy_core::{api_router, Service};
use mproxy_provider_core::{Auth, ATTR_API_KEY, ATTR_BASE_URL};

async fn chat_stub() -> ([(&'static str, &'static str); 1], &'static str) {
    // Includes an empty-data block that the normalizer must suppress.
    (
        [("content-type", "text/event-stream")],
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hi\"},\"finish_reason\":null}]}\n\n\
         data: \n\n\
         data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
         data: [DONE]\n\n",
    )
}

async fn spawn_upstream() -> String {
    let app = axum::Router::new().route("/v1/chat/completions", post(chat_stub));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1")
}

async fn spawn_proxy(upstream_base: String) -> String {
    let config = Config {
        api_keys: vec!["sk-test".to_string()],
        ..Config::default()
    };
    let service = Service::new(config, None);
    let auth = Auth::new("openai-1", "openai")
        .with_attr(ATTR_API_KEY, "upstream-key")
        .with_attr(ATTR_BASE_URL, upstream_base)
        .with_attr("models", "gpt-4o");
    service.register_auth(auth).await.unwrap();

    let app = api_router(service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn streaming_chat_round_trip_produces_well_formed_sse() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(upstream).await;

    let client = wreq::Client::builder().build().unwrap();
    let response = client
        .post(format!("{proxy}/v1/chat/completions"))
        .header("authorization", "Bearer sk-test")
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"stream":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = response.text().await.unwrap();
    assert!(body.contains("\"content\":\"hi\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));
    // Well-formedness: no doubled blank lines, and the suppressed empty-data
    // block left no trace.
    assert!(!body.contains("\n\n\n"), "body: {body:?}");
    assert!(!body.contains("data: \n"));
}

#[tokio::test]
async fn non_streaming_chat_round_trip_returns_json() {
    let app = axum::Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                [("content-type", "application/json")],
                r#"{"id":"c2","object":"chat.completion","model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","content":"pong"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let json_upstream = format!("http://{}/v1", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let proxy = spawn_proxy(json_upstream).await;
    let client = wreq::Client::builder().build().unwrap();
    let response = client
        .post(format!("{proxy}/v1/chat/completions"))
        .header("authorization", "Bearer sk-test")
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"ping"}]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let proxy = spawn_proxy("http://127.0.0.1:9/v1".to_string()).await;
    let client = wreq::Client::builder().build().unwrap();
    let response = client
        .post(format!("{proxy}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4o","messages":[]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let proxy = spawn_proxy("http://127.0.0.1:9/v1".to_string()).await;
    let client = wreq::Client::builder().build().unwrap();
    let response = client
        .post(format!("{proxy}/v1/chat/completions"))
        .header("authorization", "Bearer sk-test")
        .header("content-type", "application/json")
        .body(r#"{"model":"made-up","messages":[]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn models_listing_reflects_the_registry() {
    let proxy = spawn_proxy("http://127.0.0.1:9/v1".to_string()).await;
    let client = wreq::Client::builder().build().unwrap();
    let response = client
        .get(format!("{proxy}/v1/models"))
        .header("authorization", "Bearer sk-test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-4o"));
}
