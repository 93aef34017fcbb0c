//! Out-of-process HTTP transport backed by a headless Electron helper.
//!
//! The copilot upstream fingerprints TLS/HTTP stacks; a chromium network
//! stack passes where a native client does not. Each request is proxied
//! through a short-lived helper process speaking line-delimited JSON on
//! stdio: one request line in, then `meta`, zero or more `chunk` lines, and
//! `end` (or `error` at any point) out.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mproxy_common::env_truthy;
use mproxy_provider_core::{Headers, ExecutorError, ExecutorResult};

use crate::no_proxy;

static SHIM_JS: &[u8] = include_bytes!("../assets/electron_shim.js");
static SHIM_FILE: OnceLock<Result<PathBuf, String>> = OnceLock::new();

const SHIM_FILE_NAME: &str = "mproxy_copilot_electron_shim.js";

#[derive(Debug, Serialize)]
struct ShimRequest {
    method: String,
    url: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    body_b64: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    proxy_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    no_proxy: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ShimMessage {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, rename = "statusText")]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub b64: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub attempt: i64,
    #[serde(default, rename = "maxAttempts")]
    pub max_attempts: i64,
    #[serde(default, rename = "resolvedProxy")]
    pub resolved_proxy: String,
    #[serde(default, rename = "urlHost")]
    pub url_host: String,
    #[serde(default, rename = "tHeadersMs")]
    pub t_headers_ms: i64,
    #[serde(default, rename = "bytesReceived")]
    pub bytes_received: i64,
    #[serde(default, rename = "chunksEmitted")]
    pub chunks_emitted: i64,
    #[serde(default, rename = "idleMsSinceLastByte")]
    pub idle_ms: i64,
    #[serde(default, rename = "elapsedMs")]
    pub elapsed_ms: i64,
    #[serde(default)]
    pub electron: String,
    #[serde(default)]
    pub chromium: String,
    #[serde(default)]
    pub node: String,
}

pub struct ElectronResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    /// Closing this receiver kills and reaps the helper process.
    pub body: mpsc::Receiver<io::Result<Bytes>>,
}

/// Whether `COPILOT_TRANSPORT` asks for the subprocess transport.
/// Unset (and unknown values) prefer the subprocess with native fallback.
pub fn prefer_electron_transport() -> bool {
    let raw = std::env::var("COPILOT_TRANSPORT").unwrap_or_default();
    match raw.trim().to_ascii_lowercase().as_str() {
        "go" | "native" | "nethttp" | "http" => false,
        _ => true,
    }
}

fn find_electron_binary() -> Option<PathBuf> {
    for key in ["ELECTRON_PATH", "COPILOT_ELECTRON_PATH"] {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
    }
    lookup_in_path("electron")
}

fn lookup_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn shim_file() -> ExecutorResult<PathBuf> {
    let entry = SHIM_FILE.get_or_init(|| {
        let path = std::env::temp_dir().join(SHIM_FILE_NAME);
        // Rewrite unconditionally; the file is tiny and this avoids drift
        // across upgrades.
        std::fs::write(&path, SHIM_JS)
            .map(|_| path)
            .map_err(|err| format!("write electron shim: {err}"))
    });
    entry
        .clone()
        .map_err(ExecutorError::SubprocessUnavailable)
}

pub(crate) fn command_args(shim_path: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--headless=new".to_string(),
        "--disable-software-rasterizer".to_string(),
        "--disable-dev-shm-usage".to_string(),
    ];
    if env_flag("COPILOT_ELECTRON_DISABLE_HTTP2", true) {
        args.push("--disable-http2".to_string());
    }
    if env_flag("COPILOT_ELECTRON_FORCE_DIRECT", false) {
        args.push("--no-proxy-server".to_string());
    }
    if let Ok(netlog) = std::env::var("COPILOT_ELECTRON_NETLOG_PATH") {
        if !netlog.trim().is_empty() {
            args.push(format!("--log-net-log={}", netlog.trim()));
        }
    }
    args.push(shim_path.to_string_lossy().into_owned());
    args
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => env_truthy(&raw),
        _ => default,
    }
}

pub(crate) fn format_telemetry(msg: &ShimMessage) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !msg.message.trim().is_empty() {
        parts.push(format!("message={}", msg.message.trim()));
    }
    if !msg.phase.trim().is_empty() {
        parts.push(format!("phase={}", msg.phase.trim()));
    }
    if msg.attempt > 0 {
        if msg.max_attempts > 0 {
            parts.push(format!("attempt={}/{}", msg.attempt, msg.max_attempts));
        } else {
            parts.push(format!("attempt={}", msg.attempt));
        }
    }
    if !msg.resolved_proxy.trim().is_empty() {
        parts.push(format!("resolved_proxy={}", msg.resolved_proxy.trim()));
    }
    if !msg.url_host.trim().is_empty() {
        parts.push(format!("url_host={}", msg.url_host.trim()));
    }
    if msg.bytes_received > 0 {
        parts.push(format!("bytes={}", msg.bytes_received));
    }
    if msg.chunks_emitted > 0 {
        parts.push(format!("chunks={}", msg.chunks_emitted));
    }
    if msg.idle_ms > 0 {
        parts.push(format!("idle_ms={}", msg.idle_ms));
    }
    if msg.elapsed_ms > 0 {
        parts.push(format!("elapsed_ms={}", msg.elapsed_ms));
    }
    parts.join(" ")
}

/// Issues one HTTP request through the helper and returns a streaming
/// response. The helper is killed when the body receiver is dropped.
pub async fn fetch(
    method: &str,
    url: &str,
    headers: &Headers,
    body: Option<Bytes>,
    proxy_url: Option<&str>,
) -> ExecutorResult<ElectronResponse> {
    let electron = find_electron_binary().ok_or_else(|| {
        ExecutorError::SubprocessUnavailable("electron binary not found".to_string())
    })?;
    let shim = shim_file()?;

    let mut header_map = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        header_map.insert(name.clone(), value.clone());
    }
    let request = ShimRequest {
        method: method.to_string(),
        url: url.to_string(),
        headers: header_map,
        body_b64: body
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(&bytes))
            .unwrap_or_default(),
        proxy_url: proxy_url.unwrap_or_default().trim().to_string(),
        no_proxy: no_proxy::no_proxy_patterns().join(","),
    };
    let mut line = serde_json::to_vec(&request)
        .map_err(|err| ExecutorError::other(format!("encode shim request: {err}")))?;
    line.push(b'\n');

    let mut child = Command::new(&electron)
        .args(command_args(&shim))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            ExecutorError::SubprocessUnavailable(format!("spawn electron: {err}"))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExecutorError::other("electron transport: stdin unavailable"))?;
    stdin
        .write_all(&line)
        .await
        .map_err(|err| ExecutorError::other(format!("electron transport: write stdin: {err}")))?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::other("electron transport: stdout unavailable"))?;
    let mut reader = BufReader::new(stdout);

    let mut meta_line = String::new();
    let read = reader
        .read_line(&mut meta_line)
        .await
        .map_err(|err| ExecutorError::other(format!("electron transport: read meta: {err}")))?;
    if read == 0 {
        let _ = child.wait().await;
        return Err(ExecutorError::SubprocessUnavailable(
            "electron transport: no response before EOF".to_string(),
        ));
    }
    let meta: ShimMessage = serde_json::from_str(meta_line.trim()).map_err(|err| {
        ExecutorError::other(format!("electron transport: parse meta: {err}"))
    })?;
    match meta.r#type.as_str() {
        "meta" => {}
        "error" => {
            let _ = child.wait().await;
            let detail = format_telemetry(&meta);
            return Err(ExecutorError::UpstreamTransient(if detail.is_empty() {
                "electron transport: upstream error".to_string()
            } else {
                format!("electron transport: upstream error: {detail}")
            }));
        }
        other => {
            let _ = child.wait().await;
            return Err(ExecutorError::other(format!(
                "electron transport: unexpected first message type {other:?}"
            )));
        }
    }
    debug!(
        status = meta.status,
        proxy = %meta.resolved_proxy,
        host = %meta.url_host,
        attempt = meta.attempt,
        max_attempts = meta.max_attempts,
        t_headers_ms = meta.t_headers_ms,
        electron = %meta.electron,
        chromium = %meta.chromium,
        node = %meta.node,
        "copilot electron transport: headers received"
    );

    let response_headers: Headers = meta
        .headers
        .iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
    tokio::spawn(pump_chunks(reader, child, tx));

    Ok(ElectronResponse {
        status: meta.status,
        status_text: meta.status_text,
        headers: response_headers,
        body: rx,
    })
}

async fn pump_chunks(
    mut reader: BufReader<tokio::process::ChildStdout>,
    mut child: Child,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = match reader.read_line(&mut line).await {
            Ok(read) => read,
            Err(err) => {
                let _ = tx
                    .send(Err(io::Error::other(format!(
                        "electron transport: read chunk: {err}"
                    ))))
                    .await;
                break;
            }
        };
        if read == 0 {
            let _ = tx
                .send(Err(io::Error::other(
                    "electron transport: unexpected EOF before end marker",
                )))
                .await;
            break;
        }
        let msg: ShimMessage = match serde_json::from_str(line.trim()) {
            Ok(msg) => msg,
            Err(err) => {
                let _ = tx
                    .send(Err(io::Error::other(format!(
                        "electron transport: parse chunk: {err}"
                    ))))
                    .await;
                break;
            }
        };
        match msg.r#type.as_str() {
            "chunk" => {
                if msg.b64.is_empty() {
                    continue;
                }
                let bytes = match base64::engine::general_purpose::STANDARD.decode(&msg.b64) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(err) => {
                        let _ = tx
                            .send(Err(io::Error::other(format!(
                                "electron transport: decode chunk: {err}"
                            ))))
                            .await;
                        break;
                    }
                };
                if tx.send(Ok(bytes)).await.is_err() {
                    // Receiver dropped: the response body was closed.
                    break;
                }
            }
            "end" => break,
            "error" => {
                let detail = format_telemetry(&msg);
                warn!(detail = %detail, "copilot electron transport: stream error");
                let _ = tx
                    .send(Err(io::Error::other(format!(
                        "electron transport: upstream error: {detail}"
                    ))))
                    .await;
                break;
            }
            other => {
                let _ = tx
                    .send(Err(io::Error::other(format!(
                        "electron transport: unexpected message type {other:?}"
                    ))))
                    .await;
                break;
            }
        }
    }
    // Reap in every exit path so no zombie survives a dropped body.
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn command_args_follow_env_knobs() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("COPILOT_ELECTRON_DISABLE_HTTP2");
        std::env::remove_var("COPILOT_ELECTRON_FORCE_DIRECT");
        std::env::remove_var("COPILOT_ELECTRON_NETLOG_PATH");

        let shim = std::path::Path::new("/tmp/shim.js");
        let args = command_args(shim);
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        // http2 is disabled by default for parity with the fingerprinted path.
        assert!(args.contains(&"--disable-http2".to_string()));
        assert!(!args.contains(&"--no-proxy-server".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/shim.js"));

        std::env::set_var("COPILOT_ELECTRON_DISABLE_HTTP2", "0");
        std::env::set_var("COPILOT_ELECTRON_FORCE_DIRECT", "1");
        std::env::set_var("COPILOT_ELECTRON_NETLOG_PATH", "/tmp/netlog.json");
        let args = command_args(shim);
        assert!(!args.contains(&"--disable-http2".to_string()));
        assert!(args.contains(&"--no-proxy-server".to_string()));
        assert!(args.contains(&"--log-net-log=/tmp/netlog.json".to_string()));

        std::env::remove_var("COPILOT_ELECTRON_DISABLE_HTTP2");
        std::env::remove_var("COPILOT_ELECTRON_FORCE_DIRECT");
        std::env::remove_var("COPILOT_ELECTRON_NETLOG_PATH");
    }

    #[test]
    fn transport_preference_parses_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        for (value, expected) in [
            ("", true),
            ("electron", true),
            ("auto", true),
            ("chromium", true),
            ("definitely-not-a-mode", true),
            ("go", false),
            ("native", false),
            ("NetHTTP", false),
            ("http", false),
        ] {
            if value.is_empty() {
                std::env::remove_var("COPILOT_TRANSPORT");
            } else {
                std::env::set_var("COPILOT_TRANSPORT", value);
            }
            assert_eq!(prefer_electron_transport(), expected, "value={value:?}");
        }
        std::env::remove_var("COPILOT_TRANSPORT");
    }

    #[test]
    fn telemetry_formatting_skips_empty_fields() {
        let msg = ShimMessage {
            r#type: "error".to_string(),
            message: "ERR_CONNECTION_RESET".to_string(),
            phase: "request".to_string(),
            attempt: 2,
            max_attempts: 2,
            resolved_proxy: "http://proxy.example:3128".to_string(),
            url_host: "api.githubcopilot.com".to_string(),
            bytes_received: 0,
            elapsed_ms: 1523,
            ..ShimMessage::default()
        };
        assert_eq!(
            format_telemetry(&msg),
            "message=ERR_CONNECTION_RESET phase=request attempt=2/2 \
             resolved_proxy=http://proxy.example:3128 url_host=api.githubcopilot.com elapsed_ms=1523"
        );
        assert_eq!(format_telemetry(&ShimMessage::default()), "");
    }

    #[test]
    fn shim_messages_parse_protocol_lines() {
        let meta: ShimMessage = serde_json::from_str(
            r#"{"type":"meta","status":200,"statusText":"OK","headers":{"content-type":"text/event-stream"},"attempt":1,"maxAttempts":2,"electron":"33.0.0","chromium":"130.0.0.0","node":"20.18.0"}"#,
        )
        .unwrap();
        assert_eq!(meta.r#type, "meta");
        assert_eq!(meta.status, 200);
        assert_eq!(meta.headers.get("content-type").map(String::as_str), Some("text/event-stream"));

        let chunk: ShimMessage =
            serde_json::from_str(r#"{"type":"chunk","b64":"aGVsbG8="}"#).unwrap();
        assert_eq!(chunk.r#type, "chunk");
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(&chunk.b64).unwrap(),
            b"hello"
        );

        let end: ShimMessage = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert_eq!(end.r#type, "end");
    }
}
