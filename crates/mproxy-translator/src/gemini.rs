//! Chat-completions ⇄ Gemini generateContent conversions.

use serde_json::{json, Map, Value};

use crate::sse::SseEvent;
use crate::{invalid, TranslateError};

/// Chat-completions request body → generateContent request body.
pub fn chat_request_to_gemini(req: &Value) -> Result<Value, TranslateError> {
    let obj = req
        .as_object()
        .ok_or_else(|| invalid("chat request must be a JSON object"))?;

    let mut system: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in obj
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user");
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match role {
            "system" | "developer" => {
                if !text.is_empty() {
                    system.push(json!({"text": text}));
                }
            }
            "assistant" => {
                let mut parts: Vec<Value> = Vec::new();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                for call in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let args = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                        .unwrap_or_else(|| json!({}));
                    parts.push(json!({"functionCall": {
                        "name": function.get("name").cloned().unwrap_or(Value::Null),
                        "args": args,
                    }}));
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
            "tool" => contents.push(json!({"role": "user", "parts": [{
                "functionResponse": {
                    "name": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "response": {"result": text},
                },
            }]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));
    if !system.is_empty() {
        out.insert("systemInstruction".to_string(), json!({"parts": system}));
    }

    let mut generation = Map::new();
    if let Some(temperature) = obj.get("temperature") {
        generation.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = obj.get("top_p") {
        generation.insert("topP".to_string(), top_p.clone());
    }
    if let Some(max_tokens) = obj
        .get("max_completion_tokens")
        .or_else(|| obj.get("max_tokens"))
    {
        generation.insert("maxOutputTokens".to_string(), max_tokens.clone());
    }
    if !generation.is_empty() {
        out.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": function.get("parameters").cloned().unwrap_or(Value::Null),
                }))
            })
            .collect();
        if !declarations.is_empty() {
            out.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
    }

    Ok(Value::Object(out))
}

/// Final generateContent response → chat completion object.
pub fn gemini_to_chat_completion(response: &Value, model: &str) -> Value {
    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .cloned()
        .unwrap_or(Value::Null);

    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for part in candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(value) = part.get("text").and_then(Value::as_str) {
            text.push_str(value);
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(json!({
                "id": format!("call_{}", tool_calls.len()),
                "type": "function",
                "function": {
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": call
                        .get("args")
                        .map(|args| args.to_string())
                        .unwrap_or_default(),
                },
            }));
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(text));
    let finish_reason = if tool_calls.is_empty() {
        map_finish_reason(candidate.get("finishReason").and_then(Value::as_str))
    } else {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
        "tool_calls"
    };

    let usage = response.get("usageMetadata").cloned().unwrap_or(Value::Null);
    json!({
        "id": response
            .get("responseId")
            .cloned()
            .unwrap_or_else(|| json!("chatcmpl-gemini")),
        "object": "chat.completion",
        "created": 0,
        "model": response
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(model),
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": usage.get("promptTokenCount").cloned().unwrap_or(json!(0)),
            "completion_tokens": usage.get("candidatesTokenCount").cloned().unwrap_or(json!(0)),
            "total_tokens": usage.get("totalTokenCount").cloned().unwrap_or(json!(0)),
        },
    })
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        _ => "stop",
    }
}

/// Rewrites a `streamGenerateContent?alt=sse` stream into chat chunks.
#[derive(Debug, Default)]
pub struct GeminiToChatState {
    model: String,
    started: bool,
    finished: bool,
}

impl GeminiToChatState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            started: false,
            finished: false,
        }
    }

    pub fn push(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(self.chunk(json!({"role": "assistant", "content": ""}), None, None));
        }

        let candidate = data
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .cloned()
            .unwrap_or(Value::Null);
        let mut text = String::new();
        for part in candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(value) = part.get("text").and_then(Value::as_str) {
                text.push_str(value);
            }
        }
        if !text.is_empty() {
            out.push(self.chunk(json!({"content": text}), None, None));
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            let usage = data.get("usageMetadata").map(|usage| {
                json!({
                    "prompt_tokens": usage.get("promptTokenCount").cloned().unwrap_or(json!(0)),
                    "completion_tokens": usage.get("candidatesTokenCount").cloned().unwrap_or(json!(0)),
                    "total_tokens": usage.get("totalTokenCount").cloned().unwrap_or(json!(0)),
                })
            });
            out.push(self.chunk(json!({}), Some(map_finish_reason(Some(reason))), usage));
            out.push(SseEvent::data("[DONE]"));
            self.finished = true;
        }
        Ok(out)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![SseEvent::data("[DONE]")]
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> SseEvent {
        let mut body = json!({
            "id": "chatcmpl-gemini",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason.map(Value::from).unwrap_or(Value::Null),
            }],
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        SseEvent::data(body.to_string())
    }
}
