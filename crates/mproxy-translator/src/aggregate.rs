//! Folds a streamed upstream response into a single non-streaming body, for
//! clients that asked `stream=false` against an upstream that always streams.

use serde_json::{json, Map, Value};

use crate::sse::SseEvent;
use crate::{invalid, TranslateError};

/// Responses-API stream → final response object.
///
/// The terminal `response.completed` event carries the authoritative object;
/// everything else is only consulted when the stream dies early.
pub fn fold_responses_stream(events: &[SseEvent]) -> Result<Value, TranslateError> {
    let mut fallback_text = String::new();
    for event in events {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        let kind = event
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default();
        match kind {
            "response.completed" => {
                if let Some(response) = data.get("response") {
                    return Ok(response.clone());
                }
            }
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    fallback_text.push_str(delta);
                }
            }
            "response.failed" | "error" => {
                return Err(invalid(format!("upstream stream failed: {data}")));
            }
            _ => {}
        }
    }
    if fallback_text.is_empty() {
        return Err(invalid("stream ended without a completed response"));
    }
    Ok(json!({
        "object": "response",
        "status": "incomplete",
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": fallback_text}],
        }],
    }))
}

/// Chat-completion chunk stream → final chat completion object.
pub fn fold_chat_stream(events: &[SseEvent]) -> Result<Value, TranslateError> {
    let mut id = Value::Null;
    let mut model = Value::Null;
    let mut created = Value::Null;
    let mut content = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut finish_reason = Value::Null;
    let mut usage = Value::Null;
    let mut saw_chunk = false;

    for event in events {
        if event.is_done_sentinel() {
            break;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            continue;
        };
        saw_chunk = true;
        if id.is_null() {
            id = data.get("id").cloned().unwrap_or(Value::Null);
            model = data.get("model").cloned().unwrap_or(Value::Null);
            created = data.get("created").cloned().unwrap_or(Value::Null);
        }
        if let Some(value) = data.get("usage").filter(|value| !value.is_null()) {
            usage = value.clone();
        }
        let Some(choice) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").filter(|value| !value.is_null()) {
            finish_reason = reason.clone();
        }
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            content.push_str(text);
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            merge_tool_call(&mut tool_calls, call);
        }
    }

    if !saw_chunk {
        return Err(invalid("stream contained no chat chunks"));
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(content));
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Ok(json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": if finish_reason.is_null() { json!("stop") } else { finish_reason },
        }],
        "usage": usage,
    }))
}

fn merge_tool_call(tool_calls: &mut Vec<Value>, delta: &Value) {
    let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
    while tool_calls.len() <= index {
        tool_calls.push(json!({
            "id": Value::Null,
            "type": "function",
            "function": {"name": Value::Null, "arguments": ""},
        }));
    }
    let slot = &mut tool_calls[index];
    if let Some(id) = delta.get("id").filter(|value| !value.is_null()) {
        slot["id"] = id.clone();
    }
    if let Some(function) = delta.get("function") {
        if let Some(name) = function.get("name").filter(|value| !value.is_null()) {
            slot["function"]["name"] = name.clone();
        }
        if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
            let existing = slot["function"]["arguments"].as_str().unwrap_or_default();
            slot["function"]["arguments"] = json!(format!("{existing}{arguments}"));
        }
    }
}
