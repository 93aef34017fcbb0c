//! OpenAI chat-completions ⇄ responses-API conversions.

use serde_json::{json, Map, Value};

use crate::sse::SseEvent;
use crate::{invalid, TranslateError};

/// Chat-completions request body → responses-API request body.
pub fn chat_request_to_responses(req: &Value) -> Result<Value, TranslateError> {
    let obj = req
        .as_object()
        .ok_or_else(|| invalid("chat request must be a JSON object"))?;

    let mut out = Map::new();
    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("user");
            match role {
                "system" | "developer" => {
                    if let Some(text) = content_as_text(message.get("content")) {
                        instructions.push(text);
                    }
                }
                "tool" => {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                        "output": content_as_text(message.get("content")).unwrap_or_default(),
                    }));
                }
                _ => {
                    if role == "assistant" {
                        for call in message
                            .get("tool_calls")
                            .and_then(Value::as_array)
                            .into_iter()
                            .flatten()
                        {
                            let function = call.get("function").cloned().unwrap_or(Value::Null);
                            input.push(json!({
                                "type": "function_call",
                                "call_id": call.get("id").cloned().unwrap_or(Value::Null),
                                "name": function.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": function.get("arguments").cloned().unwrap_or(Value::Null),
                            }));
                        }
                    }
                    if let Some(parts) = content_as_parts(message.get("content"), role) {
                        input.push(json!({
                            "type": "message",
                            "role": role,
                            "content": parts,
                        }));
                    }
                }
            }
        }
    }

    if let Some(model) = obj.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    if !instructions.is_empty() {
        out.insert(
            "instructions".to_string(),
            Value::String(instructions.join("\n\n")),
        );
    }
    out.insert("input".to_string(), Value::Array(input));

    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "type": "function",
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": function.get("parameters").cloned().unwrap_or(Value::Null),
                }))
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".to_string(), Value::Array(converted));
        }
    }

    let max_tokens = obj
        .get("max_completion_tokens")
        .or_else(|| obj.get("max_tokens"));
    if let Some(max_tokens) = max_tokens {
        out.insert("max_output_tokens".to_string(), max_tokens.clone());
    }
    if let Some(effort) = obj.get("reasoning_effort") {
        out.insert("reasoning".to_string(), json!({ "effort": effort }));
    }
    for key in ["temperature", "top_p", "stream", "metadata", "tool_choice", "parallel_tool_calls"] {
        if let Some(value) = obj.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }

    Ok(Value::Object(out))
}

/// Responses-API request body → chat-completions request body.
pub fn responses_request_to_chat(req: &Value) -> Result<Value, TranslateError> {
    let obj = req
        .as_object()
        .ok_or_else(|| invalid("responses request must be a JSON object"))?;

    let mut messages: Vec<Value> = Vec::new();
    if let Some(instructions) = obj.get("instructions").and_then(Value::as_str) {
        if !instructions.is_empty() {
            messages.push(json!({"role": "system", "content": instructions}));
        }
    }

    match obj.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(Value::Array(items)) => {
            for item in items {
                let kind = item.get("type").and_then(Value::as_str).unwrap_or("message");
                match kind {
                    "message" => {
                        let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                        let text = item_text(item);
                        messages.push(json!({"role": role, "content": text}));
                    }
                    "function_call" => {
                        messages.push(json!({
                            "role": "assistant",
                            "content": Value::Null,
                            "tool_calls": [{
                                "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                                "type": "function",
                                "function": {
                                    "name": item.get("name").cloned().unwrap_or(Value::Null),
                                    "arguments": item.get("arguments").cloned().unwrap_or(Value::Null),
                                },
                            }],
                        }));
                    }
                    "function_call_output" => {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": item.get("call_id").cloned().unwrap_or(Value::Null),
                            "content": item.get("output").cloned().unwrap_or(Value::Null),
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut out = Map::new();
    if let Some(model) = obj.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    out.insert("messages".to_string(), Value::Array(messages));
    if let Some(max_output) = obj.get("max_output_tokens") {
        out.insert("max_tokens".to_string(), max_output.clone());
    }
    if let Some(effort) = obj.get("reasoning").and_then(|r| r.get("effort")) {
        out.insert("reasoning_effort".to_string(), effort.clone());
    }
    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .filter(|tool| tool.get("type").and_then(Value::as_str) == Some("function"))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("parameters").cloned().unwrap_or(Value::Null),
                    },
                })
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".to_string(), Value::Array(converted));
        }
    }
    for key in ["temperature", "top_p", "stream", "metadata"] {
        if let Some(value) = obj.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }

    Ok(Value::Object(out))
}

/// Final responses object → chat completion object.
pub fn responses_to_chat_completion(response: &Value) -> Value {
    let mut content = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for item in response
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => content.push_str(&item_text(item)),
            Some("function_call") => tool_calls.push(json!({
                "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": item.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": item.get("arguments").cloned().unwrap_or(Value::Null),
                },
            })),
            _ => {}
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(content));
    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
        "tool_calls"
    };

    json!({
        "id": response.get("id").cloned().unwrap_or_else(|| json!("chatcmpl-unknown")),
        "object": "chat.completion",
        "created": response.get("created_at").cloned().unwrap_or(json!(0)),
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
        }],
        "usage": usage_to_chat(response.get("usage")),
    })
}

/// Final chat completion object → responses object.
pub fn chat_completion_to_responses(response: &Value) -> Value {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut output = Vec::new();
    if !content.is_empty() {
        output.push(json!({
            "type": "message",
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": content}],
        }));
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        output.push(json!({
            "type": "function_call",
            "call_id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": function.get("name").cloned().unwrap_or(Value::Null),
            "arguments": function.get("arguments").cloned().unwrap_or(Value::Null),
            "status": "completed",
        }));
    }

    json!({
        "id": response.get("id").cloned().unwrap_or_else(|| json!("resp-unknown")),
        "object": "response",
        "created_at": response.get("created").cloned().unwrap_or(json!(0)),
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "status": "completed",
        "output": output,
        "usage": usage_to_responses(response.get("usage")),
    })
}

fn usage_to_chat(usage: Option<&Value>) -> Value {
    let usage = usage.cloned().unwrap_or(Value::Null);
    json!({
        "prompt_tokens": usage.get("input_tokens").cloned().unwrap_or(json!(0)),
        "completion_tokens": usage.get("output_tokens").cloned().unwrap_or(json!(0)),
        "total_tokens": usage.get("total_tokens").cloned().unwrap_or(json!(0)),
    })
}

fn usage_to_responses(usage: Option<&Value>) -> Value {
    let usage = usage.cloned().unwrap_or(Value::Null);
    json!({
        "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
        "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
        "total_tokens": usage.get("total_tokens").cloned().unwrap_or(json!(0)),
    })
}

/// Concatenated text from a message or output item's `content` list.
fn item_text(item: &Value) -> String {
    let mut text = String::new();
    match item.get("content") {
        Some(Value::String(value)) => text.push_str(value),
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("output_text") | Some("input_text") | Some("text") => {
                        if let Some(value) = part.get("text").and_then(Value::as_str) {
                            text.push_str(value);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    text
}

fn content_as_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            Some(out)
        }
        _ => None,
    }
}

fn content_as_parts(content: Option<&Value>, role: &str) -> Option<Vec<Value>> {
    let text_type = if role == "assistant" {
        "output_text"
    } else {
        "input_text"
    };
    match content? {
        Value::String(text) => Some(vec![json!({"type": text_type, "text": text})]),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => out.push(json!({
                        "type": text_type,
                        "text": part.get("text").cloned().unwrap_or(Value::Null),
                    })),
                    Some("image_url") => out.push(json!({
                        "type": "input_image",
                        "image_url": part
                            .get("image_url")
                            .and_then(|image| image.get("url"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    })),
                    _ => {}
                }
            }
            (!out.is_empty()).then_some(out)
        }
        _ => None,
    }
}

/// Rewrites a responses-API event stream into chat-completion chunks.
#[derive(Debug, Default)]
pub struct ResponsesToChatState {
    id: String,
    model: String,
    created: i64,
    tool_index: i64,
    finished: bool,
}

impl ResponsesToChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => return Ok(Vec::new()),
        };
        let kind = event
            .event
            .clone()
            .or_else(|| data.get("type").and_then(Value::as_str).map(String::from))
            .unwrap_or_default();

        let mut out = Vec::new();
        match kind.as_str() {
            "response.created" => {
                let response = data.get("response").cloned().unwrap_or(Value::Null);
                self.id = response
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("resp-stream")
                    .to_string();
                self.model = response
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.created = response
                    .get("created_at")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                out.push(self.chunk(json!({"role": "assistant", "content": ""}), None, None));
            }
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    out.push(self.chunk(json!({"content": delta}), None, None));
                }
            }
            "response.output_item.added" => {
                let item = data.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let index = self.tool_index;
                    self.tool_index += 1;
                    out.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": index,
                            "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": item.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": "",
                            },
                        }]}),
                        None,
                        None,
                    ));
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    let index = (self.tool_index - 1).max(0);
                    out.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": index,
                            "function": {"arguments": delta},
                        }]}),
                        None,
                        None,
                    ));
                }
            }
            "response.completed" => {
                let response = data.get("response").cloned().unwrap_or(Value::Null);
                let finish_reason = if self.tool_index > 0 { "tool_calls" } else { "stop" };
                out.push(self.chunk(
                    json!({}),
                    Some(finish_reason),
                    Some(usage_to_chat(response.get("usage"))),
                ));
                out.push(SseEvent::data("[DONE]"));
                self.finished = true;
            }
            "response.failed" | "error" => {
                out.push(SseEvent::data(
                    json!({"error": data.get("error").cloned().unwrap_or(data.clone())}).to_string(),
                ));
                out.push(SseEvent::data("[DONE]"));
                self.finished = true;
            }
            _ => {}
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
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
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

/// Rewrites a chat-completion chunk stream into responses-API events.
#[derive(Debug, Default)]
pub struct ChatToResponsesState {
    id: String,
    model: String,
    created: i64,
    text: String,
    usage: Option<Value>,
    started: bool,
    finished: bool,
}

impl ChatToResponsesState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        if event.is_done_sentinel() {
            return Ok(self.finish());
        }
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            self.id = data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("resp-stream")
                .to_string();
            self.model = data
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.created = data.get("created").and_then(Value::as_i64).unwrap_or_default();
            out.push(SseEvent::named(
                "response.created",
                json!({"type": "response.created", "response": self.partial("in_progress")})
                    .to_string(),
            ));
        }
        if let Some(usage) = data.get("usage").filter(|usage| !usage.is_null()) {
            self.usage = Some(usage.clone());
        }

        let choice = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(delta) = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            if !delta.is_empty() {
                self.text.push_str(delta);
                out.push(SseEvent::named(
                    "response.output_text.delta",
                    json!({"type": "response.output_text.delta", "delta": delta}).to_string(),
                ));
            }
        }
        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            out.extend(self.complete());
        }
        Ok(out)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        self.complete()
    }

    fn complete(&mut self) -> Vec<SseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut response = self.partial("completed");
        response["output"] = json!([{
            "type": "message",
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": self.text}],
        }]);
        if let Some(usage) = &self.usage {
            response["usage"] = usage_to_responses(Some(usage));
        }
        vec![SseEvent::named(
            "response.completed",
            json!({"type": "response.completed", "response": response}).to_string(),
        )]
    }

    fn partial(&self, status: &str) -> Value {
        json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created,
            "model": self.model,
            "status": status,
            "output": [],
        })
    }
}
