//! Claude messages ⇄ chat-completions / responses-API conversions.

use serde_json::{json, Map, Value};

use crate::chat_responses::{chat_request_to_responses, responses_request_to_chat};
use crate::sse::SseEvent;
use crate::{invalid, TranslateError};

/// Claude messages request body → chat-completions request body.
pub fn claude_request_to_chat(req: &Value) -> Result<Value, TranslateError> {
    let obj = req
        .as_object()
        .ok_or_else(|| invalid("claude request must be a JSON object"))?;

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = obj.get("system") {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

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
        match message.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(value) = block.get("text").and_then(Value::as_str) {
                                text.push_str(value);
                            }
                        }
                        Some("tool_use") => tool_calls.push(json!({
                            "id": block.get("id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": block
                                    .get("input")
                                    .map(|input| input.to_string())
                                    .unwrap_or_default(),
                            },
                        })),
                        Some("tool_result") => messages.push(json!({
                            "role": "tool",
                            "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                            "content": tool_result_text(block),
                        })),
                        _ => {}
                    }
                }
                if !text.is_empty() || !tool_calls.is_empty() {
                    let mut entry = Map::new();
                    entry.insert("role".to_string(), json!(role));
                    entry.insert(
                        "content".to_string(),
                        if text.is_empty() { Value::Null } else { json!(text) },
                    );
                    if !tool_calls.is_empty() {
                        entry.insert("tool_calls".to_string(), Value::Array(tool_calls));
                    }
                    messages.push(Value::Object(entry));
                }
            }
            _ => {}
        }
    }

    let mut out = Map::new();
    if let Some(model) = obj.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    out.insert("messages".to_string(), Value::Array(messages));
    if let Some(max_tokens) = obj.get("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(Value::Null),
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

/// Claude messages request body → responses-API request body.
///
/// Goes through the chat shape; the composition keeps each mapping small and
/// the behavior consistent between the two OpenAI dialects.
pub fn claude_request_to_responses(req: &Value) -> Result<Value, TranslateError> {
    let chat = claude_request_to_chat(req)?;
    chat_request_to_responses(&chat)
}

/// Chat-completions request body → Claude messages request body.
pub fn chat_request_to_claude(req: &Value) -> Result<Value, TranslateError> {
    let obj = req
        .as_object()
        .ok_or_else(|| invalid("chat request must be a JSON object"))?;

    let mut system: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
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
            .map(String::from)
            .unwrap_or_default();
        match role {
            "system" | "developer" => {
                if !text.is_empty() {
                    system.push(text);
                }
            }
            "tool" => messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "content": text,
                }],
            })),
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let function = call.get("function").cloned().unwrap_or(Value::Null);
                    let input = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                        .unwrap_or_else(|| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": function.get("name").cloned().unwrap_or(Value::Null),
                        "input": input,
                    }));
                }
                if !blocks.is_empty() {
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            _ => messages.push(json!({"role": "user", "content": text})),
        }
    }

    let mut out = Map::new();
    if let Some(model) = obj.get("model") {
        out.insert("model".to_string(), model.clone());
    }
    if !system.is_empty() {
        out.insert("system".to_string(), json!(system.join("\n\n")));
    }
    out.insert("messages".to_string(), Value::Array(messages));
    // Claude requires max_tokens; fall back to a generous ceiling.
    let max_tokens = obj
        .get("max_completion_tokens")
        .or_else(|| obj.get("max_tokens"))
        .cloned()
        .unwrap_or(json!(4096));
    out.insert("max_tokens".to_string(), max_tokens);
    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function.get("parameters").cloned().unwrap_or(Value::Null),
                }))
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

/// Responses-API request body → Claude messages request body.
pub fn responses_request_to_claude(req: &Value) -> Result<Value, TranslateError> {
    let chat = responses_request_to_chat(req)?;
    chat_request_to_claude(&chat)
}

/// Final chat completion object → Claude message object.
pub fn chat_completion_to_claude_message(response: &Value) -> Value {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    let mut has_tool_use = false;
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        has_tool_use = true;
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let input = function
            .get("arguments")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .unwrap_or_else(|| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": function.get("name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        _ if has_tool_use => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };
    let usage = response.get("usage").cloned().unwrap_or(Value::Null);

    json!({
        "id": response.get("id").cloned().unwrap_or_else(|| json!("msg-unknown")),
        "type": "message",
        "role": "assistant",
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

/// Final responses object → Claude message object.
pub fn responses_to_claude_message(response: &Value) -> Value {
    let chat = crate::chat_responses::responses_to_chat_completion(response);
    chat_completion_to_claude_message(&chat)
}

/// Claude message object → chat completion object.
pub fn claude_message_to_chat_completion(message: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in message
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(value) = block.get("text").and_then(Value::as_str) {
                    text.push_str(value);
                }
            }
            Some("tool_use") => tool_calls.push(json!({
                "id": block.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default(),
                },
            })),
            _ => {}
        }
    }

    let mut chat_message = Map::new();
    chat_message.insert("role".to_string(), json!("assistant"));
    chat_message.insert("content".to_string(), json!(text));
    let finish_reason = match message.get("stop_reason").and_then(Value::as_str) {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    };
    if !tool_calls.is_empty() {
        chat_message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    let usage = message.get("usage").cloned().unwrap_or(Value::Null);
    let input_tokens = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    json!({
        "id": message.get("id").cloned().unwrap_or_else(|| json!("chatcmpl-unknown")),
        "object": "chat.completion",
        "created": 0,
        "model": message.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": Value::Object(chat_message),
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    })
}

fn system_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn claude_event(kind: &str, body: Value) -> SseEvent {
    let mut data = Map::new();
    data.insert("type".to_string(), json!(kind));
    if let Value::Object(extra) = body {
        for (key, value) in extra {
            data.insert(key, value);
        }
    }
    SseEvent::named(kind, Value::Object(data).to_string())
}

/// Rewrites a responses-API event stream into Claude message events.
#[derive(Debug, Default)]
pub struct ResponsesToClaudeState {
    block_index: i64,
    text_block_open: bool,
    tool_block_open: bool,
    saw_tool_use: bool,
    finished: bool,
}

impl ResponsesToClaudeState {
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
                out.push(claude_event(
                    "message_start",
                    json!({"message": {
                        "id": response.get("id").cloned().unwrap_or_else(|| json!("msg-stream")),
                        "type": "message",
                        "role": "assistant",
                        "model": response.get("model").cloned().unwrap_or(Value::Null),
                        "content": [],
                        "stop_reason": Value::Null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    }}),
                ));
            }
            "response.output_text.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    if !self.text_block_open {
                        out.extend(self.close_tool_block());
                        self.text_block_open = true;
                        out.push(claude_event(
                            "content_block_start",
                            json!({"index": self.block_index, "content_block": {"type": "text", "text": ""}}),
                        ));
                    }
                    out.push(claude_event(
                        "content_block_delta",
                        json!({"index": self.block_index, "delta": {"type": "text_delta", "text": delta}}),
                    ));
                }
            }
            "response.output_item.added" => {
                let item = data.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    out.extend(self.close_text_block());
                    out.extend(self.close_tool_block());
                    self.saw_tool_use = true;
                    self.tool_block_open = true;
                    out.push(claude_event(
                        "content_block_start",
                        json!({"index": self.block_index, "content_block": {
                            "type": "tool_use",
                            "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                            "name": item.get("name").cloned().unwrap_or(Value::Null),
                            "input": {},
                        }}),
                    ));
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                    out.push(claude_event(
                        "content_block_delta",
                        json!({"index": self.block_index, "delta": {"type": "input_json_delta", "partial_json": delta}}),
                    ));
                }
            }
            "response.completed" => {
                out.extend(self.close_text_block());
                out.extend(self.close_tool_block());
                let response = data.get("response").cloned().unwrap_or(Value::Null);
                let usage = response.get("usage").cloned().unwrap_or(Value::Null);
                let stop_reason = if self.saw_tool_use { "tool_use" } else { "end_turn" };
                out.push(claude_event(
                    "message_delta",
                    json!({
                        "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                        "usage": {"output_tokens": usage.get("output_tokens").cloned().unwrap_or(json!(0))},
                    }),
                ));
                out.push(claude_event("message_stop", json!({})));
                self.finished = true;
            }
            "response.failed" | "error" => {
                out.push(claude_event(
                    "error",
                    json!({"error": data.get("error").cloned().unwrap_or(data.clone())}),
                ));
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
        let mut out = self.close_text_block();
        out.extend(self.close_tool_block());
        out.push(claude_event("message_stop", json!({})));
        out
    }

    fn close_text_block(&mut self) -> Vec<SseEvent> {
        if !self.text_block_open {
            return Vec::new();
        }
        self.text_block_open = false;
        let event = claude_event("content_block_stop", json!({"index": self.block_index}));
        self.block_index += 1;
        vec![event]
    }

    fn close_tool_block(&mut self) -> Vec<SseEvent> {
        if !self.tool_block_open {
            return Vec::new();
        }
        self.tool_block_open = false;
        let event = claude_event("content_block_stop", json!({"index": self.block_index}));
        self.block_index += 1;
        vec![event]
    }
}

/// Rewrites a chat-completion chunk stream into Claude message events.
#[derive(Debug, Default)]
pub struct ChatToClaudeState {
    started: bool,
    block_index: i64,
    text_block_open: bool,
    tool_block_open: bool,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Option<Value>,
    finished: bool,
}

impl ChatToClaudeState {
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
            out.push(claude_event(
                "message_start",
                json!({"message": {
                    "id": data.get("id").cloned().unwrap_or_else(|| json!("msg-stream")),
                    "type": "message",
                    "role": "assistant",
                    "model": data.get("model").cloned().unwrap_or(Value::Null),
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }}),
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
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                if !self.text_block_open {
                    out.extend(self.close_tool_block());
                    self.text_block_open = true;
                    out.push(claude_event(
                        "content_block_start",
                        json!({"index": self.block_index, "content_block": {"type": "text", "text": ""}}),
                    ));
                }
                out.push(claude_event(
                    "content_block_delta",
                    json!({"index": self.block_index, "delta": {"type": "text_delta", "text": text}}),
                ));
            }
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    out.extend(self.close_text_block());
                    out.extend(self.close_tool_block());
                    self.saw_tool_use = true;
                    self.tool_block_open = true;
                    out.push(claude_event(
                        "content_block_start",
                        json!({"index": self.block_index, "content_block": {
                            "type": "tool_use",
                            "id": call.get("id").cloned().unwrap_or(Value::Null),
                            "name": name,
                            "input": {},
                        }}),
                    ));
                }
                if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                    if !arguments.is_empty() {
                        out.push(claude_event(
                            "content_block_delta",
                            json!({"index": self.block_index, "delta": {"type": "input_json_delta", "partial_json": arguments}}),
                        ));
                    }
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(out)
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = self.close_text_block();
        out.extend(self.close_tool_block());
        let stop_reason = match self.finish_reason.as_deref() {
            _ if self.saw_tool_use => "tool_use",
            Some("length") => "max_tokens",
            _ => "end_turn",
        };
        let output_tokens = self
            .usage
            .as_ref()
            .and_then(|usage| usage.get("completion_tokens"))
            .cloned()
            .unwrap_or(json!(0));
        out.push(claude_event(
            "message_delta",
            json!({
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {"output_tokens": output_tokens},
            }),
        ));
        out.push(claude_event("message_stop", json!({})));
        out
    }

    fn close_text_block(&mut self) -> Vec<SseEvent> {
        if !self.text_block_open {
            return Vec::new();
        }
        self.text_block_open = false;
        let event = claude_event("content_block_stop", json!({"index": self.block_index}));
        self.block_index += 1;
        vec![event]
    }

    fn close_tool_block(&mut self) -> Vec<SseEvent> {
        if !self.tool_block_open {
            return Vec::new();
        }
        self.tool_block_open = false;
        let event = claude_event("content_block_stop", json!({"index": self.block_index}));
        self.block_index += 1;
        vec![event]
    }
}

/// Rewrites a Claude message event stream into chat-completion chunks.
#[derive(Debug, Default)]
pub struct ClaudeToChatState {
    id: String,
    model: String,
    stop_reason: Option<String>,
    output_tokens: Value,
    finished: bool,
}

impl ClaudeToChatState {
    pub fn new() -> Self {
        Self {
            output_tokens: json!(0),
            ..Self::default()
        }
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
            "message_start" => {
                let message = data.get("message").cloned().unwrap_or(Value::Null);
                self.id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("chatcmpl-stream")
                    .to_string();
                self.model = message
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                out.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            out.push(self.chunk(json!({"content": text}), None));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            out.push(self.chunk(
                                json!({"tool_calls": [{"index": 0, "function": {"arguments": partial}}]}),
                                None,
                            ));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    out.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": 0,
                            "id": block.get("id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": "",
                            },
                        }]}),
                        None,
                    ));
                }
            }
            "message_delta" => {
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) = data
                    .get("usage")
                    .and_then(|usage| usage.get("output_tokens"))
                {
                    self.output_tokens = tokens.clone();
                }
            }
            "message_stop" => {
                out.extend(self.finish());
            }
            "error" => {
                out.push(SseEvent::data(data.to_string()));
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
        let finish_reason = match self.stop_reason.as_deref() {
            Some("tool_use") => "tool_calls",
            Some("max_tokens") => "length",
            _ => "stop",
        };
        vec![
            self.chunk(json!({}), Some(finish_reason)),
            SseEvent::data("[DONE]"),
        ]
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> SseEvent {
        SseEvent::data(
            json!({
                "id": self.id,
                "object": "chat.completion.chunk",
                "created": 0,
                "model": self.model,
                "choices": [{
                    "index": 0,
                    "delta": delta,
                    "finish_reason": finish_reason.map(Value::from).unwrap_or(Value::Null),
                }],
            })
            .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_request_flattens_system_and_tools() {
        let req = json!({
            "model": "claude-sonnet-4",
            "system": [{"type": "text", "text": "be kind"}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"q": 1}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "42"},
                ]},
            ],
            "max_tokens": 256,
            "tools": [{"name": "lookup", "description": "d", "input_schema": {"type": "object"}}],
        });
        let out = claude_request_to_chat(&req).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(out["tools"][0]["function"]["name"], "lookup");
        assert_eq!(out["max_tokens"], 256);
    }

    #[test]
    fn chat_request_to_claude_defaults_max_tokens() {
        let req = json!({
            "model": "claude-sonnet-4",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hello"},
            ],
        });
        let out = chat_request_to_claude(&req).unwrap();
        assert_eq!(out["system"], "sys");
        assert_eq!(out["messages"][0]["role"], "user");
        assert_eq!(out["max_tokens"], 4096);
    }

    #[test]
    fn chat_completion_maps_to_claude_message() {
        let response = json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{"index": 0, "message": {
                "role": "assistant",
                "content": "hi",
                "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}}],
            }, "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5},
        });
        let out = chat_completion_to_claude_message(&response);
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "hi");
        assert_eq!(out["content"][1]["type"], "tool_use");
        assert_eq!(out["content"][1]["input"]["a"], 1);
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["usage"]["input_tokens"], 2);
    }

    #[test]
    fn responses_stream_becomes_claude_events() {
        let mut state = ResponsesToClaudeState::new();
        let start = state
            .push(&SseEvent::named(
                "response.created",
                json!({"type":"response.created","response":{"id":"r1","model":"gpt-5"}}).to_string(),
            ))
            .unwrap();
        assert_eq!(start[0].event.as_deref(), Some("message_start"));

        let delta = state
            .push(&SseEvent::named(
                "response.output_text.delta",
                json!({"type":"response.output_text.delta","delta":"hey"}).to_string(),
            ))
            .unwrap();
        assert_eq!(delta[0].event.as_deref(), Some("content_block_start"));
        assert_eq!(delta[1].event.as_deref(), Some("content_block_delta"));

        let end = state
            .push(&SseEvent::named(
                "response.completed",
                json!({"type":"response.completed","response":{"usage":{"output_tokens":7}}}).to_string(),
            ))
            .unwrap();
        let names: Vec<_> = end.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(state.finish().is_empty());
    }

    #[test]
    fn chat_stream_becomes_claude_events() {
        let mut state = ChatToClaudeState::new();
        let first = state
            .push(&SseEvent::data(
                json!({"id":"c1","model":"m","choices":[{"index":0,"delta":{"role":"assistant","content":"he"},"finish_reason":null}]}).to_string(),
            ))
            .unwrap();
        let names: Vec<_> = first.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec!["message_start", "content_block_start", "content_block_delta"]
        );

        state
            .push(&SseEvent::data(
                json!({"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}).to_string(),
            ))
            .unwrap();
        let end = state.push(&SseEvent::data("[DONE]")).unwrap();
        let names: Vec<_> = end.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn claude_stream_becomes_chat_chunks() {
        let mut state = ClaudeToChatState::new();
        state
            .push(&SseEvent::named(
                "message_start",
                json!({"type":"message_start","message":{"id":"m1","model":"claude"}}).to_string(),
            ))
            .unwrap();
        let delta = state
            .push(&SseEvent::named(
                "content_block_delta",
                json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"yo"}}).to_string(),
            ))
            .unwrap();
        let chunk: Value = serde_json::from_str(&delta[0].data).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "yo");

        state
            .push(&SseEvent::named(
                "message_delta",
                json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}).to_string(),
            ))
            .unwrap();
        let end = state
            .push(&SseEvent::named("message_stop", json!({"type":"message_stop"}).to_string()))
            .unwrap();
        let last: Value = serde_json::from_str(&end[0].data).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert!(end[1].is_done_sentinel());
    }
}
