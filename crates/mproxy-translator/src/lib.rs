//! Dialect translation for mproxy.
//!
//! Public API dialects and provider wire formats are all JSON; translation is
//! expressed as pure functions over `serde_json::Value` trees, with stateful
//! incremental adapters for SSE streams. No whole-response buffering happens
//! on the streaming paths: each upstream event yields zero or more downstream
//! events immediately.

pub mod aggregate;
pub mod chat_responses;
pub mod claude;
pub mod gemini;
pub mod sse;

use serde_json::Value;

pub use sse::{SseEvent, SseStreamParser};

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("unknown format: {0}")]
    UnknownFormat(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported translation: {from} -> {to}")]
    Unsupported { from: Format, to: Format },
}

pub(crate) fn invalid(message: impl std::fmt::Display) -> TranslateError {
    TranslateError::InvalidPayload(message.to_string())
}

/// Wire dialects spoken on the public surface and by upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// OpenAI chat completions.
    OpenAI,
    /// Anthropic messages.
    Claude,
    /// OpenAI responses API (the codex-family wire format).
    Codex,
    /// Google generateContent.
    Gemini,
}

impl Format {
    pub fn from_string(name: &str) -> Result<Self, TranslateError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-chat" | "openai_chat" | "chat-completions" => Ok(Format::OpenAI),
            "claude" | "anthropic" | "messages" => Ok(Format::Claude),
            "codex" | "responses" | "openai-responses" | "openai_response" => Ok(Format::Codex),
            "gemini" | "google" => Ok(Format::Gemini),
            other => Err(TranslateError::UnknownFormat(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::OpenAI => "openai",
            Format::Claude => "claude",
            Format::Codex => "codex",
            Format::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_payload(payload: &[u8]) -> Result<Value, TranslateError> {
    serde_json::from_slice(payload).map_err(|err| invalid(err))
}

/// Request-direction translation over raw bytes. Pure; same-format input is
/// passed through untouched.
pub fn translate(payload: &[u8], from: Format, to: Format) -> Result<Vec<u8>, TranslateError> {
    if from == to {
        return Ok(payload.to_vec());
    }
    let value = parse_payload(payload)?;
    let out = translate_request_value(&value, from, to)?;
    serde_json::to_vec(&out).map_err(|err| invalid(err))
}

pub fn translate_request_value(
    value: &Value,
    from: Format,
    to: Format,
) -> Result<Value, TranslateError> {
    use Format::*;
    match (from, to) {
        (a, b) if a == b => Ok(value.clone()),
        (OpenAI, Codex) => chat_responses::chat_request_to_responses(value),
        (OpenAI, Claude) => claude::chat_request_to_claude(value),
        (OpenAI, Gemini) => gemini::chat_request_to_gemini(value),
        (Claude, Codex) => claude::claude_request_to_responses(value),
        (Claude, OpenAI) => claude::claude_request_to_chat(value),
        (Claude, Gemini) => {
            let chat = claude::claude_request_to_chat(value)?;
            gemini::chat_request_to_gemini(&chat)
        }
        (Codex, OpenAI) => chat_responses::responses_request_to_chat(value),
        (Codex, Claude) => claude::responses_request_to_claude(value),
        (Codex, Gemini) => {
            let chat = chat_responses::responses_request_to_chat(value)?;
            gemini::chat_request_to_gemini(&chat)
        }
        (from, to) => Err(TranslateError::Unsupported { from, to }),
    }
}

/// Response-direction translation: upstream-native body → client-dialect body.
pub fn translate_response(
    payload: &[u8],
    upstream: Format,
    client: Format,
) -> Result<Vec<u8>, TranslateError> {
    if upstream == client {
        return Ok(payload.to_vec());
    }
    let value = parse_payload(payload)?;
    let out = translate_response_value(&value, upstream, client)?;
    serde_json::to_vec(&out).map_err(|err| invalid(err))
}

pub fn translate_response_value(
    value: &Value,
    upstream: Format,
    client: Format,
) -> Result<Value, TranslateError> {
    use Format::*;
    match (upstream, client) {
        (a, b) if a == b => Ok(value.clone()),
        (Codex, OpenAI) => Ok(chat_responses::responses_to_chat_completion(value)),
        (Codex, Claude) => Ok(claude::responses_to_claude_message(value)),
        (OpenAI, Claude) => Ok(claude::chat_completion_to_claude_message(value)),
        (OpenAI, Codex) => Ok(chat_responses::chat_completion_to_responses(value)),
        (Claude, OpenAI) => Ok(claude::claude_message_to_chat_completion(value)),
        (Claude, Codex) => {
            let chat = claude::claude_message_to_chat_completion(value);
            Ok(chat_responses::chat_completion_to_responses(&chat))
        }
        (Gemini, OpenAI) => Ok(gemini::gemini_to_chat_completion(value, "")),
        (Gemini, Claude) => {
            let chat = gemini::gemini_to_chat_completion(value, "");
            Ok(claude::chat_completion_to_claude_message(&chat))
        }
        (upstream, client) => Err(TranslateError::Unsupported {
            from: upstream,
            to: client,
        }),
    }
}

/// Stateful upstream-stream → client-stream adapter.
///
/// `push` is incremental: each upstream SSE event yields zero or more client
/// events; `finish` flushes terminal events when the upstream ended without
/// its own terminator.
pub enum StreamTranslator {
    Passthrough,
    ResponsesToChat(chat_responses::ResponsesToChatState),
    ResponsesToClaude(claude::ResponsesToClaudeState),
    ChatToClaude(claude::ChatToClaudeState),
    ChatToResponses(chat_responses::ChatToResponsesState),
    ClaudeToChat(claude::ClaudeToChatState),
    ClaudeToResponses(claude::ClaudeToChatState, chat_responses::ChatToResponsesState),
    GeminiToChat(gemini::GeminiToChatState),
    GeminiToClaude(gemini::GeminiToChatState, claude::ChatToClaudeState),
}

impl StreamTranslator {
    /// `model` seeds synthesized chunks for upstreams (gemini) whose stream
    /// frames do not repeat the model name.
    pub fn new(upstream: Format, client: Format, model: &str) -> Result<Self, TranslateError> {
        use Format::*;
        let translator = match (upstream, client) {
            (a, b) if a == b => StreamTranslator::Passthrough,
            (Codex, OpenAI) => {
                StreamTranslator::ResponsesToChat(chat_responses::ResponsesToChatState::new())
            }
            (Codex, Claude) => {
                StreamTranslator::ResponsesToClaude(claude::ResponsesToClaudeState::new())
            }
            (OpenAI, Claude) => StreamTranslator::ChatToClaude(claude::ChatToClaudeState::new()),
            (OpenAI, Codex) => {
                StreamTranslator::ChatToResponses(chat_responses::ChatToResponsesState::new())
            }
            (Claude, OpenAI) => StreamTranslator::ClaudeToChat(claude::ClaudeToChatState::new()),
            (Claude, Codex) => StreamTranslator::ClaudeToResponses(
                claude::ClaudeToChatState::new(),
                chat_responses::ChatToResponsesState::new(),
            ),
            (Gemini, OpenAI) => {
                StreamTranslator::GeminiToChat(gemini::GeminiToChatState::new(model))
            }
            (Gemini, Claude) => StreamTranslator::GeminiToClaude(
                gemini::GeminiToChatState::new(model),
                claude::ChatToClaudeState::new(),
            ),
            (upstream, client) => {
                return Err(TranslateError::Unsupported {
                    from: upstream,
                    to: client,
                })
            }
        };
        Ok(translator)
    }

    pub fn push(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        match self {
            StreamTranslator::Passthrough => Ok(vec![event.clone()]),
            StreamTranslator::ResponsesToChat(state) => state.push(event),
            StreamTranslator::ResponsesToClaude(state) => state.push(event),
            StreamTranslator::ChatToClaude(state) => state.push(event),
            StreamTranslator::ChatToResponses(state) => state.push(event),
            StreamTranslator::ClaudeToChat(state) => state.push(event),
            StreamTranslator::ClaudeToResponses(first, second) => {
                chain(first.push(event)?, second)
            }
            StreamTranslator::GeminiToChat(state) => state.push(event),
            StreamTranslator::GeminiToClaude(first, second) => chain(first.push(event)?, second),
        }
    }

    pub fn finish(&mut self) -> Result<Vec<SseEvent>, TranslateError> {
        match self {
            StreamTranslator::Passthrough => Ok(Vec::new()),
            StreamTranslator::ResponsesToChat(state) => Ok(state.finish()),
            StreamTranslator::ResponsesToClaude(state) => Ok(state.finish()),
            StreamTranslator::ChatToClaude(state) => Ok(state.finish()),
            StreamTranslator::ChatToResponses(state) => Ok(state.finish()),
            StreamTranslator::ClaudeToChat(state) => Ok(state.finish()),
            StreamTranslator::ClaudeToResponses(first, second) => {
                let mut out = chain(first.finish(), second)?;
                out.extend(second.finish());
                Ok(out)
            }
            StreamTranslator::GeminiToChat(state) => Ok(state.finish()),
            StreamTranslator::GeminiToClaude(first, second) => {
                let mut out = chain(first.finish(), second)?;
                out.extend(second.finish());
                Ok(out)
            }
        }
    }
}

trait ChunkSink {
    fn push_event(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError>;
}

impl ChunkSink for chat_responses::ChatToResponsesState {
    fn push_event(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        self.push(event)
    }
}

impl ChunkSink for claude::ChatToClaudeState {
    fn push_event(&mut self, event: &SseEvent) -> Result<Vec<SseEvent>, TranslateError> {
        self.push(event)
    }
}

fn chain<S: ChunkSink>(
    intermediate: Vec<SseEvent>,
    sink: &mut S,
) -> Result<Vec<SseEvent>, TranslateError> {
    let mut out = Vec::new();
    for event in &intermediate {
        out.extend(sink.push_event(event)?);
    }
    Ok(out)
}
