//! Incremental SSE event parser.
//!
//! Feed it arbitrary byte chunks; it yields one [`SseEvent`] per blank-line
//! terminated block. Chunk boundaries need not align with line boundaries.

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The OpenAI chat-completions end-of-stream sentinel.
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Wire rendering: optional `event:` line, one `data:` line per payload
    /// line, blank-line terminator.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.data.len() + 32);
        if let Some(name) = &self.event {
            out.extend_from_slice(b"event: ");
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        for line in self.data.split('\n') {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        Bytes::from(out)
    }
}

#[derive(Debug, Default)]
pub struct SseStreamParser {
    pending: String,
    event: Option<String>,
    data_lines: Vec<String>,
    saw_field: bool,
}

impl SseStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.pending.push_str(text);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line = self.pending[..pos].to_string();
            self.pending.drain(..=pos);
            self.consume_line(line, &mut events);
        }
        events
    }

    /// Flushes any unterminated trailing block at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.consume_line(line, &mut events);
        }
        self.flush_block(&mut events);
        events
    }

    fn consume_line(&mut self, mut line: String, events: &mut Vec<SseEvent>) {
        if line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            self.flush_block(events);
            return;
        }
        // Comment lines (heartbeats and the like) carry no event payload.
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => {
                self.saw_field = true;
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => {
                self.saw_field = true;
                self.data_lines.push(value.to_string());
            }
            // id, retry, unknown fields: irrelevant to payload routing.
            _ => {}
        }
    }

    fn flush_block(&mut self, events: &mut Vec<SseEvent>) {
        if !self.saw_field {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
        self.saw_field = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_across_chunk_boundaries() {
        let mut parser = SseStreamParser::new();
        assert!(parser.push(b"event: response.cre").is_empty());
        assert!(parser.push(b"ated\ndata: {\"a\":1").is_empty());
        let events = parser.push(b"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::named("response.created", "{\"a\":1}")]
        );
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut parser = SseStreamParser::new();
        let events = parser.push(b"data: one\ndata: two\n\n");
        assert_eq!(events, vec![SseEvent::data("one\ntwo")]);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseStreamParser::new();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
        let events = parser.push(b"data: x\n\n");
        assert_eq!(events, vec![SseEvent::data("x")]);
    }

    #[test]
    fn crlf_is_trimmed() {
        let mut parser = SseStreamParser::new();
        let events = parser.push(b"data: ok\r\n\r\n");
        assert_eq!(events, vec![SseEvent::data("ok")]);
    }

    #[test]
    fn finish_flushes_unterminated_block() {
        let mut parser = SseStreamParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        assert_eq!(parser.finish(), vec![SseEvent::data("tail")]);
    }

    #[test]
    fn done_sentinel_detection() {
        assert!(SseEvent::data("[DONE]").is_done_sentinel());
        assert!(!SseEvent::data("{}").is_done_sentinel());
    }

    #[test]
    fn event_rendering_round_trips() {
        let rendered = SseEvent::named("message_start", "{\"x\":1}").to_bytes();
        assert_eq!(&rendered[..], b"event: message_start\ndata: {\"x\":1}\n\n");
        let mut parser = SseStreamParser::new();
        let events = parser.push(&rendered);
        assert_eq!(events, vec![SseEvent::named("message_start", "{\"x\":1}")]);
    }
}
