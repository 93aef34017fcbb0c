//! Downstream SSE write-state normalizer.
//!
//! Translators emit chunks that are *almost* well-formed SSE, but strict
//! client decoders choke on event lines without data, empty data payloads,
//! and doubled blank lines. This filter rewrites the outgoing chunk sequence
//! into strictly well-formed event blocks: every emitted block contains at
//! least one non-empty `data:` payload and ends with exactly one blank line.

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct SseWriteState {
    /// Buffered non-data lines (usually one `event:` line) waiting for a
    /// non-empty data payload in the same block.
    pending: Vec<Vec<u8>>,
    /// The current emitted block has produced data and is still open.
    block_has_data: bool,
    /// Some non-empty data payload has been emitted on this response.
    wrote_data: bool,
}

impl SseWriteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk; returns the bytes to forward downstream.
    ///
    /// A chunk may contain several `\n`-separated lines or none. An empty
    /// chunk is the explicit block delimiter. A trailing empty segment from a
    /// chunk ending in `\n` is *not* a delimiter and is dropped.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Bytes {
        let mut out = Vec::new();
        if chunk.is_empty() {
            self.end_block(&mut out);
            return Bytes::from(out);
        }
        let mut segments: Vec<&[u8]> = chunk.split(|byte| *byte == b'\n').collect();
        if segments.len() > 1 && segments.last().map(|seg| seg.is_empty()).unwrap_or(false) {
            segments.pop();
        }
        for segment in segments {
            if segment.is_empty() {
                self.end_block(&mut out);
            } else {
                self.write_line(segment, &mut out);
            }
        }
        Bytes::from(out)
    }

    /// End of stream: terminates an open data block. Never writes anything
    /// unless some non-empty data was emitted and the stream is mid-block.
    pub fn write_done(&mut self) -> Bytes {
        let mut out = Vec::new();
        self.end_block(&mut out);
        self.pending.clear();
        Bytes::from(out)
    }

    fn write_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        if let Some(payload) = strip_data_prefix(line) {
            if payload.iter().all(|byte| byte.is_ascii_whitespace()) {
                // Empty data payloads are filtered; the block may still get
                // real data later.
                return;
            }
            for pending in self.pending.drain(..) {
                out.extend_from_slice(&pending);
                out.push(b'\n');
            }
            out.extend_from_slice(line);
            out.push(b'\n');
            self.block_has_data = true;
            self.wrote_data = true;
            return;
        }

        // Non-data line. An open data block means this starts the next block:
        // close the previous one with exactly one separator.
        if self.block_has_data {
            out.push(b'\n');
            self.block_has_data = false;
        } else if !self.pending.is_empty() {
            // The previous buffered block never produced data; discard it.
            self.pending.clear();
        }
        self.pending.push(line.to_vec());
    }

    fn end_block(&mut self, out: &mut Vec<u8>) {
        if self.block_has_data {
            out.push(b'\n');
            self.block_has_data = false;
        }
        self.pending.clear();
    }

    pub fn wrote_any_data(&self) -> bool {
        self.wrote_data
    }
}

fn strip_data_prefix(line: &[u8]) -> Option<&[u8]> {
    line.strip_prefix(b"data:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> String {
        let mut state = SseWriteState::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&state.write_chunk(chunk));
        }
        out.extend_from_slice(&state.write_done());
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn leading_empty_chunk_and_event_only_block_emit_nothing() {
        // Event lines with no data are suppressed entirely so downstream SSE
        // decoders never see events whose data fails JSON parsing.
        let out = run(&[b"", b"event: response.created"]);
        assert_eq!(out, "");
    }

    #[test]
    fn event_newline_only_after_non_empty_data() {
        let out = run(&[
            br#"data: {"type":"response.created"}"#,
            b"event: response.output_text.delta",
            br#"data: {"delta":"hi"}"#,
        ]);
        assert_eq!(
            out,
            "data: {\"type\":\"response.created\"}\n\nevent: response.output_text.delta\ndata: {\"delta\":\"hi\"}\n\n"
        );
    }

    #[test]
    fn multiline_chunk_is_one_block() {
        let out = run(&[
            b"event: response.created\ndata: {\"type\":\"response.created\"}",
            b"",
        ]);
        assert_eq!(
            out,
            "event: response.created\ndata: {\"type\":\"response.created\"}\n\n"
        );
    }

    #[test]
    fn empty_data_payloads_are_filtered() {
        assert_eq!(run(&[b"data: "]), "");
        assert_eq!(run(&[b"data:   "]), "");
        assert_eq!(
            run(&[br#"data: {"ok":true}"#]),
            "data: {\"ok\":true}\n\n"
        );
    }

    #[test]
    fn empty_data_filtered_but_valid_data_passes_in_sequence() {
        let out = run(&[
            b"event: test",
            b"data: ",
            b"",
            br#"data: {"valid":true}"#,
            b"",
        ]);
        // The first block (event + empty data) is suppressed entirely; the
        // second block has only a data line.
        assert_eq!(out, "data: {\"valid\":true}\n\n");
    }

    #[test]
    fn write_done_is_gated_on_emitted_data() {
        assert_eq!(run(&[]), "");
        assert_eq!(run(&[br#"data: {"ok":true}"#]), "data: {\"ok\":true}\n\n");
        // Upstream already closed the block; done must not double the
        // delimiter.
        assert_eq!(
            run(&[br#"data: {"ok":true}"#, b""]),
            "data: {\"ok\":true}\n\n"
        );
    }

    #[test]
    fn event_only_block_after_valid_block_is_suppressed() {
        let out = run(&[
            b"event: response.created",
            br#"data: {"type":"response.created"}"#,
            b"",
            b"event: response.output_text.delta",
            b"data: ",
            b"",
        ]);
        assert_eq!(
            out,
            "event: response.created\ndata: {\"type\":\"response.created\"}\n\n"
        );
    }

    #[test]
    fn consecutive_events_with_empty_data_emit_nothing() {
        let out = run(&[b"event: first", b"data: ", b"event: second", b"data: "]);
        assert_eq!(out, "");
    }

    #[test]
    fn trailing_newline_does_not_drop_buffered_event() {
        // A chunk ending in a newline yields a trailing empty split segment;
        // that segment is not a block delimiter.
        let out = run(&[
            b"event: response.created\n",
            br#"data: {"type":"response.created"}"#,
        ]);
        assert_eq!(
            out,
            "event: response.created\ndata: {\"type\":\"response.created\"}\n\n"
        );
    }

    #[test]
    fn interior_blank_line_separates_blocks() {
        let out = run(&[b"data: a\n\ndata: b"]);
        assert_eq!(out, "data: a\n\ndata: b\n\n");
    }

    #[test]
    fn no_double_blank_lines_anywhere() {
        let out = run(&[
            b"data: one",
            b"",
            b"",
            b"event: e",
            b"data: two",
            b"",
            b"data: three",
        ]);
        assert!(!out.contains("\n\n\n"), "output: {out:?}");
        assert_eq!(out, "data: one\n\nevent: e\ndata: two\n\ndata: three\n\n");
    }

    #[test]
    fn data_without_space_after_colon_still_counts() {
        assert_eq!(run(&[b"data:{\"x\":1}"]), "data:{\"x\":1}\n\n");
    }
}
