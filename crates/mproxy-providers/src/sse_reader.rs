//! Logical-line reader for upstream SSE bodies.
//!
//! Reads through a fixed-size fill buffer but reassembles lines of any
//! length, so a `data:` payload larger than the buffer still comes back as
//! one line. CR before the newline is trimmed; a final line without a
//! trailing newline is returned once before end-of-stream.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_FILL_CAPACITY: usize = 16 * 1024;

pub struct SseLineReader<R> {
    inner: R,
    pending: Vec<u8>,
    /// Bytes of `pending` already scanned for a newline, so refills never
    /// rescan the head of an oversized line.
    scanned: usize,
    fill: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> SseLineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_FILL_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            scanned: 0,
            fill: vec![0u8; capacity.max(1)],
            eof: false,
        }
    }

    /// Next logical line, without its newline. `None` at end of stream.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(rel) = self.pending[self.scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
            {
                let pos = self.scanned + rel;
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                self.scanned = 0;
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(Bytes::from(line)));
            }
            self.scanned = self.pending.len();
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                self.scanned = 0;
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(Bytes::from(line)));
            }
            let n = self.inner.read(&mut self.fill).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&self.fill[..n]);
            }
        }
    }
}
