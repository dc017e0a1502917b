//! Shared SSE streaming substrate for the provider adapters.
//!
//! [`SseEventBuffer`] frames raw body bytes into SSE event payloads: it
//! accumulates bytes, splits on blank-line boundaries (LF or CRLF
//! framing), and joins each event's `data:` lines per the SSE rules.
//! [`sse_chunk_stream`] drives a response body through the buffer and a
//! provider-specific parser, stops reading as soon as a terminal chunk
//! appears, and guarantees the caller always sees exactly one terminal
//! chunk even when the backend just closes the connection.

use futures_util::StreamExt;

use maestro_domain::stream::{StopReason, StreamChunk};

/// Incremental SSE event framer over raw bytes.
///
/// Bytes go in via [`extend`](Self::extend); complete event payloads come
/// out via [`next_event`](Self::next_event). A trailing event that the
/// server never delimited can be recovered with [`finish`](Self::finish)
/// after the body closes.
pub(crate) struct SseEventBuffer {
    buf: Vec<u8>,
}

impl SseEventBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete event's data payload. Events without any
    /// `data:` field (comments, bare `event:` lines, keep-alives) are
    /// consumed and skipped.
    pub(crate) fn next_event(&mut self) -> Option<String> {
        loop {
            let (end, delim_len) = find_boundary(&self.buf)?;
            let block: Vec<u8> = self.buf.drain(..end + delim_len).collect();
            if let Some(payload) = data_payload(&block[..end]) {
                return Some(payload);
            }
        }
    }

    /// Consume whatever is left as one final, undelimited event. Call
    /// once, after the body has closed.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.buf);
        data_payload(&block)
    }
}

/// Locate the earliest blank-line boundary in `buf`, returning the block
/// end and the delimiter width. Handles both `\n\n` and `\r\n\r\n`
/// framing; servers are allowed to mix them mid-stream.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if buf[i] == b'\r' && buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Extract an event block's data payload: every `data:` line's value,
/// joined with newlines. One leading space after the colon is field
/// syntax, not payload. `None` when the block carries no data field.
fn data_payload(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut payload: Option<String> = None;

    for line in text.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match &mut payload {
            None => payload = Some(value.to_owned()),
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
        }
    }

    payload.filter(|p| !p.is_empty())
}

fn is_terminal(chunk: &StreamChunk) -> bool {
    matches!(chunk, StreamChunk::Done { .. } | StreamChunk::Error { .. })
}

/// Drive an SSE response through a provider-specific parser, yielding
/// chunks.
///
/// The closure is `FnMut` because adapters keep assembly state across
/// events (tool-call fragments, usage counters). The stream stops pulling
/// the body at the first terminal chunk — nothing meaningful follows a
/// `done` or `error` — and if the body closes without one, the trailing
/// undelimited event (if any) is parsed and a fallback `done` is emitted
/// so every stream terminates properly. Transport failures surface as a
/// terminal `error` chunk.
pub(crate) fn sse_chunk_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> maestro_domain::BoxStream<'static, StreamChunk>
where
    F: FnMut(&str) -> Vec<StreamChunk> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut events = SseEventBuffer::new();

        while let Some(read) = body.next().await {
            let bytes = match read {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield StreamChunk::Error {
                        error: format!("stream read: {e}"),
                    };
                    return;
                }
            };
            events.extend(&bytes);

            while let Some(payload) = events.next_event() {
                for chunk in parse_data(&payload) {
                    let terminal = is_terminal(&chunk);
                    yield chunk;
                    if terminal {
                        return;
                    }
                }
            }
        }

        // Body closed without a terminal chunk; the final event may be
        // sitting in the buffer missing its blank-line delimiter.
        if let Some(payload) = events.finish() {
            for chunk in parse_data(&payload) {
                let terminal = is_terminal(&chunk);
                yield chunk;
                if terminal {
                    return;
                }
            }
        }

        // Backends that just close the connection still owe the caller a
        // terminal chunk.
        yield StreamChunk::Done {
            usage: None,
            stop_reason: StopReason::EndTurn,
        };
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
