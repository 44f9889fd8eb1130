/// SSE (Server-Sent Events) frame parser, encoder, and stream utilities.
///
/// The parser handles upstream `data:` events arriving at arbitrary byte
/// boundaries; the encoder writes the downstream `event:`/`data:` frames.
use super::SseEvent;
use futures_util::Stream;
use memchr::memchr_iter;

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    ///
    /// - `event:` sets the event type of the next frame
    /// - `data:` lines append to the payload, joined with `\n`
    /// - a blank line dispatches the frame
    /// - `:` comments and unknown fields are ignored
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
        } else if self.read_offset >= 8 * 1024 || self.read_offset >= self.buffer.len() / 2 {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Dispatch a trailing event that was not followed by a blank line.
    ///
    /// Some backends close the connection right after the last `data:` line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.read_offset < self.buffer.len() {
            let mut tail = std::mem::take(&mut self.buffer);
            tail.drain(..self.read_offset);
            self.read_offset = 0;
            let mut sink = Vec::new();
            let line = tail.strip_suffix('\r').unwrap_or(&tail);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut sink,
            );
        }
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseEvent {
            event: self.event_type.take(),
            data: std::mem::take(&mut self.data_buffer),
        })
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                });
                *has_data = false;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Append one named frame: `event: {name}\ndata: {json}\n\n`.
#[inline]
pub fn write_event_frame(out: &mut String, event_type: &str, json: &str) {
    out.reserve(16 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push_str("\ndata: ");
    out.push_str(json);
    out.push_str("\n\n");
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Split a byte stream into SSE events using [`SseParser`].
///
/// Bytes arriving from an HTTP response body are decoded as UTF-8 (a code
/// point split across chunks is carried over), fed into the parser, and
/// complete [`SseEvent`] frames are yielded. A transport error is yielded
/// once and ends the stream.
pub fn sse_event_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, E>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    use futures_util::StreamExt;

    struct State<S> {
        stream: std::pin::Pin<Box<S>>,
        parser: SseParser,
        remainder: Vec<u8>,
        pending: std::collections::VecDeque<SseEvent>,
        parsed: Vec<SseEvent>,
        done: bool,
    }

    let state = State {
        stream: Box::pin(byte_stream),
        parser: SseParser::new(),
        remainder: Vec::new(),
        pending: std::collections::VecDeque::with_capacity(8),
        parsed: Vec::with_capacity(8),
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }

            match st.stream.as_mut().next().await {
                Some(Ok(bytes)) => {
                    st.remainder.extend_from_slice(&bytes);
                    let valid_up_to = match std::str::from_utf8(&st.remainder) {
                        Ok(text) => {
                            st.parser.feed_into(text, &mut st.parsed);
                            st.remainder.len()
                        }
                        // Incomplete code point at the tail: keep it for the next chunk.
                        Err(e) if e.error_len().is_none() => {
                            let valid_up_to = e.valid_up_to();
                            let text = String::from_utf8_lossy(&st.remainder[..valid_up_to]);
                            st.parser.feed_into(&text, &mut st.parsed);
                            valid_up_to
                        }
                        Err(_) => {
                            let text = String::from_utf8_lossy(&st.remainder);
                            st.parser.feed_into(&text, &mut st.parsed);
                            st.remainder.len()
                        }
                    };
                    st.remainder.drain(..valid_up_to);
                    st.pending.extend(st.parsed.drain(..));
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    if let Some(event) = st.parser.finish() {
                        st.pending.push_back(event);
                    }
                }
            }
        }
    })
}
