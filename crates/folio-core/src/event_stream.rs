//! Incremental framing of a server-pushed event stream.
//!
//! Frames are separated by a blank line (`\n\n`). Inside a frame, the line
//! starting with `event:` names the event and `data:` lines carry the
//! payload. Chunk boundaries are arbitrary: the decoder buffers partial
//! frames (and partial UTF-8 sequences) until the next chunk completes them.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::error::ClientError;

const FRAME_SEPARATOR: &str = "\n\n";
const EVENT_PREFIX: &str = "event:";
const DATA_PREFIX: &str = "data:";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub event_type: String,
    pub data: String,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }
}

/// Decoder state for a single stream. Create one per response body.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: String,
    /// Trailing bytes of a UTF-8 sequence cut by a chunk boundary.
    partial_char: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.append_utf8(chunk);

        let text = std::mem::take(&mut self.buffer);
        let Some((complete, tail)) = text.rsplit_once(FRAME_SEPARATOR) else {
            self.buffer = text;
            return Vec::new();
        };

        let events = complete
            .split(FRAME_SEPARATOR)
            .filter_map(|frame| {
                let event = parse_frame(frame);
                if event.is_none() && !frame.trim().is_empty() {
                    log::debug!("dropping frame without event type: {frame:?}");
                }
                event
            })
            .collect();
        self.buffer = tail.to_string();
        events
    }

    /// Text held back waiting for the rest of its frame.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// End of stream: discard whatever partial frame is left.
    ///
    /// Returns the discarded text when there was any.
    pub fn take_remainder(&mut self) -> Option<String> {
        let mut rest = std::mem::take(&mut self.buffer);
        if !self.partial_char.is_empty() {
            rest.push_str(&String::from_utf8_lossy(&self.partial_char));
            self.partial_char.clear();
        }
        (!rest.is_empty()).then_some(rest)
    }

    fn append_utf8(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial_char);
        bytes.extend_from_slice(chunk);

        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes
                            self.partial_char = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Parse one complete frame. `None` if it has no (non-empty) `event:` line.
pub fn parse_frame(frame: &str) -> Option<StreamEvent> {
    let mut event_type: Option<&str> = None;
    let mut data: Option<String> = None;

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix(EVENT_PREFIX) {
            event_type.get_or_insert(value.trim());
        } else if let Some(value) = line.strip_prefix(DATA_PREFIX) {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }

    let event_type = event_type.filter(|t| !t.is_empty())?;
    Some(StreamEvent::new(event_type, data.unwrap_or_default()))
}

/// Pull-based adapter from a byte-chunk stream to decoded events.
///
/// The next chunk is only read once every buffered event has been handed
/// out, so a slow consumer naturally slows the reader.
pub struct EventStream<S> {
    inner: S,
    decoder: EventStreamDecoder,
    ready: VecDeque<StreamEvent>,
    finished: bool,
}

impl<S, B, E> EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: EventStreamDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Next event, or `Ok(None)` once the body has ended.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, ClientError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    let events = self.decoder.push(chunk.as_ref());
                    self.ready.extend(events);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(ClientError::network(format!("stream read failed: {e}")));
                }
                None => {
                    self.finished = true;
                    if let Some(rest) = self.decoder.take_remainder() {
                        log::debug!("stream ended mid-frame, discarding {} bytes", rest.len());
                    }
                }
            }
        }
    }
}
