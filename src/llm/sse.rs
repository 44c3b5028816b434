//! Line-buffering SSE parser for model token streams.
//!
//! SSE streams are newline-delimited, but TCP does not align network
//! chunks with event boundaries: one chunk may carry several events, and
//! a JSON payload may be split across two chunks. The buffer accumulates
//! partial lines and emits complete events only when a full line arrives.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::mem;

use super::{ChatStream, StreamChunk};
use crate::error::{AppError, Result};

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped.
    Data(String),
    /// The `[DONE]` termination signal (OpenAI convention).
    Done,
}

/// Accumulates raw bytes and yields complete SSE events.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from one TCP chunk, returning any complete events.
    /// A trailing partial line stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[newline_pos + 1..].to_owned();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing partial line when the byte stream ends.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = mem::take(&mut self.buffer);
        parse_line(&remaining).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "data: [DONE]" {
        return Some(SseEvent::Done);
    }
    // Non-data SSE fields (event:, id:, retry:, comments) are ignored.
    let data = trimmed.strip_prefix("data: ")?;
    if data.trim().is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_owned()))
}

/// Wrap a raw byte stream into a [`ChatStream`], applying line buffering
/// and a provider-specific `parse_data` closure per `data:` payload.
///
/// `parse_data` returns `None` for events that carry no output (empty
/// deltas, metadata-only chunks); those are skipped.
pub fn sse_chunk_stream<S, F>(byte_stream: S, parse_data: F, service: &'static str) -> ChatStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    F: Fn(&str) -> Option<Result<StreamChunk>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut byte_stream = Box::pin(byte_stream);
        let mut buffer = SseLineBuffer::new();
        let mut done = false;

        while let Some(next) = byte_stream.next().await {
            match next {
                Ok(bytes) => {
                    for event in buffer.feed(&bytes) {
                        match event {
                            SseEvent::Data(payload) => {
                                if let Some(result) = parse_data(&payload) {
                                    yield result;
                                }
                            }
                            SseEvent::Done => {
                                done = true;
                                yield Ok(StreamChunk {
                                    delta: String::new(),
                                    is_final: true,
                                    finish_reason: Some("stop".to_owned()),
                                });
                            }
                        }
                    }
                    if done {
                        return;
                    }
                }
                Err(e) => {
                    yield Err(AppError::external(service, format!("stream read error: {e}")));
                    return;
                }
            }
        }

        for event in buffer.flush() {
            match event {
                SseEvent::Data(payload) => {
                    if let Some(result) = parse_data(&payload) {
                        yield result;
                    }
                }
                SseEvent::Done => {
                    yield Ok(StreamChunk {
                        delta: String::new(),
                        is_final: true,
                        finish_reason: Some("stop".to_owned()),
                    });
                }
            }
        }
    })
}
