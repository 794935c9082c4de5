use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::provider::{ChatStream, StreamChunk, TokenUsage};

pub type ByteSource = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server-sent-events reader over a byte stream.
///
/// Lines are split on raw bytes so multi-byte characters cut across network
/// chunks decode correctly. Every read is bounded by `idle_timeout`.
pub struct SseReader {
    source: ByteSource,
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    idle_timeout: Duration,
    finished: bool,
}

impl SseReader {
    pub fn new(source: ByteSource, idle_timeout: Duration) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            idle_timeout,
            finished: false,
        }
    }

    pub fn from_response(response: reqwest::Response, idle_timeout: Duration) -> Self {
        let source = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| Error::model_provider(format!("Stream read error: {}", e)))
        });
        Self::new(Box::pin(source), idle_timeout)
    }

    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            while let Some(line) = self.take_line()? {
                if let Some(event) = self.process_line(&line) {
                    return Ok(Some(event));
                }
            }

            if self.finished {
                // A final line without a trailing newline still counts.
                if !self.buffer.is_empty() {
                    let rest = std::mem::take(&mut self.buffer);
                    let line = decode_line(&rest)?;
                    if let Some(event) = self.process_line(&line) {
                        return Ok(Some(event));
                    }
                }
                return Ok(self.dispatch());
            }

            let next = tokio::time::timeout(self.idle_timeout, self.source.next())
                .await
                .map_err(|_| Error::StreamTimeout {
                    seconds: self.idle_timeout.as_secs(),
                })?;

            match next {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => self.finished = true,
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<String>> {
        let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let rest = self.buffer.split_off(newline_pos + 1);
        let line = std::mem::replace(&mut self.buffer, rest);
        decode_line(&line[..newline_pos]).map(Some)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => debug!("Ignoring SSE field: {}", field),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| Error::model_provider(format!("Invalid UTF-8 in stream: {}", e)))
}

/// Provider-specific translation from SSE events to normalized chunks.
pub trait EventDecoder: Send {
    /// Consumes one event, queueing any chunks ready for the caller. Returns
    /// true once the provider's terminal marker has been seen.
    fn decode(&mut self, event: &SseEvent, out: &mut VecDeque<StreamChunk>) -> Result<bool>;

    /// Whether the provider signalled a complete generation, so that end of
    /// input is a clean finish rather than a truncated stream.
    fn is_complete(&self) -> bool;

    /// Usage reconciled so far.
    fn usage(&self) -> Option<TokenUsage>;

    /// Flushes outstanding tool calls. The terminal chunk is added by the
    /// stream.
    fn flush(&mut self, out: &mut VecDeque<StreamChunk>);
}

/// A `ChatStream` over an SSE body, driven by a provider's decoder.
pub struct SseChatStream<D: EventDecoder> {
    reader: SseReader,
    decoder: D,
    pending: VecDeque<StreamChunk>,
    finished: bool,
    provider: &'static str,
}

impl<D: EventDecoder> SseChatStream<D> {
    pub fn new(reader: SseReader, decoder: D, provider: &'static str) -> Self {
        Self {
            reader,
            decoder,
            pending: VecDeque::new(),
            finished: false,
            provider,
        }
    }

    fn complete(&mut self) {
        self.decoder.flush(&mut self.pending);
        self.pending.push_back(StreamChunk::done(self.decoder.usage()));
        self.finished = true;
    }
}

#[async_trait]
impl<D: EventDecoder> ChatStream for SseChatStream<D> {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.finished {
                return Ok(None);
            }

            match self.reader.next_event().await? {
                Some(event) => {
                    if self.decoder.decode(&event, &mut self.pending)? {
                        self.complete();
                    }
                }
                None => {
                    if !self.decoder.is_complete() {
                        return Err(Error::model_provider(format!(
                            "{} stream ended before completion",
                            self.provider
                        )));
                    }
                    self.complete();
                }
            }
        }
    }

    fn usage_so_far(&self) -> Option<TokenUsage> {
        self.decoder.usage()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use futures_util::stream;

    /// A reader over fixed byte chunks, as if they arrived from the network.
    pub fn reader_from_chunks(chunks: Vec<&str>) -> SseReader {
        let owned: Vec<Result<Vec<u8>>> = chunks.into_iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        SseReader::new(Box::pin(stream::iter(owned)), Duration::from_secs(5))
    }

    /// Runs a decoder over a transcript and collects everything it emits.
    pub async fn collect<D: EventDecoder>(decoder: D, transcript: &str) -> Result<Vec<StreamChunk>> {
        let mut stream = SseChatStream::new(reader_from_chunks(vec![transcript]), decoder, "test");
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}
