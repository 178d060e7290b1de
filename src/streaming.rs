use crate::logging::StreamMetric;
use crate::specs::google::GoogleResponse;
use crate::specs::openai::OpenAiStreamChunk;
use crate::types::*;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// What a decoder makes of the bytes it has seen so far.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    Delta(StreamDelta),
    /// The provider signalled a clean end of stream.
    Done,
    /// A tool call was emitted; stop reading and hand over to the dispatcher.
    Halt,
    /// The provider reported an error inside an otherwise successful response.
    Error(String),
}

/// Push-based protocol decoder. Chunk boundaries carry no meaning: feeding a
/// payload in any split must yield the same events as feeding it whole.
pub trait StreamDecoder: Send {
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecoderEvent>;

    /// Called once the body is exhausted.
    fn finish(&mut self) -> Vec<DecoderEvent>;

    /// Identifier of the upstream generation, when the protocol exposes one.
    fn generation_id(&self) -> Option<&str> {
        None
    }
}

/// --- OPENROUTER (SSE) ---

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    generation_id: Option<String>,
    tool_calls: BTreeMap<u32, PendingToolCall>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_line(&mut self, raw: &[u8], events: &mut Vec<DecoderEvent>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        let Some(data) = line.strip_prefix("data:") else {
            if line.starts_with(':') {
                tracing::trace!("[☁️  -> ⚙️ ] SSE comment: {}", line);
            }
            return;
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.finished = true;
            if !self.flush_tool_calls(events) {
                events.push(DecoderEvent::Done);
            }
            return;
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("[☁️  -> ⚙️ ] Skipping malformed SSE frame: {} | {}", e, data);
                return;
            }
        };

        if let Some(err) = chunk.error {
            tracing::error!("[☁️  -> ⚙️ ] Provider error mid-stream: {}", err.message);
            self.finished = true;
            events.push(DecoderEvent::Error(err.message));
            return;
        }

        if self.generation_id.is_none() {
            if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
                tracing::debug!("[☁️  -> ⚙️ ] Generation id: {}", id);
                self.generation_id = Some(id);
            }
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            events.push(DecoderEvent::Delta(StreamDelta::Text(text)));
        }

        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let pending = self.tool_calls.entry(fragment.index).or_default();
            if pending.id.is_none() {
                pending.id = fragment.id.filter(|id| !id.is_empty());
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                    if pending.name.is_empty() {
                        pending.name = name;
                    }
                }
                if let Some(args) = function.arguments {
                    pending.arguments.push_str(&args);
                }
            }
        }

        if choice.finish_reason.is_some() && self.flush_tool_calls(events) {
            self.finished = true;
        }
    }

    /// Emits accumulated tool calls in index order. Returns true if any were
    /// emitted, in which case a `Halt` follows them.
    fn flush_tool_calls(&mut self, events: &mut Vec<DecoderEvent>) -> bool {
        if self.tool_calls.is_empty() {
            return false;
        }
        for (_, pending) in std::mem::take(&mut self.tool_calls) {
            let id = pending.id.unwrap_or_else(|| ToolCallId::new().0);
            let arguments = if pending.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                pending.arguments
            };
            events.push(DecoderEvent::Delta(StreamDelta::ToolCall(ToolCall::function(
                id,
                pending.name,
                arguments,
            ))));
        }
        events.push(DecoderEvent::Halt);
        true
    }
}

impl StreamDecoder for SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.process_line(&line[..pos], &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.buffer.is_empty() {
            let tail = self.buffer.split();
            self.process_line(&tail, &mut events);
        }
        if !self.finished {
            self.flush_tool_calls(&mut events);
            self.finished = true;
        }
        events
    }

    fn generation_id(&self) -> Option<&str> {
        self.generation_id.as_deref()
    }
}

/// --- GOOGLE (CONCATENATED JSON) ---

/// Pulls complete top-level JSON objects out of a byte stream that carries
/// them back to back with arbitrary separators in between.
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buffer: BytesMut,
    search_from: usize,
}

enum Span {
    Complete(usize, usize),
    Partial(usize),
    NoObject,
}

impl JsonObjectScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for the rest of an object.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    fn locate(&self) -> Span {
        let Some(offset) = self.buffer[self.search_from..].iter().position(|b| *b == b'{') else {
            return Span::NoObject;
        };
        let start = self.search_from + offset;

        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, byte) in self.buffer[start..].iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Span::Complete(start, start + i);
                    }
                }
                _ => {}
            }
        }
        Span::Partial(start)
    }

    /// Next complete object, or `None` if the buffer holds no complete one.
    pub fn next_object(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.locate() {
                Span::NoObject => {
                    self.buffer.clear();
                    self.search_from = 0;
                    return None;
                }
                Span::Partial(start) => {
                    self.buffer.advance(start);
                    self.search_from = 0;
                    return None;
                }
                Span::Complete(start, end) => {
                    match serde_json::from_slice::<serde_json::Value>(&self.buffer[start..=end]) {
                        Ok(value) => {
                            self.buffer.advance(end + 1);
                            self.search_from = 0;
                            return Some(value);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "[☁️  -> ⚙️ ] Unparseable object at offset {}: {}",
                                start,
                                e
                            );
                            self.search_from = start + 1;
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct GoogleStreamDecoder {
    scanner: JsonObjectScanner,
    halted: bool,
}

impl GoogleStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_object(&mut self, value: serde_json::Value, events: &mut Vec<DecoderEvent>) {
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            tracing::error!("[☁️  -> ⚙️ ] Gemini error mid-stream: {}", message);
            self.halted = true;
            events.push(DecoderEvent::Error(message));
            return;
        }

        let response: GoogleResponse = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[☁️  -> ⚙️ ] Skipping unexpected Gemini object: {}", e);
                return;
            }
        };

        if let Some(usage) = response.usage_metadata {
            events.push(DecoderEvent::Delta(StreamDelta::Usage(usage.into())));
        }

        let parts = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default();

        let mut text = String::new();
        let mut reasoning = String::new();
        for part in parts {
            if let Some(call) = part.function_call {
                flush_text(&mut reasoning, &mut text, events);
                let arguments = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".into());
                tracing::info!("[☁️  -> ⚙️ ] Gemini function call: {}", call.name);
                events.push(DecoderEvent::Delta(StreamDelta::ToolCall(ToolCall::function(
                    ToolCallId::new().0,
                    call.name,
                    arguments,
                ))));
                events.push(DecoderEvent::Halt);
                self.halted = true;
                return;
            }
            if let Some(t) = part.text {
                if part.thought {
                    reasoning.push_str(&t);
                } else {
                    text.push_str(&t);
                }
            }
        }
        flush_text(&mut reasoning, &mut text, events);
    }
}

fn flush_text(reasoning: &mut String, text: &mut String, events: &mut Vec<DecoderEvent>) {
    if !reasoning.is_empty() {
        events.push(DecoderEvent::Delta(StreamDelta::Reasoning(std::mem::take(reasoning))));
    }
    if !text.is_empty() {
        events.push(DecoderEvent::Delta(StreamDelta::Text(std::mem::take(text))));
    }
}

impl StreamDecoder for GoogleStreamDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        if self.halted {
            return events;
        }
        self.scanner.push(chunk);
        while let Some(value) = self.scanner.next_object() {
            self.process_object(value, &mut events);
            if self.halted {
                break;
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<DecoderEvent> {
        let leftover = self.scanner.pending();
        if !self.halted && leftover.iter().any(|b| !b.is_ascii_whitespace() && *b != b']') {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Gemini stream ended inside an object ({} bytes dropped)",
                leftover.len()
            );
        }
        Vec::new()
    }
}

/// --- DRIVER ---

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    HaltedOnToolCall,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    pub generation_id: Option<String>,
    /// Last usage report seen in-band; later reports overwrite earlier ones.
    pub final_usage: Option<GenerationInfo>,
    pub tool_calls: Vec<ToolCall>,
    pub metric: StreamMetric,
}

pub struct StreamHandler;

impl StreamHandler {
    /// Reads `body` to completion (or until a tool call, error or abort),
    /// handing every content delta to `sink`.
    ///
    /// `sink` returns `false` when the turn has been aborted under it; the
    /// read stops there and the outcome is `Cancelled`.
    pub async fn drive<S, E, F>(
        body: S,
        decoder: &mut dyn StreamDecoder,
        token: &CancellationToken,
        mut sink: F,
    ) -> StreamSummary
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::fmt::Display,
        F: FnMut(StreamDelta) -> bool,
    {
        let mut body = Box::pin(body);
        let mut summary = StreamSummary {
            outcome: StreamOutcome::Completed,
            generation_id: None,
            final_usage: None,
            tool_calls: Vec::new(),
            metric: StreamMetric::new(),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    summary.outcome = StreamOutcome::Cancelled;
                    break;
                }
                item = body.next() => item,
            };

            let events = match next {
                Some(Ok(bytes)) => {
                    summary.metric.record_chunk(bytes.len());
                    decoder.feed(&bytes)
                }
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Body read failed: {}", e);
                    summary.outcome = StreamOutcome::Failed(format!("Failed to read response: {}", e));
                    break;
                }
                None => {
                    let events = decoder.finish();
                    if let Some(outcome) = Self::apply(events, &mut summary, &mut sink) {
                        summary.outcome = outcome;
                    }
                    break;
                }
            };

            if let Some(outcome) = Self::apply(events, &mut summary, &mut sink) {
                summary.outcome = outcome;
                break;
            }
        }

        summary.generation_id = decoder.generation_id().map(str::to_string);
        summary.metric.log_summary(&summary.outcome);
        summary
    }

    fn apply<F>(
        events: Vec<DecoderEvent>,
        summary: &mut StreamSummary,
        sink: &mut F,
    ) -> Option<StreamOutcome>
    where
        F: FnMut(StreamDelta) -> bool,
    {
        for event in events {
            match event {
                DecoderEvent::Delta(StreamDelta::Usage(usage)) => {
                    summary.final_usage = Some(usage);
                }
                DecoderEvent::Delta(delta) => {
                    summary.metric.record_delta(&delta);
                    if let StreamDelta::ToolCall(call) = &delta {
                        summary.tool_calls.push(call.clone());
                    }
                    if !sink(delta) {
                        return Some(StreamOutcome::Cancelled);
                    }
                }
                DecoderEvent::Done => return Some(StreamOutcome::Completed),
                DecoderEvent::Halt => return Some(StreamOutcome::HaltedOnToolCall),
                DecoderEvent::Error(message) => return Some(StreamOutcome::Failed(message)),
            }
        }
        None
    }
}
