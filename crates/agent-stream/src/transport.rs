//! SSE decoding for OpenAI-compatible `chat.completion.chunk` streams.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::content::{MessageContent, RawChunk, ToolCallChunk, UsageMetadata};
use crate::errors::StreamError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame decoder; frames may span any number of pushes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Buffers `chunk` and returns every frame completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            let frame = parse_sse_frame(&self.buf[..idx]);
            self.buf.drain(..idx + delim_len);
            frames.extend(frame);
        }
        frames
    }

    /// Decodes a trailing frame the server did not terminate.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_frame(&rest)
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else {
            None
        }
    })
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Maps one SSE frame to a raw chunk. `[DONE]`, keep-alives and frames that
/// carry nothing map to `None`.
pub fn map_frame(frame: &SseFrame) -> Result<Option<RawChunk>, StreamError> {
    let data = frame.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| StreamError::producer(format!("invalid SSE JSON frame: {e}")))?;
    map_completion_chunk(&value)
}

/// Maps a decoded `chat.completion.chunk` object to a raw chunk.
pub fn map_completion_chunk(value: &serde_json::Value) -> Result<Option<RawChunk>, StreamError> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("stream error");
        return Err(StreamError::producer(message));
    }

    let mut chunk = RawChunk {
        id: value.get("id").and_then(|v| v.as_str()).map(ToOwned::to_owned),
        usage_metadata: value.get("usage").and_then(map_usage),
        ..RawChunk::default()
    };

    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first());
    if let Some(choice) = choice {
        chunk.finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned);
        if let Some(delta) = choice.get("delta") {
            let text = |key: &str| delta.get(key).and_then(|v| v.as_str()).map(ToOwned::to_owned);
            if let Some(content) = text("content") {
                chunk.content = MessageContent::Text(content);
            }
            chunk.additional_fields.reasoning = text("reasoning");
            chunk.additional_fields.reasoning_content = text("reasoning_content");
            if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                chunk.tool_call_chunks = calls.iter().map(map_tool_call_delta).collect();
            }
        }
    }

    let empty = matches!(&chunk.content, MessageContent::Text(t) if t.is_empty())
        && chunk.tool_call_chunks.is_empty()
        && chunk.additional_fields.reasoning.is_none()
        && chunk.additional_fields.reasoning_content.is_none()
        && chunk.usage_metadata.is_none()
        && chunk.finish_reason.is_none();
    Ok((!empty).then_some(chunk))
}

fn map_tool_call_delta(call: &serde_json::Value) -> ToolCallChunk {
    let function = call.get("function");
    let field = |value: Option<&serde_json::Value>, key: &str| {
        value
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
    };
    ToolCallChunk {
        index: call
            .get("index")
            .and_then(|v| v.as_u64())
            .and_then(|i| u32::try_from(i).ok()),
        id: field(Some(call), "id"),
        name: field(function, "name"),
        args_fragment: field(function, "arguments").unwrap_or_default(),
    }
}

fn map_usage(usage: &serde_json::Value) -> Option<UsageMetadata> {
    let count = |key: &str| usage.get(key).and_then(|v| v.as_u64());
    let input = count("prompt_tokens")?;
    let output = count("completion_tokens").unwrap_or(0);
    Some(UsageMetadata {
        input_tokens: input,
        output_tokens: output,
        total_tokens: count("total_tokens").unwrap_or_else(|| input.saturating_add(output)),
    })
}

type ByteStream<E> = Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, E>> + Send>>;

/// Turns an SSE byte stream into raw chunks. Transport errors and error
/// frames end the stream with a producer error.
pub fn sse_chunk_stream<S, E>(
    bytes_stream: S,
) -> impl futures::Stream<Item = Result<RawChunk, StreamError>> + Send
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    struct State<E> {
        bytes_stream: ByteStream<E>,
        decoder: SseDecoder,
        pending: VecDeque<RawChunk>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream: Box::pin(bytes_stream) as ByteStream<E>,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(Some((chunk, state)));
                }
                if state.done {
                    return Ok(None);
                }
                let frames = match state.bytes_stream.next().await {
                    Some(Ok(bytes)) => state.decoder.push_chunk(&bytes),
                    Some(Err(e)) => {
                        return Err(StreamError::producer(format!("stream read failed: {e}")));
                    }
                    None => {
                        state.done = true;
                        state.decoder.finish().into_iter().collect()
                    }
                };
                for frame in &frames {
                    if let Some(chunk) = map_frame(frame)? {
                        state.pending.push_back(chunk);
                    }
                }
                if !frames.is_empty() {
                    debug!(frames = frames.len(), queued = state.pending.len(), "sse frames decoded");
                }
            }
        },
    )
}
