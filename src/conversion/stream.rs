use std::collections::HashMap;
use std::pin::Pin;

use async_stream::stream;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use serde_json::{Map, Value, json};
use tokio_sse_codec::{Frame, SseDecoder};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::finish_reason_to_stop_reason;
use crate::error::AppError;
use crate::models::{
    claude::{
        AnthropicStreamEvent, ClaudeStreamMessage, ClaudeUsage, ContentBlock, ContentBlockDelta,
        ContentBlockStart, ContentBlockStop, Delta, MessageDelta, MessageDeltaInfo,
        MessageDeltaUsage, MessageStart, MessageStop,
    },
    openai::{OpenAIStreamChunk, OpenAIStreamToolCall},
};

pub fn emit_event(event_type: &str, data: &impl serde::Serialize) -> Bytes {
    let data_str = serde_json::to_string(data).unwrap_or_default();
    debug!("Emitting event: {event_type}");
    Bytes::from(format!("event: {event_type}\ndata: {data_str}\n\n"))
}

pub fn emit_ping() -> Bytes {
    emit_event("ping", &json!({"type": "ping"}))
}

#[derive(Debug, Default)]
struct ToolBlock {
    block_index: Option<u32>,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Content-block state machine for the OpenAI -> Anthropic direction.
/// Blocks are opened lazily as deltas arrive and all closed, in insertion
/// order, when the upstream reports a finish reason.
#[derive(Debug)]
pub struct StreamState {
    model: String,
    message_id: String,
    next_block_index: u32,
    text_block_index: Option<u32>,
    thinking_block_index: Option<u32>,
    tool_blocks: HashMap<u32, ToolBlock>,
    open_blocks: Vec<u32>,
    input_tokens: u32,
    output_tokens: u32,
    finish_reason: Option<String>,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", Utc::now().timestamp_millis()),
            next_block_index: 0,
            text_block_index: None,
            thinking_block_index: None,
            tool_blocks: HashMap::new(),
            open_blocks: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: None,
        }
    }

    pub fn initial_event(&self) -> AnthropicStreamEvent {
        AnthropicStreamEvent::MessageStart(MessageStart {
            message: ClaudeStreamMessage {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: ClaudeUsage::default(),
            },
        })
    }

    pub fn process_chunk(&mut self, chunk: &OpenAIStreamChunk) -> Vec<AnthropicStreamEvent> {
        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > 0 {
                self.input_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                self.output_tokens = usage.completion_tokens;
            }
        }

        // After finish_reason only trailing usage chunks are expected.
        if self.finish_reason.is_some() {
            return Vec::new();
        }

        let mut events = Vec::new();
        for choice in &chunk.choices {
            let delta = &choice.delta;

            if let Some(reasoning) = delta.get_reasoning().filter(|r| !r.is_empty()) {
                let index = self.ensure_thinking_block(&mut events);
                events.push(AnthropicStreamEvent::ContentBlockDelta(ContentBlockDelta {
                    index,
                    delta: Delta::Thinking {
                        thinking: reasoning.clone(),
                    },
                }));
            }

            if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
                let index = self.ensure_text_block(&mut events);
                events.push(AnthropicStreamEvent::ContentBlockDelta(ContentBlockDelta {
                    index,
                    delta: Delta::Text {
                        text: content.to_string(),
                    },
                }));
            }

            // Refusal text streams like ordinary text content.
            if let Some(refusal) = delta.refusal.as_deref().filter(|r| !r.is_empty()) {
                let index = self.ensure_text_block(&mut events);
                events.push(AnthropicStreamEvent::ContentBlockDelta(ContentBlockDelta {
                    index,
                    delta: Delta::Text {
                        text: refusal.to_string(),
                    },
                }));
            }

            if let Some(tool_calls) = &delta.tool_calls {
                events.extend(self.handle_tool_fragments(tool_calls));
            }

            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        events
    }

    /// Stops every still-open block in insertion order, then reports the
    /// mapped stop reason and cumulative output usage.
    pub fn finalize(&mut self) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        for index in self.open_blocks.drain(..) {
            events.push(AnthropicStreamEvent::ContentBlockStop(ContentBlockStop {
                index,
            }));
        }
        let stop_reason = finish_reason_to_stop_reason(self.finish_reason.as_deref());
        events.push(AnthropicStreamEvent::MessageDelta(MessageDelta {
            delta: MessageDeltaInfo {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                input_tokens: None,
                output_tokens: self.output_tokens,
            },
        }));
        events.push(AnthropicStreamEvent::MessageStop(MessageStop {}));
        events
    }

    fn alloc_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_blocks.push(index);
        index
    }

    fn ensure_text_block(&mut self, events: &mut Vec<AnthropicStreamEvent>) -> u32 {
        if let Some(index) = self.text_block_index {
            return index;
        }
        let index = self.alloc_block();
        self.text_block_index = Some(index);
        events.push(AnthropicStreamEvent::ContentBlockStart(ContentBlockStart {
            index,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        }));
        index
    }

    fn ensure_thinking_block(&mut self, events: &mut Vec<AnthropicStreamEvent>) -> u32 {
        if let Some(index) = self.thinking_block_index {
            return index;
        }
        let index = self.alloc_block();
        self.thinking_block_index = Some(index);
        events.push(AnthropicStreamEvent::ContentBlockStart(ContentBlockStart {
            index,
            content_block: ContentBlock::Thinking {
                thinking: String::new(),
            },
        }));
        index
    }

    fn handle_tool_fragments(
        &mut self,
        fragments: &[OpenAIStreamToolCall],
    ) -> Vec<AnthropicStreamEvent> {
        let mut events = Vec::new();
        for fragment in fragments {
            let entry = self.tool_blocks.entry(fragment.index).or_default();
            if let Some(id) = &fragment.id {
                entry.id.get_or_insert_with(|| id.clone());
            }
            let Some(function) = &fragment.function else {
                continue;
            };

            if let Some(name) = &function.name
                && entry.block_index.is_none()
            {
                entry.name = Some(name.clone());
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.open_blocks.push(index);
                entry.block_index = Some(index);
                let tool_use_id = entry.id.clone().unwrap_or_else(|| {
                    format!("call_{}_{}", Utc::now().timestamp_millis(), fragment.index)
                });
                events.push(AnthropicStreamEvent::ContentBlockStart(ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id: tool_use_id,
                        name: name.clone(),
                        input: Value::Object(Map::new()),
                    },
                }));
            }

            if let Some(arguments) = function.arguments.as_deref().filter(|a| !a.is_empty()) {
                entry.arguments.push_str(arguments);
                if let Some(index) = entry.block_index {
                    events.push(AnthropicStreamEvent::ContentBlockDelta(ContentBlockDelta {
                        index,
                        delta: Delta::InputJson {
                            partial_json: arguments.to_string(),
                        },
                    }));
                }
            }
        }
        events
    }
}

/// Consumes an OpenAI SSE response and yields Anthropic-shaped SSE frames.
/// Upstream failure surfaces as a terminal `error` event; dropping the
/// returned stream cancels the upstream body.
pub fn convert_openai_stream_to_anthropic(
    response: reqwest::Response,
    model: &str,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> {
    let byte_stream = response.bytes_stream().map_err(AppError::from);
    let stream_reader = StreamReader::new(byte_stream);

    let chunk_stream =
        FramedRead::new(stream_reader, SseDecoder::<String>::new()).filter_map(|frame| async {
            match frame {
                Ok(Frame::Event(event)) => {
                    let data = &event.data;
                    if data == "[DONE]" {
                        return None;
                    }
                    match serde_json::from_str::<OpenAIStreamChunk>(data) {
                        Ok(chunk) => Some(Ok(chunk)),
                        Err(e) => Some(Err(AppError::Stream(format!(
                            "Failed to parse stream chunk: {e}, data: {data}"
                        )))),
                    }
                }
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });

    let mut state = StreamState::new(model);

    Box::pin(stream! {
        yield Ok(emit_bytes(&state.initial_event()));

        let mut chunks = Box::pin(chunk_stream);
        let mut ping_interval = tokio::time::interval(std::time::Duration::from_secs(30));
        ping_interval.tick().await;
        let mut failed = false;

        loop {
            tokio::select! {
                next = chunks.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            for event in state.process_chunk(&chunk) {
                                yield Ok(emit_bytes(&event));
                            }
                        }
                        Some(Err(e)) => {
                            yield Ok(emit_stream_error(&e.to_string()));
                            failed = true;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    yield Ok(emit_ping());
                }
            }
        }

        if !failed {
            for event in state.finalize() {
                yield Ok(emit_bytes(&event));
            }
        }
    })
}

pub fn emit_bytes(event: &AnthropicStreamEvent) -> Bytes {
    let (event_type, data) = event.to_parts();
    emit_event(event_type, &data)
}

pub fn emit_stream_error(message: &str) -> Bytes {
    emit_event(
        "error",
        &json!({
            "type": "error",
            "error": {
                "message": message,
                "type": "stream_error",
                "code": "stream_failed",
            }
        }),
    )
}
