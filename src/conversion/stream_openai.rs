use std::collections::HashMap;
use std::pin::Pin;

use async_stream::stream;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use serde_json::{Value, json};
use tokio_sse_codec::{Frame, SseDecoder};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::stop_reason_to_finish_reason;
use crate::error::AppError;
use crate::models::{
    claude::{AnthropicStreamEvent, ContentBlock, Delta},
    openai::{
        OpenAIDelta, OpenAIStreamChoice, OpenAIStreamChunk, OpenAIStreamFunction,
        OpenAIStreamToolCall, OpenAIUsage,
    },
};

/// Content-block state machine for the Anthropic -> OpenAI direction.
/// Anthropic block indices map onto densely numbered OpenAI tool-call
/// indices; text and thinking deltas pass through as content fragments.
#[derive(Debug)]
pub struct OpenAiStreamState {
    model: String,
    chunk_id: String,
    created: i64,
    block_to_tool: HashMap<u32, u32>,
    tool_count: u32,
    finish_reason: Option<String>,
    prompt_tokens: u32,
    output_tokens: u32,
    finished: bool,
}

impl OpenAiStreamState {
    pub fn new(model: &str) -> Self {
        let now = Utc::now();
        Self {
            model: model.to_string(),
            chunk_id: format!("chatcmpl-{}", now.timestamp_millis()),
            created: now.timestamp(),
            block_to_tool: HashMap::new(),
            tool_count: 0,
            finish_reason: None,
            prompt_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn process_event(&mut self, event: AnthropicStreamEvent) -> Vec<OpenAIStreamChunk> {
        match event {
            AnthropicStreamEvent::MessageStart(start) => {
                self.prompt_tokens = start.message.usage.input_tokens;
                vec![self.chunk(
                    OpenAIDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..Default::default()
                    },
                    None,
                )]
            }
            AnthropicStreamEvent::ContentBlockStart(start) => match start.content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.tool_count;
                    self.tool_count += 1;
                    self.block_to_tool.insert(start.index, tool_index);
                    vec![self.chunk(
                        OpenAIDelta {
                            tool_calls: Some(vec![OpenAIStreamToolCall {
                                index: tool_index,
                                id: Some(id),
                                call_type: Some("function".to_string()),
                                function: Some(OpenAIStreamFunction {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    )]
                }
                ContentBlock::Text { .. } | ContentBlock::Thinking { .. } => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta(delta) => match delta.delta {
                Delta::Text { text } => vec![self.chunk(
                    OpenAIDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )],
                Delta::Thinking { thinking } => vec![self.chunk(
                    OpenAIDelta {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    },
                    None,
                )],
                Delta::InputJson { partial_json } => {
                    let Some(&tool_index) = self.block_to_tool.get(&delta.index) else {
                        return Vec::new();
                    };
                    vec![self.chunk(
                        OpenAIDelta {
                            tool_calls: Some(vec![OpenAIStreamToolCall {
                                index: tool_index,
                                function: Some(OpenAIStreamFunction {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        },
                        None,
                    )]
                }
                Delta::Signature { .. } => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta(message_delta) => {
                self.finish_reason = Some(
                    stop_reason_to_finish_reason(message_delta.delta.stop_reason.as_deref())
                        .to_string(),
                );
                self.output_tokens = message_delta.usage.output_tokens;
                Vec::new()
            }
            AnthropicStreamEvent::MessageStop(_) => vec![self.terminal_chunk()],
            AnthropicStreamEvent::ContentBlockStop(_) | AnthropicStreamEvent::Ping(_) => Vec::new(),
        }
    }

    /// Empty-delta chunk carrying the finish reason and final usage.
    pub fn terminal_chunk(&mut self) -> OpenAIStreamChunk {
        self.finished = true;
        let finish = self
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".to_string());
        let mut chunk = self.chunk(OpenAIDelta::default(), Some(finish));
        chunk.usage = Some(OpenAIUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.prompt_tokens + self.output_tokens,
        });
        chunk
    }

    fn chunk(&self, delta: OpenAIDelta, finish_reason: Option<String>) -> OpenAIStreamChunk {
        OpenAIStreamChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            choices: vec![OpenAIStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            model: self.model.clone(),
            usage: None,
        }
    }
}

pub fn emit_chunk(chunk: &OpenAIStreamChunk) -> Bytes {
    let data = serde_json::to_string(chunk).unwrap_or_default();
    debug!("Emitting chunk: {data}");
    Bytes::from(format!("data: {data}\n\n"))
}

pub fn emit_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn emit_error(message: &str) -> Bytes {
    let data = json!({
        "error": {
            "message": message,
            "type": "stream_error",
            "code": "stream_failed",
        }
    });
    Bytes::from(format!("data: {data}\n\n"))
}

/// Consumes an Anthropic SSE response and yields OpenAI-shaped chunks
/// terminated by a single `[DONE]` sentinel.
pub fn convert_anthropic_stream_to_openai(
    response: reqwest::Response,
    model: &str,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> {
    let byte_stream = response.bytes_stream().map_err(AppError::from);
    let stream_reader = StreamReader::new(byte_stream);

    let event_stream =
        FramedRead::new(stream_reader, SseDecoder::<String>::new()).filter_map(|frame| async {
            match frame {
                Ok(Frame::Event(event)) => parse_event(&event.data),
                Ok(_) => None,
                Err(e) => Some(Err(AppError::from(e))),
            }
        });

    let mut state = OpenAiStreamState::new(model);

    Box::pin(stream! {
        let mut events = Box::pin(event_stream);
        let mut terminated = false;
        while let Some(next) = events.next().await {
            match next {
                Ok(event) => {
                    for chunk in state.process_event(event) {
                        yield Ok(emit_chunk(&chunk));
                    }
                    if state.is_finished() {
                        terminated = true;
                        break;
                    }
                }
                Err(e) => {
                    yield Ok(emit_error(&e.to_string()));
                    terminated = true;
                    break;
                }
            }
        }

        // Upstream closing without message_stop still terminates cleanly.
        if !state.is_finished() && !terminated {
            yield Ok(emit_chunk(&state.terminal_chunk()));
        }
        yield Ok(emit_done());
    })
}

fn parse_event(data: &str) -> Option<Result<AnthropicStreamEvent, AppError>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            return Some(Err(AppError::Stream(format!(
                "Failed to parse stream event: {e}, data: {data}"
            ))));
        }
    };
    if value["type"].as_str() == Some("error") {
        let message = value["error"]["message"]
            .as_str()
            .unwrap_or("upstream stream error")
            .to_string();
        return Some(Err(AppError::Stream(message)));
    }
    match serde_json::from_value::<AnthropicStreamEvent>(value) {
        Ok(event) => Some(Ok(event)),
        // Unknown event types are forward-compatible noise.
        Err(_) => None,
    }
}
