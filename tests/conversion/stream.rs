use serde_json::{Value, json};

use polygate::conversion::{convert_anthropic_stream_to_openai, convert_openai_stream_to_anthropic};
use polygate::models::claude::{AnthropicStreamEvent, ContentBlock, Delta};

use crate::helpers::{
    anthropic_sse, collect_anthropic_events, collect_frames, collect_openai_chunks,
    mock_sse_response, openai_sse,
};

fn text_chunk(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
}

fn reasoning_chunk(reasoning: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {"reasoning_content": reasoning}, "finish_reason": null}]
    })
}

fn tool_chunk(index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Value {
    let mut call = json!({"index": index, "function": {}});
    if let Some(id) = id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    if let Some(name) = name {
        call["function"]["name"] = json!(name);
    }
    if let Some(arguments) = arguments {
        call["function"]["arguments"] = json!(arguments);
    }
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {"tool_calls": [call]}, "finish_reason": null}]
    })
}

fn final_chunk(finish_reason: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]
    })
}

fn usage_chunk(prompt: u32, completion: u32) -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4",
        "choices": [],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion}
    })
}

#[tokio::test]
async fn openai_text_stream_translates_to_anthropic_envelope() {
    let payload = openai_sse(&[text_chunk("he"), text_chunk("llo"), final_chunk("stop")]);
    let stream = convert_openai_stream_to_anthropic(mock_sse_response(payload), "claude-3-sonnet");
    let events = collect_anthropic_events(stream).await;

    assert_eq!(events.len(), 7);
    assert!(matches!(&events[0], AnthropicStreamEvent::MessageStart(start)
        if start.message.model == "claude-3-sonnet"));
    assert!(matches!(&events[1], AnthropicStreamEvent::ContentBlockStart(start)
        if start.index == 0 && matches!(&start.content_block, ContentBlock::Text { .. })));
    assert!(matches!(&events[2], AnthropicStreamEvent::ContentBlockDelta(delta)
        if matches!(&delta.delta, Delta::Text { text } if text == "he")));
    assert!(matches!(&events[3], AnthropicStreamEvent::ContentBlockDelta(delta)
        if matches!(&delta.delta, Delta::Text { text } if text == "llo")));
    assert!(matches!(&events[4], AnthropicStreamEvent::ContentBlockStop(stop) if stop.index == 0));
    assert!(matches!(&events[5], AnthropicStreamEvent::MessageDelta(delta)
        if delta.delta.stop_reason.as_deref() == Some("end_turn")));
    assert!(matches!(&events[6], AnthropicStreamEvent::MessageStop(_)));
}

#[tokio::test]
async fn openai_tool_stream_opens_tool_block_and_accumulates_json() {
    let payload = openai_sse(&[
        tool_chunk(0, Some("call_1"), Some("lookup"), Some("{\"city\":")),
        tool_chunk(0, None, None, Some("\"SF\"}")),
        final_chunk("tool_calls"),
    ]);
    let stream = convert_openai_stream_to_anthropic(mock_sse_response(payload), "claude-3-sonnet");
    let events = collect_anthropic_events(stream).await;

    assert!(matches!(&events[1], AnthropicStreamEvent::ContentBlockStart(start)
        if matches!(&start.content_block, ContentBlock::ToolUse { id, name, .. }
            if id == "call_1" && name == "lookup")));

    let fragments: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockDelta(delta) => match &delta.delta {
                Delta::InputJson { partial_json } => Some(partial_json.as_str()),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(fragments.concat(), "{\"city\":\"SF\"}");

    assert!(events.iter().any(|e| matches!(e,
        AnthropicStreamEvent::MessageDelta(delta)
            if delta.delta.stop_reason.as_deref() == Some("tool_use"))));
}

/// Every opened content block is closed, in insertion order, at finish.
#[tokio::test]
async fn mixed_stream_balances_block_starts_and_stops() {
    let payload = openai_sse(&[
        reasoning_chunk("hmm"),
        text_chunk("answer"),
        tool_chunk(0, Some("c1"), Some("search"), Some("{}")),
        tool_chunk(1, Some("c2"), Some("fetch"), Some("{}")),
        final_chunk("tool_calls"),
    ]);
    let stream = convert_openai_stream_to_anthropic(mock_sse_response(payload), "claude-3-sonnet");
    let events = collect_anthropic_events(stream).await;

    let starts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockStart(start) => Some(start.index),
            _ => None,
        })
        .collect();
    let stops: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            AnthropicStreamEvent::ContentBlockStop(stop) => Some(stop.index),
            _ => None,
        })
        .collect();

    assert_eq!(starts, vec![0, 1, 2, 3]);
    assert_eq!(starts, stops);
    assert!(matches!(&events[1], AnthropicStreamEvent::ContentBlockStart(start)
        if matches!(start.content_block, ContentBlock::Thinking { .. })));
}

/// Usage arriving on a trailing chunk after finish_reason still lands in
/// the final message_delta.
#[tokio::test]
async fn trailing_usage_chunk_feeds_message_delta() {
    let payload = openai_sse(&[text_chunk("hi"), final_chunk("stop"), usage_chunk(5, 9)]);
    let stream = convert_openai_stream_to_anthropic(mock_sse_response(payload), "claude-3-sonnet");
    let events = collect_anthropic_events(stream).await;

    let usage = events
        .iter()
        .find_map(|e| match e {
            AnthropicStreamEvent::MessageDelta(delta) => Some(&delta.usage),
            _ => None,
        })
        .expect("message_delta expected");
    assert_eq!(usage.output_tokens, 9);
}

#[tokio::test]
async fn malformed_chunk_surfaces_stream_error_event() {
    let payload = "data: {not valid json\n\n".to_string();
    let stream = convert_openai_stream_to_anthropic(mock_sse_response(payload), "claude-3-sonnet");
    let frames = collect_frames(stream).await;

    let error_frame = frames
        .iter()
        .find(|f| f.contains("stream_failed"))
        .expect("terminal error event expected");
    assert!(error_frame.contains("stream_error"));
}

fn anthropic_text_events() -> Vec<Value> {
    vec![
        json!({"type": "message_start", "message": {
            "id": "msg_1", "type": "message", "role": "assistant", "content": [],
            "model": "claude-3-sonnet", "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 3, "output_tokens": 0}
        }}),
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": "he"}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": "llo"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn", "stop_sequence": null},
               "usage": {"output_tokens": 2}}),
        json!({"type": "message_stop"}),
    ]
}

#[tokio::test]
async fn anthropic_text_stream_translates_to_openai_chunks() {
    let payload = anthropic_sse(&anthropic_text_events());
    let stream = convert_anthropic_stream_to_openai(mock_sse_response(payload), "gpt-4");
    let (chunks, done_count) = collect_openai_chunks(stream).await;

    assert_eq!(done_count, 1);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "he");
    assert_eq!(chunks[2]["choices"][0]["delta"]["content"], "llo");

    let terminal = chunks.last().expect("terminal chunk expected");
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    assert_eq!(terminal["usage"]["prompt_tokens"], 3);
    assert_eq!(terminal["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn anthropic_tool_stream_maps_block_indices_to_dense_tool_indices() {
    let payload = anthropic_sse(&[
        json!({"type": "message_start", "message": {
            "id": "msg_1", "type": "message", "role": "assistant", "content": [],
            "model": "claude-3-sonnet", "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 1, "output_tokens": 0}
        }}),
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0,
               "delta": {"type": "text_delta", "text": "checking"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "content_block_start", "index": 1,
               "content_block": {"type": "tool_use", "id": "t1", "name": "search", "input": {}}}),
        json!({"type": "content_block_delta", "index": 1,
               "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
        json!({"type": "content_block_delta", "index": 1,
               "delta": {"type": "input_json_delta", "partial_json": "\"rust\"}"}}),
        json!({"type": "content_block_stop", "index": 1}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use", "stop_sequence": null},
               "usage": {"output_tokens": 6}}),
        json!({"type": "message_stop"}),
    ]);
    let stream = convert_anthropic_stream_to_openai(mock_sse_response(payload), "gpt-4");
    let (chunks, done_count) = collect_openai_chunks(stream).await;

    assert_eq!(done_count, 1);

    let open = chunks
        .iter()
        .find(|c| c["choices"][0]["delta"]["tool_calls"][0]["id"] == "t1")
        .expect("tool-call open chunk expected");
    // Anthropic block index 1 becomes the first OpenAI tool index.
    assert_eq!(open["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
    assert_eq!(
        open["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
        "search"
    );

    let arguments: String = chunks
        .iter()
        .filter_map(|c| {
            c["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"].as_str()
        })
        .collect();
    assert_eq!(arguments, "{\"q\":\"rust\"}");

    let terminal = chunks.last().expect("terminal chunk expected");
    assert_eq!(terminal["choices"][0]["finish_reason"], "tool_calls");
}

#[tokio::test]
async fn upstream_error_event_terminates_openai_stream() {
    let payload = anthropic_sse(&[
        json!({"type": "message_start", "message": {
            "id": "msg_1", "type": "message", "role": "assistant", "content": [],
            "model": "claude-3-sonnet", "stop_reason": null, "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }}),
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "overloaded"}}),
    ]);
    let stream = convert_anthropic_stream_to_openai(mock_sse_response(payload), "gpt-4");
    let frames = collect_frames(stream).await;

    assert!(frames.iter().any(|f| f.contains("stream_failed")));
    assert_eq!(frames.iter().filter(|f| *f == "[DONE]").count(), 1);
}

/// A stream that drops before message_stop still terminates the client
/// side with a finish chunk and one [DONE].
#[tokio::test]
async fn truncated_anthropic_stream_still_terminates() {
    let mut events = anthropic_text_events();
    events.truncate(4);
    let payload = anthropic_sse(&events);
    let stream = convert_anthropic_stream_to_openai(mock_sse_response(payload), "gpt-4");
    let (chunks, done_count) = collect_openai_chunks(stream).await;

    assert_eq!(done_count, 1);
    let terminal = chunks.last().expect("terminal chunk expected");
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
}
