mod stream;

use rstest::rstest;
use serde_json::json;

use polygate::conversion::{
    claude_response_to_openai, claude_to_openai, finish_reason_to_stop_reason, openai_to_claude,
    openai_response_to_claude, stop_reason_to_finish_reason,
};
use polygate::models::{
    claude::{ClaudeContent, ClaudeMessagesRequest},
    openai::{OpenAIContent, OpenAIRequest},
};

#[rstest]
#[case(Some("tool_calls"), "tool_use")]
#[case(Some("length"), "max_tokens")]
#[case(Some("content_filter"), "refusal")]
#[case(Some("stop"), "end_turn")]
#[case(None, "end_turn")]
fn finish_reason_mapping(#[case] finish: Option<&str>, #[case] stop: &str) {
    assert_eq!(finish_reason_to_stop_reason(finish), stop);
}

#[rstest]
#[case(Some("tool_use"), "tool_calls")]
#[case(Some("max_tokens"), "length")]
#[case(Some("end_turn"), "stop")]
#[case(Some("stop_sequence"), "stop")]
#[case(None, "stop")]
fn stop_reason_mapping(#[case] stop: Option<&str>, #[case] finish: &str) {
    assert_eq!(stop_reason_to_finish_reason(stop), finish);
}

fn openai_request(value: serde_json::Value) -> OpenAIRequest {
    serde_json::from_value(value).expect("test request must deserialize")
}

fn claude_request(value: serde_json::Value) -> ClaudeMessagesRequest {
    serde_json::from_value(value).expect("test request must deserialize")
}

#[test]
fn openai_system_messages_coalesce() {
    let request = openai_request(json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "one"},
            {"role": "system", "content": "two"},
            {"role": "user", "content": "hi"}
        ]
    }));

    let converted = openai_to_claude(&request, "claude-3-sonnet", 4096);
    assert_eq!(
        converted.system.as_ref().map(|s| s.to_text()),
        Some("one\ntwo".to_string())
    );
    assert_eq!(converted.messages.len(), 1);
    assert_eq!(converted.messages[0].role, "user");
    assert_eq!(converted.max_tokens, 4096);
}

#[test]
fn openai_tool_message_becomes_tool_result_user_message() {
    let request = openai_request(json!({
        "model": "gpt-4",
        "messages": [
            {"role": "user", "content": "weather?"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "lookup", "arguments": "{\"city\":\"SF\"}"}}
            ]},
            {"role": "tool", "tool_call_id": "c1", "content": "sunny"}
        ]
    }));

    let converted = openai_to_claude(&request, "claude-3-sonnet", 4096);
    assert_eq!(converted.messages.len(), 3);

    let assistant = &converted.messages[1];
    assert_eq!(assistant.role, "assistant");
    let ClaudeContent::Array(blocks) = &assistant.content else {
        panic!("assistant content should be a block array");
    };
    assert_eq!(blocks[0].block_type, "tool_use");
    assert_eq!(blocks[0].input, Some(json!({"city": "SF"})));

    let tool_result = &converted.messages[2];
    assert_eq!(tool_result.role, "user");
    let ClaudeContent::Array(blocks) = &tool_result.content else {
        panic!("tool result content should be a block array");
    };
    assert_eq!(blocks[0].block_type, "tool_result");
    assert_eq!(blocks[0].tool_use_id.as_deref(), Some("c1"));
    assert_eq!(blocks[0].content, Some(json!("sunny")));
}

#[test]
fn unparseable_tool_arguments_become_empty_object() {
    let request = openai_request(json!({
        "model": "gpt-4",
        "messages": [
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "lookup", "arguments": "{broken"}}
            ]}
        ]
    }));

    let converted = openai_to_claude(&request, "claude-3-sonnet", 4096);
    let ClaudeContent::Array(blocks) = &converted.messages[0].content else {
        panic!("assistant content should be a block array");
    };
    assert_eq!(blocks[0].input, Some(json!({})));
}

#[test]
fn claude_system_prepends_and_tools_convert() {
    let request = claude_request(json!({
        "model": "claude-3-sonnet",
        "max_tokens": 0,
        "system": [{"type": "text", "text": "be kind"}, {"type": "text", "text": "be brief"}],
        "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "rust"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "found"}
            ]}
        ],
        "tools": [{"name": "search", "description": "find", "input_schema": {"type": "object"}}],
        "stream": true
    }));

    let converted = claude_to_openai(&request, "gpt-4", 4096);

    assert_eq!(converted.messages[0].role, "system");
    assert!(matches!(
        &converted.messages[0].content,
        Some(OpenAIContent::Text(text)) if text == "be kind\nbe brief"
    ));

    // Absent max_tokens falls back to the configured default.
    assert_eq!(converted.max_tokens, Some(4096));
    assert_eq!(converted.stream, Some(true));
    assert!(converted.stream_options.is_some());

    let assistant = converted
        .messages
        .iter()
        .find(|m| m.role == "assistant")
        .expect("assistant message should survive");
    let tool_calls = assistant.tool_calls.as_ref().expect("tool calls expected");
    assert_eq!(tool_calls[0].function.name, "search");
    assert_eq!(tool_calls[0].function.arguments, "{\"q\":\"rust\"}");

    let tool = converted
        .messages
        .iter()
        .find(|m| m.role == "tool")
        .expect("tool message expected");
    assert_eq!(tool.tool_call_id.as_deref(), Some("t1"));

    let tools = converted.tools.as_ref().expect("tools should convert");
    assert_eq!(tools[0].function.name, "search");
}

fn flatten_openai_content(content: Option<&OpenAIContent>) -> String {
    match content {
        Some(OpenAIContent::Text(text)) => text.clone(),
        Some(OpenAIContent::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

/// Text-only requests survive the round trip with ordered (role, content)
/// pairs intact, modulo system-message coalescing.
#[test]
fn text_round_trip_preserves_roles_and_content() {
    let request = openai_request(json!({
        "model": "gpt-4",
        "max_tokens": 100,
        "messages": [
            {"role": "system", "content": "sys-a"},
            {"role": "system", "content": "sys-b"},
            {"role": "user", "content": "question one"},
            {"role": "assistant", "content": "answer one"},
            {"role": "user", "content": "question two"}
        ]
    }));

    let anthropic = openai_to_claude(&request, "claude-3-sonnet", 4096);
    let back = claude_to_openai(&anthropic, "gpt-4", 4096);

    let pairs: Vec<(String, String)> = back
        .messages
        .iter()
        .map(|m| (m.role.clone(), flatten_openai_content(m.content.as_ref())))
        .collect();

    assert_eq!(
        pairs,
        vec![
            ("system".to_string(), "sys-a\nsys-b".to_string()),
            ("user".to_string(), "question one".to_string()),
            ("assistant".to_string(), "answer one".to_string()),
            ("user".to_string(), "question two".to_string()),
        ]
    );
    assert_eq!(back.max_tokens, Some(100));
}

/// Tool-call round trip: OpenAI upstream answers an Anthropic client.
#[test]
fn openai_tool_response_converts_to_anthropic_tool_use() {
    let response = json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "c1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"city\":\"SF\"}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4}
    });

    let converted = openai_response_to_claude(&response, "claude-3-sonnet");
    assert_eq!(converted["stop_reason"], "tool_use");
    assert_eq!(
        converted["content"],
        json!([{"type": "tool_use", "id": "c1", "name": "lookup", "input": {"city": "SF"}}])
    );
    assert_eq!(converted["usage"]["input_tokens"], 9);
    assert_eq!(converted["usage"]["output_tokens"], 4);
}

#[test]
fn openai_text_response_converts_to_text_block() {
    let response = json!({
        "id": "chatcmpl-2",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello", "reasoning_content": "let me think"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1}
    });

    let converted = openai_response_to_claude(&response, "claude-3-sonnet");
    assert_eq!(converted["model"], "claude-3-sonnet");
    assert_eq!(converted["stop_reason"], "end_turn");
    assert_eq!(
        converted["content"],
        json!([
            {"type": "thinking", "thinking": "let me think"},
            {"type": "text", "text": "hello"}
        ])
    );
}

#[test]
fn anthropic_response_converts_to_openai_with_string_arguments() {
    let response = json!({
        "id": "msg_1",
        "content": [
            {"type": "text", "text": "checking"},
            {"type": "tool_use", "id": "t9", "name": "search", "input": {"q": "rust"}}
        ],
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 11, "output_tokens": 7}
    });

    let converted = claude_response_to_openai(&response, "gpt-4");
    let choice = &converted["choices"][0];
    assert_eq!(choice["finish_reason"], "tool_calls");
    assert_eq!(choice["message"]["content"], "checking");
    assert_eq!(
        choice["message"]["tool_calls"][0]["function"]["arguments"],
        "{\"q\":\"rust\"}"
    );
    assert_eq!(converted["usage"]["prompt_tokens"], 11);
    assert_eq!(converted["usage"]["completion_tokens"], 7);
    assert_eq!(converted["usage"]["total_tokens"], 18);
}

#[test]
fn anthropic_max_tokens_stop_maps_to_length() {
    let response = json!({
        "id": "msg_2",
        "content": [{"type": "text", "text": "truncated"}],
        "stop_reason": "max_tokens",
        "usage": {"input_tokens": 1, "output_tokens": 1}
    });
    let converted = claude_response_to_openai(&response, "gpt-4");
    assert_eq!(converted["choices"][0]["finish_reason"], "length");
}
