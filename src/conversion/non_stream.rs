use chrono::Utc;
use serde_json::{Map, Value, json};

use super::{finish_reason_to_stop_reason, stop_reason_to_finish_reason};

/// OpenAI chat completion -> Anthropic message, for Anthropic-dialect
/// clients served by an OpenAI-style upstream.
pub fn openai_response_to_claude(openai_response: &Value, model: &str) -> Value {
    let choice = &openai_response["choices"][0];
    let message = &choice["message"];
    let mut content_blocks = Vec::new();

    if let Some(reasoning) = message["reasoning_content"]
        .as_str()
        .filter(|s| !s.is_empty())
    {
        content_blocks.push(json!({
            "type": "thinking",
            "thinking": reasoning,
        }));
    }

    if let Some(content) = message["content"].as_str().filter(|s| !s.is_empty()) {
        content_blocks.push(json!({"type": "text", "text": content}));
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tool_call in tool_calls {
            if let (Some(id), Some(name)) = (
                tool_call["id"].as_str(),
                tool_call["function"]["name"].as_str(),
            ) {
                let arguments = tool_call["function"]["arguments"].as_str().unwrap_or("{}");
                let input: Value =
                    serde_json::from_str(arguments).unwrap_or(Value::Object(Map::new()));
                content_blocks.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }));
            }
        }
    }

    let stop_reason = finish_reason_to_stop_reason(choice["finish_reason"].as_str());

    json!({
        "id": openai_response["id"],
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content_blocks,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": openai_response["usage"]["prompt_tokens"],
            "output_tokens": openai_response["usage"]["completion_tokens"],
        }
    })
}

/// Anthropic message -> OpenAI chat completion, for OpenAI-dialect clients
/// served by an Anthropic-style upstream. Tool inputs re-serialize to the
/// JSON-string argument encoding OpenAI expects.
pub fn claude_response_to_openai(claude_response: &Value, model: &str) -> Value {
    let mut text_content = String::new();
    let mut reasoning_content = String::new();
    let mut tool_calls = Vec::new();

    if let Some(blocks) = claude_response["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(text) = block["text"].as_str() {
                        text_content.push_str(text);
                    }
                }
                Some("thinking") => {
                    if let Some(thinking) = block["thinking"].as_str() {
                        reasoning_content.push_str(thinking);
                    }
                }
                Some("tool_use") => {
                    let arguments =
                        serde_json::to_string(&block["input"]).unwrap_or_else(|_| "{}".to_string());
                    tool_calls.push(json!({
                        "id": block["id"],
                        "type": "function",
                        "function": {
                            "name": block["name"],
                            "arguments": arguments,
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert(
        "content".to_string(),
        if text_content.is_empty() {
            Value::Null
        } else {
            Value::String(text_content)
        },
    );
    if !reasoning_content.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning_content));
    }
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let finish_reason = stop_reason_to_finish_reason(claude_response["stop_reason"].as_str());
    let input_tokens = claude_response["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = claude_response["usage"]["output_tokens"]
        .as_u64()
        .unwrap_or(0);

    json!({
        "id": claude_response["id"],
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }
    })
}
