use serde_json::Value;

use crate::config::ClientDialect;
use crate::error::AppError;

/// Everything the router needs to know about a request, extracted in one
/// pass over the parsed JSON without materializing the message array into
/// typed structs.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    pub model: String,
    pub thinking_enabled: bool,
    pub system_messages: Vec<String>,
    pub user_messages: Vec<String>,
    pub tool_uses: Vec<String>,
    pub latest_content_type: Option<String>,
    /// Whether the last message in the request carries role `user`.
    pub latest_is_user: bool,
    pub estimated_tokens: usize,
}

impl RequestContext {
    pub fn latest_user_message(&self) -> &str {
        self.user_messages.last().map(String::as_str).unwrap_or("")
    }

    pub fn combined_system(&self) -> String {
        self.system_messages.join("\n")
    }

    pub fn combined_user(&self) -> String {
        self.user_messages.join("\n")
    }
}

/// Rough approximation: one token per four Unicode code points.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

pub fn extract_context(dialect: ClientDialect, body: &Value) -> Result<RequestContext, AppError> {
    let mut ctx = match dialect {
        ClientDialect::OpenAi => extract_openai(body),
        ClientDialect::Anthropic => extract_anthropic(body),
    };

    if ctx.model.is_empty() {
        return Err(AppError::BadRequest("model is required".to_string()));
    }

    ctx.estimated_tokens = ctx
        .system_messages
        .iter()
        .chain(ctx.user_messages.iter())
        .map(|piece| estimate_tokens(piece))
        .sum();

    Ok(ctx)
}

fn extract_openai(body: &Value) -> RequestContext {
    let mut ctx = RequestContext {
        model: body["model"].as_str().unwrap_or_default().to_string(),
        ..Default::default()
    };

    if let Some(messages) = body["messages"].as_array() {
        for message in messages {
            let Some(role) = message["role"].as_str() else {
                continue;
            };
            let content = &message["content"];
            match role {
                "system" => {
                    let text = content_to_string(content);
                    if !text.is_empty() {
                        ctx.system_messages.push(text);
                    }
                }
                "user" => {
                    let text = content_to_string(content);
                    if !text.is_empty() {
                        ctx.user_messages.push(text);
                    }
                    if has_image_content(content) {
                        ctx.latest_content_type = Some("image".to_string());
                    }
                }
                _ => {}
            }

            // Tool names referenced by prior assistant turns.
            if let Some(tool_calls) = message["tool_calls"].as_array() {
                for call in tool_calls {
                    if let Some(name) = call["function"]["name"].as_str() {
                        ctx.tool_uses.push(name.to_string());
                    }
                }
            }
        }
        ctx.latest_is_user = messages
            .last()
            .and_then(|m| m["role"].as_str())
            .is_some_and(|r| r == "user");
    }

    if let Some(tools) = body["tools"].as_array() {
        for tool in tools {
            if let Some(name) = tool["function"]["name"].as_str() {
                ctx.tool_uses.push(name.to_string());
            }
        }
    }

    ctx
}

fn extract_anthropic(body: &Value) -> RequestContext {
    let mut ctx = RequestContext {
        model: body["model"].as_str().unwrap_or_default().to_string(),
        ..Default::default()
    };

    match &body["system"] {
        Value::String(text) if !text.is_empty() => ctx.system_messages.push(text.clone()),
        system @ Value::Array(_) => {
            let text = content_to_string(system);
            if !text.is_empty() {
                ctx.system_messages.push(text);
            }
        }
        _ => {}
    }

    if let Some(thinking) = body["thinking"].as_object() {
        let kind = thinking.get("type").and_then(Value::as_str);
        ctx.thinking_enabled = kind != Some("disabled");
    }

    if let Some(messages) = body["messages"].as_array() {
        for message in messages {
            let Some(role) = message["role"].as_str() else {
                continue;
            };
            let content = &message["content"];
            if role == "user" {
                let text = content_to_string(content);
                if !text.is_empty() {
                    ctx.user_messages.push(text);
                }
                if has_image_content(content) {
                    ctx.latest_content_type = Some("image".to_string());
                }
            }

            if let Some(blocks) = content.as_array() {
                for block in blocks {
                    if block["type"].as_str() == Some("tool_use")
                        && let Some(name) = block["name"].as_str()
                    {
                        ctx.tool_uses.push(name.to_string());
                    }
                }
            }
        }
        ctx.latest_is_user = messages
            .last()
            .and_then(|m| m["role"].as_str())
            .is_some_and(|r| r == "user");
    }

    if let Some(tools) = body["tools"].as_array() {
        for tool in tools {
            if let Some(name) = tool["name"].as_str() {
                ctx.tool_uses.push(name.to_string());
            }
        }
    }

    ctx
}

/// Flattens string or block-array content to routable text. Image blocks
/// contribute an `[image]` marker instead of their payload.
fn content_to_string(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block["type"].as_str() {
                Some("text") => block["text"].as_str().map(str::to_string),
                Some("image") | Some("image_url") => Some("[image]".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn has_image_content(content: &Value) -> bool {
    content.as_array().is_some_and(|blocks| {
        blocks
            .iter()
            .any(|b| matches!(b["type"].as_str(), Some("image") | Some("image_url")))
    })
}
