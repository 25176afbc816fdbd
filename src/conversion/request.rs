use serde_json::{Map, Value};

use crate::models::{
    claude::{
        ClaudeContent, ClaudeContentBlock, ClaudeMessage, ClaudeMessagesRequest, ClaudeSystem,
        ClaudeTool, ClaudeToolChoice,
    },
    openai::{
        OpenAIContent, OpenAIContentPart, OpenAIFunction, OpenAIFunctionChoice, OpenAIImageUrl,
        OpenAIMessage, OpenAIRequest, OpenAITool, OpenAIToolChoice, OpenAIToolFunction,
        StreamOptions,
    },
};

/// Anthropic request -> OpenAI request, for Anthropic-dialect clients
/// routed to an OpenAI-style upstream.
pub fn claude_to_openai(
    claude_request: &ClaudeMessagesRequest,
    model: &str,
    default_max_tokens: u32,
) -> OpenAIRequest {
    let mut messages = Vec::new();

    if let Some(system) = &claude_request.system {
        let system_text = system.to_text();
        if !system_text.is_empty() {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(OpenAIContent::Text(system_text)),
                ..Default::default()
            });
        }
    }

    for message in &claude_request.messages {
        match message.role.as_str() {
            "user" => convert_claude_user_message(&message.content, &mut messages),
            "assistant" => convert_claude_assistant_message(&message.content, &mut messages),
            _ => {}
        }
    }

    let streaming = claude_request.stream.unwrap_or(false);
    let max_tokens = if claude_request.max_tokens == 0 {
        default_max_tokens
    } else {
        claude_request.max_tokens
    };

    OpenAIRequest {
        model: model.to_string(),
        messages,
        max_tokens: Some(max_tokens),
        temperature: claude_request.temperature,
        top_p: claude_request.top_p,
        stop: claude_request.stop_sequences.clone(),
        stream: claude_request.stream,
        tools: claude_request
            .tools
            .as_ref()
            .filter(|tools| !tools.is_empty())
            .map(|tools| convert_claude_tools(tools)),
        tool_choice: claude_request
            .tool_choice
            .as_ref()
            .map(convert_claude_tool_choice),
        stream_options: streaming.then_some(StreamOptions {
            include_usage: Some(true),
        }),
    }
}

fn convert_claude_user_message(content: &ClaudeContent, messages: &mut Vec<OpenAIMessage>) {
    match content {
        ClaudeContent::Text(text) => {
            messages.push(OpenAIMessage {
                role: "user".to_string(),
                content: Some(OpenAIContent::Text(text.clone())),
                ..Default::default()
            });
        }
        ClaudeContent::Array(blocks) => convert_claude_content_blocks(blocks, messages),
    }
}

fn convert_claude_content_blocks(blocks: &[ClaudeContentBlock], messages: &mut Vec<OpenAIMessage>) {
    // Tool results become their own `tool` role messages.
    for block in blocks.iter().filter(|b| b.block_type == "tool_result") {
        if let (Some(tool_use_id), Some(content)) = (&block.tool_use_id, &block.content) {
            let text = match content {
                Value::String(s) => s.clone(),
                other => tool_result_text(other),
            };
            messages.push(OpenAIMessage {
                role: "tool".to_string(),
                content: Some(OpenAIContent::Text(text)),
                tool_call_id: Some(tool_use_id.clone()),
                ..Default::default()
            });
        }
    }

    let content_parts: Vec<OpenAIContentPart> = blocks
        .iter()
        .filter(|b| b.block_type != "tool_result")
        .filter_map(|block| match block.block_type.as_str() {
            "text" => block.text.as_ref().map(|text| OpenAIContentPart {
                part_type: "text".to_string(),
                text: Some(text.clone()),
                image_url: None,
            }),
            "image" => block.source.as_ref().map(|source| OpenAIContentPart {
                part_type: "image_url".to_string(),
                text: None,
                image_url: Some(OpenAIImageUrl {
                    url: format!("data:{};base64,{}", source.media_type, source.data),
                }),
            }),
            _ => None,
        })
        .collect();

    if !content_parts.is_empty() {
        messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: Some(OpenAIContent::Array(content_parts)),
            ..Default::default()
        });
    }
}

/// Anthropic tool_result content arrays flatten to their text blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                if b["type"].as_str() == Some("text") {
                    b["text"].as_str().map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn convert_claude_assistant_message(content: &ClaudeContent, messages: &mut Vec<OpenAIMessage>) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    match content {
        ClaudeContent::Text(text) => text_parts.push(text.clone()),
        ClaudeContent::Array(blocks) => {
            for block in blocks {
                match block.block_type.as_str() {
                    "text" => {
                        if let Some(text) = &block.text {
                            text_parts.push(text.clone());
                        }
                    }
                    "tool_use" => {
                        if let (Some(id), Some(name), Some(input)) =
                            (&block.id, &block.name, &block.input)
                        {
                            tool_calls.push(crate::models::openai::OpenAIToolCall {
                                id: id.clone(),
                                call_type: "function".to_string(),
                                function: OpenAIFunction {
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input).unwrap_or_default(),
                                },
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return;
    }

    messages.push(OpenAIMessage {
        role: "assistant".to_string(),
        content: (!text_parts.is_empty()).then(|| OpenAIContent::Text(text_parts.join("\n"))),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    });
}

fn convert_claude_tools(tools: &[ClaudeTool]) -> Vec<OpenAITool> {
    tools
        .iter()
        .map(|tool| OpenAITool {
            tool_type: "function".to_string(),
            function: OpenAIToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect()
}

fn convert_claude_tool_choice(tool_choice: &ClaudeToolChoice) -> OpenAIToolChoice {
    match (tool_choice.choice_type.as_str(), &tool_choice.name) {
        ("tool", Some(name)) => OpenAIToolChoice::Object {
            choice_type: "function".to_string(),
            function: OpenAIFunctionChoice { name: name.clone() },
        },
        ("any", _) => OpenAIToolChoice::String("required".to_string()),
        _ => OpenAIToolChoice::String("auto".to_string()),
    }
}

/// OpenAI request -> Anthropic request, for OpenAI-dialect clients routed
/// to an Anthropic-style upstream. System messages coalesce into the
/// `system` field; `tool` messages become user-role tool_result blocks.
pub fn openai_to_claude(
    openai_request: &OpenAIRequest,
    model: &str,
    default_max_tokens: u32,
) -> ClaudeMessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &openai_request.messages {
        match message.role.as_str() {
            "system" => {
                let text = openai_content_text(message.content.as_ref());
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" => {
                let text = openai_content_text(message.content.as_ref());
                messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Array(vec![text_block(text)]),
                });
            }
            "assistant" => {
                let mut blocks = Vec::new();
                let text = openai_content_text(message.content.as_ref());
                if !text.is_empty() {
                    blocks.push(text_block(text));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::Object(Map::new()));
                        blocks.push(ClaudeContentBlock {
                            block_type: "tool_use".to_string(),
                            id: Some(call.id.clone()),
                            name: Some(call.function.name.clone()),
                            input: Some(input),
                            ..Default::default()
                        });
                    }
                }
                if !blocks.is_empty() {
                    messages.push(ClaudeMessage {
                        role: "assistant".to_string(),
                        content: ClaudeContent::Array(blocks),
                    });
                }
            }
            "tool" => {
                let text = openai_content_text(message.content.as_ref());
                messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Array(vec![ClaudeContentBlock {
                        block_type: "tool_result".to_string(),
                        tool_use_id: message.tool_call_id.clone(),
                        content: Some(Value::String(text)),
                        ..Default::default()
                    }]),
                });
            }
            _ => {}
        }
    }

    ClaudeMessagesRequest {
        model: model.to_string(),
        messages,
        system: (!system_parts.is_empty()).then(|| ClaudeSystem::Text(system_parts.join("\n"))),
        max_tokens: openai_request.max_tokens.unwrap_or(default_max_tokens),
        stop_sequences: openai_request.stop.clone(),
        stream: openai_request.stream,
        temperature: openai_request.temperature,
        top_p: openai_request.top_p,
        top_k: None,
        tools: openai_request
            .tools
            .as_ref()
            .filter(|tools| !tools.is_empty())
            .map(|tools| convert_openai_tools(tools)),
        tool_choice: openai_request
            .tool_choice
            .as_ref()
            .map(convert_openai_tool_choice),
        thinking: None,
    }
}

fn text_block(text: String) -> ClaudeContentBlock {
    ClaudeContentBlock {
        block_type: "text".to_string(),
        text: Some(text),
        ..Default::default()
    }
}

/// Flattens string-or-parts content; non-text parts are marker-replaced.
fn openai_content_text(content: Option<&OpenAIContent>) -> String {
    match content {
        Some(OpenAIContent::Text(text)) => text.clone(),
        Some(OpenAIContent::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part.part_type.as_str() {
                "text" => part.text.clone(),
                "image_url" => Some("[image]".to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

fn convert_openai_tools(tools: &[OpenAITool]) -> Vec<ClaudeTool> {
    tools
        .iter()
        .map(|tool| ClaudeTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool.function.parameters.clone(),
        })
        .collect()
}

fn convert_openai_tool_choice(tool_choice: &OpenAIToolChoice) -> ClaudeToolChoice {
    match tool_choice {
        OpenAIToolChoice::Object { function, .. } => ClaudeToolChoice {
            choice_type: "tool".to_string(),
            name: Some(function.name.clone()),
        },
        OpenAIToolChoice::String(choice) if choice == "required" => ClaudeToolChoice {
            choice_type: "any".to_string(),
            name: None,
        },
        OpenAIToolChoice::String(_) => ClaudeToolChoice {
            choice_type: "auto".to_string(),
            name: None,
        },
    }
}
