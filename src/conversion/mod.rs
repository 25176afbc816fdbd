pub mod non_stream;
pub mod request;
pub mod stream;
pub mod stream_openai;

pub use self::non_stream::{claude_response_to_openai, openai_response_to_claude};
pub use self::request::{claude_to_openai, openai_to_claude};
pub use self::stream::convert_openai_stream_to_anthropic;
pub use self::stream_openai::convert_anthropic_stream_to_openai;

/// Anthropic stop_reason -> OpenAI finish_reason.
pub fn stop_reason_to_finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    }
}

/// OpenAI finish_reason -> Anthropic stop_reason.
pub fn finish_reason_to_stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        Some("content_filter") => "refusal",
        _ => "end_turn",
    }
}
