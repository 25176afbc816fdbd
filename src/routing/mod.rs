pub mod context;

pub use self::context::{RequestContext, estimate_tokens, extract_context};

use globset::Glob;
use regex::Regex;
use tracing::debug;

use crate::config::types::{OpKind, OpPosition, RouteOp, Rule};

/// Evaluates the rules in declaration order and returns the first whose ops
/// all hold. No match returns None and the caller applies its default path.
pub fn select<'a>(rules: &'a [Rule], ctx: &RequestContext) -> Option<&'a Rule> {
    let matched = rules.iter().find(|rule| rule_matches(rule, ctx));
    if let Some(rule) = matched {
        debug!("request matched rule: {}", rule.description);
    }
    matched
}

fn rule_matches(rule: &Rule, ctx: &RequestContext) -> bool {
    rule.ops.iter().all(|op| eval_op(op, ctx))
}

fn eval_op(op: &RouteOp, ctx: &RequestContext) -> bool {
    match op.position {
        OpPosition::Model => eval_model(op, ctx),
        OpPosition::Thinking => eval_thinking(op, ctx),
        OpPosition::System => eval_system(op, ctx),
        OpPosition::User => eval_user(op, ctx),
        OpPosition::ToolUse => eval_tool_use(op, ctx),
        OpPosition::Token => eval_token(op, ctx),
    }
}

fn eval_model(op: &RouteOp, ctx: &RequestContext) -> bool {
    match op.operation {
        OpKind::Contains => ctx.model.contains(&op.value),
        OpKind::Equals => ctx.model == op.value,
        // A malformed pattern makes the op false, never an error.
        OpKind::Glob => match Glob::new(&op.value) {
            Ok(glob) => glob.compile_matcher().is_match(&ctx.model),
            Err(_) => false,
        },
        _ => false,
    }
}

/// Values "", "true", "yes" and "1" all assert the named state.
fn truthy(value: &str) -> bool {
    value.is_empty()
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
}

fn eval_thinking(op: &RouteOp, ctx: &RequestContext) -> bool {
    match op.operation {
        OpKind::Enabled => truthy(&op.value) && ctx.thinking_enabled,
        OpKind::Disabled => truthy(&op.value) && !ctx.thinking_enabled,
        _ => false,
    }
}

fn regex_matches(text: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

fn eval_system(op: &RouteOp, ctx: &RequestContext) -> bool {
    let combined = ctx.combined_system();
    match op.operation {
        OpKind::AnyContains => combined.contains(&op.value),
        OpKind::Regex => regex_matches(&combined, &op.value),
        _ => false,
    }
}

fn eval_user(op: &RouteOp, ctx: &RequestContext) -> bool {
    match op.operation {
        OpKind::AnyContains => ctx.combined_user().contains(&op.value),
        // Only applies when the last message in the request is a user turn.
        OpKind::Contains => ctx.latest_is_user && ctx.latest_user_message().contains(&op.value),
        OpKind::Regex => regex_matches(&ctx.combined_user(), &op.value),
        OpKind::Type => ctx.latest_content_type.as_deref() == Some(op.value.as_str()),
        _ => false,
    }
}

fn eval_tool_use(op: &RouteOp, ctx: &RequestContext) -> bool {
    ctx.tool_uses.iter().any(|tool| match op.operation {
        OpKind::Is => tool == &op.value,
        OpKind::Contains => tool.contains(&op.value),
        _ => false,
    })
}

fn eval_token(op: &RouteOp, ctx: &RequestContext) -> bool {
    let Ok(target) = op.value.parse::<i64>() else {
        return false;
    };
    let tokens = ctx.estimated_tokens as i64;
    match op.operation {
        OpKind::Ge => tokens >= target,
        OpKind::Gt => tokens > target,
        OpKind::Le => tokens <= target,
        OpKind::Lt => tokens < target,
        _ => false,
    }
}
