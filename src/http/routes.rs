use std::pin::Pin;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use futures_util::stream::{Stream, TryStreamExt};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::balance;
use crate::config::{ApiStyle, ClientDialect, Provider, Snapshot};
use crate::conversion::{
    claude_response_to_openai, claude_to_openai, convert_anthropic_stream_to_openai,
    convert_openai_stream_to_anthropic, openai_response_to_claude, openai_to_claude,
};
use crate::error::AppError;
use crate::models::{claude::ClaudeMessagesRequest, openai::OpenAIRequest};
use crate::routing::{self, RequestContext, extract_context};
use crate::state::{AppState, RequestRecord};
use crate::upstream::{self, oauth};

pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    handle(state, ClientDialect::OpenAi, body).await
}

pub async fn messages(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    handle(state, ClientDialect::Anthropic, body).await
}

struct RoutedUpstream {
    provider: Provider,
    model: String,
    rule: String,
}

/// First matching rule wins; an empty router result falls back to the first
/// enabled provider whose style matches the model prefix heuristic.
fn resolve_route(
    snapshot: &Snapshot,
    ctx: &RequestContext,
    health: &balance::HealthRegistry,
) -> Result<RoutedUpstream, AppError> {
    if let Some(rule) = routing::select(&snapshot.rules, ctx) {
        let service = balance::choose(&rule.services, health)?;
        let provider = snapshot
            .provider_by_id(&service.provider)
            .filter(|p| p.enabled)
            .ok_or(AppError::NoUpstreamAvailable)?;
        return Ok(RoutedUpstream {
            provider: provider.clone(),
            model: service.model.clone(),
            rule: rule.description.clone(),
        });
    }

    let model = ctx.model.to_lowercase();
    let preferred_style = if model.starts_with("gpt") {
        Some(ApiStyle::OpenAi)
    } else if model.starts_with("claude") {
        Some(ApiStyle::Anthropic)
    } else {
        None
    };

    let enabled: Vec<&Provider> = snapshot.providers.iter().filter(|p| p.enabled).collect();
    let provider = preferred_style
        .and_then(|style| enabled.iter().find(|p| p.api_style == style).copied())
        .or_else(|| enabled.first().copied())
        .ok_or(AppError::NoUpstreamAvailable)?;

    Ok(RoutedUpstream {
        provider: provider.clone(),
        model: ctx.model.clone(),
        rule: "default".to_string(),
    })
}

async fn handle(
    state: AppState,
    dialect: ClientDialect,
    body: Bytes,
) -> Result<Response, AppError> {
    let started = std::time::Instant::now();
    let (raw, ctx) = parse_body(dialect, &body)?;
    let streaming = raw["stream"].as_bool().unwrap_or(false);

    let snapshot = state.store.get_snapshot();
    let routed = resolve_route(&snapshot, &ctx, &state.health)?;
    let provider = oauth::ensure_fresh(&state.store, &routed.provider).await?;
    info!(
        model = %ctx.model,
        provider = %provider.name,
        rule = %routed.rule,
        streaming,
        "routing request"
    );

    let client = state.pool.get(&provider, &routed.model)?;
    let upstream_body = build_upstream_body(
        dialect,
        provider.api_style,
        &raw,
        &routed.model,
        snapshot.default_max_tokens,
    )?;
    let url = upstream::dialect_endpoint(&provider);

    let response = match upstream::post_json(&client, &provider, url, &upstream_body, streaming)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            state.health.mark_failed(&provider.id);
            record(&state, dialect, &ctx, &routed, 502, started, streaming);
            return Err(e.into());
        }
    };

    let status = response.status();
    if !status.is_success() {
        if status.is_server_error() {
            state.health.mark_failed(&provider.id);
        }
        let message = response.text().await.unwrap_or_default();
        warn!("upstream {} returned {status}: {message}", provider.name);
        let error = AppError::upstream(status, message);
        record(&state, dialect, &ctx, &routed, status.as_u16(), started, streaming);
        return Err(error);
    }

    let mut response = if streaming {
        stream_response(dialect, provider.api_style, response, &ctx.model)?
    } else {
        non_stream_response(dialect, provider.api_style, response, &ctx.model).await?
    };

    if let Ok(tag) = HeaderValue::from_str(&routed.rule) {
        response.headers_mut().insert("x-route-rule", tag);
    }
    record(&state, dialect, &ctx, &routed, 200, started, streaming);
    Ok(response)
}

/// Anthropic count endpoint. Anthropic-style upstreams answer it natively;
/// for everything else the local estimate stands in.
pub async fn count_tokens(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let (raw, ctx) = parse_body(ClientDialect::Anthropic, &body)?;

    let snapshot = state.store.get_snapshot();
    let routed = resolve_route(&snapshot, &ctx, &state.health)?;

    if routed.provider.api_style != ApiStyle::Anthropic {
        return Ok(Json(json!({"input_tokens": ctx.estimated_tokens})).into_response());
    }

    let provider = oauth::ensure_fresh(&state.store, &routed.provider).await?;
    let client = state.pool.get(&provider, &routed.model)?;
    let mut forward = raw.clone();
    forward["model"] = json!(routed.model);
    let url = upstream::count_tokens_endpoint(&provider);

    let response = upstream::post_json(&client, &provider, url, &forward, false)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AppError::upstream(status, message));
    }
    let payload: Value = response.json().await?;
    Ok(Json(payload).into_response())
}

fn parse_body(dialect: ClientDialect, body: &Bytes) -> Result<(Value, RequestContext), AppError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(AppError::PayloadTooLarge);
    }
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?;
    let ctx = extract_context(dialect, &raw)?;
    Ok((raw, ctx))
}

/// Builds the body sent upstream. Same-dialect requests pass through with
/// only the model rewritten; cross-dialect requests go through the
/// protocol adapter.
fn build_upstream_body(
    dialect: ClientDialect,
    style: ApiStyle,
    raw: &Value,
    model: &str,
    default_max_tokens: u32,
) -> Result<Value, AppError> {
    match (dialect, style) {
        (ClientDialect::OpenAi, ApiStyle::OpenAi) => {
            let mut body = raw.clone();
            body["model"] = json!(model);
            Ok(body)
        }
        (ClientDialect::Anthropic, ApiStyle::Anthropic) => {
            let mut body = raw.clone();
            body["model"] = json!(model);
            if body["max_tokens"].as_u64().unwrap_or(0) == 0 {
                body["max_tokens"] = json!(default_max_tokens);
            }
            Ok(body)
        }
        (ClientDialect::Anthropic, ApiStyle::OpenAi) => {
            let request: ClaudeMessagesRequest = serde_json::from_value(raw.clone())
                .map_err(|e| AppError::BadRequest(format!("invalid messages request: {e}")))?;
            Ok(serde_json::to_value(claude_to_openai(
                &request,
                model,
                default_max_tokens,
            ))?)
        }
        (ClientDialect::OpenAi, ApiStyle::Anthropic) => {
            let request: OpenAIRequest = serde_json::from_value(raw.clone())
                .map_err(|e| AppError::BadRequest(format!("invalid chat request: {e}")))?;
            Ok(serde_json::to_value(openai_to_claude(
                &request,
                model,
                default_max_tokens,
            ))?)
        }
    }
}

fn stream_response(
    dialect: ClientDialect,
    style: ApiStyle,
    upstream: reqwest::Response,
    model: &str,
) -> Result<Response, AppError> {
    let stream: Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> =
        match (dialect, style) {
            // Same dialect: byte-level passthrough, chunk for chunk.
            (ClientDialect::OpenAi, ApiStyle::OpenAi)
            | (ClientDialect::Anthropic, ApiStyle::Anthropic) => {
                Box::pin(upstream.bytes_stream().map_err(AppError::from))
            }
            (ClientDialect::Anthropic, ApiStyle::OpenAi) => {
                convert_openai_stream_to_anthropic(upstream, model)
            }
            (ClientDialect::OpenAi, ApiStyle::Anthropic) => {
                convert_anthropic_stream_to_openai(upstream, model)
            }
        };

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(format!("failed to build streaming response: {e}")))
}

async fn non_stream_response(
    dialect: ClientDialect,
    style: ApiStyle,
    upstream: reqwest::Response,
    model: &str,
) -> Result<Response, AppError> {
    let payload: Value = upstream.json().await?;
    let converted = match (dialect, style) {
        (ClientDialect::OpenAi, ApiStyle::OpenAi)
        | (ClientDialect::Anthropic, ApiStyle::Anthropic) => {
            let mut body = payload;
            body["model"] = json!(model);
            body
        }
        (ClientDialect::Anthropic, ApiStyle::OpenAi) => openai_response_to_claude(&payload, model),
        (ClientDialect::OpenAi, ApiStyle::Anthropic) => claude_response_to_openai(&payload, model),
    };
    Ok(Json(converted).into_response())
}

fn record(
    state: &AppState,
    dialect: ClientDialect,
    ctx: &RequestContext,
    routed: &RoutedUpstream,
    status: u16,
    started: std::time::Instant,
    streamed: bool,
) {
    state.history.record(RequestRecord {
        time: Utc::now(),
        dialect: match dialect {
            ClientDialect::OpenAi => "openai",
            ClientDialect::Anthropic => "anthropic",
        },
        model: ctx.model.clone(),
        provider: routed.provider.name.clone(),
        rule: routed.rule.clone(),
        status,
        duration_ms: started.elapsed().as_millis() as i64,
        streamed,
    });
}
