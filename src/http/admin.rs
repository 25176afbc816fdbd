use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::auth;
use crate::config::{ApiStyle, Provider, ProviderAuth, Rule};
use crate::error::AppError;
use crate::state::AppState;
use crate::upstream;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateProviderInput {
    pub name: String,
    pub api_base: String,
    pub api_style: ApiStyle,
    pub auth: ProviderAuth,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProviderInput {
    pub name: Option<String>,
    pub api_base: Option<String>,
    pub api_style: Option<ApiStyle>,
    pub auth: Option<ProviderAuth>,
    pub proxy_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub enabled: Option<bool>,
}

/// Secret material never leaves through the control API.
fn sanitized(provider: &Provider) -> Value {
    let mut value = serde_json::to_value(provider).unwrap_or_default();
    if let Some(auth) = value.get_mut("auth") {
        for key in ["token", "access_token", "refresh_token"] {
            if let Some(field) = auth.get_mut(key) {
                *field = json!("[redacted]");
            }
        }
    }
    value
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<Value>> {
    let snapshot = state.store.get_snapshot();
    Json(snapshot.providers.iter().map(sanitized).collect())
}

pub async fn create_provider(
    State(state): State<AppState>,
    Json(input): Json<CreateProviderInput>,
) -> Result<Response, AppError> {
    if input.name.is_empty() {
        return Err(AppError::BadRequest("provider name cannot be empty".to_string()));
    }
    if input.api_base.is_empty() {
        return Err(AppError::BadRequest("api_base cannot be empty".to_string()));
    }

    let provider = Provider {
        id: uuid::Uuid::new_v4().to_string(),
        name: input.name,
        enabled: input.enabled,
        api_base: input.api_base,
        api_style: input.api_style,
        auth: input.auth,
        proxy_url: input.proxy_url,
        timeout_secs: input.timeout_secs.unwrap_or(300),
    };
    let view = sanitized(&provider);
    state.store.add_provider(provider).await?;
    Ok(Json(view).into_response())
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let snapshot = state.store.get_snapshot();
    let provider = snapshot
        .provider_by_id(&id)
        .ok_or_else(|| AppError::NotFound("provider".to_string()))?;
    Ok(Json(sanitized(provider)))
}

pub async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateProviderInput>,
) -> Result<Json<Value>, AppError> {
    let snapshot = state.store.get_snapshot();
    let mut provider = snapshot
        .provider_by_id(&id)
        .ok_or_else(|| AppError::NotFound("provider".to_string()))?
        .clone();

    if let Some(name) = input.name {
        provider.name = name;
    }
    if let Some(api_base) = input.api_base {
        provider.api_base = api_base;
    }
    if let Some(api_style) = input.api_style {
        provider.api_style = api_style;
    }
    if let Some(auth) = input.auth {
        provider.auth = auth;
    }
    if let Some(proxy_url) = input.proxy_url {
        provider.proxy_url = (!proxy_url.is_empty()).then_some(proxy_url);
    }
    if let Some(timeout_secs) = input.timeout_secs {
        provider.timeout_secs = timeout_secs;
    }
    if let Some(enabled) = input.enabled {
        provider.enabled = enabled;
    }

    let view = sanitized(&provider);
    state.store.update_provider(&id, provider).await?;
    Ok(Json(view))
}

pub async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.store.delete_provider(&id).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn toggle_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let enabled = state.store.toggle_provider(&id).await?;
    Ok(Json(json!({"enabled": enabled})))
}

pub async fn get_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.store.get_snapshot().rules.clone())
}

pub async fn put_rules(
    State(state): State<AppState>,
    Json(rules): Json<Vec<Rule>>,
) -> Result<Json<Value>, AppError> {
    let count = rules.len();
    state.store.replace_rules(rules).await?;
    Ok(Json(json!({"success": true, "rules": count})))
}

/// Best-effort `GET /models` against one provider.
async fn fetch_models(provider: &Provider) -> Result<Vec<String>, AppError> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build probe client: {e}")))?;

    let url = upstream::models_endpoint(provider);
    let response = upstream::with_auth(client.get(url), provider).send().await?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(AppError::upstream(status, message));
    }

    let payload: Value = response.json().await?;
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        return Err(AppError::BadRequest(format!(
            "provider returned error: {}",
            error["message"].as_str().unwrap_or("unknown")
        )));
    }

    let models = payload["data"]
        .as_array()
        .map(|data| {
            data.iter()
                .filter_map(|m| m["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(models)
}

pub async fn all_provider_models(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.store.get_snapshot();
    let mut result = serde_json::Map::new();
    for provider in snapshot.providers.iter().filter(|p| p.enabled) {
        let entry = match fetch_models(provider).await {
            Ok(models) => json!({"models": models}),
            Err(e) => json!({"error": e.to_string()}),
        };
        result.insert(provider.name.clone(), entry);
    }
    Json(Value::Object(result))
}

pub async fn provider_models(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let snapshot = state.store.get_snapshot();
    let provider = snapshot
        .provider_by_name(&name)
        .ok_or_else(|| AppError::NotFound("provider".to_string()))?;
    let models = fetch_models(provider).await?;
    Ok(Json(json!({"provider": name, "models": models})))
}

#[derive(Debug, Deserialize)]
pub struct ProbeInput {
    pub name: String,
    pub api_base: String,
    pub api_style: ApiStyle,
    pub token: String,
}

/// Tests a candidate provider's key and connectivity without persisting it.
pub async fn probe_provider(Json(input): Json<ProbeInput>) -> Result<Json<Value>, AppError> {
    if input.name.is_empty() || input.api_base.is_empty() || input.token.is_empty() {
        return Err(AppError::BadRequest(
            "all fields (name, api_base, api_style, token) are required".to_string(),
        ));
    }

    let candidate = Provider {
        id: String::new(),
        name: input.name,
        enabled: true,
        api_base: input.api_base,
        api_style: input.api_style,
        auth: ProviderAuth::Token { token: input.token },
        proxy_url: None,
        timeout_secs: 10,
    };

    let started = Instant::now();
    let result = fetch_models(&candidate).await;
    let response_time_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(models) => Ok(Json(json!({
            "valid": true,
            "models_count": models.len(),
            "response_time_ms": response_time_ms,
            "message": "API key is valid and accessible",
        }))),
        Err(e) => Ok(Json(json!({
            "valid": false,
            "models_count": 0,
            "response_time_ms": response_time_ms,
            "message": e.to_string(),
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenInput {
    pub client_id: String,
}

pub async fn issue_token(
    State(state): State<AppState>,
    Json(input): Json<TokenInput>,
) -> Result<Json<Value>, AppError> {
    if input.client_id.is_empty() {
        return Err(AppError::BadRequest("client_id is required".to_string()));
    }
    let snapshot = state.store.get_snapshot();
    let token = auth::issue_api_key(&snapshot.jwt_secret, &input.client_id)?;
    Ok(Json(json!({"token": token, "type": "Bearer"})))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.store.get_snapshot();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "providers": snapshot.providers.len(),
        "rules": snapshot.rules.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let records = state.history.recent(query.limit.unwrap_or(50));
    Json(json!({"history": records}))
}

/// The external supervisor owns respawn; stop/restart only trigger a
/// graceful shutdown here.
pub async fn server_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<Value>, AppError> {
    match action.as_str() {
        "start" => Ok(Json(json!({"success": true, "running": true}))),
        "stop" | "restart" => {
            info!("server {action} requested via control API");
            state.shutdown.notify_waiters();
            Ok(Json(json!({"success": true, "action": action})))
        }
        other => Err(AppError::BadRequest(format!("unknown server action '{other}'"))),
    }
}
