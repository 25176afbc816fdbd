use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::store::ConfigStore;
use crate::config::types::{OAuthCredential, Provider, ProviderAuth};
use crate::error::AppError;

// Public CLI client identifiers for the personal-account OAuth channels.
const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

fn token_endpoint(provider_type: &str) -> Result<(&'static str, &'static str), AppError> {
    match provider_type {
        "anthropic" | "claude" => Ok((
            "https://console.anthropic.com/v1/oauth/token",
            ANTHROPIC_CLIENT_ID,
        )),
        "openai" | "codex" => Ok(("https://auth.openai.com/oauth/token", OPENAI_CLIENT_ID)),
        other => Err(AppError::BadRequest(format!(
            "unknown oauth provider type '{other}'"
        ))),
    }
}

/// Returns a provider whose OAuth access token is valid, refreshing and
/// persisting the bundle first when it has expired. Static-token providers
/// pass through untouched.
pub async fn ensure_fresh(
    store: &Arc<ConfigStore>,
    provider: &Provider,
) -> Result<Provider, AppError> {
    let ProviderAuth::OAuth(credential) = &provider.auth else {
        return Ok(provider.clone());
    };
    if !credential.is_expired() {
        return Ok(provider.clone());
    }

    let refreshed = refresh(credential).await?;
    store.update_oauth(&provider.id, refreshed.clone()).await?;
    info!("refreshed oauth credential for provider {}", provider.name);

    let mut provider = provider.clone();
    provider.auth = ProviderAuth::OAuth(refreshed);
    Ok(provider)
}

async fn refresh(credential: &OAuthCredential) -> Result<OAuthCredential, AppError> {
    let (endpoint, client_id) = token_endpoint(&credential.provider_type)?;
    let payload = json!({
        "grant_type": "refresh_token",
        "refresh_token": credential.refresh_token,
        "client_id": client_id,
    });

    let response = reqwest::Client::new()
        .post(endpoint)
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::upstream(
            status,
            format!("oauth token refresh failed: {body}"),
        ));
    }

    let tokens: TokenResponse = response.json().await?;
    Ok(OAuthCredential {
        access_token: tokens.access_token,
        refresh_token: tokens
            .refresh_token
            .unwrap_or_else(|| credential.refresh_token.clone()),
        expires_at: Utc::now().timestamp() + tokens.expires_in.unwrap_or(3600),
        provider_type: credential.provider_type.clone(),
    })
}
