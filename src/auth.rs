use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub client_id: String,
    pub exp: i64,
}

/// Issues a long-lived HS256 API key bound to a client id.
pub fn issue_api_key(secret: &str, client_id: &str) -> Result<String, AppError> {
    let claims = Claims {
        client_id: client_id.to_string(),
        exp: (Utc::now() + Duration::days(365)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
}

pub fn validate_api_key(secret: &str, token: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::AuthInvalid)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("Authorization")?.to_str().ok()?;
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Data-plane auth: the configured model token (Bearer or `X-Api-Key`) or a
/// valid issued API key.
pub async fn model_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers();
    let bearer = bearer_token(headers);
    let x_api_key = header_value(headers, "X-Api-Key");
    if bearer.is_none() && x_api_key.is_none() {
        return Err(AppError::AuthRequired);
    }

    let snapshot = state.store.get_snapshot();
    let expected = &snapshot.model_token;
    if !expected.is_empty()
        && (bearer.as_deref() == Some(expected) || x_api_key.as_deref() == Some(expected))
    {
        return Ok(next.run(request).await);
    }

    let token = bearer.or(x_api_key).ok_or(AppError::AuthRequired)?;
    validate_api_key(&snapshot.jwt_secret, &token)?;
    Ok(next.run(request).await)
}

/// Control-plane auth: the configured user token or a valid issued API key.
pub async fn user_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers()).ok_or(AppError::AuthRequired)?;

    let snapshot = state.store.get_snapshot();
    if !snapshot.user_token.is_empty() && token == snapshot.user_token {
        return Ok(next.run(request).await);
    }

    validate_api_key(&snapshot.jwt_secret, &token)?;
    Ok(next.run(request).await)
}
