pub mod oauth;

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::config::{ApiStyle, Provider, Snapshot};
use crate::error::AppError;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

static VERSION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+$").expect("Static regex pattern must be valid"));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    provider_id: String,
    model: String,
}

struct PooledClient {
    client: Client,
    /// Rotates with the provider secret; a stale fingerprint forces rebuild.
    fingerprint: String,
}

/// Amortizes HTTP client construction per (provider, model). Lookups take a
/// read lock; only the first call per key materializes under the write lock.
#[derive(Default)]
pub struct ClientPool {
    clients: RwLock<HashMap<PoolKey, PooledClient>>,
}

impl ClientPool {
    pub fn get(&self, provider: &Provider, model: &str) -> Result<Client, AppError> {
        let key = PoolKey {
            provider_id: provider.id.clone(),
            model: model.to_string(),
        };
        let fingerprint = provider.secret_fingerprint();

        {
            let guard = self.clients.read().expect("client pool lock poisoned");
            if let Some(entry) = guard.get(&key)
                && entry.fingerprint == fingerprint
            {
                return Ok(entry.client.clone());
            }
        }

        let mut guard = self.clients.write().expect("client pool lock poisoned");
        // Double-checked: another task may have built it while we waited.
        if let Some(entry) = guard.get(&key)
            && entry.fingerprint == fingerprint
        {
            return Ok(entry.client.clone());
        }

        debug!(
            "building upstream client for provider={} model={model}",
            provider.name
        );
        let client = build_client(provider)?;
        guard.insert(
            key,
            PooledClient {
                client: client.clone(),
                fingerprint,
            },
        );
        Ok(client)
    }

    /// Drops entries whose provider no longer exists in the snapshot or
    /// whose secret rotated. Wired as a store subscriber.
    pub fn evict_stale(&self, snapshot: &Snapshot) {
        let mut guard = self.clients.write().expect("client pool lock poisoned");
        guard.retain(|key, entry| {
            snapshot
                .provider_by_id(&key.provider_id)
                .is_some_and(|p| p.secret_fingerprint() == entry.fingerprint)
        });
    }
}

fn build_client(provider: &Provider) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(60));

    if let Some(proxy_url) = provider.proxy_url.as_deref().filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| AppError::BadRequest(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| AppError::Internal(format!("failed to build upstream client: {e}")))
}

/// Roots the API base: a base already ending in a version segment is kept
/// as-is, otherwise `/v1` is appended.
pub fn versioned_base(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    let last = base.rsplit('/').next().unwrap_or("");
    if VERSION_SEGMENT.is_match(last) {
        base.to_string()
    } else {
        format!("{base}/v1")
    }
}

/// The completions/messages endpoint for the provider's own dialect.
pub fn dialect_endpoint(provider: &Provider) -> String {
    let base = versioned_base(&provider.api_base);
    match provider.api_style {
        ApiStyle::OpenAi => format!("{base}/chat/completions"),
        ApiStyle::Anthropic => format!("{base}/messages"),
    }
}

pub fn count_tokens_endpoint(provider: &Provider) -> String {
    format!("{}/messages/count_tokens", versioned_base(&provider.api_base))
}

pub fn models_endpoint(provider: &Provider) -> String {
    format!("{}/models", versioned_base(&provider.api_base))
}

/// Applies the provider's auth headers: `Authorization: Bearer` for
/// OpenAI-style upstreams, `x-api-key` + `anthropic-version` for
/// Anthropic-style ones.
pub fn with_auth(builder: RequestBuilder, provider: &Provider) -> RequestBuilder {
    let token = provider.auth.access_token();
    match provider.api_style {
        ApiStyle::OpenAi => builder.header("Authorization", format!("Bearer {token}")),
        ApiStyle::Anthropic => builder
            .header("x-api-key", token)
            .header("anthropic-version", ANTHROPIC_VERSION),
    }
}

/// Prepares a POST for the provider. Non-streaming calls inherit the
/// provider timeout as an absolute deadline; streaming calls carry no
/// deadline (the stream manages its own lifetime).
pub fn post_json(
    client: &Client,
    provider: &Provider,
    url: String,
    body: &serde_json::Value,
    streaming: bool,
) -> RequestBuilder {
    let mut builder = client.post(url).header("Content-Type", "application/json");
    builder = with_auth(builder, provider);
    if !streaming {
        builder = builder.timeout(Duration::from_secs(provider.timeout_secs));
    }
    builder.json(body)
}
