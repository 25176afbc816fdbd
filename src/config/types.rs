use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Wire format spoken by a provider or requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    OpenAi,
    Anthropic,
}

/// Dialect of the incoming request, derived from the URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDialect {
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds at which the access token expires.
    pub expires_at: i64,
    /// Discriminates the issuing OAuth provider (token endpoint selection).
    pub provider_type: String,
}

impl OAuthCredential {
    /// A bundle within 30 seconds of expiry counts as expired so the
    /// refresh happens before the upstream rejects the token.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at - 30
    }
}

/// Exactly one auth shape is populated; the untagged representation keeps
/// the persisted JSON flat (`{"token": ...}` or the OAuth bundle fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderAuth {
    OAuth(OAuthCredential),
    Token { token: String },
}

impl ProviderAuth {
    /// The bearer/x-api-key value sent upstream. OAuth bundles hand out
    /// their current access token; refresh happens before this is called.
    pub fn access_token(&self) -> &str {
        match self {
            Self::Token { token } => token,
            Self::OAuth(oauth) => &oauth.access_token,
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub api_base: String,
    pub api_style: ApiStyle,
    pub auth: ProviderAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Provider {
    /// Changes whenever the secret material rotates; the client pool evicts
    /// entries whose fingerprint no longer matches.
    pub fn secret_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.auth.access_token().as_bytes());
        hasher.update(self.api_base.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn default_weight() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// A (provider, model, weight) triple; the unit the balancer picks among.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpPosition {
    Model,
    Thinking,
    System,
    User,
    ToolUse,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Contains,
    Glob,
    Equals,
    Enabled,
    Disabled,
    AnyContains,
    Regex,
    Type,
    Is,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteOp {
    pub position: OpPosition,
    pub operation: OpKind,
    #[serde(default)]
    pub value: String,
}

impl RouteOp {
    /// The permitted operations per position. Anything outside this table
    /// rejects the enclosing rule set.
    pub fn validate(&self) -> Result<(), String> {
        use OpKind::*;
        let allowed: &[OpKind] = match self.position {
            OpPosition::Model => &[Contains, Glob, Equals],
            OpPosition::Thinking => &[Enabled, Disabled],
            OpPosition::System => &[AnyContains, Regex],
            OpPosition::User => &[AnyContains, Contains, Regex, Type],
            OpPosition::ToolUse => &[Is, Contains],
            OpPosition::Token => &[Ge, Gt, Le, Lt],
        };
        if !allowed.contains(&self.operation) {
            return Err(format!(
                "operation '{:?}' is not valid for position '{:?}'",
                self.operation, self.position
            ));
        }
        if matches!(self.position, OpPosition::Token) && self.value.parse::<i64>().is_err() {
            return Err(format!("token op value '{}' is not an integer", self.value));
        }
        Ok(())
    }
}

/// An ordered predicate -> service-list binding evaluated by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub description: String,
    pub ops: Vec<RouteOp>,
    pub services: Vec<Service>,
}

impl Rule {
    pub fn validate(&self) -> Result<(), String> {
        if self.description.is_empty() {
            return Err("description cannot be empty".to_string());
        }
        if self.ops.is_empty() {
            return Err("ops cannot be empty".to_string());
        }
        for (i, op) in self.ops.iter().enumerate() {
            op.validate().map_err(|e| format!("op[{i}]: {e}"))?;
        }
        if self.services.is_empty() {
            return Err("services cannot be empty".to_string());
        }
        for (i, svc) in self.services.iter().enumerate() {
            if svc.provider.is_empty() {
                return Err(format!("services[{i}]: provider cannot be empty"));
            }
            if svc.model.is_empty() {
                return Err(format!("services[{i}]: model cannot be empty"));
            }
        }
        Ok(())
    }
}

/// Rejects the entire set on the first invalid rule so a bad save never
/// partially applies.
pub fn validate_rules(rules: &[Rule]) -> Result<(), String> {
    for (i, rule) in rules.iter().enumerate() {
        rule.validate().map_err(|e| format!("rule[{i}]: {e}"))?;
    }
    Ok(())
}

fn default_max_tokens() -> u32 {
    4096
}

/// An immutable, internally consistent view of the full configuration.
/// Unknown fields ride along in `extra` so older files survive round-trips
/// through newer binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default)]
    pub user_token: String,
    #[serde(default)]
    pub model_token: String,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Snapshot {
    /// A fresh snapshot with generated secrets, used when no config file
    /// exists yet.
    pub fn initialized() -> Self {
        Self {
            providers: Vec::new(),
            rules: Vec::new(),
            default_max_tokens: default_max_tokens(),
            user_token: generate_secret(),
            model_token: generate_secret(),
            jwt_secret: generate_secret(),
            extra: Map::new(),
        }
    }

    pub fn provider_by_id(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn provider_by_name(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }
}

pub fn generate_secret() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
