use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;

use polygate::config::types::{OAuthCredential, ProviderAuth, Snapshot};
use polygate::config::{ApiStyle, ConfigStore, OpKind, OpPosition};

use crate::helpers::{op, provider, rule, service};

fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
    ConfigStore::open(dir.path().join("config.enc")).expect("store should open")
}

#[test]
fn missing_file_initializes_with_generated_secrets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);
    let snapshot = store.get_snapshot();

    assert!(snapshot.providers.is_empty());
    assert!(!snapshot.user_token.is_empty());
    assert!(!snapshot.model_token.is_empty());
    assert!(!snapshot.jwt_secret.is_empty());
    assert!(dir.path().join("config.enc").exists());
}

#[test]
fn persisted_file_is_sealed_not_plaintext() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _store = store_in(&dir);

    let raw = std::fs::read_to_string(dir.path().join("config.enc")).expect("file readable");
    assert!(!raw.contains("providers"));
    assert!(!raw.contains("jwt_secret"));

    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .expect("payload should be base64");
}

/// load(save(apply(M))) == apply(M): the encrypted round trip is an
/// identity for configuration mutations.
#[tokio::test]
async fn mutations_round_trip_through_encrypted_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.enc");

    {
        let store = ConfigStore::open(path.clone()).expect("store should open");
        store
            .add_provider(provider("p1", "openrouter", ApiStyle::OpenAi))
            .await
            .expect("add should succeed");
        store
            .replace_rules(vec![rule(
                "haiku traffic",
                vec![op(OpPosition::Model, OpKind::Contains, "haiku")],
                vec![service("p1", "small-model")],
            )])
            .await
            .expect("rules should persist");
    }

    let reopened = ConfigStore::open(path).expect("store should reopen");
    let snapshot = reopened.get_snapshot();
    assert_eq!(snapshot.providers.len(), 1);
    assert_eq!(snapshot.providers[0].name, "openrouter");
    assert_eq!(snapshot.providers[0].api_style, ApiStyle::OpenAi);
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(snapshot.rules[0].description, "haiku traffic");
}

#[tokio::test]
async fn duplicate_provider_name_conflicts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);

    store
        .add_provider(provider("p1", "openai", ApiStyle::OpenAi))
        .await
        .expect("first add should succeed");
    let err = store
        .add_provider(provider("p2", "openai", ApiStyle::Anthropic))
        .await
        .expect_err("duplicate name must conflict");
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);

    assert!(store.delete_provider("ghost").await.is_err());
    assert!(store.toggle_provider("ghost").await.is_err());
}

#[tokio::test]
async fn toggle_flips_enabled_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);
    store
        .add_provider(provider("p1", "openai", ApiStyle::OpenAi))
        .await
        .expect("add should succeed");

    assert!(!store.toggle_provider("p1").await.expect("toggle"));
    assert!(store.toggle_provider("p1").await.expect("toggle"));
}

/// A rule set with a position/operation mismatch fails the save and the
/// previous rules stay in force.
#[tokio::test]
async fn malformed_rule_set_is_rejected_atomically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);

    store
        .replace_rules(vec![rule(
            "good",
            vec![op(OpPosition::Model, OpKind::Contains, "haiku")],
            vec![service("p1", "m1")],
        )])
        .await
        .expect("valid rules should persist");

    let err = store
        .replace_rules(vec![rule(
            "bad",
            vec![op(OpPosition::Model, OpKind::Enabled, "")],
            vec![service("p1", "m1")],
        )])
        .await
        .expect_err("invalid op must be rejected");
    assert!(err.to_string().contains("not valid for position"));

    let snapshot = store.get_snapshot();
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(snapshot.rules[0].description, "good");
}

#[tokio::test]
async fn subscribers_observe_every_mutation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    store.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    store
        .add_provider(provider("p1", "openai", ApiStyle::OpenAi))
        .await
        .expect("add should succeed");
    store.toggle_provider("p1").await.expect("toggle");

    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

/// A reader holding a snapshot keeps seeing it unchanged while the store
/// moves on; only subsequent reads observe the mutation.
#[tokio::test]
async fn captured_snapshot_survives_provider_deletion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_in(&dir);
    store
        .add_provider(provider("p1", "openai", ApiStyle::OpenAi))
        .await
        .expect("add should succeed");

    let captured = store.get_snapshot();
    store.delete_provider("p1").await.expect("delete");

    assert_eq!(captured.providers.len(), 1);
    assert!(store.get_snapshot().providers.is_empty());
}

#[tokio::test]
async fn external_change_is_picked_up_by_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.enc");

    let watcher_side = ConfigStore::open(path.clone()).expect("store should open");
    let writer_side = ConfigStore::open(path).expect("second handle should open");

    writer_side
        .add_provider(provider("p1", "openai", ApiStyle::OpenAi))
        .await
        .expect("add should succeed");

    assert!(watcher_side.get_snapshot().providers.is_empty());
    watcher_side.reload_from_disk().expect("reload");
    assert_eq!(watcher_side.get_snapshot().providers.len(), 1);
}

#[test]
fn unknown_snapshot_fields_survive_round_trips() {
    let original = json!({
        "providers": [],
        "rules": [],
        "default_max_tokens": 2048,
        "user_token": "u",
        "model_token": "m",
        "jwt_secret": "s",
        "dashboard_theme": "dark"
    });

    let snapshot: Snapshot = serde_json::from_value(original).expect("snapshot deserializes");
    let reserialized = serde_json::to_value(&snapshot).expect("snapshot serializes");
    assert_eq!(reserialized["dashboard_theme"], "dark");
    assert_eq!(reserialized["default_max_tokens"], 2048);
}

#[test]
fn provider_auth_deserializes_both_shapes() {
    let token: ProviderAuth =
        serde_json::from_value(json!({"token": "sk-live"})).expect("token shape");
    assert_eq!(token.access_token(), "sk-live");

    let oauth: ProviderAuth = serde_json::from_value(json!({
        "access_token": "at",
        "refresh_token": "rt",
        "expires_at": 0,
        "provider_type": "anthropic"
    }))
    .expect("oauth shape");
    assert_eq!(oauth.access_token(), "at");
}

#[test]
fn expired_oauth_bundle_is_refresh_eligible() {
    let expired = OAuthCredential {
        access_token: "at".to_string(),
        refresh_token: "rt".to_string(),
        expires_at: 0,
        provider_type: "anthropic".to_string(),
    };
    assert!(expired.is_expired());

    let fresh = OAuthCredential {
        expires_at: chrono::Utc::now().timestamp() + 3600,
        ..expired
    };
    assert!(!fresh.is_expired());
}
