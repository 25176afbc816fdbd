use polygate::auth::{issue_api_key, validate_api_key};

#[test]
fn issued_key_validates_against_same_secret() {
    let token = issue_api_key("topsecret", "ide-client").expect("issue");
    let claims = validate_api_key("topsecret", &token).expect("validate");
    assert_eq!(claims.client_id, "ide-client");
    assert!(claims.exp > chrono::Utc::now().timestamp());
}

#[test]
fn wrong_secret_is_rejected() {
    let token = issue_api_key("topsecret", "ide-client").expect("issue");
    assert!(validate_api_key("othersecret", &token).is_err());
}

#[test]
fn garbage_token_is_rejected() {
    assert!(validate_api_key("topsecret", "not-a-jwt").is_err());
}
