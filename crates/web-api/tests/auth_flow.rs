use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use config::{AppConfig, AuthConfig};
use domain::TokenRequest;
use serde_json::Value;
use tower::ServiceExt;
use web_api::{router, AppState, TokenIssuer};

fn issuer(api_key: Option<&str>) -> Arc<TokenIssuer> {
    let auth = AuthConfig {
        api_key: api_key.map(str::to_string),
        token_ttl_ms: 3_600_000,
    };
    Arc::new(TokenIssuer::new(&auth, "amana-chat"))
}

fn app(issuer: Arc<TokenIssuer>) -> Router {
    router(AppState::new(issuer))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn health_returns_ok() {
    let (status, _) = get(app(issuer(None)), "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn auth_issues_signed_token_for_client() {
    let issuer = issuer(Some("app.key:s3cret"));
    let (status, body) = get(app(issuer.clone()), "/auth?clientId=Alice").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["keyName"], "app.key");
    assert_eq!(json["clientId"], "Alice");
    assert_eq!(
        json["capability"]["amana-chat:*"],
        serde_json::json!(["publish", "subscribe", "presence"])
    );

    let token: TokenRequest = serde_json::from_value(json).unwrap();
    assert!(issuer.verify(&token));
}

#[tokio::test]
async fn auth_without_client_id_generates_one() {
    let (status, body) = get(app(issuer(Some("app.key:s3cret"))), "/auth").await;
    assert_eq!(status, StatusCode::OK);

    let token: TokenRequest = serde_json::from_slice(&body).unwrap();
    let client_id = token.client_id.unwrap();
    assert!(client_id.starts_with("user-"));
    assert!(client_id.len() > "user-".len());
}

#[tokio::test]
async fn auth_without_api_key_returns_500() {
    let (status, body) = get(app(issuer(None)), "/auth?clientId=Alice").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!({ "error": "API key not configured" }));
}

#[tokio::test]
async fn auth_with_malformed_key_returns_500() {
    let (status, body) = get(app(issuer(Some("missing-secret"))), "/auth").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Failed to create authentication token");
}

#[tokio::test]
async fn state_from_default_config_uses_realtime_namespace() {
    let mut config = AppConfig::default();
    config.auth.api_key = Some("app.key:s3cret".into());
    let (status, body) = get(router(AppState::from_config(&config)), "/auth").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    let pattern = format!("{}:*", config.realtime.namespace);
    assert!(json["capability"].get(&pattern).is_some());
}
