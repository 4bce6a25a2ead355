//! Token refresh against a mock cloud backend.
//!
//! Exercises the real reqwest transport, the key-value token store and the
//! token manager end to end.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use memex_background::{
    background_config, BackgroundError, BackgroundServices, InMemoryKeyValueStore, KeyValueStore,
    NetworkError, NewTokens, ProtocolError, RefreshOutcome, ReqwestHttpTransport, TokenManager,
};

async fn services_for(
    server: &MockServer,
    store: Arc<dyn KeyValueStore>,
) -> BackgroundServices<ReqwestHttpTransport> {
    let config = background_config()
        .cloud_origin(server.uri())
        .request_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let transport = Arc::new(ReqwestHttpTransport::with_timeout(config.request_timeout).unwrap());
    BackgroundServices::with_components(config, transport, store)
        .await
        .unwrap()
}

fn empty_store() -> Arc<dyn KeyValueStore> {
    Arc::new(InMemoryKeyValueStore::new())
}

#[tokio::test]
async fn refresh_posts_refresh_token_and_applies_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"refreshToken": "r-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "a-new", "expiresInSeconds": 3600})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = empty_store();
    let services = services_for(&server, store.clone()).await;
    let tokens = services.token_manager();
    tokens
        .handle_new_tokens(NewTokens {
            refresh_token: Some("r-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let outcome = tokens.refresh_access_token(false).await.unwrap();

    assert!(matches!(outcome, RefreshOutcome::Refreshed { .. }));
    assert_eq!(tokens.get_access_token().as_deref(), Some("a-new"));
    assert!(!tokens.is_access_token_expired());
    assert_eq!(
        store.get("google-drive-access").await.unwrap(),
        Some(json!("a-new"))
    );
}

#[tokio::test]
async fn fresh_token_is_not_refreshed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let services = services_for(&server, empty_store()).await;
    let tokens = services.token_manager();
    tokens
        .handle_new_tokens(NewTokens {
            access_token: Some("a-1".to_string()),
            refresh_token: Some("r-1".to_string()),
            expires_in_seconds: Some(7200),
        })
        .await
        .unwrap();

    let outcome = tokens.refresh_access_token(false).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::NotNeeded);
}

#[tokio::test]
async fn rejected_refresh_keeps_existing_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "revoked"})))
        .mount(&server)
        .await;

    let services = services_for(&server, empty_store()).await;
    let tokens = services.token_manager();
    tokens
        .handle_new_tokens(NewTokens {
            access_token: Some("a-1".to_string()),
            refresh_token: Some("r-1".to_string()),
            expires_in_seconds: Some(60),
        })
        .await
        .unwrap();

    let outcome = tokens.refresh_access_token(false).await.unwrap();

    assert!(matches!(outcome, RefreshOutcome::Rejected { .. }));
    assert_eq!(tokens.get_access_token().as_deref(), Some("a-1"));
    assert_eq!(services.metrics().snapshot().refresh_failures, 1);
}

#[tokio::test]
async fn response_without_lifetime_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accessToken": "a-2"})))
        .mount(&server)
        .await;

    let services = services_for(&server, empty_store()).await;
    let tokens = services.token_manager();

    let outcome = tokens.refresh_access_token(true).await.unwrap();

    assert!(matches!(outcome, RefreshOutcome::Rejected { .. }));
    assert!(tokens.get_access_token().is_none());
}

#[tokio::test]
async fn redirect_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "https://login.test"))
        .mount(&server)
        .await;

    let services = services_for(&server, empty_store()).await;
    let result = services.token_manager().refresh_access_token(true).await;

    assert!(matches!(
        result,
        Err(BackgroundError::Protocol(ProtocolError::UnexpectedRedirect { .. }))
    ));
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/google/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"accessToken": "a-1", "expiresInSeconds": 3600}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let services = services_for(&server, empty_store()).await;
    let result = services.token_manager().refresh_access_token(true).await;

    assert!(matches!(
        result,
        Err(BackgroundError::Network(NetworkError::Timeout { .. }))
    ));
}
