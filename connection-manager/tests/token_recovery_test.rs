//! API calls that hit an expired token recover through the refresh scheduler.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use connection_manager::adapters::instagram::api::InstagramClient;
use connection_manager::adapters::InstagramAdapter;
use connection_manager::{
    AccessTokenSource, ApiExecutor, ApiResponse, ExecuteOptions, StoredTokens,
    TokenRefreshScheduler,
};
use mockito::Matcher;
use serde_json::{json, Map};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tether::config::SchedulerConfig;
use tether::connection::{Connection, ConnectionStatus, MemoryConnectionStore};
use tether::credentials::{AesGcmCodec, CredentialCodec};
use tether::error::{
    ErrorCategory, ErrorCode, ErrorRegistry, NormalizedError, TokenRefreshStrategy,
};
use tether::oauth::{OAuthError, OAuthErrorKind, OAuthHandler, RefreshMaterial, TokenGrant};
use tether::registry::PlatformComponent;
use tether::HandlerRegistry;

const MASTER_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

/// Exchanges the access token, like Instagram.
struct ExchangeHandler {
    calls: AtomicU32,
    succeed: bool,
}

impl PlatformComponent for ExchangeHandler {
    fn platform(&self) -> &str {
        "instagram"
    }
}

#[async_trait]
impl OAuthHandler for ExchangeHandler {
    fn refresh_material(&self) -> RefreshMaterial {
        RefreshMaterial::AccessToken
    }

    async fn refresh(&self, token: &str) -> Result<TokenGrant, OAuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Err(OAuthError::new(
                OAuthErrorKind::InvalidToken,
                "Session has been invalidated",
            ));
        }
        Ok(TokenGrant::expiring_in(format!("{}-renewed", token), None, 5_184_000))
    }
}

struct Engine {
    scheduler: Arc<TokenRefreshScheduler>,
    errors: Arc<ErrorRegistry>,
    tokens: Arc<StoredTokens>,
    handler: Arc<ExchangeHandler>,
}

fn engine(succeed: bool, register_strategy: bool) -> Result<Engine> {
    let codec = Arc::new(AesGcmCodec::new(MASTER_KEY)?);
    let connection = Connection {
        id: "ig-1".to_string(),
        user_id: "user-1".to_string(),
        platform: "instagram".to_string(),
        access_token: codec.encrypt("IGold", "kid-0")?,
        access_token_key_id: "kid-0".to_string(),
        refresh_token: None,
        refresh_token_key_id: None,
        token_expires_at: Utc::now() + chrono::Duration::days(30),
        status: ConnectionStatus::Active,
        scopes: Vec::new(),
        last_sync: None,
        metadata: Map::new(),
    };
    let store = Arc::new(MemoryConnectionStore::with_connections([connection]));

    let handler = Arc::new(ExchangeHandler {
        calls: AtomicU32::new(0),
        succeed,
    });
    let handlers = Arc::new(HandlerRegistry::for_handlers());
    handlers.register("instagram", handler.clone());

    let errors = Arc::new(ErrorRegistry::with_defaults(100, None));
    let scheduler = Arc::new(TokenRefreshScheduler::new(
        &SchedulerConfig::default(),
        store.clone(),
        codec.clone(),
        handlers,
        errors.clone(),
    ));
    if register_strategy {
        errors.register_recovery_strategy(
            ErrorCode::TokenExpired,
            Arc::new(TokenRefreshStrategy::new(scheduler.recovery_hook())),
        );
    }

    Ok(Engine {
        scheduler,
        errors,
        tokens: Arc::new(StoredTokens::new(store, codec)),
        handler,
    })
}

fn expired() -> anyhow::Error {
    NormalizedError::new(
        ErrorCategory::Token,
        ErrorCode::TokenExpired,
        "Error validating access token: Session has expired",
    )
    .into()
}

/// A call that fails with an expired token until the stored token changes.
async fn call_with(
    tokens: &StoredTokens,
    calls: &AtomicU32,
    seen: &Mutex<Vec<String>>,
) -> Result<ApiResponse> {
    calls.fetch_add(1, Ordering::SeqCst);
    let token = tokens.access_token("ig-1").await?;
    seen.lock().unwrap().push(token.clone());
    if token == "IGold" {
        return Err(expired());
    }
    Ok(ApiResponse::new(json!({ "token": token })))
}

#[tokio::test]
async fn test_expired_token_refreshes_once_and_retries_once() {
    let engine = engine(true, true).unwrap();
    let executor = ApiExecutor::new("instagram", engine.errors.clone());
    let calls = AtomicU32::new(0);
    let seen = Mutex::new(Vec::new());

    let response = executor
        .execute_call(&ExecuteOptions::for_connection("ig-1"), || {
            call_with(&engine.tokens, &calls, &seen)
        })
        .await
        .unwrap();

    assert_eq!(response.data["token"], "IGold-renewed");
    assert_eq!(engine.handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock().unwrap(), vec!["IGold", "IGold-renewed"]);
    assert!(engine.scheduler.get_active_tasks().is_empty());
}

#[tokio::test]
async fn test_token_still_expired_after_refresh_is_not_refreshed_again() {
    let engine = engine(true, true).unwrap();
    let executor = ApiExecutor::new("instagram", engine.errors.clone());
    let calls = AtomicU32::new(0);

    let err = executor
        .execute_call(&ExecuteOptions::for_connection("ig-1"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<ApiResponse, _>(expired()) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::TokenExpired);
    assert_eq!(engine.handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.errors.history().len(), 2);
}

#[tokio::test]
async fn test_failed_refresh_surfaces_token_error() {
    let engine = engine(false, true).unwrap();
    let executor = ApiExecutor::new("instagram", engine.errors.clone());
    let calls = AtomicU32::new(0);
    let seen = Mutex::new(Vec::new());

    let err = executor
        .execute_call(&ExecuteOptions::for_connection("ig-1"), || {
            call_with(&engine.tokens, &calls, &seen)
        })
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Token);
    assert_eq!(err.code(), ErrorCode::TokenExpired);
    assert_eq!(err.connection_id(), Some("ig-1"));
    assert_eq!(engine.handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the scheduler keeps retrying in the background
    let status = engine.scheduler.get_refresh_status("ig-1").unwrap();
    assert_eq!(status.attempt, 1);
    assert!(status
        .last_error
        .unwrap()
        .contains("Session has been invalidated"));
}

#[tokio::test]
async fn test_executor_hook_used_without_registry_strategy() {
    let engine = engine(true, false).unwrap();
    let executor = ApiExecutor::new("instagram", engine.errors.clone())
        .with_token_recovery(engine.scheduler.recovery_hook());
    let calls = AtomicU32::new(0);
    let seen = Mutex::new(Vec::new());

    let response = executor
        .execute_call(&ExecuteOptions::for_connection("ig-1"), || {
            call_with(&engine.tokens, &calls, &seen)
        })
        .await
        .unwrap();

    assert_eq!(response.data["token"], "IGold-renewed");
    assert_eq!(engine.handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_instagram_adapter_recovers_expired_session() {
    let engine = engine(true, true).unwrap();
    let mut server = mockito::Server::new_async().await;
    let expired = server
        .mock("GET", "/me")
        .match_query(Matcher::UrlEncoded("access_token".into(), "IGold".into()))
        .with_status(400)
        .with_body(
            json!({"error": {
                "message": "Error validating access token: Session has expired",
                "type": "OAuthException",
                "code": 190,
                "error_subcode": 463
            }})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let renewed = server
        .mock("GET", "/me")
        .match_query(Matcher::UrlEncoded(
            "access_token".into(),
            "IGold-renewed".into(),
        ))
        .with_status(200)
        .with_body(json!({"id": "1789", "username": "alice", "media_count": 7}).to_string())
        .expect(1)
        .create_async()
        .await;

    let adapter = InstagramAdapter::with_client(
        InstagramClient::with_base_url(server.url()),
        ApiExecutor::new("instagram", engine.errors.clone()),
        engine.tokens.clone(),
    );
    let profile = adapter.user_profile("ig-1").await.unwrap();

    assert_eq!(profile.data["username"], "alice");
    assert_eq!(profile.data["media_count"], 7);
    assert_eq!(engine.handler.calls.load(Ordering::SeqCst), 1);
    expired.assert_async().await;
    renewed.assert_async().await;
}
