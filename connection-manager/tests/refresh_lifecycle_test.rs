//! End-to-end refresh lifecycle against the in-memory store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use connection_manager::{TaskStatus, TokenRefreshScheduler, WebhookNotifier};
use mockito::Matcher;
use serde_json::{json, Map};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::config::SchedulerConfig;
use tether::connection::{
    Connection, ConnectionStatus, ConnectionStore, MemoryConnectionStore, META_LAST_REFRESH_ERROR,
    META_LAST_REFRESH_SUCCESS,
};
use tether::credentials::{AesGcmCodec, CredentialCodec};
use tether::error::{ErrorCategory, ErrorRegistry};
use tether::oauth::{OAuthError, OAuthErrorKind, OAuthHandler, TokenGrant};
use tether::registry::PlatformComponent;
use tether::HandlerRegistry;

const MASTER_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

/// Fails `failures` times, then grants. Each refresh takes `latency`.
struct FlakyHandler {
    failures: Mutex<VecDeque<OAuthError>>,
    calls: AtomicU32,
    latency: Duration,
}

impl FlakyHandler {
    fn failing(times: usize, kind: OAuthErrorKind) -> Arc<Self> {
        Self::slow(times, kind, Duration::ZERO)
    }

    fn slow(times: usize, kind: OAuthErrorKind, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(
                (0..times)
                    .map(|i| OAuthError::new(kind, format!("failure {}", i + 1)))
                    .collect(),
            ),
            calls: AtomicU32::new(0),
            latency,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PlatformComponent for FlakyHandler {
    fn platform(&self) -> &str {
        "demo"
    }
}

#[async_trait]
impl OAuthHandler for FlakyHandler {
    async fn refresh(&self, token: &str) -> Result<TokenGrant, OAuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        assert_eq!(token, "refresh-plain");
        Ok(TokenGrant::expiring_in(
            "access-new".to_string(),
            Some("refresh-new".to_string()),
            7200,
        ))
    }
}

struct Fixture {
    scheduler: Arc<TokenRefreshScheduler>,
    store: Arc<MemoryConnectionStore>,
    codec: Arc<AesGcmCodec>,
    errors: Arc<ErrorRegistry>,
}

fn demo_connection(codec: &AesGcmCodec, expires_in_secs: i64) -> Result<Connection> {
    Ok(Connection {
        id: "conn-1".to_string(),
        user_id: "user-1".to_string(),
        platform: "demo".to_string(),
        access_token: codec.encrypt("access-plain", "kid-0")?,
        access_token_key_id: "kid-0".to_string(),
        refresh_token: Some(codec.encrypt("refresh-plain", "kid-0")?),
        refresh_token_key_id: Some("kid-0".to_string()),
        token_expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        status: ConnectionStatus::Active,
        scopes: vec!["read".to_string()],
        last_sync: None,
        metadata: Map::new(),
    })
}

fn fixture(handler: Arc<FlakyHandler>, config: SchedulerConfig) -> Result<Fixture> {
    let codec = Arc::new(AesGcmCodec::new(MASTER_KEY)?);
    let store = Arc::new(MemoryConnectionStore::with_connections([demo_connection(
        &codec, 60,
    )?]));
    let handlers = Arc::new(HandlerRegistry::for_handlers());
    handlers.register("demo", handler);
    let errors = Arc::new(ErrorRegistry::new(100));

    let scheduler = Arc::new(TokenRefreshScheduler::new(
        &config,
        store.clone(),
        codec.clone(),
        handlers,
        errors.clone(),
    ));
    Ok(Fixture {
        scheduler,
        store,
        codec,
        errors,
    })
}

async fn stored(store: &MemoryConnectionStore) -> Connection {
    store.get_connection("conn-1").await.unwrap().unwrap()
}

/// Runs queue passes, advancing paused time to each retry, until the queue
/// drains.
async fn drain(scheduler: &TokenRefreshScheduler) {
    for _ in 0..20 {
        scheduler.process_queue().await;
        if scheduler.get_active_tasks().is_empty() {
            return;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
    }
    panic!("refresh queue did not drain");
}

#[tokio::test(start_paused = true)]
async fn test_expiring_connection_is_queued_immediately() {
    let handler = FlakyHandler::failing(0, OAuthErrorKind::ServerError);
    let f = fixture(handler, SchedulerConfig::default()).unwrap();

    // expires in 60s, threshold 300s
    assert_eq!(f.scheduler.sweep().await.unwrap(), 1);
    let status = f.scheduler.get_refresh_status("conn-1").unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert!(status.next_attempt <= Utc::now());
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let handler = FlakyHandler::failing(3, OAuthErrorKind::TemporarilyUnavailable);
    let f = fixture(handler.clone(), SchedulerConfig::default()).unwrap();

    f.scheduler.sweep().await.unwrap();
    drain(&f.scheduler).await;

    assert_eq!(handler.calls(), 4);
    let connection = stored(&f.store).await;
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.last_refresh_error().is_none());
    assert!(connection.metadata.contains_key(META_LAST_REFRESH_SUCCESS));
    assert_eq!(connection.refresh_attempt_count(), 1);
    assert!(connection.token_expires_at > Utc::now() + chrono::Duration::seconds(7000));

    let key_id = &connection.access_token_key_id;
    assert_ne!(key_id, "kid-0");
    assert_eq!(
        f.codec.decrypt(&connection.access_token, key_id).unwrap(),
        "access-new"
    );
    assert_eq!(
        f.codec
            .decrypt(connection.refresh_token.as_deref().unwrap(), key_id)
            .unwrap(),
        "refresh-new"
    );
    assert!(f
        .errors
        .history()
        .iter()
        .all(|e| e.category() == ErrorCategory::Api));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_mark_connection_failed() {
    let handler = FlakyHandler::failing(10, OAuthErrorKind::InvalidGrant);
    let f = fixture(handler.clone(), SchedulerConfig::default()).unwrap();

    f.scheduler.sweep().await.unwrap();
    drain(&f.scheduler).await;

    // initial attempt plus one retry per backoff entry
    assert_eq!(handler.calls(), 6);
    let connection = stored(&f.store).await;
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert!(connection.last_refresh_error().unwrap().contains("failure 6"));
    assert_eq!(connection.refresh_attempt_count(), 1);
    assert_eq!(connection.access_token_key_id, "kid-0");
    assert!(f.scheduler.get_refresh_status("conn-1").is_none());

    // errored connections are still swept
    assert_eq!(f.scheduler.sweep().await.unwrap(), 1);
}

#[tokio::test]
async fn test_permanent_failure_notifies_webhook() {
    let mut server = mockito::Server::new_async().await;
    let hook = server
        .mock("POST", "/refresh-failed")
        .match_body(Matcher::PartialJson(json!({
            "type": "token_refresh_failed",
            "connection_id": "conn-1",
            "platform": "demo"
        })))
        .with_status(200)
        .create_async()
        .await;

    let handler = FlakyHandler::failing(1, OAuthErrorKind::RevokedToken);
    let config = SchedulerConfig {
        retry_delays_ms: Vec::new(),
        failure_webhook_url: Some(format!("{}/refresh-failed", server.url())),
        ..SchedulerConfig::default()
    };
    let f = fixture(handler.clone(), config).unwrap();

    f.scheduler.sweep().await.unwrap();
    f.scheduler.process_queue().await;

    hook.assert_async().await;
    assert_eq!(handler.calls(), 1);
    let connection = stored(&f.store).await;
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert!(connection.metadata[META_LAST_REFRESH_ERROR]
        .as_str()
        .unwrap()
        .contains("failure 1"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_refresh_result() {
    let handler = FlakyHandler::slow(1, OAuthErrorKind::InvalidGrant, Duration::from_secs(5));
    let config = SchedulerConfig {
        retry_delays_ms: Vec::new(),
        ..SchedulerConfig::default()
    };
    let f = fixture(handler.clone(), config).unwrap();
    f.scheduler.sweep().await.unwrap();

    let scheduler = f.scheduler.clone();
    let pass = tokio::spawn(async move { scheduler.process_queue().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.calls(), 1);

    f.scheduler.stop();
    assert!(f.scheduler.get_active_tasks().is_empty());

    // the refresh still runs to completion
    pass.await.unwrap();
    assert_eq!(handler.calls(), 1);
    assert!(f.scheduler.get_active_tasks().is_empty());
    assert!(f.scheduler.get_refresh_status("conn-1").is_none());

    // its failure is not written back
    let connection = stored(&f.store).await;
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.last_refresh_error().is_none());
    assert_eq!(connection.refresh_attempt_count(), 0);
    assert_eq!(connection.access_token_key_id, "kid-0");
}

#[tokio::test]
async fn test_oversized_threshold_is_clamped() {
    let handler = FlakyHandler::failing(0, OAuthErrorKind::ServerError);
    let config = SchedulerConfig {
        refresh_threshold_secs: u64::MAX,
        retry_delays_ms: vec![u64::MAX],
        ..SchedulerConfig::default()
    };
    let f = fixture(handler, config).unwrap();

    let mut distant = demo_connection(&f.codec, 30 * 24 * 60 * 60).unwrap();
    distant.id = "conn-2".to_string();
    f.store.insert_connection(&distant).await.unwrap();

    assert_eq!(f.scheduler.sweep().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_restarts_attempts() {
    let handler = FlakyHandler::failing(2, OAuthErrorKind::ServerError);
    let f = fixture(handler.clone(), SchedulerConfig::default()).unwrap();

    f.scheduler.sweep().await.unwrap();
    f.scheduler.process_queue().await;
    assert_eq!(f.scheduler.get_refresh_status("conn-1").unwrap().attempt, 1);

    f.scheduler.force_refresh("conn-1").await.unwrap();
    assert_eq!(f.scheduler.get_active_tasks().len(), 1);
    assert_eq!(f.scheduler.get_refresh_status("conn-1").unwrap().attempt, 0);

    // the forced task is due now; the old one's backoff no longer applies
    assert_eq!(f.scheduler.process_queue().await, 1);
    assert_eq!(f.scheduler.get_refresh_status("conn-1").unwrap().attempt, 1);
    drain(&f.scheduler).await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(stored(&f.store).await.status, ConnectionStatus::Active);
}

#[tokio::test]
async fn test_refresh_now_reports_outcome() {
    let handler = FlakyHandler::failing(1, OAuthErrorKind::InvalidGrant);
    let f = fixture(handler.clone(), SchedulerConfig::default()).unwrap();

    let err = f.scheduler.refresh_now("conn-1").await.unwrap_err();
    assert!(err.to_string().contains("failure 1"));
    assert_eq!(f.scheduler.get_refresh_status("conn-1").unwrap().attempt, 1);

    f.scheduler.refresh_now("conn-1").await.unwrap();
    assert!(f.scheduler.get_active_tasks().is_empty());
    assert_eq!(stored(&f.store).await.status, ConnectionStatus::Active);

    let err = f.scheduler.refresh_now("missing").await.unwrap_err();
    assert!(err.to_string().contains("Connection not found"));
}

#[tokio::test]
async fn test_unknown_platform_fails_refresh() -> Result<()> {
    let handler = FlakyHandler::failing(0, OAuthErrorKind::ServerError);
    let f = fixture(handler, SchedulerConfig::default())?;

    let mut orphan = demo_connection(&f.codec, 60)?;
    orphan.id = "conn-2".to_string();
    orphan.platform = "friendster".to_string();
    f.store.insert_connection(&orphan).await?;

    let err = f
        .scheduler
        .refresh_now("conn-2")
        .await
        .err()
        .ok_or_else(|| anyhow!("refresh of unknown platform succeeded"))?;
    assert!(err.to_string().contains("friendster"));
    Ok(())
}

#[test]
fn test_notifier_keeps_url() {
    assert_eq!(
        WebhookNotifier::new("https://hooks.example.com/x").url(),
        "https://hooks.example.com/x"
    );
}
