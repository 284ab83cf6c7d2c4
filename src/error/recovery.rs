//! Recovery strategies dispatched by the error registry.
//!
//! Outcomes are advisory: the registry reports what a strategy did or suggests,
//! and the caller decides whether to act on it.

use super::{ErrorCategory, ErrorCode, NormalizedError};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Wait suggested for a rate-limit error that carries no hint.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Lookup key for a strategy: an exact code wins over its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKey {
    Code(ErrorCode),
    Category(ErrorCategory),
}

impl From<ErrorCode> for StrategyKey {
    fn from(code: ErrorCode) -> Self {
        Self::Code(code)
    }
}

impl From<ErrorCategory> for StrategyKey {
    fn from(category: ErrorCategory) -> Self {
        Self::Category(category)
    }
}

/// Result of running recovery for one error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Nothing is registered for the error's code or category.
    NoStrategy,
    /// Recovery was not attempted (see [`ErrorRegistry::record`](super::ErrorRegistry::record)).
    Skipped,
    /// Credentials were refreshed; the failed call can be retried now.
    TokenRefreshed,
    /// Retry after the given wait; nothing blocked.
    RetryScheduled {
        #[serde(rename = "retry_after_ms", serialize_with = "as_millis")]
        retry_after: Duration,
    },
    /// Retry with exponential backoff within a fixed budget.
    RetryWithBackoff {
        max_retries: u32,
        #[serde(rename = "base_delay_ms", serialize_with = "as_millis")]
        base_delay: Duration,
    },
    Failed { reason: String },
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NoStrategy | Self::Skipped | Self::Failed { .. })
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A pluggable recovery routine.
///
/// Returning `Err` (or panicking) is reported as [`RecoveryOutcome::Failed`];
/// it never reaches the caller of `classify`.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn recover(&self, error: &NormalizedError) -> Result<RecoveryOutcome>;
}

/// Adapts a synchronous closure into a [`RecoveryStrategy`].
pub struct FnStrategy<F>(F);

pub fn strategy_fn<F>(f: F) -> FnStrategy<F>
where
    F: Fn(&NormalizedError) -> RecoveryOutcome + Send + Sync,
{
    FnStrategy(f)
}

#[async_trait]
impl<F> RecoveryStrategy for FnStrategy<F>
where
    F: Fn(&NormalizedError) -> RecoveryOutcome + Send + Sync,
{
    async fn recover(&self, error: &NormalizedError) -> Result<RecoveryOutcome> {
        Ok((self.0)(error))
    }
}

/// Hook that renews a connection's credentials out of band.
///
/// Implemented by the refresh scheduler; `Ok(())` means the connection now
/// holds fresh tokens.
#[async_trait]
pub trait TokenRecovery: Send + Sync {
    async fn recover_token(&self, connection_id: &str) -> Result<()>;
}

/// Refreshes credentials for `token_expired` errors that name a connection.
pub struct TokenRefreshStrategy {
    recovery: Arc<dyn TokenRecovery>,
}

impl TokenRefreshStrategy {
    pub fn new(recovery: Arc<dyn TokenRecovery>) -> Self {
        Self { recovery }
    }
}

#[async_trait]
impl RecoveryStrategy for TokenRefreshStrategy {
    async fn recover(&self, error: &NormalizedError) -> Result<RecoveryOutcome> {
        if error.code() != ErrorCode::TokenExpired {
            return Ok(RecoveryOutcome::failed("Unable to refresh token"));
        }
        let Some(connection_id) = error.connection_id() else {
            return Ok(RecoveryOutcome::failed("No connection to refresh"));
        };
        match self.recovery.recover_token(connection_id).await {
            Ok(()) => Ok(RecoveryOutcome::TokenRefreshed),
            Err(e) => Ok(RecoveryOutcome::failed(format!(
                "Unable to refresh token: {}",
                e
            ))),
        }
    }
}

/// Suggests waiting out a rate limit, one minute unless the error says otherwise.
pub struct RateLimitStrategy;

#[async_trait]
impl RecoveryStrategy for RateLimitStrategy {
    async fn recover(&self, error: &NormalizedError) -> Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::RetryScheduled {
            retry_after: error.retry_after().unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
        })
    }
}

/// Suggests a bounded exponential backoff for network failures.
pub struct NetworkBackoffStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for NetworkBackoffStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkBackoffStrategy {
    async fn recover(&self, _error: &NormalizedError) -> Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::RetryWithBackoff {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
        })
    }
}

/// The default strategy set. The token strategy is only included when a
/// recovery hook is available.
pub fn default_strategies(
    token_recovery: Option<Arc<dyn TokenRecovery>>,
) -> Vec<(StrategyKey, Arc<dyn RecoveryStrategy>)> {
    let mut strategies: Vec<(StrategyKey, Arc<dyn RecoveryStrategy>)> = vec![
        (ErrorCategory::RateLimit.into(), Arc::new(RateLimitStrategy)),
        (
            ErrorCategory::Network.into(),
            Arc::new(NetworkBackoffStrategy::default()),
        ),
    ];
    if let Some(recovery) = token_recovery {
        strategies.push((
            ErrorCode::TokenExpired.into(),
            Arc::new(TokenRefreshStrategy::new(recovery)),
        ));
    }
    strategies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::META_CONNECTION_ID;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRecovery {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl TokenRecovery for CountingRecovery {
        async fn recover_token(&self, _connection_id: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                anyhow::bail!("invalid_grant")
            }
        }
    }

    fn expired(connection_id: Option<&str>) -> NormalizedError {
        let err = NormalizedError::new(ErrorCategory::Token, ErrorCode::TokenExpired, "expired");
        match connection_id {
            Some(id) => err.with_metadata(META_CONNECTION_ID, id),
            None => err,
        }
    }

    #[tokio::test]
    async fn test_token_strategy_reports_refresh() {
        let recovery = Arc::new(CountingRecovery {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let strategy = TokenRefreshStrategy::new(recovery.clone());

        let outcome = strategy.recover(&expired(Some("c1"))).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::TokenRefreshed);
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_strategy_failure_and_missing_connection() {
        let recovery = Arc::new(CountingRecovery {
            calls: AtomicUsize::new(0),
            succeed: false,
        });
        let strategy = TokenRefreshStrategy::new(recovery.clone());

        let outcome = strategy.recover(&expired(Some("c1"))).await.unwrap();
        assert!(!outcome.is_success());

        let outcome = strategy.recover(&expired(None)).await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::failed("No connection to refresh"));
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_strategy_defaults_to_one_minute() {
        let err = NormalizedError::new(
            ErrorCategory::RateLimit,
            ErrorCode::RateLimitExceeded,
            "slow down",
        );
        let outcome = RateLimitStrategy.recover(&err).await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::RetryScheduled {
                retry_after: Duration::from_secs(60)
            }
        );

        let err = err.with_retry_after(Duration::from_millis(1500));
        let outcome = RateLimitStrategy.recover(&err).await.unwrap();
        assert_eq!(
            outcome,
            RecoveryOutcome::RetryScheduled {
                retry_after: Duration::from_millis(1500)
            }
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(RecoveryOutcome::RetryWithBackoff {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(json["action"], "retry_with_backoff");
        assert_eq!(json["max_retries"], 3);
        assert_eq!(json["base_delay_ms"], 1000);
    }

    #[test]
    fn test_default_strategies_include_token_only_with_hook() {
        assert_eq!(default_strategies(None).len(), 2);
        let recovery: Arc<dyn TokenRecovery> = Arc::new(CountingRecovery {
            calls: AtomicUsize::new(0),
            succeed: true,
        });
        let strategies = default_strategies(Some(recovery));
        assert!(strategies
            .iter()
            .any(|(key, _)| *key == StrategyKey::Code(ErrorCode::TokenExpired)));
    }
}
