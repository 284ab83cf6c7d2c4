//! Platform API adapter contract and the resilient call executor.
//!
//! A [`PlatformAdapter`] only knows its platform's response shapes and error
//! codes. Everything about *when* to retry lives in [`ApiExecutor`]:
//!
//! ```text
//!   execute_call
//!     ├─ tracked window exhausted? ──▶ rate_limit error (fail fast)
//!     ├─ call()
//!     │    ├─ Ok  ──▶ record reported windows, return
//!     │    └─ Err ──▶ classify
//!     │         ├─ rate_limit    ──▶ wait out reset (bounded), retry
//!     │         ├─ token_expired ──▶ refresh once, retry
//!     │         ├─ retryable     ──▶ backoff min(base·2^n, cap), retry
//!     │         └─ otherwise     ──▶ return error
//! ```

use chrono::Utc;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether::config::AdapterConfig;
use tether::error::{
    ErrorCategory, ErrorCode, ErrorContext, ErrorRegistry, NormalizedError, RecoveryOutcome,
    TokenRecovery, DEFAULT_RATE_LIMIT_WAIT, META_CONNECTION_ID, META_ENDPOINT, META_RESET_AT,
};
use tether::rate_limit::{RateLimitInfo, RateLimitTracker};
use tether::registry::PlatformComponent;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A platform HTTP response, read fully.
#[derive(Debug, Clone)]
pub struct PlatformResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Parsed JSON body; `Value::Null` when the body is empty or not JSON.
    pub body: Value,
}

impl PlatformResponse {
    pub async fn read(response: reqwest::Response) -> anyhow::Result<Self> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Normalized result of one platform call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T = Value> {
    pub data: T,
    pub metadata: Map<String, Value>,
    /// Budgets the platform reported with this response.
    pub rate_limits: Vec<RateLimitInfo>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            metadata: Map::new(),
            rate_limits: Vec::new(),
        }
    }

    pub fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.rate_limits.push(info);
        self
    }
}

/// Per-platform response handling.
///
/// Implementations supply shape validation, normalization, metadata and
/// rate-limit extraction, and error-code mapping. Retry behaviour is not part
/// of the contract; calls go through an [`ApiExecutor`].
pub trait PlatformAdapter: PlatformComponent {
    /// Converts a validated body into the platform-neutral shape.
    fn normalize_data(&self, body: &Value) -> Result<Value, NormalizedError>;

    fn extract_metadata(&self, response: &PlatformResponse) -> Map<String, Value>;

    fn extract_rate_limits(&self, response: &PlatformResponse) -> Vec<RateLimitInfo>;

    /// Maps a non-success response to a classified error.
    fn map_error(&self, response: &PlatformResponse) -> NormalizedError;

    fn validate_response(&self, body: &Value) -> bool;

    /// Validates, normalizes and annotates a response; errors for non-2xx.
    fn normalize_response(&self, response: &PlatformResponse) -> Result<ApiResponse, NormalizedError> {
        if !response.is_success() {
            return Err(self.map_error(response));
        }
        if !self.validate_response(&response.body) {
            return Err(NormalizedError::new(
                ErrorCategory::Api,
                ErrorCode::InvalidResponse,
                format!("Unexpected {} response shape", self.platform()),
            )
            .with_platform(self.platform()));
        }
        Ok(ApiResponse {
            data: self.normalize_data(&response.body)?,
            metadata: self.extract_metadata(response),
            rate_limits: self.extract_rate_limits(response),
        })
    }
}

/// Retry limits for [`ApiExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for retryable failures.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest rate-limit reset the executor will sleep through.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AdapterConfig::default())
    }
}

impl From<&AdapterConfig> for RetryPolicy {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_rate_limit_wait: config.max_rate_limit_wait(),
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Connection whose credentials the call uses; required for token recovery.
    pub connection_id: Option<String>,
    /// Logical endpoint, for error context.
    pub endpoint: Option<String>,
    /// Overrides the policy's attempt budget.
    pub max_retries: Option<u32>,
}

impl ExecuteOptions {
    pub fn for_connection(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::default()
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Runs platform calls with rate-limit tracking, token recovery and backoff.
///
/// One executor per adapter instance; its rate-limit windows are private.
pub struct ApiExecutor {
    platform: String,
    policy: RetryPolicy,
    rate_limits: RateLimitTracker,
    errors: Arc<ErrorRegistry>,
    token_recovery: Option<Arc<dyn TokenRecovery>>,
}

impl ApiExecutor {
    pub fn new(platform: impl Into<String>, errors: Arc<ErrorRegistry>) -> Self {
        Self {
            platform: platform.into(),
            policy: RetryPolicy::default(),
            rate_limits: RateLimitTracker::new(),
            errors,
            token_recovery: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Hook used when the error registry has no strategy for an expired token.
    pub fn with_token_recovery(mut self, recovery: Arc<dyn TokenRecovery>) -> Self {
        self.token_recovery = Some(recovery);
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    /// Executes `call` until it succeeds or a failure is final.
    ///
    /// `call` performs exactly one HTTP request per invocation and must read
    /// credentials afresh each time, so that a retry after token recovery uses
    /// the new token.
    pub async fn execute_call<T, F, Fut>(
        &self,
        options: &ExecuteOptions,
        mut call: F,
    ) -> Result<ApiResponse<T>, NormalizedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<ApiResponse<T>>>,
    {
        let max_retries = options.max_retries.unwrap_or(self.policy.max_retries).max(1);
        let context = self.context(options);

        let mut attempt: u32 = 0;
        let mut rate_limit_waits: u32 = 0;
        let mut token_recovered = false;

        loop {
            if let Some(limited) = self.rate_limits.check() {
                let error = self.window_exhausted(&limited.endpoint, limited.wait, options);
                let (error, _) = self.errors.report(error).await;
                return Err(error);
            }

            let raw = match call().await {
                Ok(response) => {
                    for info in &response.rate_limits {
                        self.rate_limits.update(info);
                    }
                    return Ok(response);
                }
                Err(e) => e,
            };

            // one token recovery per call; later failures are only recorded
            let (error, outcome) = if token_recovered {
                (self.errors.record(raw, &context).await, RecoveryOutcome::Skipped)
            } else {
                self.errors.handle(raw, &context).await
            };

            if error.category() == ErrorCategory::RateLimit {
                let wait = error.retry_after().unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                if rate_limit_waits < max_retries && wait <= self.policy.max_rate_limit_wait {
                    rate_limit_waits += 1;
                    info!(
                        platform = %self.platform,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, waiting for reset"
                    );
                    sleep(wait).await;
                    continue;
                }
                if error.retry_after().is_none() {
                    return Err(error.with_retry_after(wait));
                }
                return Err(error);
            }

            if error.is_token_expiry() && !token_recovered {
                token_recovered = true;
                if self.recover_token(&error, &outcome, options).await {
                    debug!(platform = %self.platform, "Token recovered, retrying call");
                    continue;
                }
                return Err(error);
            }

            if error.is_retryable() {
                attempt += 1;
                if attempt >= max_retries {
                    warn!(
                        platform = %self.platform,
                        attempts = attempt,
                        code = %error.code(),
                        "Retries exhausted"
                    );
                    return Err(error);
                }
                let delay = self.policy.backoff_delay(attempt - 1);
                debug!(
                    platform = %self.platform,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                sleep(delay).await;
                continue;
            }

            return Err(error);
        }
    }

    /// Acts on the registry's outcome, falling back to the executor's own hook
    /// when nothing is registered for the error.
    async fn recover_token(
        &self,
        error: &NormalizedError,
        outcome: &RecoveryOutcome,
        options: &ExecuteOptions,
    ) -> bool {
        match outcome {
            RecoveryOutcome::TokenRefreshed => true,
            RecoveryOutcome::NoStrategy => {
                let (Some(hook), Some(connection_id)) =
                    (&self.token_recovery, options.connection_id.as_deref())
                else {
                    return false;
                };
                match hook.recover_token(connection_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            platform = %self.platform,
                            connection_id = %connection_id,
                            code = %error.code(),
                            error = %e,
                            "Token recovery failed"
                        );
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn context(&self, options: &ExecuteOptions) -> ErrorContext {
        let mut context = ErrorContext::for_platform(self.platform.clone());
        if let Some(id) = &options.connection_id {
            context = context.with_connection(id.clone());
        }
        if let Some(endpoint) = &options.endpoint {
            context = context.with_endpoint(endpoint.clone());
        }
        context
    }

    fn window_exhausted(
        &self,
        endpoint: &str,
        wait: Duration,
        options: &ExecuteOptions,
    ) -> NormalizedError {
        let reset_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        let mut error = NormalizedError::new(
            ErrorCategory::RateLimit,
            ErrorCode::RateLimitExceeded,
            format!("Rate limit exceeded for {}", endpoint),
        )
        .with_platform(self.platform.clone())
        .with_metadata(META_ENDPOINT, endpoint)
        .with_metadata(META_RESET_AT, reset_at.to_rfc3339())
        .with_retry_after(wait);
        if let Some(id) = &options.connection_id {
            error = error.with_metadata(META_CONNECTION_ID, id.as_str());
        }
        error
    }
}
