//! Normalized error model shared by the API executor and the refresh scheduler.
//!
//! Every failure the engine makes a decision about is first turned into a
//! [`NormalizedError`]: a category, a fine-grained code, a severity, the
//! originating platform and free-form metadata. Raw errors (HTTP client errors,
//! OAuth handler errors, JSON errors, plain `anyhow` errors) are mapped by
//! [`normalize`]; the [`ErrorRegistry`] adds history, logging, recovery
//! strategies and listener fan-out on top.
//!
//! ```text
//!   raw anyhow::Error ──normalize──▶ NormalizedError
//!                                         │
//!                         ┌───────────────┼────────────────┐
//!                         ▼               ▼                ▼
//!                      history         recover()       listeners
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod recovery;
mod registry;

pub use recovery::{
    default_strategies, strategy_fn, FnStrategy, NetworkBackoffStrategy, RateLimitStrategy,
    RecoveryOutcome, RecoveryStrategy, StrategyKey, TokenRecovery, TokenRefreshStrategy,
    DEFAULT_RATE_LIMIT_WAIT,
};
pub use registry::{ErrorRegistry, ListenerId, DEFAULT_HISTORY_SIZE};

use crate::oauth::{OAuthError, OAuthErrorKind};

/// Metadata key: milliseconds the caller should wait before retrying.
pub const META_RETRY_AFTER_MS: &str = "retry_after_ms";
/// Metadata key: logical endpoint the error relates to.
pub const META_ENDPOINT: &str = "endpoint";
/// Metadata key: RFC 3339 timestamp when a rate-limit window resets.
pub const META_RESET_AT: &str = "reset_at";
/// Metadata key: connection the failing call was made for.
pub const META_CONNECTION_ID: &str = "connection_id";

/// Broad failure category used for recovery and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Token,
    RateLimit,
    Network,
    Api,
    Validation,
    Platform,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Token => "token",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Api => "api",
            Self::Validation => "validation",
            Self::Platform => "platform",
            Self::Unknown => "unknown",
        }
    }

    /// Severity assigned when the producer of an error does not pick one.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            Self::Authentication | Self::Authorization | Self::Token | Self::Platform => {
                ErrorSeverity::High
            }
            Self::RateLimit | Self::Validation => ErrorSeverity::Low,
            Self::Network | Self::Api | Self::Unknown => ErrorSeverity::Medium,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Authentication
    InvalidCredentials,
    TokenExpired,
    TokenInvalid,
    TokenRevoked,
    // Authorization
    InsufficientScope,
    PermissionDenied,
    AccountRestricted,
    // Rate limits
    RateLimitExceeded,
    QuotaExceeded,
    // Network
    NetworkUnavailable,
    Timeout,
    ConnectionError,
    // API
    ApiError,
    InvalidRequest,
    InvalidResponse,
    ServiceUnavailable,
    // Validation
    InvalidParameter,
    MissingParameter,
    InvalidFormat,
    // Platform
    PlatformError,
    PlatformMaintenance,
    PlatformDeprecated,
    PlatformNotSupported,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::TokenRevoked => "token_revoked",
            Self::InsufficientScope => "insufficient_scope",
            Self::PermissionDenied => "permission_denied",
            Self::AccountRestricted => "account_restricted",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NetworkUnavailable => "network_unavailable",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::ApiError => "api_error",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidResponse => "invalid_response",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InvalidParameter => "invalid_parameter",
            Self::MissingParameter => "missing_parameter",
            Self::InvalidFormat => "invalid_format",
            Self::PlatformError => "platform_error",
            Self::PlatformMaintenance => "platform_maintenance",
            Self::PlatformDeprecated => "platform_deprecated",
            Self::PlatformNotSupported => "platform_not_supported",
            Self::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Caller-supplied context attached to an error during classification.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub platform: Option<String>,
    pub connection_id: Option<String>,
    pub endpoint: Option<String>,
}

impl ErrorContext {
    pub fn for_platform(platform: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.into()),
            ..Self::default()
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// The engine's canonical error shape.
///
/// Fields are private: an error is built once through the `with_*` methods and
/// then only read. Cloning is cheap; the triggering raw error is shared.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NormalizedError {
    message: String,
    category: ErrorCategory,
    code: ErrorCode,
    severity: ErrorSeverity,
    platform: Option<String>,
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
    raw: Option<Arc<anyhow::Error>>,
}

impl NormalizedError {
    pub fn new(category: ErrorCategory, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
            code,
            severity: category.default_severity(),
            platform: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
            raw: None,
        }
    }

    /// Error returned when a registry has nothing registered for `platform`.
    pub fn platform_not_supported(platform: &str, what: &str) -> Self {
        Self::new(
            ErrorCategory::Platform,
            ErrorCode::PlatformNotSupported,
            format!("No {} registered for platform: {}", what, platform),
        )
        .with_platform(platform)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_retry_after(self, wait: Duration) -> Self {
        self.with_metadata(META_RETRY_AFTER_MS, wait.as_millis() as u64)
    }

    pub fn with_raw(mut self, raw: anyhow::Error) -> Self {
        self.raw = Some(Arc::new(raw));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn raw(&self) -> Option<&anyhow::Error> {
        self.raw.as_deref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.metadata.get(META_CONNECTION_ID).and_then(Value::as_str)
    }

    /// Wait hint carried in metadata, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.metadata
            .get(META_RETRY_AFTER_MS)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// True for an expired credential, whether it was reported by a platform
    /// (`token`) or recognised from a message (`authentication`).
    pub fn is_token_expiry(&self) -> bool {
        self.code == ErrorCode::TokenExpired
            && matches!(
                self.category,
                ErrorCategory::Token | ErrorCategory::Authentication
            )
    }

    /// Transient failures the API executor retries with exponential backoff.
    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Network
            || matches!(
                self.code,
                ErrorCode::ServiceUnavailable | ErrorCode::Timeout
            )
    }

    /// JSON view used by the error tracking sink.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "message": self.message,
            "category": self.category,
            "code": self.code,
            "severity": self.severity,
            "platform": self.platform,
            "timestamp": self.timestamp.to_rfc3339(),
            "metadata": self.metadata,
        })
    }

    fn absorb_context(mut self, context: &ErrorContext) -> Self {
        if self.platform.is_none() {
            self.platform = context.platform.clone();
        }
        if let Some(id) = &context.connection_id {
            self.metadata
                .entry(META_CONNECTION_ID.to_string())
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(endpoint) = &context.endpoint {
            self.metadata
                .entry(META_ENDPOINT.to_string())
                .or_insert_with(|| Value::String(endpoint.clone()));
        }
        self
    }
}

/// Maps an arbitrary failure into a [`NormalizedError`].
///
/// Already-normalized errors are not passed through untouched: they keep
/// their classification and message, but context they lack (platform,
/// connection, endpoint) is filled in from `context`. Known error types are
/// mapped by kind; anything else is classified from its message.
pub fn normalize(raw: anyhow::Error, context: &ErrorContext) -> NormalizedError {
    if let Some(normalized) = raw.downcast_ref::<NormalizedError>() {
        return normalized.clone().absorb_context(context);
    }

    let message = raw.to_string();
    let (category, code) = if let Some(oauth) = raw.downcast_ref::<OAuthError>() {
        classify_oauth(oauth.kind)
    } else if let Some(http) = raw.downcast_ref::<reqwest::Error>() {
        classify_http(http, &message)
    } else if raw.downcast_ref::<serde_json::Error>().is_some() {
        (ErrorCategory::Api, ErrorCode::InvalidResponse)
    } else {
        classify_message(&format!("{:#}", raw))
    };

    NormalizedError::new(category, code, message)
        .with_metadata("original_message", format!("{:#}", raw))
        .with_raw(raw)
        .absorb_context(context)
}

fn classify_oauth(kind: OAuthErrorKind) -> (ErrorCategory, ErrorCode) {
    match kind {
        OAuthErrorKind::TokenExpired => (ErrorCategory::Token, ErrorCode::TokenExpired),
        OAuthErrorKind::InvalidToken | OAuthErrorKind::InvalidGrant => {
            (ErrorCategory::Token, ErrorCode::TokenInvalid)
        }
        OAuthErrorKind::RevokedToken => (ErrorCategory::Token, ErrorCode::TokenRevoked),
        OAuthErrorKind::InvalidRequest => (ErrorCategory::Validation, ErrorCode::InvalidRequest),
        OAuthErrorKind::RateLimitExceeded => {
            (ErrorCategory::RateLimit, ErrorCode::RateLimitExceeded)
        }
        OAuthErrorKind::ServerError | OAuthErrorKind::TemporarilyUnavailable => {
            (ErrorCategory::Api, ErrorCode::ServiceUnavailable)
        }
        OAuthErrorKind::NetworkError => (ErrorCategory::Network, ErrorCode::NetworkUnavailable),
        OAuthErrorKind::UnknownError => (ErrorCategory::Unknown, ErrorCode::UnknownError),
    }
}

fn classify_http(err: &reqwest::Error, message: &str) -> (ErrorCategory, ErrorCode) {
    if err.is_timeout() {
        (ErrorCategory::Network, ErrorCode::Timeout)
    } else if err.is_connect() {
        (ErrorCategory::Network, ErrorCode::ConnectionError)
    } else if err.is_decode() {
        (ErrorCategory::Api, ErrorCode::InvalidResponse)
    } else if let Some(status) = err.status() {
        match status.as_u16() {
            401 => (ErrorCategory::Authentication, ErrorCode::TokenInvalid),
            403 => (ErrorCategory::Authorization, ErrorCode::PermissionDenied),
            429 => (ErrorCategory::RateLimit, ErrorCode::RateLimitExceeded),
            s if s >= 500 => (ErrorCategory::Api, ErrorCode::ServiceUnavailable),
            _ => (ErrorCategory::Api, ErrorCode::ApiError),
        }
    } else {
        classify_message(message)
    }
}

/// Message heuristics, checked in order: network, token/auth, rate limit.
fn classify_message(message: &str) -> (ErrorCategory, ErrorCode) {
    let lower = message.to_lowercase();
    if lower.contains("network") || lower.contains("timeout") || lower.contains("timed out") {
        let code = if lower.contains("timeout") || lower.contains("timed out") {
            ErrorCode::Timeout
        } else {
            ErrorCode::NetworkUnavailable
        };
        (ErrorCategory::Network, code)
    } else if lower.contains("token") || lower.contains("auth") {
        let code = if lower.contains("expired") {
            ErrorCode::TokenExpired
        } else {
            ErrorCode::TokenInvalid
        };
        (ErrorCategory::Authentication, code)
    } else if lower.contains("rate limit") || lower.contains("quota") {
        (ErrorCategory::RateLimit, ErrorCode::RateLimitExceeded)
    } else {
        (ErrorCategory::Unknown, ErrorCode::UnknownError)
    }
}
