//! OAuth handler contract.
//!
//! Each platform's handler hides its refresh quirks behind [`OAuthHandler`]:
//! most platforms exchange a refresh token, some (Instagram) exchange the
//! current access token. The scheduler asks the handler which material it
//! needs via [`OAuthHandler::refresh_material`].

use crate::registry::PlatformComponent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod instagram;
mod provider;
mod standard;

pub use instagram::InstagramRefreshHandler;
pub use provider::ClientCredentials;
pub use standard::StandardRefreshHandler;

/// Which stored token a platform refreshes with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMaterial {
    RefreshToken,
    AccessToken,
}

/// New credentials returned by a successful refresh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// `None` when the platform does not issue or rotate refresh tokens.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenGrant {
    /// Builds a grant from a token endpoint's `expires_in` seconds.
    pub fn expiring_in(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }
}

/// Standard OAuth error kinds a handler reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidGrant,
    InvalidToken,
    TokenExpired,
    RevokedToken,
    RateLimitExceeded,
    ServerError,
    TemporarilyUnavailable,
    NetworkError,
    UnknownError,
}

impl OAuthErrorKind {
    /// Maps an RFC 6749 `error` field (plus a few common extensions).
    pub fn from_oauth_code(code: &str) -> Self {
        match code {
            "invalid_request" | "invalid_client" | "unauthorized_client"
            | "unsupported_grant_type" | "invalid_scope" => Self::InvalidRequest,
            "invalid_grant" => Self::InvalidGrant,
            "invalid_token" | "access_token_invalid" => Self::InvalidToken,
            "token_expired" | "access_token_expired" => Self::TokenExpired,
            "revoked_token" | "access_denied" => Self::RevokedToken,
            "rate_limit_exceeded" | "slow_down" => Self::RateLimitExceeded,
            "server_error" => Self::ServerError,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            _ => Self::UnknownError,
        }
    }

    /// Fallback when the response body carries no error code.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            400 => Self::InvalidGrant,
            401 => Self::InvalidToken,
            429 => Self::RateLimitExceeded,
            503 => Self::TemporarilyUnavailable,
            s if s >= 500 => Self::ServerError,
            _ => Self::UnknownError,
        }
    }
}

/// Failure reported by an OAuth handler.
#[derive(Clone, Debug, thiserror::Error)]
#[error("OAuth {kind:?}: {message}")]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub message: String,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Raised when a connection holds nothing the platform can refresh with.
    pub fn no_refresh_material() -> Self {
        Self::new(
            OAuthErrorKind::InvalidToken,
            "No valid token available for refresh",
        )
    }
}

/// Error body shape shared by most OAuth token endpoints.
#[derive(Deserialize, Debug)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Turns a failed token-endpoint response into an [`OAuthError`].
pub(crate) async fn error_from_response(response: reqwest::Response) -> OAuthError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());

    match serde_json::from_str::<OAuthErrorBody>(&body) {
        Ok(OAuthErrorBody {
            error: Some(code),
            error_description,
        }) => OAuthError::new(
            OAuthErrorKind::from_oauth_code(&code),
            error_description.unwrap_or(code),
        ),
        _ => OAuthError::new(
            OAuthErrorKind::from_status(status),
            format!("Token refresh failed with status {}: {}", status, body),
        ),
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> OAuthError {
    OAuthError::new(
        OAuthErrorKind::NetworkError,
        format!("Failed to send token refresh request: {}", err),
    )
}

/// Per-platform OAuth handler.
///
/// Only the refresh half of the handshake is part of this contract; the
/// authorization-code exchange lives with the connect flow.
#[async_trait]
pub trait OAuthHandler: PlatformComponent {
    /// Which stored token `refresh` expects.
    fn refresh_material(&self) -> RefreshMaterial {
        RefreshMaterial::RefreshToken
    }

    /// Exchanges `token` (per [`refresh_material`](Self::refresh_material))
    /// for new credentials.
    async fn refresh(&self, token: &str) -> Result<TokenGrant, OAuthError>;
}
