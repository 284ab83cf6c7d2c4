//! RFC 6749 refresh-token grant.

use super::{error_from_response, transport_error, ClientCredentials, OAuthError, OAuthHandler, TokenGrant};
use crate::registry::{Capability, PlatformComponent};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Lifetime assumed when a token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Token response from an OAuth token refresh endpoint.
///
/// Some platforms (TikTok) wrap the payload in a `data` envelope.
#[derive(Deserialize, Debug)]
struct TokenRefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    data: Option<Box<TokenRefreshResponse>>,
}

impl TokenRefreshResponse {
    fn into_grant(self) -> Result<TokenGrant, OAuthError> {
        let payload = match self.data {
            Some(data) if self.access_token.is_none() => *data,
            _ => self,
        };
        let access_token = payload
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                OAuthError::new(
                    super::OAuthErrorKind::InvalidGrant,
                    "Token refresh response did not contain an access token",
                )
            })?;
        Ok(TokenGrant::expiring_in(
            access_token,
            payload.refresh_token,
            payload.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        ))
    }
}

/// Refreshes by POSTing `grant_type=refresh_token` to a token endpoint.
///
/// Client credentials are sent as form fields when configured; the name of
/// the client id field is platform specific (`client_id`, or `client_key`
/// for TikTok).
pub struct StandardRefreshHandler {
    platform: String,
    token_url: String,
    credentials: Option<ClientCredentials>,
    client_id_field: &'static str,
    capabilities: Vec<Capability>,
    http_client: reqwest::Client,
}

impl StandardRefreshHandler {
    pub fn new(
        platform: impl Into<String>,
        token_url: impl Into<String>,
        credentials: Option<ClientCredentials>,
    ) -> Self {
        Self {
            platform: platform.into(),
            token_url: token_url.into(),
            credentials,
            client_id_field: "client_id",
            capabilities: vec![Capability::RefreshToken],
            http_client: reqwest::Client::new(),
        }
    }

    /// TikTok: `POST /v2/oauth/token/` with `client_key`.
    pub fn tiktok(credentials: Option<ClientCredentials>) -> Self {
        Self::tiktok_with_url("https://open.tiktokapis.com/v2/oauth/token/", credentials)
    }

    pub fn tiktok_with_url(token_url: &str, credentials: Option<ClientCredentials>) -> Self {
        let mut handler = Self::new("tiktok", token_url, credentials);
        handler.client_id_field = "client_key";
        handler
    }

    /// Pinterest: `POST /v5/oauth/token`.
    pub fn pinterest(credentials: Option<ClientCredentials>) -> Self {
        Self::new(
            "pinterest",
            "https://api.pinterest.com/v5/oauth/token",
            credentials,
        )
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

impl PlatformComponent for StandardRefreshHandler {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }
}

#[async_trait]
impl OAuthHandler for StandardRefreshHandler {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, OAuthError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        if let Some(creds) = &self.credentials {
            form.insert(self.client_id_field, &creds.client_id);
            form.insert("client_secret", &creds.client_secret);
        }

        debug!(platform = %self.platform, token_url = %self.token_url, "Refreshing OAuth token");

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let token_response: TokenRefreshResponse = response.json().await.map_err(|e| {
            OAuthError::new(
                super::OAuthErrorKind::UnknownError,
                format!("Failed to parse token refresh response: {}", e),
            )
        })?;

        let grant = token_response.into_grant()?;
        info!(
            platform = %self.platform,
            rotated = grant.refresh_token.is_some(),
            "OAuth token refreshed"
        );
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::OAuthErrorKind;
    use chrono::{Duration, Utc};
    use mockito::Matcher;

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "my_refresh".into()),
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","refresh_token":"rotated","expires_in":7200}"#)
            .create_async()
            .await;

        let handler = StandardRefreshHandler::new(
            "pinterest",
            format!("{}/token", server.url()),
            Some(ClientCredentials {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
            }),
        );

        let grant = handler.refresh("my_refresh").await.unwrap();
        assert_eq!(grant.access_token, "new_token");
        assert_eq!(grant.refresh_token.as_deref(), Some("rotated"));
        assert!(grant.expires_at > Utc::now() + Duration::seconds(7000));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_unwraps_data_envelope_and_uses_client_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/oauth/token/")
            .match_body(Matcher::UrlEncoded("client_key".into(), "tt-key".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"access_token":"tt_access","refresh_token":"tt_refresh","expires_in":86400}}"#)
            .create_async()
            .await;

        let handler = StandardRefreshHandler::tiktok_with_url(
            &format!("{}/v2/oauth/token/", server.url()),
            Some(ClientCredentials {
                client_id: "tt-key".to_string(),
                client_secret: "tt-secret".to_string(),
            }),
        );

        let grant = handler.refresh("old").await.unwrap();
        assert_eq!(grant.access_token, "tt_access");
        assert_eq!(grant.refresh_token.as_deref(), Some("tt_refresh"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#)
            .create_async()
            .await;

        let handler = StandardRefreshHandler::new("pinterest", format!("{}/token", server.url()), None);
        let err = handler.refresh("revoked").await.unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
        assert_eq!(err.message, "Refresh token revoked");
    }

    #[tokio::test]
    async fn test_refresh_server_error_without_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(502)
            .create_async()
            .await;

        let handler = StandardRefreshHandler::new("pinterest", format!("{}/token", server.url()), None);
        let err = handler.refresh("r").await.unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::ServerError);
        assert!(err.message.contains("502"));
    }

    #[tokio::test]
    async fn test_refresh_unreachable_is_network_error() {
        let handler = StandardRefreshHandler::new("pinterest", "http://127.0.0.1:9/token", None);
        let err = handler.refresh("r").await.unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::NetworkError);
    }

    #[test]
    fn test_missing_access_token_is_rejected() {
        let response: TokenRefreshResponse =
            serde_json::from_str(r#"{"refresh_token":"only"}"#).unwrap();
        let err = response.into_grant().unwrap_err();
        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
    }
}
