use super::{
    error_from_response, transport_error, OAuthError, OAuthErrorKind, OAuthHandler,
    RefreshMaterial, TokenGrant,
};
use crate::registry::{Capability, PlatformComponent};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

const GRAPH_BASE_URL: &str = "https://graph.instagram.com";

/// Long-lived Instagram tokens last 60 days.
const LONG_LIVED_EXPIRES_IN_SECS: i64 = 60 * 24 * 3600;

#[derive(Deserialize, Debug)]
struct IgRefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Extends a long-lived Instagram token.
///
/// Instagram has no refresh tokens: the current access token is exchanged
/// for a new one via `GET /refresh_access_token?grant_type=ig_refresh_token`.
pub struct InstagramRefreshHandler {
    base_url: String,
    http_client: reqwest::Client,
}

impl InstagramRefreshHandler {
    pub fn new() -> Self {
        Self::with_base_url(GRAPH_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }
}

impl Default for InstagramRefreshHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformComponent for InstagramRefreshHandler {
    fn platform(&self) -> &str {
        "instagram"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::AccessTokenExchange]
    }
}

#[async_trait]
impl OAuthHandler for InstagramRefreshHandler {
    fn refresh_material(&self) -> RefreshMaterial {
        RefreshMaterial::AccessToken
    }

    async fn refresh(&self, access_token: &str) -> Result<TokenGrant, OAuthError> {
        let url = format!(
            "{}/refresh_access_token?grant_type=ig_refresh_token&access_token={}",
            self.base_url,
            urlencoding::encode(access_token)
        );
        debug!("Extending Instagram long-lived token");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: IgRefreshResponse = response.json().await.map_err(|e| {
            OAuthError::new(
                OAuthErrorKind::UnknownError,
                format!("Failed to parse Instagram refresh response: {}", e),
            )
        })?;

        info!("Instagram token extended");
        Ok(TokenGrant::expiring_in(
            body.access_token,
            None,
            body.expires_in.unwrap_or(LONG_LIVED_EXPIRES_IN_SECS),
        ))
    }
}
