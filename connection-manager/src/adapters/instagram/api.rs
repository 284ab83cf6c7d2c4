use crate::adapter::PlatformResponse;
use anyhow::{Context, Result};
use reqwest::Client;

pub const BASE_URL: &str = "https://graph.instagram.com";

pub const PROFILE_FIELDS: &str = "id,username,account_type,media_count";
pub const MEDIA_FIELDS: &str =
    "id,caption,media_type,media_url,permalink,thumbnail_url,timestamp,username";
pub const MEDIA_ITEM_FIELDS: &str = "id,caption,media_type,media_url,permalink,thumbnail_url,\
     timestamp,username,like_count,comments_count";
pub const INSIGHT_METRICS: &str = "engagement,impressions,reach,saved,video_views";

/// HTTP client for the Instagram Graph API.
///
/// Returns raw responses; status handling is the adapter's job.
pub struct InstagramClient {
    http_client: Client,
    base_url: String,
}

impl InstagramClient {
    /// Create a client using the default Graph API base URL.
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    /// Create a client with a custom base URL (for testing with a mock server).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET {base}{path}` with `access_token` appended to `query`.
    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        access_token: &str,
    ) -> Result<PlatformResponse> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .get(&url)
            .query(query)
            .query(&[("access_token", access_token)])
            .send()
            .await
            .with_context(|| format!("Failed to send Instagram request to {}", path))?;

        PlatformResponse::read(response)
            .await
            .context("Failed to read Instagram response")
    }
}

impl Default for InstagramClient {
    fn default() -> Self {
        Self::new()
    }
}
