//! Refresh failure webhook.

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

const EVENT_TOKEN_REFRESH_FAILED: &str = "token_refresh_failed";

#[derive(Debug, Serialize)]
struct FailurePayload<'a> {
    #[serde(rename = "type")]
    event: &'a str,
    connection_id: &'a str,
    platform: &'a str,
    error: &'a str,
    timestamp: String,
}

/// Posts permanent refresh failures to an external endpoint.
///
/// Delivery is best effort: failures are logged and never returned.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    http_client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_client: Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn refresh_failed(&self, connection_id: &str, platform: &str, error: &str) {
        let payload = FailurePayload {
            event: EVENT_TOKEN_REFRESH_FAILED,
            connection_id,
            platform,
            error,
            timestamp: Utc::now().to_rfc3339(),
        };

        match self.http_client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(connection_id = %connection_id, "Refresh failure notification sent");
            }
            Ok(response) => warn!(
                connection_id = %connection_id,
                status = %response.status(),
                "Refresh failure webhook rejected notification"
            ),
            Err(e) => warn!(
                connection_id = %connection_id,
                error = %e,
                "Failed to send refresh failure notification"
            ),
        }
    }
}
