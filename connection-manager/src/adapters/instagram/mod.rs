//! Instagram Graph API adapter.
//!
//! Reads a user's profile, media, single media items and media insights.
//! Responses are normalized into platform-neutral JSON:
//!
//! - media items: `{id, type, caption, url, thumbnail_url, permalink,
//!   timestamp, username, metrics: {likes, comments}}`
//! - media lists: `{items: [...], paging}`
//! - insights: `{metrics: {<name>: {value, timestamp}}}`
//!
//! Rate limits come from the `x-app-usage` header, which reports usage as a
//! percentage of the hourly app budget.

pub mod api;

use crate::adapter::{
    ApiExecutor, ApiResponse, ExecuteOptions, PlatformAdapter, PlatformResponse,
};
use crate::tokens::AccessTokenSource;
use api::InstagramClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tether::error::{ErrorCategory, ErrorCode, NormalizedError};
use tether::rate_limit::RateLimitInfo;
use tether::registry::{Capability, PlatformComponent};
use tracing::warn;

const PLATFORM: &str = "instagram";
const APP_USAGE_ENDPOINT: &str = "api_calls";
const APP_USAGE_LIMIT: u64 = 100;
const APP_USAGE_RESET: Duration = Duration::from_secs(3600);

/// Graph error subcode for an expired session.
const SUBCODE_SESSION_EXPIRED: i64 = 463;

#[derive(Deserialize)]
struct RawMediaItem {
    id: String,
    media_type: String,
    media_url: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    timestamp: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    like_count: Option<u64>,
    #[serde(default)]
    comments_count: Option<u64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MediaMetrics {
    pub likes: u64,
    pub comments: u64,
}

/// Normalized media item.
#[derive(Debug, Serialize, PartialEq)]
pub struct MediaItem {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub caption: String,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub permalink: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub username: Option<String>,
    pub metrics: MediaMetrics,
}

#[derive(Deserialize)]
struct RawInsight {
    name: String,
    values: Vec<RawInsightValue>,
}

#[derive(Deserialize)]
struct RawInsightValue {
    value: Value,
    #[serde(default)]
    end_time: Option<String>,
}

#[derive(Deserialize)]
struct AppUsage {
    call_count: u64,
}

#[derive(Deserialize, Default)]
struct GraphErrorBody {
    #[serde(default)]
    error: Option<GraphError>,
}

#[derive(Deserialize)]
struct GraphError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
}

fn invalid_response(message: impl Into<String>) -> NormalizedError {
    NormalizedError::new(ErrorCategory::Api, ErrorCode::InvalidResponse, message)
        .with_platform(PLATFORM)
}

/// Instagram timestamps use `+0000` offsets; RFC 3339 is accepted as well.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, NormalizedError> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid_response(format!("Invalid Instagram timestamp {}: {}", s, e)))
}

fn normalize_media_item(item: &Value) -> Result<MediaItem, NormalizedError> {
    let raw: RawMediaItem = serde_json::from_value(item.clone())
        .map_err(|e| invalid_response(format!("Invalid Instagram media item: {}", e)))?;
    Ok(MediaItem {
        timestamp: parse_timestamp(&raw.timestamp)?,
        media_type: raw.media_type.to_lowercase(),
        caption: raw.caption.unwrap_or_default(),
        thumbnail_url: raw.thumbnail_url.or_else(|| raw.media_url.clone()),
        url: raw.media_url,
        permalink: raw.permalink,
        username: raw.username,
        metrics: MediaMetrics {
            likes: raw.like_count.unwrap_or(0),
            comments: raw.comments_count.unwrap_or(0),
        },
        id: raw.id,
    })
}

fn normalize_insights(data: &Value) -> Result<Value, NormalizedError> {
    let insights: Vec<RawInsight> = serde_json::from_value(data.clone())
        .map_err(|e| invalid_response(format!("Invalid Instagram insights: {}", e)))?;
    let mut metrics = Map::new();
    for insight in insights {
        let Some(first) = insight.values.into_iter().next() else {
            continue;
        };
        let timestamp = first
            .end_time
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        metrics.insert(
            insight.name,
            json!({ "value": first.value, "timestamp": timestamp }),
        );
    }
    Ok(json!({ "metrics": metrics }))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, NormalizedError> {
    serde_json::to_value(value)
        .map_err(|e| invalid_response(format!("Failed to encode normalized data: {}", e)))
}

fn is_media_item(value: &Value) -> bool {
    value.is_object()
        && value["id"].is_string()
        && value["media_type"].is_string()
        && value["media_url"].is_string()
        && value["timestamp"].is_string()
}

fn is_insight(value: &Value) -> bool {
    value["name"].is_string()
        && value["values"]
            .as_array()
            .map_or(false, |values| !values.is_empty())
}

/// Distinguishes a media list from an insights list by its first entry.
fn is_media_list(items: &[Value]) -> bool {
    items.first().map_or(true, |item| item.get("media_type").is_some())
}

/// Adapter for the Instagram Graph API.
pub struct InstagramAdapter {
    client: InstagramClient,
    executor: ApiExecutor,
    tokens: Arc<dyn AccessTokenSource>,
}

impl InstagramAdapter {
    pub fn new(executor: ApiExecutor, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self::with_client(InstagramClient::new(), executor, tokens)
    }

    pub fn with_client(
        client: InstagramClient,
        executor: ApiExecutor,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            client,
            executor,
            tokens,
        }
    }

    pub fn executor(&self) -> &ApiExecutor {
        &self.executor
    }

    pub async fn user_profile(&self, connection_id: &str) -> Result<ApiResponse, NormalizedError> {
        self.get(
            connection_id,
            "user",
            "/me",
            vec![("fields", api::PROFILE_FIELDS.to_string())],
        )
        .await
    }

    /// One page of the user's media, newest first.
    pub async fn user_media(
        &self,
        connection_id: &str,
        limit: u32,
        after: Option<&str>,
    ) -> Result<ApiResponse, NormalizedError> {
        let mut query = vec![
            ("fields", api::MEDIA_FIELDS.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = after {
            query.push(("after", cursor.to_string()));
        }
        self.get(connection_id, "media", "/me/media", query).await
    }

    pub async fn media_item(
        &self,
        connection_id: &str,
        media_id: &str,
    ) -> Result<ApiResponse, NormalizedError> {
        self.get(
            connection_id,
            "media_item",
            &format!("/{}", media_id),
            vec![("fields", api::MEDIA_ITEM_FIELDS.to_string())],
        )
        .await
    }

    pub async fn media_insights(
        &self,
        connection_id: &str,
        media_id: &str,
    ) -> Result<ApiResponse, NormalizedError> {
        self.get(
            connection_id,
            "insights",
            &format!("/{}/insights", media_id),
            vec![("metric", api::INSIGHT_METRICS.to_string())],
        )
        .await
    }

    async fn get(
        &self,
        connection_id: &str,
        endpoint: &str,
        path: &str,
        query: Vec<(&str, String)>,
    ) -> Result<ApiResponse, NormalizedError> {
        let options = ExecuteOptions::for_connection(connection_id).endpoint(endpoint);
        self.executor
            .execute_call(&options, || self.fetch(connection_id, path, &query))
            .await
    }

    /// One request; the token is looked up per attempt.
    async fn fetch(
        &self,
        connection_id: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<ApiResponse> {
        let token = self.tokens.access_token(connection_id).await?;
        let response = self.client.get(path, query, &token).await?;
        Ok(self.normalize_response(&response)?)
    }
}

impl PlatformComponent for InstagramAdapter {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Insights]
    }
}

impl PlatformAdapter for InstagramAdapter {
    fn normalize_data(&self, body: &Value) -> Result<Value, NormalizedError> {
        match body.get("data") {
            Some(Value::Array(items)) if is_media_list(items) => {
                let items = items
                    .iter()
                    .map(normalize_media_item)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(json!({
                    "items": to_value(&items)?,
                    "paging": body.get("paging").cloned().unwrap_or(Value::Null),
                }))
            }
            Some(data @ Value::Array(_)) => normalize_insights(data),
            _ if body.get("media_type").is_some() => to_value(&normalize_media_item(body)?),
            _ => Ok(json!({
                "id": body["id"],
                "username": body["username"],
                "account_type": body["account_type"],
                "media_count": body["media_count"].as_u64().unwrap_or(0),
            })),
        }
    }

    fn extract_metadata(&self, response: &PlatformResponse) -> Map<String, Value> {
        let mut metadata = Map::new();
        if let Some(id) = response.header("x-fb-request-id") {
            metadata.insert("request_id".to_string(), json!(id));
        }
        if let Some(trace) = response.header("x-fb-trace-id") {
            metadata.insert("trace".to_string(), json!(trace));
        }
        metadata
    }

    fn extract_rate_limits(&self, response: &PlatformResponse) -> Vec<RateLimitInfo> {
        let Some(usage) = response.header("x-app-usage") else {
            return Vec::new();
        };
        match serde_json::from_str::<AppUsage>(usage) {
            Ok(usage) => vec![RateLimitInfo {
                endpoint: APP_USAGE_ENDPOINT.to_string(),
                limit: APP_USAGE_LIMIT,
                remaining: APP_USAGE_LIMIT.saturating_sub(usage.call_count),
                reset_in: APP_USAGE_RESET,
            }],
            Err(e) => {
                warn!(error = %e, "Failed to parse Instagram rate limits");
                Vec::new()
            }
        }
    }

    fn map_error(&self, response: &PlatformResponse) -> NormalizedError {
        let graph = serde_json::from_value::<GraphErrorBody>(response.body.clone())
            .unwrap_or_default()
            .error;
        let (code, subcode, message, error_type) = match &graph {
            Some(e) => (
                e.code,
                e.error_subcode,
                e.message.clone(),
                e.error_type.clone(),
            ),
            None => (None, None, None, None),
        };

        let (category, error_code) = match code {
            Some(190) if subcode == Some(SUBCODE_SESSION_EXPIRED) => {
                (ErrorCategory::Token, ErrorCode::TokenExpired)
            }
            Some(190) => (ErrorCategory::Token, ErrorCode::TokenInvalid),
            Some(4) => (ErrorCategory::RateLimit, ErrorCode::RateLimitExceeded),
            Some(24) => (ErrorCategory::Authorization, ErrorCode::PermissionDenied),
            Some(10) => (ErrorCategory::Validation, ErrorCode::InvalidParameter),
            _ if response.status == 404 => (ErrorCategory::Api, ErrorCode::InvalidRequest),
            _ if response.status >= 500 => (ErrorCategory::Api, ErrorCode::ServiceUnavailable),
            _ => (ErrorCategory::Unknown, ErrorCode::UnknownError),
        };

        let message = message
            .unwrap_or_else(|| format!("Instagram API error: HTTP {}", response.status));
        let mut error = NormalizedError::new(category, error_code, message)
            .with_platform(PLATFORM)
            .with_metadata("status", response.status);
        if let Some(code) = code {
            error = error.with_metadata("platform_code", code);
        }
        if let Some(error_type) = error_type {
            error = error.with_metadata("platform_error_type", error_type);
        }
        error
    }

    fn validate_response(&self, body: &Value) -> bool {
        if !body.is_object() {
            return false;
        }
        match body.get("data") {
            Some(Value::Array(items)) if is_media_list(items) => {
                items.iter().all(is_media_item) && body["paging"].is_object()
            }
            Some(Value::Array(items)) => items.iter().all(is_insight),
            Some(_) => false,
            None if body.get("media_type").is_some() => is_media_item(body),
            None => body["id"].is_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::StaticToken;
    use mockito::Matcher;
    use reqwest::header::{HeaderMap, HeaderValue};
    use tether::error::ErrorRegistry;

    fn adapter(base_url: &str) -> InstagramAdapter {
        let executor = ApiExecutor::new(PLATFORM, Arc::new(ErrorRegistry::new(100)));
        InstagramAdapter::with_client(
            InstagramClient::with_base_url(base_url.to_string()),
            executor,
            Arc::new(StaticToken("IGtoken".to_string())),
        )
    }

    fn response(status: u16, body: Value) -> PlatformResponse {
        PlatformResponse {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    fn media_json() -> Value {
        json!({
            "id": "17895695668004550",
            "media_type": "IMAGE",
            "media_url": "https://cdn.example.com/a.jpg",
            "permalink": "https://instagram.com/p/abc",
            "timestamp": "2024-03-01T10:00:00+0000",
            "username": "alice",
            "like_count": 12
        })
    }

    #[test]
    fn test_normalize_media_item_defaults() {
        let adapter = adapter("http://unused");
        let data = adapter.normalize_data(&media_json()).unwrap();

        assert_eq!(data["type"], "image");
        assert_eq!(data["caption"], "");
        assert_eq!(data["thumbnail_url"], "https://cdn.example.com/a.jpg");
        assert_eq!(data["metrics"]["likes"], 12);
        assert_eq!(data["metrics"]["comments"], 0);
        assert_eq!(data["timestamp"], "2024-03-01T10:00:00Z");
    }

    #[test]
    fn test_normalize_insights() {
        let adapter = adapter("http://unused");
        let body = json!({
            "data": [
                {"name": "reach", "values": [{"value": 42, "end_time": "2024-03-02T08:00:00+0000"}]},
                {"name": "saved", "values": [{"value": 3}]}
            ]
        });
        assert!(adapter.validate_response(&body));

        let data = adapter.normalize_data(&body).unwrap();
        assert_eq!(data["metrics"]["reach"]["value"], 42);
        assert_eq!(data["metrics"]["saved"]["value"], 3);
        assert!(data["metrics"]["saved"]["timestamp"].is_null());
    }

    #[test]
    fn test_validate_response_shapes() {
        let adapter = adapter("http://unused");
        assert!(adapter.validate_response(&media_json()));
        assert!(adapter.validate_response(&json!({"data": [media_json()], "paging": {}})));
        assert!(!adapter.validate_response(&json!({"data": [media_json()]})));
        assert!(!adapter.validate_response(&json!({"data": [{"name": "reach", "values": []}]})));
        assert!(!adapter.validate_response(&json!({"media_type": "IMAGE"})));
        assert!(!adapter.validate_response(&json!([1, 2])));
        assert!(adapter.validate_response(&json!({"id": "1", "username": "alice"})));
    }

    #[test]
    fn test_rate_limits_from_app_usage() {
        let adapter = adapter("http://unused");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-app-usage",
            HeaderValue::from_static(r#"{"call_count":28,"total_cputime":25,"total_time":25}"#),
        );
        let limits = adapter.extract_rate_limits(&PlatformResponse {
            status: 200,
            headers,
            body: Value::Null,
        });

        assert_eq!(
            limits,
            vec![RateLimitInfo {
                endpoint: "api_calls".to_string(),
                limit: 100,
                remaining: 72,
                reset_in: Duration::from_secs(3600),
            }]
        );
        assert!(adapter
            .extract_rate_limits(&response(200, Value::Null))
            .is_empty());
    }

    #[test]
    fn test_map_graph_errors() {
        let adapter = adapter("http://unused");
        let graph = |code: i64, subcode: Option<i64>| {
            response(
                400,
                json!({"error": {"message": "graph says no", "type": "OAuthException", "code": code, "error_subcode": subcode}}),
            )
        };

        let err = adapter.map_error(&graph(190, None));
        assert_eq!(
            (err.category(), err.code()),
            (ErrorCategory::Token, ErrorCode::TokenInvalid)
        );
        assert_eq!(err.message(), "graph says no");

        let err = adapter.map_error(&graph(190, Some(463)));
        assert!(err.is_token_expiry());

        assert_eq!(adapter.map_error(&graph(4, None)).category(), ErrorCategory::RateLimit);
        assert_eq!(adapter.map_error(&graph(24, None)).code(), ErrorCode::PermissionDenied);
        assert_eq!(adapter.map_error(&graph(10, None)).code(), ErrorCode::InvalidParameter);

        let err = adapter.map_error(&response(404, Value::Null));
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        let err = adapter.map_error(&response(503, Value::Null));
        assert!(err.is_retryable());
        let err = adapter.map_error(&response(418, Value::Null));
        assert_eq!(err.category(), ErrorCategory::Unknown);
    }

    #[tokio::test]
    async fn test_user_media_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me/media")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("access_token".into(), "IGtoken".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
                Matcher::UrlEncoded("after".into(), "cursor1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("x-app-usage", r#"{"call_count":99}"#)
            .with_header("x-fb-request-id", "req-1")
            .with_body(
                json!({
                    "data": [media_json()],
                    "paging": {"cursors": {"after": "cursor2"}}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        let response = adapter
            .user_media("conn-1", 10, Some("cursor1"))
            .await
            .unwrap();

        assert_eq!(response.data["items"][0]["id"], "17895695668004550");
        assert_eq!(response.data["paging"]["cursors"]["after"], "cursor2");
        assert_eq!(response.metadata["request_id"], "req-1");
        assert_eq!(
            adapter.executor().rate_limits().window("api_calls").unwrap().remaining,
            1
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_permission_error_over_http() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/me")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"message":"Application does not have permission","code":24}}"#)
            .create_async()
            .await;

        let err = adapter(&server.url()).user_profile("conn-1").await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Authorization);
        assert_eq!(err.platform(), Some("instagram"));
        assert_eq!(err.connection_id(), Some("conn-1"));
    }
}
