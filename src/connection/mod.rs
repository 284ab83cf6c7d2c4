//! Connection records and the store the engine reads and updates.
//!
//! A [`Connection`] is one user's authorization to one platform. Tokens are
//! held encrypted together with the key id they were encrypted under. The
//! engine never creates or deletes connections; it lists them, reads them and
//! patches them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

mod memory;
mod sqlite;

pub use memory::MemoryConnectionStore;
pub use sqlite::SqliteConnectionStore;

/// Metadata key: RFC 3339 time of the last successful refresh.
pub const META_LAST_REFRESH_SUCCESS: &str = "last_refresh_success";
/// Metadata key: message of the last permanent refresh failure.
pub const META_LAST_REFRESH_ERROR: &str = "last_refresh_error";
/// Metadata key: RFC 3339 time of the last permanent refresh failure.
pub const META_LAST_REFRESH_ATTEMPT: &str = "last_refresh_attempt";
/// Metadata key: number of refresh runs recorded against the connection.
pub const META_REFRESH_ATTEMPT_COUNT: &str = "refresh_attempt_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(anyhow::anyhow!("Unknown connection status: {}", other)),
        }
    }
}

/// A user's connection to one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    /// Encrypted access token.
    pub access_token: String,
    pub access_token_key_id: String,
    /// Encrypted refresh token; some platforms never issue one.
    pub refresh_token: Option<String>,
    pub refresh_token_key_id: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Connection {
    /// Number of refresh runs recorded in metadata.
    pub fn refresh_attempt_count(&self) -> u64 {
        self.metadata
            .get(META_REFRESH_ATTEMPT_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn last_refresh_error(&self) -> Option<&str> {
        self.metadata
            .get(META_LAST_REFRESH_ERROR)
            .and_then(Value::as_str)
    }

    /// True when the token expires within `threshold` of `now`.
    pub fn expires_within(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.token_expires_at - now <= threshold
    }
}

/// Selection for [`ConnectionStore::list_connections`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    /// Empty matches every status.
    pub statuses: Vec<ConnectionStatus>,
    pub platform: Option<String>,
    /// Sort by `token_expires_at`, soonest first.
    pub order_by_expiry: bool,
}

impl ConnectionFilter {
    pub fn with_statuses(statuses: &[ConnectionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn ordered_by_expiry(mut self) -> Self {
        self.order_by_expiry = true;
        self
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&connection.status))
            && self
                .platform
                .as_deref()
                .map_or(true, |p| p == connection.platform)
    }
}

/// Partial update. Only fields that are `Some` are written.
///
/// `refresh_token` and its key id are double options so a patch can clear
/// them (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionPatch {
    pub access_token: Option<String>,
    pub access_token_key_id: Option<String>,
    pub refresh_token: Option<Option<String>>,
    pub refresh_token_key_id: Option<Option<String>>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: Option<ConnectionStatus>,
    pub last_sync: Option<DateTime<Utc>>,
    /// Replaces the whole metadata map.
    pub metadata: Option<Map<String, Value>>,
}

impl ConnectionPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, connection: &mut Connection) {
        if let Some(v) = &self.access_token {
            connection.access_token = v.clone();
        }
        if let Some(v) = &self.access_token_key_id {
            connection.access_token_key_id = v.clone();
        }
        if let Some(v) = &self.refresh_token {
            connection.refresh_token = v.clone();
        }
        if let Some(v) = &self.refresh_token_key_id {
            connection.refresh_token_key_id = v.clone();
        }
        if let Some(v) = self.token_expires_at {
            connection.token_expires_at = v;
        }
        if let Some(v) = self.status {
            connection.status = v;
        }
        if let Some(v) = self.last_sync {
            connection.last_sync = Some(v);
        }
        if let Some(v) = &self.metadata {
            connection.metadata = v.clone();
        }
    }
}

/// Persistent connection storage consumed by the engine.
///
/// The store is shared with other writers (connect/disconnect flows); the
/// engine holds no lock across calls. Updating a connection that no longer
/// exists returns `Ok(false)`.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>>;

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>>;

    async fn update_connection(&self, id: &str, patch: &ConnectionPatch) -> Result<bool>;

    /// Inserts or replaces a connection.
    async fn insert_connection(&self, connection: &Connection) -> Result<()>;
}

#[cfg(test)]
pub(crate) fn test_connection(id: &str, platform: &str, expires_in_secs: i64) -> Connection {
    Connection {
        id: id.to_string(),
        user_id: "user-1".to_string(),
        platform: platform.to_string(),
        access_token: "enc-access".to_string(),
        access_token_key_id: "kid-0".to_string(),
        refresh_token: Some("enc-refresh".to_string()),
        refresh_token_key_id: Some("kid-0".to_string()),
        token_expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        status: ConnectionStatus::Active,
        scopes: vec!["read".to_string()],
        last_sync: None,
        metadata: Map::new(),
    }
}
