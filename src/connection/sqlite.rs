//! SQLite-backed connection store.

use super::{Connection, ConnectionFilter, ConnectionPatch, ConnectionStatus, ConnectionStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const COLUMNS: &str = "id, user_id, platform, access_token, access_token_key_id, \
     refresh_token, refresh_token_key_id, token_expires_at, status, scopes, last_sync, metadata";

/// Connection store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     id TEXT PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     platform TEXT NOT NULL,
///     access_token TEXT NOT NULL,          -- Encrypted
///     access_token_key_id TEXT NOT NULL,
///     refresh_token TEXT,                  -- Encrypted (optional)
///     refresh_token_key_id TEXT,
///     token_expires_at TEXT NOT NULL,      -- RFC 3339, fixed width UTC
///     status TEXT NOT NULL,                -- active | error | disconnected
///     scopes TEXT NOT NULL,                -- JSON array
///     last_sync TEXT,
///     metadata TEXT NOT NULL,              -- JSON object
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// Timestamps are written with fixed-width microseconds so that ordering by
/// the text column orders by time.
pub struct SqliteConnectionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteConnectionStore {
    /// Opens (or creates) the database at `db_path`. `":memory:"` works for tests.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_key_id TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_key_id TEXT,
                token_expires_at TEXT NOT NULL,
                status TEXT NOT NULL,
                scopes TEXT NOT NULL,
                last_sync TEXT,
                metadata TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create connections table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_status_expiry ON connections(status, token_expires_at)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    fn write(conn: &rusqlite::Connection, connection: &Connection) -> Result<()> {
        let scopes = serde_json::to_string(&connection.scopes).context("Failed to encode scopes")?;
        let metadata =
            serde_json::to_string(&connection.metadata).context("Failed to encode metadata")?;

        conn.execute(
            r#"
            INSERT INTO connections (
                id, user_id, platform,
                access_token, access_token_key_id,
                refresh_token, refresh_token_key_id,
                token_expires_at, status, scopes, last_sync, metadata, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                platform = excluded.platform,
                access_token = excluded.access_token,
                access_token_key_id = excluded.access_token_key_id,
                refresh_token = excluded.refresh_token,
                refresh_token_key_id = excluded.refresh_token_key_id,
                token_expires_at = excluded.token_expires_at,
                status = excluded.status,
                scopes = excluded.scopes,
                last_sync = excluded.last_sync,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
            params![
                connection.id,
                connection.user_id,
                connection.platform,
                connection.access_token,
                connection.access_token_key_id,
                connection.refresh_token,
                connection.refresh_token_key_id,
                timestamp(&connection.token_expires_at),
                connection.status.as_str(),
                scopes,
                connection.last_sync.as_ref().map(timestamp),
                metadata,
                timestamp(&Utc::now()),
            ],
        )
        .context("Failed to write connection")?;
        Ok(())
    }

    fn read(conn: &rusqlite::Connection, id: &str) -> Result<Option<Connection>> {
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM connections WHERE id = ?1", COLUMNS),
                params![id],
                RawConnection::from_row,
            )
            .optional()
            .context("Failed to query connection")?;
        raw.map(RawConnection::into_connection).transpose()
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse {} timestamp", field))
}

/// Row as stored, before JSON and timestamp decoding.
struct RawConnection {
    id: String,
    user_id: String,
    platform: String,
    access_token: String,
    access_token_key_id: String,
    refresh_token: Option<String>,
    refresh_token_key_id: Option<String>,
    token_expires_at: String,
    status: String,
    scopes: String,
    last_sync: Option<String>,
    metadata: String,
}

impl RawConnection {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            platform: row.get(2)?,
            access_token: row.get(3)?,
            access_token_key_id: row.get(4)?,
            refresh_token: row.get(5)?,
            refresh_token_key_id: row.get(6)?,
            token_expires_at: row.get(7)?,
            status: row.get(8)?,
            scopes: row.get(9)?,
            last_sync: row.get(10)?,
            metadata: row.get(11)?,
        })
    }

    fn into_connection(self) -> Result<Connection> {
        Ok(Connection {
            token_expires_at: parse_timestamp(&self.token_expires_at, "token_expires_at")?,
            status: self.status.parse::<ConnectionStatus>()?,
            scopes: serde_json::from_str(&self.scopes).context("Failed to decode scopes")?,
            last_sync: self
                .last_sync
                .as_deref()
                .map(|s| parse_timestamp(s, "last_sync"))
                .transpose()?,
            metadata: serde_json::from_str(&self.metadata).context("Failed to decode metadata")?,
            id: self.id,
            user_id: self.user_id,
            platform: self.platform,
            access_token: self.access_token,
            access_token_key_id: self.access_token_key_id,
            refresh_token: self.refresh_token,
            refresh_token_key_id: self.refresh_token_key_id,
        })
    }
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
        let mut sql = format!("SELECT {} FROM connections", COLUMNS);
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .map(|status| {
                    values.push(status.as_str().to_string());
                    format!("?{}", values.len())
                })
                .collect();
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if let Some(platform) = &filter.platform {
            values.push(platform.clone());
            clauses.push(format!("platform = ?{}", values.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if filter.order_by_expiry {
            sql.push_str(" ORDER BY token_expires_at ASC");
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawConnection::from_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter().map(RawConnection::into_connection).collect()
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        let conn = self.lock()?;
        Self::read(&conn, id)
    }

    async fn update_connection(&self, id: &str, patch: &ConnectionPatch) -> Result<bool> {
        let conn = self.lock()?;
        let Some(mut connection) = Self::read(&conn, id)? else {
            debug!(connection_id = %id, "Update for missing connection ignored");
            return Ok(false);
        };
        patch.apply(&mut connection);
        Self::write(&conn, &connection)?;
        Ok(true)
    }

    async fn insert_connection(&self, connection: &Connection) -> Result<()> {
        let conn = self.lock()?;
        Self::write(&conn, connection)
    }
}
