//! In-process connection store.

use super::{Connection, ConnectionFilter, ConnectionPatch, ConnectionStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Connection store backed by a `HashMap`, for embedding and tests.
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: Mutex<HashMap<String, Connection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        Self {
            connections: Mutex::new(
                connections
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
        }
    }

    /// Removes a connection, as a disconnect flow would.
    pub fn remove(&self, id: &str) -> Result<Option<Connection>> {
        Ok(self.lock()?.remove(id))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Connection>>> {
        self.connections
            .lock()
            .map_err(|_| anyhow!("Connection store lock poisoned"))
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
        let mut connections: Vec<Connection> = self
            .lock()?
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        if filter.order_by_expiry {
            connections.sort_by_key(|c| c.token_expires_at);
        }
        Ok(connections)
    }

    async fn get_connection(&self, id: &str) -> Result<Option<Connection>> {
        Ok(self.lock()?.get(id).cloned())
    }

    async fn update_connection(&self, id: &str, patch: &ConnectionPatch) -> Result<bool> {
        let mut connections = self.lock()?;
        match connections.get_mut(id) {
            Some(connection) => {
                patch.apply(connection);
                Ok(true)
            }
            None => {
                debug!(connection_id = %id, "Update for missing connection ignored");
                Ok(false)
            }
        }
    }

    async fn insert_connection(&self, connection: &Connection) -> Result<()> {
        self.lock()?
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{test_connection, ConnectionStatus};

    #[tokio::test]
    async fn test_list_orders_by_expiry() {
        let store = MemoryConnectionStore::with_connections(vec![
            test_connection("late", "tiktok", 3600),
            test_connection("soon", "tiktok", 30),
            test_connection("mid", "pinterest", 600),
        ]);

        let ids: Vec<String> = store
            .list_connections(&ConnectionFilter::default().ordered_by_expiry())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["soon", "mid", "late"]);
    }

    #[tokio::test]
    async fn test_update_missing_is_noop() {
        let store = MemoryConnectionStore::new();
        let patch = ConnectionPatch {
            status: Some(ConnectionStatus::Error),
            ..Default::default()
        };
        assert!(!store.update_connection("gone", &patch).await.unwrap());
    }
}
