//! Access-token lookup for adapters.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tether::connection::{ConnectionStatus, ConnectionStore};
use tether::credentials::CredentialCodec;

/// Supplies the current plaintext access token for a connection.
///
/// Adapters ask on every attempt, so a token refreshed between attempts is
/// picked up by the retry.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self, connection_id: &str) -> Result<String>;
}

/// Reads and decrypts tokens from the connection store.
pub struct StoredTokens {
    store: Arc<dyn ConnectionStore>,
    codec: Arc<dyn CredentialCodec>,
}

impl StoredTokens {
    pub fn new(store: Arc<dyn ConnectionStore>, codec: Arc<dyn CredentialCodec>) -> Self {
        Self { store, codec }
    }
}

#[async_trait]
impl AccessTokenSource for StoredTokens {
    async fn access_token(&self, connection_id: &str) -> Result<String> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| anyhow!("Connection not found: {}", connection_id))?;

        if connection.status == ConnectionStatus::Disconnected {
            return Err(anyhow!("Connection {} is disconnected", connection_id));
        }

        self.codec
            .decrypt(&connection.access_token, &connection.access_token_key_id)
            .context("Failed to decrypt access token")
    }
}

/// A fixed token, for one-off calls and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self, _connection_id: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}
