//! Credential codec for tokens at rest.
//!
//! The engine treats encryption as opaque: it hands a plaintext token and a
//! key id to a [`CredentialCodec`] and stores whatever comes back. Every
//! refresh generates a new key id, so ciphertext from one grant never
//! decrypts under another grant's id.
//!
//! ```text
//!   token ──encrypt(key_id)──▶ base64(nonce || ciphertext)
//!                                   │
//!                       stored with key_id on the Connection
//! ```

use anyhow::{Context, Result};

mod encryption;

pub use encryption::validate_key;

/// Fresh key id for a newly issued grant.
pub fn new_key_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Opaque encrypt/decrypt keyed by a key identifier.
pub trait CredentialCodec: Send + Sync {
    fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String>;
}

/// AES-256-GCM codec under a single master key; the key id is bound as
/// associated data.
pub struct AesGcmCodec {
    key: Vec<u8>,
}

impl AesGcmCodec {
    /// `master_key` is base64 of 32 bytes.
    pub fn new(master_key: &str) -> Result<Self> {
        let key = validate_key(master_key).context("Invalid encryption key")?;
        Ok(Self { key })
    }

    /// Reads the master key from `TETHER_ENCRYPTION_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("TETHER_ENCRYPTION_KEY")
            .context("TETHER_ENCRYPTION_KEY environment variable not set")?;
        Self::new(&key)
    }
}

impl CredentialCodec for AesGcmCodec {
    fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String> {
        encryption::seal(plaintext, key_id.as_bytes(), &self.key)
            .with_context(|| format!("Failed to encrypt token for key {}", key_id))
    }

    fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String> {
        encryption::open(ciphertext, key_id.as_bytes(), &self.key)
            .with_context(|| format!("Failed to decrypt token for key {}", key_id))
    }
}
