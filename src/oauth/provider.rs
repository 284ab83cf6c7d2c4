//! OAuth client credentials per platform.

use serde::{Deserialize, Serialize};

/// Client id/secret registered with a platform.
///
/// Loaded from `TETHER_OAUTH_{PLATFORM}_CLIENT_ID` and
/// `TETHER_OAUTH_{PLATFORM}_CLIENT_SECRET`.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ClientCredentials {
    /// Returns `None` unless both variables are set.
    pub fn from_env(platform: &str) -> Option<Self> {
        let env_prefix = platform.to_uppercase();
        let client_id = std::env::var(format!("TETHER_OAUTH_{}_CLIENT_ID", env_prefix)).ok()?;
        let client_secret =
            std::env::var(format!("TETHER_OAUTH_{}_CLIENT_SECRET", env_prefix)).ok()?;
        Some(Self {
            client_id,
            client_secret,
        })
    }
}
