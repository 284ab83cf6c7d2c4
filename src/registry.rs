//! Platform registries.
//!
//! A [`PlatformRegistry`] maps a platform identifier (`"instagram"`,
//! `"tiktok"`, ...) to one pluggable implementation. The same type backs the
//! OAuth handler registry ([`HandlerRegistry`]) and the API adapter registry
//! in the connection manager.

use crate::error::NormalizedError;
use crate::oauth::{OAuthHandler, RefreshMaterial};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Optional features an implementation may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Refreshes with a refresh token.
    RefreshToken,
    /// Refreshes by exchanging the current access token.
    AccessTokenExchange,
    Insights,
    Comments,
    Scheduling,
    Publishing,
}

/// Anything registered under a platform identifier.
pub trait PlatformComponent: Send + Sync {
    fn platform(&self) -> &str;

    /// Human readable platform name.
    fn display_name(&self) -> String {
        let platform = self.platform();
        let mut chars = platform.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }
}

/// Capabilities exposed by one registered implementation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityReport {
    pub platform: String,
    pub capabilities: Vec<Capability>,
}

impl CapabilityReport {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// A successful per-platform result from a bulk operation.
#[derive(Debug)]
pub struct PlatformSuccess<R> {
    pub platform: String,
    pub result: R,
}

/// A failed per-platform result from a bulk operation.
#[derive(Debug)]
pub struct PlatformFailure {
    pub platform: String,
    pub error: NormalizedError,
}

/// Partitioned outcome of [`PlatformRegistry::execute_for_platforms`].
#[derive(Debug)]
pub struct BulkOutcome<R> {
    pub succeeded: Vec<PlatformSuccess<R>>,
    pub failed: Vec<PlatformFailure>,
}

impl<R> BulkOutcome<R> {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-platform OAuth summary for configuration screens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformConfig {
    pub platform: String,
    pub display_name: String,
    pub supports_refresh_token: bool,
    pub auth_type: String,
}

/// Registry of implementations keyed by platform identifier.
pub struct PlatformRegistry<T: ?Sized + PlatformComponent> {
    kind: &'static str,
    entries: DashMap<String, Arc<T>>,
}

impl<T: ?Sized + PlatformComponent> PlatformRegistry<T> {
    /// `kind` names what is registered (`"OAuth handler"`, `"API adapter"`)
    /// and appears in log lines and lookup errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    /// Registers `component` for `platform`, replacing any previous entry.
    pub fn register(&self, platform: impl Into<String>, component: Arc<T>) {
        let platform = platform.into();
        if self.entries.insert(platform.clone(), component).is_some() {
            warn!(kind = self.kind, platform = %platform, "Overwriting registered implementation");
        } else {
            debug!(kind = self.kind, platform = %platform, "Registered implementation");
        }
    }

    pub fn get(&self, platform: &str) -> Result<Arc<T>, NormalizedError> {
        self.entries
            .get(platform)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| NormalizedError::platform_not_supported(platform, self.kind))
    }

    /// Registered platform identifiers, sorted.
    pub fn list_supported(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        platforms.sort();
        platforms
    }

    pub fn is_supported(&self, platform: &str) -> bool {
        self.entries.contains_key(platform)
    }

    pub fn capabilities(&self, platform: &str) -> Result<CapabilityReport, NormalizedError> {
        let component = self.get(platform)?;
        Ok(CapabilityReport {
            platform: platform.to_string(),
            capabilities: component.capabilities(),
        })
    }

    /// Runs `operation` against every listed platform concurrently.
    ///
    /// Unknown platforms and failing operations land in `failed`; they never
    /// abort the other platforms.
    pub async fn execute_for_platforms<R, F, Fut>(
        &self,
        platforms: &[String],
        operation: F,
    ) -> BulkOutcome<R>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R, NormalizedError>>,
    {
        let futures = platforms.iter().map(|platform| {
            let lookup = self.get(platform);
            let pending = lookup.map(&operation);
            async move {
                let result = match pending {
                    Ok(fut) => fut.await,
                    Err(e) => Err(e),
                };
                (platform.clone(), result)
            }
        });

        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for (platform, result) in join_all(futures).await {
            match result {
                Ok(result) => outcome.succeeded.push(PlatformSuccess { platform, result }),
                Err(error) => {
                    warn!(kind = self.kind, platform = %platform, error = %error, "Bulk operation failed");
                    outcome.failed.push(PlatformFailure { platform, error });
                }
            }
        }
        outcome
    }
}

/// OAuth handlers by platform.
pub type HandlerRegistry = PlatformRegistry<dyn OAuthHandler>;

impl PlatformRegistry<dyn OAuthHandler> {
    pub fn for_handlers() -> Self {
        Self::new("OAuth handler")
    }

    /// Per-platform OAuth summary, sorted by platform.
    pub fn platform_configs(&self) -> Vec<PlatformConfig> {
        self.list_supported()
            .into_iter()
            .filter_map(|platform| {
                let handler = self.get(&platform).ok()?;
                Some(PlatformConfig {
                    display_name: handler.display_name(),
                    supports_refresh_token: handler.refresh_material()
                        == RefreshMaterial::RefreshToken,
                    auth_type: "OAuth 2.0".to_string(),
                    platform,
                })
            })
            .collect()
    }
}
