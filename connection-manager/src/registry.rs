//! Built-in platform wiring.

use crate::adapter::{ApiExecutor, PlatformAdapter, RetryPolicy};
use crate::adapters::InstagramAdapter;
use crate::tokens::AccessTokenSource;
use std::sync::Arc;
use tether::error::ErrorRegistry;
use tether::oauth::{ClientCredentials, InstagramRefreshHandler, StandardRefreshHandler};
use tether::{HandlerRegistry, PlatformRegistry};

/// API adapters by platform.
pub type AdapterRegistry = PlatformRegistry<dyn PlatformAdapter>;

pub fn adapter_registry() -> AdapterRegistry {
    PlatformRegistry::new("API adapter")
}

/// OAuth handlers for every supported platform.
///
/// Client credentials come from `TETHER_OAUTH_{PLATFORM}_CLIENT_ID` and
/// `_CLIENT_SECRET`; platforms without them still refresh, without client
/// authentication.
pub fn default_handlers() -> HandlerRegistry {
    let handlers = HandlerRegistry::for_handlers();
    handlers.register(
        "tiktok",
        Arc::new(StandardRefreshHandler::tiktok(ClientCredentials::from_env(
            "tiktok",
        ))),
    );
    handlers.register(
        "pinterest",
        Arc::new(StandardRefreshHandler::pinterest(
            ClientCredentials::from_env("pinterest"),
        )),
    );
    handlers.register("instagram", Arc::new(InstagramRefreshHandler::new()));
    handlers
}

/// API adapters for every platform with a read client. Each adapter gets its
/// own executor and therefore its own rate-limit windows.
pub fn default_adapters(
    errors: Arc<ErrorRegistry>,
    policy: RetryPolicy,
    tokens: Arc<dyn AccessTokenSource>,
) -> AdapterRegistry {
    let adapters = adapter_registry();
    let executor = ApiExecutor::new("instagram", errors).with_policy(policy);
    adapters.register("instagram", Arc::new(InstagramAdapter::new(executor, tokens)));
    adapters
}
