//! Connection Manager - keeps platform connections usable.
//!
//! Hosts the token refresh scheduler and the resilient API executor on top of
//! the `tether` core (store, codec, OAuth handlers, error registry).
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────────┐      ┌──────────────────────────────┐
//!   │    TokenRefreshScheduler     │      │   PlatformAdapter (per API)  │
//!   │  - sweep expiring tokens     │      │  - normalize / validate      │
//!   │  - refresh with backoff      │◀─────│  - map platform errors       │
//!   │  - mark failures, webhook    │ hook │  ApiExecutor                 │
//!   └──────────────┬───────────────┘      │  - rate-limit windows        │
//!                  │                      │  - token recovery, backoff   │
//!                  ▼                      └──────────────┬───────────────┘
//!        ConnectionStore + CredentialCodec               │
//!                  ▲                                     ▼
//!                  └──────────── ErrorRegistry ◀─── classify / recover
//! ```
//!
//! # Core Types
//!
//! - [`TokenRefreshScheduler`] - periodic sweep and refresh state machine
//! - [`ApiExecutor`] - retry, rate-limit and token-recovery policy for calls
//! - [`PlatformAdapter`] - per-platform response handling
//! - [`AdapterRegistry`] - adapters by platform

pub mod adapter;
pub mod adapters;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod tokens;

pub use adapter::{
    ApiExecutor, ApiResponse, ExecuteOptions, PlatformAdapter, PlatformResponse, RetryPolicy,
};
pub use notify::WebhookNotifier;
pub use registry::{default_adapters, default_handlers, AdapterRegistry};
pub use scheduler::{RefreshStatus, TaskStatus, TokenRefreshScheduler};
pub use tokens::{AccessTokenSource, StaticToken, StoredTokens};
