//! Tether core: the pieces shared by the API executor and the token refresh
//! scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  API executor        │   │  Refresh scheduler   │   (connection-manager)
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │                          │
//!            ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │  error::ErrorRegistry  (classify / recover)     │
//! │  registry::PlatformRegistry  (by platform id)   │
//! │  oauth::OAuthHandler   rate_limit::Tracker      │
//! │  connection::ConnectionStore  credentials::Codec│
//! └─────────────────────────────────────────────────┘
//! ```

// Engine configuration (TOML + env overrides)
pub mod config;

// Persisted connection records
pub mod connection;

// Token encryption at rest
pub mod credentials;

// Normalized errors, recovery strategies, error registry
pub mod error;

// OAuth refresh handlers
pub mod oauth;

// Per-endpoint rate-limit windows
pub mod rate_limit;

// Platform-keyed registries
pub mod registry;

pub use connection::{Connection, ConnectionStatus, ConnectionStore};
pub use error::{ErrorCategory, ErrorCode, ErrorContext, ErrorRegistry, NormalizedError};
pub use registry::{HandlerRegistry, PlatformComponent, PlatformRegistry};
