// Per-endpoint rate-limit windows.
//
// Windows are learned from what platforms report after each call (headers or
// response metadata). State is in-memory only and private to one executor.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Rate-limit state reported by one platform response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Logical endpoint the budget applies to.
    pub endpoint: String,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets, relative to when the response arrived.
    #[serde(with = "secs")]
    pub reset_in: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Tracked budget for a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitWindow {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Instant,
}

impl RateLimitWindow {
    fn is_exhausted(&self, now: Instant) -> bool {
        self.remaining == 0 && self.reset_at > now
    }
}

/// An exhausted window found by [`RateLimitTracker::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimited {
    pub endpoint: String,
    pub wait: Duration,
}

/// Rate-limit windows keyed by endpoint.
///
/// Entries whose reset time has passed are dropped on the next check.
#[derive(Default)]
pub struct RateLimitTracker {
    windows: DashMap<String, RateLimitWindow>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Records the budget a response reported.
    pub fn update(&self, info: &RateLimitInfo) {
        self.windows.insert(
            info.endpoint.clone(),
            RateLimitWindow {
                limit: info.limit,
                remaining: info.remaining,
                reset_at: Instant::now() + info.reset_in,
            },
        );
    }

    /// Returns the exhausted window with the longest wait, if any.
    pub fn check(&self) -> Option<RateLimited> {
        let now = Instant::now();
        self.windows.retain(|_, window| window.reset_at > now);

        self.windows
            .iter()
            .filter(|entry| entry.value().is_exhausted(now))
            .map(|entry| RateLimited {
                endpoint: entry.key().clone(),
                wait: entry.value().reset_at - now,
            })
            .max_by_key(|limited| limited.wait)
    }

    pub fn window(&self, endpoint: &str) -> Option<RateLimitWindow> {
        self.windows.get(endpoint).map(|w| *w.value())
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}
