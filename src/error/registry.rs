//! Central error registry: classification, bounded history, recovery dispatch
//! and listener fan-out.

use super::recovery::{
    default_strategies, RecoveryOutcome, RecoveryStrategy, StrategyKey, TokenRecovery,
};
use super::{normalize, ErrorContext, ErrorSeverity, NormalizedError};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

/// Default number of errors kept in history.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

type Listener = Arc<dyn Fn(&NormalizedError, &RecoveryOutcome) + Send + Sync>;

/// Handle returned by [`ErrorRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

/// Error classifier and recovery registry.
///
/// One instance is shared (via `Arc`) by the API executors and the refresh
/// scheduler. All methods take `&self`.
pub struct ErrorRegistry {
    strategies: RwLock<HashMap<StrategyKey, Arc<dyn RecoveryStrategy>>>,
    listeners: Mutex<Listeners>,
    history: Mutex<VecDeque<NormalizedError>>,
    history_size: usize,
    tracking_endpoint: Option<String>,
    http_client: reqwest::Client,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl ErrorRegistry {
    /// Creates a registry with no strategies.
    pub fn new(history_size: usize) -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            }),
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            history_size,
            tracking_endpoint: None,
            http_client: reqwest::Client::new(),
        }
    }

    /// Creates a registry with the default rate-limit and network strategies,
    /// plus token refresh when a recovery hook is given.
    pub fn with_defaults(
        history_size: usize,
        token_recovery: Option<Arc<dyn TokenRecovery>>,
    ) -> Self {
        let registry = Self::new(history_size);
        for (key, strategy) in default_strategies(token_recovery) {
            registry.register_recovery_strategy(key, strategy);
        }
        registry
    }

    /// Posts every handled error to `endpoint` (fire-and-forget).
    pub fn with_tracking_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.tracking_endpoint = endpoint;
        self
    }

    /// Registers (or replaces) the strategy for a code or category.
    pub fn register_recovery_strategy(
        &self,
        key: impl Into<StrategyKey>,
        strategy: Arc<dyn RecoveryStrategy>,
    ) {
        self.strategies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), strategy);
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&NormalizedError, &RecoveryOutcome) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.entries.len();
        listeners.entries.retain(|(lid, _)| *lid != id);
        listeners.entries.len() != before
    }

    /// Classifies `raw`, records it, runs recovery and notifies listeners.
    pub async fn classify(&self, raw: anyhow::Error, context: &ErrorContext) -> NormalizedError {
        self.handle(raw, context).await.0
    }

    /// Like [`classify`](Self::classify) but also returns the recovery outcome.
    pub async fn handle(
        &self,
        raw: anyhow::Error,
        context: &ErrorContext,
    ) -> (NormalizedError, RecoveryOutcome) {
        let normalized = normalize(raw, context);
        let outcome = self.process(&normalized).await;
        (normalized, outcome)
    }

    /// Runs an already-built error through history, logging, recovery and
    /// listeners.
    pub async fn report(&self, error: NormalizedError) -> (NormalizedError, RecoveryOutcome) {
        let outcome = self.process(&error).await;
        (error, outcome)
    }

    /// Classifies and records `raw` without running recovery.
    ///
    /// For failures raised on a recovery path (a token refresh), where
    /// dispatching to a strategy would re-enter that path. Listeners see
    /// [`RecoveryOutcome::Skipped`].
    pub async fn record(&self, raw: anyhow::Error, context: &ErrorContext) -> NormalizedError {
        let normalized = normalize(raw, context);
        self.add_to_history(normalized.clone());
        log_error(&normalized);
        self.notify_listeners(&normalized, &RecoveryOutcome::Skipped);
        self.track(&normalized, &RecoveryOutcome::Skipped);
        normalized
    }

    async fn process(&self, error: &NormalizedError) -> RecoveryOutcome {
        self.add_to_history(error.clone());
        log_error(error);
        let outcome = self.recover(error).await;
        self.notify_listeners(error, &outcome);
        self.track(error, &outcome);
        outcome
    }

    /// Dispatches to the strategy registered for the error's code, falling
    /// back to its category.
    pub async fn recover(&self, error: &NormalizedError) -> RecoveryOutcome {
        let strategy = {
            let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
            strategies
                .get(&StrategyKey::Code(error.code()))
                .or_else(|| strategies.get(&StrategyKey::Category(error.category())))
                .cloned()
        };

        let Some(strategy) = strategy else {
            return RecoveryOutcome::NoStrategy;
        };

        match AssertUnwindSafe(strategy.recover(error)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(code = %error.code(), error = %e, "Recovery strategy failed");
                RecoveryOutcome::failed(format!("Recovery failed: {}", e))
            }
            Err(_) => {
                error!(code = %error.code(), "Recovery strategy panicked");
                RecoveryOutcome::failed("Recovery failed: strategy panicked")
            }
        }
    }

    /// Most recent first.
    pub fn history(&self) -> Vec<NormalizedError> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn add_to_history(&self, error: NormalizedError) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_front(error);
        history.truncate(self.history_size);
    }

    fn notify_listeners(&self, error: &NormalizedError, outcome: &RecoveryOutcome) {
        // Snapshot so listeners may (un)subscribe without deadlocking.
        let listeners: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(error, outcome)));
            if result.is_err() {
                error!(code = %error.code(), "Error listener panicked");
            }
        }
    }

    fn track(&self, error: &NormalizedError, outcome: &RecoveryOutcome) {
        let Some(endpoint) = self.tracking_endpoint.clone() else {
            return;
        };
        // Only possible from inside a runtime; classification outside one skips tracking.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let body = serde_json::json!({
            "error": error.to_json(),
            "recovery": outcome,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let client = self.http_client.clone();
        runtime.spawn(async move {
            let result = client.post(&endpoint).json(&body).send().await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "Error tracking endpoint rejected report")
                }
                Err(e) => warn!(error = %e, "Error tracking failed"),
                Ok(_) => {}
            }
        });
    }
}

fn log_error(error: &NormalizedError) {
    let platform = error.platform().unwrap_or("-");
    match error.severity() {
        ErrorSeverity::Critical | ErrorSeverity::High => error!(
            severity = ?error.severity(),
            category = %error.category(),
            code = %error.code(),
            platform = %platform,
            metadata = %serde_json::Value::Object(error.metadata().clone()),
            "{}",
            error.message()
        ),
        ErrorSeverity::Medium => warn!(
            category = %error.category(),
            code = %error.code(),
            platform = %platform,
            "{}",
            error.message()
        ),
        ErrorSeverity::Low => info!(
            category = %error.category(),
            code = %error.code(),
            platform = %platform,
            "{}",
            error.message()
        ),
    }
}
