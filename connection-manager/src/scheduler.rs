//! Token refresh scheduler.
//!
//! Keeps connection credentials fresh. A periodic sweep queues every
//! connection whose token expires within the refresh threshold; queued tasks
//! are refreshed through the platform's OAuth handler and retried along a
//! fixed backoff table.
//!
//! ```text
//!   pending ──▶ refreshing ──ok──▶ (removed, connection active)
//!      ▲            │
//!      └─ retry ────┤ attempts remain: next = now + delays[attempt]
//!                   └─ exhausted ──▶ error ──▶ (removed, connection error, webhook)
//! ```
//!
//! At most one task exists per connection. Queue passes are serialized, so a
//! connection is never refreshed twice concurrently.

use crate::notify::WebhookNotifier;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tether::config::SchedulerConfig;
use tether::connection::{
    Connection, ConnectionFilter, ConnectionPatch, ConnectionStatus, ConnectionStore,
    META_LAST_REFRESH_ATTEMPT, META_LAST_REFRESH_ERROR, META_LAST_REFRESH_SUCCESS,
    META_REFRESH_ATTEMPT_COUNT,
};
use tether::credentials::{new_key_id, CredentialCodec};
use tether::error::{ErrorContext, ErrorRegistry, NormalizedError, TokenRecovery};
use tether::oauth::{OAuthError, RefreshMaterial};
use tether::HandlerRegistry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `next_attempt`.
    Pending,
    Refreshing,
    /// Retries exhausted; the failure is being recorded.
    Error,
}

/// Read-only view of a queued refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatus {
    pub connection_id: String,
    pub platform: String,
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempt: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: DateTime<Utc>,
    pub last_error: Option<String>,
}

struct RefreshTask {
    connection: Connection,
    attempt: u32,
    status: TaskStatus,
    last_attempt: Option<DateTime<Utc>>,
    next_attempt: DateTime<Utc>,
    due: Instant,
    last_error: Option<String>,
    /// Distinguishes a task from the one that replaced it.
    generation: u64,
}

impl RefreshTask {
    fn new(connection: Connection, generation: u64) -> Self {
        Self {
            connection,
            attempt: 0,
            status: TaskStatus::Pending,
            last_attempt: None,
            next_attempt: Utc::now(),
            due: Instant::now(),
            last_error: None,
            generation,
        }
    }

    fn status(&self) -> RefreshStatus {
        RefreshStatus {
            connection_id: self.connection.id.clone(),
            platform: self.connection.platform.clone(),
            status: self.status,
            attempt: self.attempt,
            last_attempt: self.last_attempt,
            next_attempt: self.next_attempt,
            last_error: self.last_error.clone(),
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.status == TaskStatus::Pending && self.due <= now
    }
}

/// Background service that refreshes expiring connection tokens.
///
/// Constructed and owned by the host process, which drives the lifecycle with
/// [`start`](Self::start) and [`stop`](Self::stop).
pub struct TokenRefreshScheduler {
    check_interval: Duration,
    refresh_threshold: Duration,
    retry_delays: Vec<Duration>,
    store: Arc<dyn ConnectionStore>,
    codec: Arc<dyn CredentialCodec>,
    handlers: Arc<HandlerRegistry>,
    errors: Arc<ErrorRegistry>,
    notifier: Option<WebhookNotifier>,
    tasks: Mutex<HashMap<String, RefreshTask>>,
    /// Held for the duration of a queue pass.
    queue_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    wake: Notify,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokenRefreshScheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn ConnectionStore>,
        codec: Arc<dyn CredentialCodec>,
        handlers: Arc<HandlerRegistry>,
        errors: Arc<ErrorRegistry>,
    ) -> Self {
        Self {
            check_interval: config.check_interval().max(Duration::from_secs(1)),
            refresh_threshold: config.refresh_threshold(),
            retry_delays: config.retry_delays(),
            store,
            codec,
            handlers,
            errors,
            notifier: config
                .failure_webhook_url
                .as_deref()
                .map(WebhookNotifier::new),
            tasks: Mutex::new(HashMap::new()),
            queue_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one sweep and queue pass, then spawns the periodic loop.
    ///
    /// Calling `start` on a running scheduler does nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Token refresh scheduler already running");
            return;
        }

        info!(
            check_interval_secs = self.check_interval.as_secs(),
            refresh_threshold_secs = self.refresh_threshold.as_secs(),
            retries = self.retry_delays.len(),
            "Starting token refresh scheduler"
        );

        self.run_tick().await;

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(scheduler.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // consume immediate first tick, initial sweep done above

            loop {
                let next_due = scheduler.next_due();
                let sweep = tokio::select! {
                    _ = interval.tick() => true,
                    _ = sleep_until_due(next_due) => false,
                    _ = scheduler.wake.notified() => false,
                };

                // Detached so that aborting the loop leaves an in-flight
                // refresh to finish.
                let pass = Arc::clone(&scheduler);
                let result = tokio::spawn(async move {
                    if sweep {
                        pass.run_tick().await;
                    } else {
                        pass.process_queue().await;
                    }
                })
                .await;
                if let Err(e) = result {
                    error!(error = %e, "Token refresh pass panicked");
                }
            }
        });

        let mut slot = self.lock_loop();
        if self.is_running() {
            *slot = Some(handle);
        } else {
            // stopped while the initial sweep ran
            handle.abort();
        }
    }

    /// Cancels future sweeps and discards every queued task.
    ///
    /// A refresh already in flight completes; its bookkeeping is dropped.
    /// Persisted connections are left as they are.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.lock_loop().take() {
            handle.abort();
        }

        let discarded = {
            let mut tasks = self.lock_tasks();
            let count = tasks.len();
            tasks.clear();
            count
        };

        if was_running {
            info!(discarded, "Stopped token refresh scheduler");
        }
    }

    /// Sweep followed by a queue pass.
    pub async fn run_tick(&self) {
        if let Err(e) = self.sweep().await {
            error!(error = %e, "Token refresh sweep failed");
        }
        self.process_queue().await;
    }

    /// Queues every active or errored connection expiring within the refresh
    /// threshold that is not already queued. Returns the number queued.
    pub async fn sweep(&self) -> Result<usize> {
        let filter =
            ConnectionFilter::with_statuses(&[ConnectionStatus::Active, ConnectionStatus::Error])
                .ordered_by_expiry();
        let connections = self
            .store
            .list_connections(&filter)
            .await
            .context("Failed to list connections for refresh sweep")?;

        let threshold = chrono::Duration::from_std(self.refresh_threshold)
            .context("Refresh threshold out of range")?;
        let now = Utc::now();

        let mut tasks = self.lock_tasks();
        let mut queued = 0;
        for connection in connections {
            if !connection.expires_within(threshold, now) || tasks.contains_key(&connection.id) {
                continue;
            }
            debug!(
                connection_id = %connection.id,
                platform = %connection.platform,
                expires_at = %connection.token_expires_at,
                "Queueing token refresh"
            );
            let generation = self.next_generation();
            tasks.insert(connection.id.clone(), RefreshTask::new(connection, generation));
            queued += 1;
        }

        if queued > 0 {
            info!(queued, "Queued expiring connections for refresh");
        }
        Ok(queued)
    }

    /// Refreshes every pending task whose next attempt is due, once each.
    /// Returns the number of tasks run.
    pub async fn process_queue(&self) -> usize {
        let _pass = self.queue_lock.lock().await;

        let now = Instant::now();
        let mut due: Vec<(Instant, String, u64)> = self
            .lock_tasks()
            .iter()
            .filter(|(_, task)| task.is_due(now))
            .map(|(id, task)| (task.due, id.clone(), task.generation))
            .collect();
        due.sort();

        let mut processed = 0;
        for (_, id, generation) in due {
            if self.run_task(&id, generation).await.is_some() {
                processed += 1;
            }
        }
        processed
    }

    /// Replaces any queued task for the connection with a fresh one at
    /// attempt 0, due now.
    pub async fn force_refresh(&self, connection_id: &str) -> Result<()> {
        self.enqueue_fresh(connection_id).await.map(|_| ())
    }

    /// `None` when the connection has no queued task.
    pub fn get_refresh_status(&self, connection_id: &str) -> Option<RefreshStatus> {
        self.lock_tasks().get(connection_id).map(RefreshTask::status)
    }

    /// Every queued task, ordered by connection id.
    pub fn get_active_tasks(&self) -> Vec<RefreshStatus> {
        let mut statuses: Vec<RefreshStatus> =
            self.lock_tasks().values().map(RefreshTask::status).collect();
        statuses.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        statuses
    }

    /// Token recovery hook for the error registry and API executors.
    ///
    /// Holds a weak reference, so registering it with an [`ErrorRegistry`]
    /// the scheduler itself owns does not leak either.
    pub fn recovery_hook(self: &Arc<Self>) -> Arc<dyn TokenRecovery> {
        Arc::new(SchedulerRecovery(Arc::downgrade(self)))
    }

    /// Forces a refresh and runs it immediately, reporting its outcome.
    pub async fn refresh_now(&self, connection_id: &str) -> Result<()> {
        let generation = self.enqueue_fresh(connection_id).await?;
        let _pass = self.queue_lock.lock().await;

        if let Some(result) = self.run_task(connection_id, generation).await {
            return result.map_err(anyhow::Error::new);
        }

        // Another pass got to the task first.
        match self.lock_tasks().get(connection_id) {
            None => Ok(()),
            Some(task) if task.generation == generation => Err(anyhow!(
                "Token refresh failed: {}",
                task.last_error.as_deref().unwrap_or("retry pending")
            )),
            Some(_) => Err(anyhow!("Token refresh superseded by a newer request")),
        }
    }

    async fn enqueue_fresh(&self, connection_id: &str) -> Result<u64> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await
            .with_context(|| format!("Failed to load connection {}", connection_id))?
            .ok_or_else(|| anyhow!("Connection not found: {}", connection_id))?;

        let generation = self.next_generation();
        let replaced = self
            .lock_tasks()
            .insert(connection_id.to_string(), RefreshTask::new(connection, generation))
            .is_some();

        info!(connection_id = %connection_id, replaced, "Forced token refresh");
        self.wake.notify_one();
        Ok(generation)
    }

    /// Runs one attempt for a task. `None` if the task is gone, replaced, or
    /// not pending.
    async fn run_task(
        &self,
        connection_id: &str,
        generation: u64,
    ) -> Option<Result<(), NormalizedError>> {
        let (connection, attempt) = self.begin(connection_id, generation)?;

        match self.refresh_connection(&connection).await {
            Ok(()) => {
                self.remove_task(connection_id, generation);
                info!(
                    connection_id = %connection_id,
                    platform = %connection.platform,
                    attempt,
                    "Token refreshed"
                );
                Some(Ok(()))
            }
            Err(raw) => {
                let context = ErrorContext::for_platform(connection.platform.clone())
                    .with_connection(connection_id)
                    .with_endpoint("token_refresh");
                let error = self.errors.record(raw, &context).await;
                self.handle_failure(&connection, attempt, generation, &error)
                    .await;
                Some(Err(error))
            }
        }
    }

    fn begin(&self, connection_id: &str, generation: u64) -> Option<(Connection, u32)> {
        let mut tasks = self.lock_tasks();
        let task = tasks
            .get_mut(connection_id)
            .filter(|t| t.generation == generation && t.status == TaskStatus::Pending)?;
        task.status = TaskStatus::Refreshing;
        task.last_attempt = Some(Utc::now());
        Some((task.connection.clone(), task.attempt))
    }

    async fn refresh_connection(&self, connection: &Connection) -> Result<()> {
        let handler = self.handlers.get(&connection.platform)?;
        let material = handler.refresh_material();

        let token = match material {
            RefreshMaterial::AccessToken => self
                .codec
                .decrypt(&connection.access_token, &connection.access_token_key_id)?,
            RefreshMaterial::RefreshToken => {
                match (&connection.refresh_token, &connection.refresh_token_key_id) {
                    (Some(token), Some(key_id)) => self.codec.decrypt(token, key_id)?,
                    _ => return Err(OAuthError::no_refresh_material().into()),
                }
            }
        };

        let grant = handler.refresh(&token).await?;

        let key_id = new_key_id();
        let access_token = self.codec.encrypt(&grant.access_token, &key_id)?;
        // A grant without a refresh token leaves the current one valid.
        let refresh_token = match (grant.refresh_token.as_deref(), material) {
            (Some(rotated), _) => Some(self.codec.encrypt(rotated, &key_id)?),
            (None, RefreshMaterial::RefreshToken) => Some(self.codec.encrypt(&token, &key_id)?),
            (None, RefreshMaterial::AccessToken) => None,
        };

        let Some(mut metadata) = self.current_metadata(connection).await? else {
            return Ok(());
        };
        let now = Utc::now();
        metadata.insert(META_LAST_REFRESH_SUCCESS.to_string(), json!(now.to_rfc3339()));
        bump_attempt_count(&mut metadata);
        metadata.remove(META_LAST_REFRESH_ERROR);
        metadata.remove(META_LAST_REFRESH_ATTEMPT);

        let patch = ConnectionPatch {
            access_token: Some(access_token),
            access_token_key_id: Some(key_id.clone()),
            refresh_token_key_id: refresh_token.as_ref().map(|_| Some(key_id)),
            refresh_token: refresh_token.map(Some),
            token_expires_at: Some(grant.expires_at),
            status: Some(ConnectionStatus::Active),
            last_sync: Some(now),
            metadata: Some(metadata),
        };
        if !self.store.update_connection(&connection.id, &patch).await? {
            warn!(connection_id = %connection.id, "Connection vanished during token refresh");
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        connection: &Connection,
        attempt: u32,
        generation: u64,
        error: &NormalizedError,
    ) {
        let exhausted = {
            let mut tasks = self.lock_tasks();
            let Some(task) = tasks
                .get_mut(&connection.id)
                .filter(|t| t.generation == generation)
            else {
                debug!(connection_id = %connection.id, "Discarding result of superseded refresh");
                return;
            };

            task.last_error = Some(error.message().to_string());
            match self.retry_delays.get(attempt as usize) {
                Some(&delay) => {
                    task.attempt = attempt + 1;
                    task.status = TaskStatus::Pending;
                    task.due = Instant::now() + delay;
                    task.next_attempt = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        connection_id = %connection.id,
                        platform = %connection.platform,
                        attempt = task.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Token refresh failed, retry scheduled"
                    );
                    false
                }
                None => {
                    task.status = TaskStatus::Error;
                    true
                }
            }
        };

        if exhausted {
            error!(
                connection_id = %connection.id,
                platform = %connection.platform,
                attempts = attempt + 1,
                error = %error,
                "Token refresh retries exhausted"
            );
            if let Err(e) = self.mark_failed(connection, error).await {
                error!(connection_id = %connection.id, error = %e, "Failed to record refresh failure");
            }
            if let Some(notifier) = &self.notifier {
                notifier
                    .refresh_failed(&connection.id, &connection.platform, error.message())
                    .await;
            }
            self.remove_task(&connection.id, generation);
        }
    }

    async fn mark_failed(&self, connection: &Connection, error: &NormalizedError) -> Result<()> {
        let Some(mut metadata) = self.current_metadata(connection).await? else {
            return Ok(());
        };
        metadata.insert(META_LAST_REFRESH_ERROR.to_string(), json!(error.message()));
        metadata.insert(
            META_LAST_REFRESH_ATTEMPT.to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        bump_attempt_count(&mut metadata);

        let patch = ConnectionPatch {
            status: Some(ConnectionStatus::Error),
            metadata: Some(metadata),
            ..ConnectionPatch::default()
        };
        self.store.update_connection(&connection.id, &patch).await?;
        Ok(())
    }

    /// Metadata of the stored record, or `None` when the connection was
    /// removed or disconnected meanwhile.
    async fn current_metadata(&self, connection: &Connection) -> Result<Option<Map<String, Value>>> {
        match self.store.get_connection(&connection.id).await? {
            Some(current) if current.status == ConnectionStatus::Disconnected => {
                info!(connection_id = %connection.id, "Connection disconnected during refresh, not updating");
                Ok(None)
            }
            Some(current) => Ok(Some(current.metadata)),
            None => {
                warn!(connection_id = %connection.id, "Connection vanished during token refresh");
                Ok(None)
            }
        }
    }

    fn remove_task(&self, connection_id: &str, generation: u64) {
        let mut tasks = self.lock_tasks();
        if tasks
            .get(connection_id)
            .map_or(false, |t| t.generation == generation)
        {
            tasks.remove(connection_id);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.lock_tasks()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.due)
            .min()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, RefreshTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_loop(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn bump_attempt_count(metadata: &mut Map<String, Value>) {
    let count = metadata
        .get(META_REFRESH_ATTEMPT_COUNT)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    metadata.insert(META_REFRESH_ATTEMPT_COUNT.to_string(), json!(count + 1));
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

struct SchedulerRecovery(Weak<TokenRefreshScheduler>);

#[async_trait]
impl TokenRecovery for SchedulerRecovery {
    async fn recover_token(&self, connection_id: &str) -> Result<()> {
        let scheduler = self
            .0
            .upgrade()
            .ok_or_else(|| anyhow!("Token refresh scheduler is gone"))?;
        scheduler.refresh_now(connection_id).await
    }
}
