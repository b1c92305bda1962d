//! The per-projection catch-up/live state machine.
//!
//! [`run`] drives a single [`ProjectionDefinition`] from its last checkpoint through
//! catch-up and into the live phase, processing each matching event atomically alongside
//! its checkpoint update and retrying transient handler failures with linear backoff.

use crate::definition::ProjectionDefinition;
use crate::error::ProjectionError;
use composable_rust_core::event::StoredEvent;
use composable_rust_core::event_store::{EventStore, StreamOptions};
use composable_rust_core::position::GlobalPosition;
use composable_rust_core::projection::ProjectionStatus;
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Configuration a [`run`] invocation shares with every loop the manager spawns.
#[derive(Clone)]
pub struct LoopConfig {
    /// How many times a failing event is retried before the loop enters the `error` state.
    pub max_retries: u32,
    /// The linear backoff unit: the Nth retry sleeps `retry_delay * N`.
    pub retry_delay: Duration,
    /// Page size used while draining via `EventStore::stream`.
    pub stream_batch_size: u32,
    /// How long the live phase waits between drains when no notification arrives.
    pub poll_interval: Duration,
    /// When set, handlers run against the real connection but their transaction (and the
    /// checkpoint update) is rolled back rather than committed.
    pub dry_run: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            stream_batch_size: 100,
            poll_interval: Duration::from_secs(5),
            dry_run: false,
        }
    }
}

/// Callbacks the manager wires into every loop; see the crate-level docs for the
/// isolation guarantee (a panicking or erroring callback never propagates).
#[derive(Clone, Default)]
pub struct LoopCallbacks {
    /// Invoked before each retry sleep with `(name, attempt, error, next_delay)`.
    pub on_retry: Option<Arc<dyn Fn(&str, u32, &crate::error::HandlerError, Duration) + Send + Sync>>,
    /// Invoked once when a loop exhausts its retries and enters the `error` state.
    pub on_error: Option<Arc<dyn Fn(&str, &crate::error::HandlerError) + Send + Sync>>,
    /// Invoked on every lifecycle transition with `(name, status)`.
    pub on_status_change: Option<Arc<dyn Fn(&str, ProjectionStatus) + Send + Sync>>,
}

/// Shared, lock-free state a running loop exposes to
/// [`crate::manager::ProjectionManager::get_status`] and `wait_until_live`.
pub struct LoopHandle {
    status: Mutex<ProjectionStatus>,
    last_position: AtomicU64,
    error_detail: Mutex<Option<String>>,
    stop_requested: AtomicBool,
    wake: Notify,
}

impl LoopHandle {
    fn new(starting_position: GlobalPosition) -> Self {
        Self {
            status: Mutex::new(ProjectionStatus::Pending),
            last_position: AtomicU64::new(starting_position.value()),
            error_detail: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, ProjectionStatus> {
        self.status.lock().unwrap_or_else(|poison| {
            tracing::warn!("projection loop status lock poisoned, recovering");
            poison.into_inner()
        })
    }

    /// The loop's current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ProjectionStatus {
        *self.lock_status()
    }

    fn set_status(&self, status: ProjectionStatus, callbacks: &LoopCallbacks, name: &str) {
        *self.lock_status() = status;
        if let Some(on_status_change) = &callbacks.on_status_change {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_status_change(name, status)));
            if result.is_err() {
                tracing::warn!(projection = name, "on_status_change callback panicked, ignoring");
            }
        }
    }

    /// The last position this loop has committed a checkpoint for.
    #[must_use]
    pub fn last_position(&self) -> GlobalPosition {
        GlobalPosition::new(self.last_position.load(Ordering::SeqCst))
    }

    /// The last handler error recorded, if the loop is in the `error` state.
    #[must_use]
    pub fn error_detail(&self) -> Option<String> {
        self.error_detail
            .lock()
            .unwrap_or_else(|poison| {
                tracing::warn!("projection loop error-detail lock poisoned, recovering");
                poison.into_inner()
            })
            .clone()
    }

    /// Ask the loop to stop cooperatively. Checked between events and inside the signal
    /// wait; any in-flight transaction still runs to completion.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Wake this loop's live-phase signal wait (used by the manager's listener callback).
    pub fn notify(&self) {
        self.wake.notify_waiters();
    }
}

/// Construct a fresh, `Pending` handle for a loop starting from `starting_position`. The
/// caller registers this handle's [`LoopHandle::notify`] with the notification listener
/// *before* spawning [`run`], so no notification arriving during catch-up is lost.
#[must_use]
pub fn new_handle(starting_position: GlobalPosition) -> Arc<LoopHandle> {
    Arc::new(LoopHandle::new(starting_position))
}

/// Drive `definition` to completion against the given `handle`: catch-up, then live,
/// until stopped or errored.
///
/// `handle` should be freshly constructed via [`new_handle`] and already registered with
/// the notification listener. The loop streams strictly after `handle`'s starting
/// position; it returns once the loop reaches `Stopped` or `Error`.
pub async fn run(
    definition: ProjectionDefinition,
    store: Arc<dyn EventStore>,
    pool: PgPool,
    handle: Arc<LoopHandle>,
    config: LoopConfig,
    callbacks: LoopCallbacks,
) {
    let name = definition.name().to_string();

    handle.set_status(ProjectionStatus::CatchingUp, &callbacks, &name);
    tracing::info!(projection = %name, "projection catching up");

    if drain(&definition, &store, &pool, &handle, &config, &callbacks, &name)
        .await
        .is_err()
    {
        // `drain` already moved the loop into `Error` on failure.
        return;
    }

    handle.set_status(ProjectionStatus::Live, &callbacks, &name);
    tracing::info!(projection = %name, "projection live");

    // Unconditional: closes the gap between catch-up's last page and this loop
    // parking on `wake.notified()`, which stores no permit for a signal fired early.
    if drain(&definition, &store, &pool, &handle, &config, &callbacks, &name)
        .await
        .is_err()
    {
        return;
    }

    loop {
        if handle.is_stop_requested() {
            break;
        }

        tokio::select! {
            () = handle.wake.notified() => {}
            () = tokio::time::sleep(config.poll_interval) => {}
        }

        if handle.is_stop_requested() {
            break;
        }

        if drain(&definition, &store, &pool, &handle, &config, &callbacks, &name)
            .await
            .is_err()
        {
            return;
        }
    }

    handle.set_status(ProjectionStatus::Stopped, &callbacks, &name);
    tracing::info!(projection = %name, "projection stopped");
}

/// Stream every event after the loop's current checkpoint and process it through the
/// retry wrapper. Returns `Err` (after moving the loop to `Error`) on the first
/// unrecoverable handler failure.
async fn drain(
    definition: &ProjectionDefinition,
    store: &Arc<dyn EventStore>,
    pool: &PgPool,
    handle: &Arc<LoopHandle>,
    config: &LoopConfig,
    callbacks: &LoopCallbacks,
    name: &str,
) -> Result<(), ProjectionError> {
    let options = StreamOptions::new()
        .after_position(handle.last_position())
        .batch_size(config.stream_batch_size);

    let mut events = store.stream(definition.query().clone(), options);

    while let Some(next) = events.next().await {
        if handle.is_stop_requested() {
            return Ok(());
        }

        let event = match next {
            Ok(event) => event,
            Err(error) => {
                let detail = error.to_string();
                record_error(handle, callbacks, name, &detail);
                return Err(ProjectionError::Store(error));
            }
        };

        match process_with_retries(definition, pool, &event, config, callbacks, name).await {
            Ok(()) => {
                handle
                    .last_position
                    .store(event.global_position.value(), Ordering::SeqCst);
            }
            Err(detail) => {
                record_error(handle, callbacks, name, &detail);
                return Err(ProjectionError::HandlerFailed {
                    name: name.to_string(),
                    source: detail.into(),
                });
            }
        }
    }

    Ok(())
}

fn record_error(handle: &Arc<LoopHandle>, callbacks: &LoopCallbacks, name: &str, detail: &str) {
    *handle.error_detail.lock().unwrap_or_else(|poison| {
        tracing::warn!("projection loop error-detail lock poisoned, recovering");
        poison.into_inner()
    }) = Some(detail.to_string());
    handle.set_status(ProjectionStatus::Error, callbacks, name);
    tracing::error!(projection = %name, error = %detail, "projection exhausted retries");

    if let Some(on_error) = &callbacks.on_error {
        let boxed: crate::error::HandlerError = detail.to_string().into();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_error(name, &boxed)));
        if result.is_err() {
            tracing::warn!(projection = name, "on_error callback panicked, ignoring");
        }
    }
}

/// Process a single event with the retry wrapper: on failure, sleep `retry_delay *
/// attempt` and try again up to `max_retries` times before giving up.
async fn process_with_retries(
    definition: &ProjectionDefinition,
    pool: &PgPool,
    event: &StoredEvent,
    config: &LoopConfig,
    callbacks: &LoopCallbacks,
    name: &str,
) -> Result<(), String> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match process_once(definition, pool, event, config.dry_run).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                if attempt > config.max_retries {
                    return Err(error.to_string());
                }
                let next_delay = config.retry_delay * attempt;
                if let Some(on_retry) = &callbacks.on_retry {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        on_retry(name, attempt, &error, next_delay);
                    }));
                    if result.is_err() {
                        tracing::warn!(projection = name, "on_retry callback panicked, ignoring");
                    }
                }
                tracing::warn!(
                    projection = name,
                    attempt,
                    global_position = event.global_position.value(),
                    "projection handler failed, retrying"
                );
                tokio::time::sleep(next_delay).await;
            }
        }
    }
}

/// One attempt at the atomicity contract: BEGIN, run the handler, update (or skip, in
/// `dry_run`) the checkpoint row, then COMMIT (or ROLLBACK in `dry_run`, or on error).
async fn process_once(
    definition: &ProjectionDefinition,
    pool: &PgPool,
    event: &StoredEvent,
    dry_run: bool,
) -> Result<(), crate::error::HandlerError> {
    let mut tx = pool.begin().await.map_err(|error| -> crate::error::HandlerError { Box::new(error) })?;

    let handler = definition.handler().clone();
    let handler_result = handler(event, &mut tx).await;
    if let Err(error) = handler_result {
        let _ = tx.rollback().await;
        return Err(error);
    }

    if dry_run {
        let _ = tx.rollback().await;
        return Ok(());
    }

    let position = i64::try_from(event.global_position.value())
        .map_err(|error| -> crate::error::HandlerError { Box::new(error) })?;
    let checkpoint_result = sqlx::query(
        "UPDATE projection_checkpoints SET last_position = $1, updated_at = now() WHERE name = $2",
    )
    .bind(position)
    .bind(definition.name())
    .execute(&mut *tx)
    .await;

    if let Err(error) = checkpoint_result {
        let _ = tx.rollback().await;
        return Err(Box::new(error));
    }

    tx.commit()
        .await
        .map_err(|error| -> crate::error::HandlerError { Box::new(error) })?;

    metrics::counter!("dcb_projection_events_processed_total", "projection" => definition.name().to_string())
        .increment(1);
    tracing::debug!(
        projection = definition.name(),
        global_position = event.global_position.value(),
        "checkpoint advanced"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(!config.dry_run);
    }

    #[test]
    fn loop_handle_starts_pending_at_given_position() {
        let handle = LoopHandle::new(GlobalPosition::new(7));
        assert_eq!(handle.status(), ProjectionStatus::Pending);
        assert_eq!(handle.last_position(), GlobalPosition::new(7));
        assert!(handle.error_detail().is_none());
    }

    #[test]
    fn request_stop_is_observable() {
        let handle = LoopHandle::new(GlobalPosition::BEFORE_FIRST);
        assert!(!handle.is_stop_requested());
        handle.request_stop();
        assert!(handle.is_stop_requested());
    }

    #[test]
    fn retry_backoff_is_linear() {
        let unit = Duration::from_millis(500);
        let delays: Vec<_> = (1..=3u32).map(|attempt| unit * attempt).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
            ]
        );
    }
}
