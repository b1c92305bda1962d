//! A reconnecting `LISTEN`/`NOTIFY` client for the `es_events` channel.
//!
//! The event table's insert trigger fires `NOTIFY es_events` once per statement (not once
//! per row), so a batch append produces exactly one notification regardless of how many
//! events it inserted. [`NotificationListener`] holds a dedicated connection subscribed to
//! that channel and fans every notification out to a set of registered callbacks —
//! typically one per running projection loop, each of which treats the notification as
//! nothing more than a hint to wake up and drain via `EventStore::stream`.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const CHANNEL: &str = "es_events";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A registered callback, invoked with no arguments on every notification (and, to guard
/// against missed notifications during a reconnect, once more when the connection is
/// re-established).
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// A handle identifying a registered callback, returned by
/// [`NotificationListener::add_callback`] for later removal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallbackId(u64);

struct Inner {
    pool: PgPool,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    stop_signal: Notify,
}

/// Dedicated-connection `LISTEN` client with automatic reconnect.
///
/// Reconnection backoff starts at 1 second, doubles on each consecutive failure, and caps
/// at 60 seconds; it resets to 1 second after the next successful notification is
/// received. While disconnected, every callback is still invoked on each reconnect attempt
/// so a projection loop falls back to polling rather than missing events outright.
pub struct NotificationListener {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    /// Build a listener over `pool`. Call [`NotificationListener::start`] to begin
    /// listening.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Register a callback, invoked on every future notification. Returns a handle for
    /// [`NotificationListener::remove_callback`].
    pub fn add_callback(&self, callback: Callback) -> CallbackId {
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let mut callbacks = self.inner.callbacks.lock().unwrap_or_else(|poison| {
            tracing::warn!("notification listener callback lock poisoned, recovering");
            poison.into_inner()
        });
        callbacks.push((id, callback));
        id
    }

    /// Unregister a previously-registered callback. A no-op if `id` is unknown (already
    /// removed, or from a different listener).
    pub fn remove_callback(&self, id: CallbackId) {
        let mut callbacks = self.inner.callbacks.lock().unwrap_or_else(|poison| {
            tracing::warn!("notification listener callback lock poisoned, recovering");
            poison.into_inner()
        });
        callbacks.retain(|(existing, _)| *existing != id);
    }

    /// Open the dedicated connection, subscribe to the channel, and begin fanning out
    /// notifications in a background task. Idempotent-ish: calling `start` again replaces
    /// the running task.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run(inner));
        let mut task = self.task.lock().unwrap_or_else(|poison| {
            tracing::warn!("notification listener task lock poisoned, recovering");
            poison.into_inner()
        });
        *task = Some(handle);
    }

    /// Stop listening: signals the background task, which issues `UNLISTEN` and exits. Any
    /// reconnect in progress is abandoned rather than retried.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poison| {
                tracing::warn!("notification listener task lock poisoned, recovering");
                poison.into_inner()
            })
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn fan_out(inner: &Inner) {
    let callbacks = inner
        .callbacks
        .lock()
        .unwrap_or_else(|poison| {
            tracing::warn!("notification listener callback lock poisoned, recovering");
            poison.into_inner()
        })
        .clone();
    for (id, callback) in callbacks {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback()));
        if result.is_err() {
            tracing::warn!(callback = id.0, "notification callback panicked, ignoring");
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut listener = match PgListener::connect_with(&inner.pool).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::warn!(%error, backoff_secs = backoff.as_secs(), "notification listener connect failed, retrying");
                fan_out(&inner);
                if wait_or_stop(&inner, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff);
                continue;
            }
        };

        if let Err(error) = listener.listen(CHANNEL).await {
            tracing::warn!(%error, "notification listener LISTEN failed, retrying");
            fan_out(&inner);
            if wait_or_stop(&inner, backoff).await {
                return;
            }
            backoff = next_backoff(backoff);
            continue;
        }

        tracing::info!(channel = CHANNEL, "notification listener connected");
        backoff = INITIAL_BACKOFF;

        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                let _ = listener.unlisten_all().await;
                return;
            }

            tokio::select! {
                () = inner.stop_signal.notified() => {
                    let _ = listener.unlisten_all().await;
                    return;
                }
                received = listener.recv() => {
                    match received {
                        Ok(_notification) => {
                            backoff = INITIAL_BACKOFF;
                            fan_out(&inner);
                        }
                        Err(error) => {
                            tracing::warn!(%error, "notification listener connection lost, reconnecting");
                            fan_out(&inner);
                            break;
                        }
                    }
                }
            }
        }

        if wait_or_stop(&inner, backoff).await {
            return;
        }
        backoff = next_backoff(backoff);
    }
}

/// Sleep for `duration` unless a stop is requested first. Returns `true` if the caller
/// should give up (stop requested).
async fn wait_or_stop(inner: &Inner, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => inner.stopped.load(Ordering::SeqCst),
        () = inner.stop_signal.notified() => true,
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = INITIAL_BACKOFF;
        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[test]
    fn backoff_starts_at_one_second() {
        assert_eq!(INITIAL_BACKOFF, Duration::from_secs(1));
    }
}
