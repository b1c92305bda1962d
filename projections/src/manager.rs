//! [`ProjectionManager`]: owns the projection set, the notification listener, and the
//! per-projection loop tasks.

use crate::definition::ProjectionDefinition;
use crate::error::ProjectionError;
use crate::loop_runner::{self, LoopCallbacks, LoopConfig, LoopHandle};
use composable_rust_core::event_store::EventStore;
use composable_rust_core::position::GlobalPosition;
use composable_rust_core::projection::ProjectionStatus;
use composable_rust_postgres::{CallbackId, NotificationListener};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Configuration for a [`ProjectionManager`], covering every tunable in the catch-up/live
/// loop and the manager's own coordination.
#[derive(Clone)]
pub struct ManagerConfig {
    /// How many times a failing event is retried before its loop enters `error`.
    pub max_retries: u32,
    /// The linear backoff unit for retries.
    pub retry_delay: Duration,
    /// Page size used while draining via `EventStore::stream`.
    pub stream_batch_size: u32,
    /// How long the live phase waits between drains absent a notification.
    pub poll_interval: Duration,
    /// Deadline for each projection's `setup` callback at `initialize()`.
    pub setup_timeout: Duration,
    /// When `true`, only one process-wide instance of each projection's loop runs,
    /// enforced with a named Postgres advisory lock.
    pub single_instance: bool,
    /// When `true`, handlers run but leave no effect (see [`LoopConfig::dry_run`]).
    pub dry_run: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            stream_batch_size: 100,
            poll_interval: Duration::from_secs(5),
            setup_timeout: Duration::from_secs(30),
            single_instance: false,
            dry_run: false,
        }
    }
}

/// A 64-bit hash of a projection name, used to key its `single_instance` advisory lock.
/// Distinct from `Query::advisory_lock_key` (a different keyspace) so a projection name
/// can never collide with a boundary's concurrency lock.
fn single_instance_lock_key(name: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    "composable-rust-projection".hash(&mut hasher);
    name.hash(&mut hasher);
    #[allow(clippy::cast_possible_wrap)]
    let signed = hasher.finish() as i64;
    signed
}

struct RunningLoop {
    handle: Arc<LoopHandle>,
    task: JoinHandle<()>,
    callback_id: Option<CallbackId>,
    /// Held open only in `single_instance` mode, so the advisory lock it owns is never
    /// released early; dropping it (at `stop()`) closes the connection, which releases the
    /// lock as a side effect.
    lock_connection: Option<PoolConnection<Postgres>>,
}

/// Owns the event store's connection pool, the set of registered projections, the
/// notification listener, and the spawned task per running loop.
pub struct ProjectionManager {
    pool: PgPool,
    store: Arc<dyn EventStore>,
    definitions: Vec<ProjectionDefinition>,
    config: ManagerConfig,
    callbacks: LoopCallbacks,
    listener: Arc<NotificationListener>,
    running: AsyncMutex<HashMap<String, RunningLoop>>,
    started: AsyncMutex<bool>,
}

impl ProjectionManager {
    /// Build a manager over `pool`/`store` for `definitions`. Call
    /// [`ProjectionManager::initialize`] then [`ProjectionManager::start`] to begin
    /// processing.
    #[must_use]
    pub fn new(
        pool: PgPool,
        store: Arc<dyn EventStore>,
        definitions: Vec<ProjectionDefinition>,
        config: ManagerConfig,
        callbacks: LoopCallbacks,
    ) -> Self {
        let listener = Arc::new(NotificationListener::new(pool.clone()));
        Self {
            pool,
            store,
            definitions,
            config,
            callbacks,
            listener,
            running: AsyncMutex::new(HashMap::new()),
            started: AsyncMutex::new(false),
        }
    }

    /// Idempotently prepare the database for this manager's projections: apply the store's
    /// schema (which includes the checkpoint table and notify trigger), run every
    /// registered `setup` under `setup_timeout`, insert a checkpoint row per projection,
    /// and start the notification listener.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Store`] if schema application fails, or
    /// [`ProjectionError::SetupTimeout`] if a `setup` callback does not complete in time.
    pub async fn initialize(&self) -> Result<(), ProjectionError> {
        self.store.initialize_schema().await?;

        for definition in &self.definitions {
            if let Some(setup) = definition.setup() {
                let result = tokio::time::timeout(self.config.setup_timeout, setup(&self.pool)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        return Err(ProjectionError::HandlerFailed {
                            name: definition.name().to_string(),
                            source: error,
                        });
                    }
                    Err(_) => {
                        return Err(ProjectionError::SetupTimeout {
                            name: definition.name().to_string(),
                        });
                    }
                }
            }

            sqlx::query(
                "INSERT INTO projection_checkpoints (name, last_position) VALUES ($1, NULL) \
                 ON CONFLICT (name) DO NOTHING",
            )
            .bind(definition.name())
            .execute(&self.pool)
            .await
            .map_err(ProjectionError::Database)?;
        }

        self.listener.start();
        tracing::info!(projections = self.definitions.len(), "projection manager initialized");
        Ok(())
    }

    /// Spawn one task per registered projection. May only be called once; a second call is
    /// a no-op.
    pub async fn start(&self) {
        let mut started = self.started.lock().await;
        if *started {
            return;
        }
        *started = true;
        drop(started);

        let mut running = self.running.lock().await;
        for definition in &self.definitions {
            let name = definition.name().to_string();

            let lock_connection = if self.config.single_instance {
                match self.try_acquire_single_instance_lock(&name).await {
                    Ok(Some(conn)) => Some(conn),
                    Ok(None) => {
                        tracing::info!(projection = %name, "single_instance lock held elsewhere, skipping");
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(projection = %name, %error, "single_instance lock attempt failed, skipping");
                        continue;
                    }
                }
            } else {
                None
            };

            let starting_position = self.read_checkpoint(&name).await.unwrap_or(GlobalPosition::BEFORE_FIRST);

            let loop_config = LoopConfig {
                max_retries: self.config.max_retries,
                retry_delay: self.config.retry_delay,
                stream_batch_size: self.config.stream_batch_size,
                poll_interval: self.config.poll_interval,
                dry_run: self.config.dry_run,
            };

            let (handle, task, callback_id) = self.spawn_loop(definition.clone(), starting_position, loop_config);

            running.insert(
                name,
                RunningLoop {
                    handle,
                    task,
                    callback_id: Some(callback_id),
                    lock_connection,
                },
            );
        }
    }

    /// Construct a fresh [`LoopHandle`], register its wake callback with the listener, and
    /// spawn its task. Registering the callback before the task starts its catch-up drain
    /// guarantees no notification arriving mid-catch-up is lost (see
    /// `composable_rust_postgres::NotificationListener`'s gap-free contract).
    fn spawn_loop(
        &self,
        definition: ProjectionDefinition,
        starting_position: GlobalPosition,
        loop_config: LoopConfig,
    ) -> (Arc<LoopHandle>, JoinHandle<()>, CallbackId) {
        let handle = loop_runner::new_handle(starting_position);

        let wake_handle = Arc::clone(&handle);
        let callback_id = self.listener.add_callback(Arc::new(move || wake_handle.notify()));

        let store = Arc::clone(&self.store);
        let pool = self.pool.clone();
        let callbacks = self.callbacks.clone();
        let task_handle = Arc::clone(&handle);
        let task = tokio::spawn(async move {
            loop_runner::run(definition, store, pool, task_handle, loop_config, callbacks).await;
        });

        (handle, task, callback_id)
    }

    async fn try_acquire_single_instance_lock(
        &self,
        name: &str,
    ) -> Result<Option<PoolConnection<Postgres>>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let key = single_instance_lock_key(name);
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(acquired.then_some(conn))
    }

    async fn read_checkpoint(&self, name: &str) -> Option<GlobalPosition> {
        let row = sqlx::query("SELECT last_position FROM projection_checkpoints WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        let raw: Option<i64> = row.try_get("last_position").ok()?;
        raw.and_then(|value| GlobalPosition::try_from_i64(value).ok())
    }

    /// Signal every running loop to stop, await their tasks, stop the notification
    /// listener, and (in `single_instance` mode) release every held advisory lock by
    /// closing its connection.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        for (_, running_loop) in running.iter() {
            running_loop.handle.request_stop();
        }
        for (_, mut running_loop) in running.drain() {
            if let Some(callback_id) = running_loop.callback_id.take() {
                self.listener.remove_callback(callback_id);
            }
            let _ = (&mut running_loop.task).await;
            drop(running_loop.lock_connection);
        }
        drop(running);
        self.listener.stop().await;
        tracing::info!("projection manager stopped");
    }

    /// Block until every running loop reaches `live`, `error`, or `stopped`, or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Timeout`] if `timeout` elapses first.
    pub async fn wait_until_live(&self, timeout: Duration) -> Result<(), ProjectionError> {
        tokio::time::timeout(timeout, async {
            loop {
                let all_settled = {
                    let running = self.running.lock().await;
                    running.values().all(|running_loop| {
                        let status = running_loop.handle.status();
                        status == ProjectionStatus::Live || status.is_terminal()
                    })
                };
                if all_settled {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .map_err(|_| ProjectionError::Timeout("wait_until_live".to_string()))
    }

    /// Block until `name`'s checkpoint reaches at least `target`, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Timeout`] if `timeout` elapses first.
    pub async fn wait_for_position(
        &self,
        name: &str,
        target: GlobalPosition,
        timeout: Duration,
    ) -> Result<(), ProjectionError> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(position) = self.read_checkpoint(name).await {
                    if position >= target {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .map_err(|_| ProjectionError::Timeout(name.to_string()))
    }

    /// Restart a projection currently in the `error` state: re-reads its checkpoint and
    /// spawns a fresh loop. Never rewinds `last_position`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::UnknownProjection`] if no such projection is registered,
    /// or [`ProjectionError::NotInErrorState`] if it is not currently in `error`.
    pub async fn restart(&self, name: &str) -> Result<(), ProjectionError> {
        let definition = self
            .definitions
            .iter()
            .find(|definition| definition.name() == name)
            .cloned()
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))?;

        let mut running = self.running.lock().await;
        let in_error = match running.get(name) {
            Some(running_loop) => running_loop.handle.status() == ProjectionStatus::Error,
            None => return Err(ProjectionError::UnknownProjection(name.to_string())),
        };
        if !in_error {
            return Err(ProjectionError::NotInErrorState(name.to_string()));
        }

        if let Some(mut removed) = running.remove(name) {
            if let Some(callback_id) = removed.callback_id.take() {
                self.listener.remove_callback(callback_id);
            }
            let _ = (&mut removed.task).await;
            drop(removed.lock_connection);
        }

        let starting_position = self.read_checkpoint(name).await.unwrap_or(GlobalPosition::BEFORE_FIRST);
        let loop_config = LoopConfig {
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay,
            stream_batch_size: self.config.stream_batch_size,
            poll_interval: self.config.poll_interval,
            dry_run: self.config.dry_run,
        };
        let (handle, task, callback_id) = self.spawn_loop(definition, starting_position, loop_config);

        running.insert(
            name.to_string(),
            RunningLoop {
                handle,
                task,
                callback_id: Some(callback_id),
                lock_connection: None,
            },
        );
        Ok(())
    }

    /// A snapshot of every running loop's current status, keyed by projection name.
    #[must_use]
    pub async fn get_status(&self) -> HashMap<String, ProjectionStatus> {
        let running = self.running.lock().await;
        running
            .iter()
            .map(|(name, running_loop)| (name.clone(), running_loop.handle.status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.setup_timeout, Duration::from_secs(30));
        assert!(!config.single_instance);
        assert!(!config.dry_run);
    }
}
