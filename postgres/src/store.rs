//! `PostgresEventStore`: the production [`EventStore`] implementation.

use crate::row::row_to_stored_event;
use crate::schema;
use async_stream::stream;
use composable_rust_core::compiler::{self, QueryParam};
use composable_rust_core::event::{NewEvent, StoredEvent};
use composable_rust_core::event_store::{
    AppendOptions, ConcurrencyError, EventStore, EventStoreError, LoadResult, StreamOptions,
};
use composable_rust_core::position::GlobalPosition;
use composable_rust_core::query::Query;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Query as SqlxQuery, QueryScalar, Row};
use std::future::Future;
use std::pin::Pin;

/// A Postgres-backed implementation of `composable_rust_core::event_store::EventStore`.
///
/// Cheaply cloneable: internally just an `sqlx::PgPool`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool, for callers that need to share it (for example, a
    /// `ProjectionManager` reusing the store's pool for read-model writes).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn database_err(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Database(Box::new(err))
}

fn bind_query<'q>(
    mut query: SqlxQuery<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> SqlxQuery<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Type(s) => query.bind(s),
            QueryParam::Json(v) => query.bind(v),
            QueryParam::Position(p) => query.bind(position_to_i64(*p)),
            QueryParam::Limit(l) => query.bind(*l),
        };
    }
    query
}

fn bind_scalar_i64<'q>(
    mut query: QueryScalar<'q, Postgres, i64, PgArguments>,
    params: &'q [QueryParam],
) -> QueryScalar<'q, Postgres, i64, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Type(s) => query.bind(s),
            QueryParam::Json(v) => query.bind(v),
            QueryParam::Position(p) => query.bind(position_to_i64(*p)),
            QueryParam::Limit(l) => query.bind(*l),
        };
    }
    query
}

#[allow(clippy::cast_possible_wrap)] // positions come from a BIGSERIAL sequence, fit in i64
const fn position_to_i64(position: u64) -> i64 {
    position as i64
}

impl EventStore for PostgresEventStore {
    fn load(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<LoadResult, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let compiled = compiler::compile_load(&query)?;
            let sql_query = bind_query(sqlx::query(&compiled.sql), &compiled.params);
            let rows = sql_query
                .fetch_all(&self.pool)
                .await
                .map_err(database_err)?;

            let mut events = Vec::with_capacity(rows.len());
            for row in &rows {
                events.push(row_to_stored_event(row).map_err(database_err)?);
            }
            let version = events
                .last()
                .map_or(GlobalPosition::BEFORE_FIRST, |e| e.global_position);

            Ok(LoadResult { events, version })
        })
    }

    fn append(
        &self,
        events: Vec<NewEvent>,
        options: Option<AppendOptions>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if events.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.pool.begin().await.map_err(database_err)?;

            sqlx::query("SET LOCAL lock_timeout = '5s'")
                .execute(&mut *tx)
                .await
                .map_err(database_err)?;
            sqlx::query("SET LOCAL statement_timeout = '30s'")
                .execute(&mut *tx)
                .await
                .map_err(database_err)?;

            if let Some(options) = &options {
                let lock_key = options.concurrency_query().advisory_lock_key();
                let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
                    .bind(lock_key)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(database_err)?;

                if !acquired {
                    let _ = tx.rollback().await;
                    return Err(ConcurrencyError {
                        expected_version: options.expected_version(),
                        actual_version: options.expected_version(),
                    }
                    .into());
                }

                let compiled = compiler::compile_version_check(options.concurrency_query())?;
                let scalar_query =
                    bind_scalar_i64(sqlx::query_scalar::<_, i64>(&compiled.sql), &compiled.params);
                let actual_raw: i64 = scalar_query
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(database_err)?;
                let actual_version =
                    GlobalPosition::try_from_i64(actual_raw).unwrap_or(GlobalPosition::BEFORE_FIRST);

                if actual_version != options.expected_version() {
                    let _ = tx.rollback().await;
                    return Err(ConcurrencyError {
                        expected_version: options.expected_version(),
                        actual_version,
                    }
                    .into());
                }
            }

            let mut stored = Vec::with_capacity(events.len());
            for event in events {
                let row: PgRow = sqlx::query(
                    "INSERT INTO events (event_id, type, payload, metadata) \
                     VALUES ($1, $2, $3, $4) \
                     RETURNING global_position, event_id, type, payload, metadata, occurred_at",
                )
                .bind(event.event_id)
                .bind(&event.event_type)
                .bind(&event.payload)
                .bind(&event.metadata)
                .fetch_one(&mut *tx)
                .await
                .map_err(database_err)?;
                stored.push(row_to_stored_event(&row).map_err(database_err)?);
            }

            tx.commit().await.map_err(database_err)?;

            metrics::counter!("dcb_events_appended_total").increment(stored.len() as u64);
            tracing::debug!(count = stored.len(), "appended events");

            Ok(stored)
        })
    }

    fn stream<'a>(
        &'a self,
        query: Query,
        options: StreamOptions,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>> {
        stream! {
            let mut after_position = options.get_after_position();
            let batch_size = i64::from(options.get_batch_size());

            loop {
                let compiled = match compiler::compile_stream(&query, after_position.value(), batch_size) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(EventStoreError::from(e));
                        return;
                    }
                };

                let sql_query = bind_query(sqlx::query(&compiled.sql), &compiled.params);
                let rows = match sql_query.fetch_all(&self.pool).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(database_err(e));
                        return;
                    }
                };

                let page_len = rows.len();
                for row in &rows {
                    match row_to_stored_event(row) {
                        Ok(event) => {
                            after_position = event.global_position;
                            yield Ok(event);
                        }
                        Err(e) => {
                            yield Err(database_err(e));
                            return;
                        }
                    }
                }

                let requested = usize::try_from(batch_size).unwrap_or(usize::MAX);
                if page_len < requested {
                    break;
                }
            }
        }
        .boxed()
    }

    fn initialize_schema(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            schema::apply(&self.pool).await.map_err(database_err)?;
            tracing::info!("event store schema initialized");
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.pool.close().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_to_i64_roundtrips() {
        assert_eq!(position_to_i64(42), 42);
    }
}
