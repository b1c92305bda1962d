//! The event store abstraction: load, append, and stream events selected by a [`Query`].
//!
//! # Design
//!
//! Like the store trait it's descended from, [`EventStore`] uses explicit
//! `Pin<Box<dyn Future>>` returns instead of `async fn` so the trait remains dyn-compatible
//! (`Arc<dyn EventStore>`): projection loops and test harnesses both want to hold a store
//! behind a trait object without knowing whether it's backed by Postgres or an in-memory
//! fake.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `composable-rust-postgres`): production implementation.
//! - `InMemoryEventStore` (in `composable-rust-testing`): fast, deterministic fake for
//!   projection and query-logic tests.

use crate::event::{NewEvent, StoredEvent};
use crate::position::GlobalPosition;
use crate::query::{Query, QueryError};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// An optimistic concurrency conflict: the boundary described by a query had already
/// advanced past the version the caller expected.
///
/// Always retryable: a caller that re-reads the current state and rebuilds its command
/// against it can simply try the append again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("concurrency conflict: expected version {expected_version}, found {actual_version}")]
pub struct ConcurrencyError {
    /// The version the caller expected the boundary to be at.
    pub expected_version: GlobalPosition,
    /// The boundary's actual version at the time of the check.
    pub actual_version: GlobalPosition,
}

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The append's consistency boundary had moved; see [`ConcurrencyError`].
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// The query passed to load/append/stream was invalid (currently: empty).
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    /// A database-originated failure. The causal error is preserved via `source()` so a
    /// caller that logs only the top-level message does not lose the underlying detail.
    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Options governing a conditional (version-checked) append.
///
/// Without `AppendOptions`, [`EventStore::append`] is unconditional: it writes the events
/// with no lock and no version check.
#[derive(Clone, Debug)]
pub struct AppendOptions {
    query: Query,
    expected_version: GlobalPosition,
    concurrency_query: Option<Query>,
}

impl AppendOptions {
    /// Require that `query`'s boundary is currently at `expected_version`.
    #[must_use]
    pub const fn new(query: Query, expected_version: GlobalPosition) -> Self {
        Self {
            query,
            expected_version,
            concurrency_query: None,
        }
    }

    /// Use a different query than `query` to compute the boundary's current version.
    ///
    /// Lets a caller append events matching a narrow query while checking consistency
    /// against a broader one (or vice versa) — the mechanism this store exposes for
    /// resolving boundary races the store itself takes no implicit position on.
    #[must_use]
    pub fn with_concurrency_query(mut self, concurrency_query: Query) -> Self {
        self.concurrency_query = Some(concurrency_query);
        self
    }

    /// The query whose boundary is being appended to.
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// The version the boundary is expected to be at.
    #[must_use]
    pub const fn expected_version(&self) -> GlobalPosition {
        self.expected_version
    }

    /// The query used to compute the current version, defaulting to [`AppendOptions::query`]
    /// when no override was set.
    #[must_use]
    pub const fn concurrency_query(&self) -> &Query {
        match &self.concurrency_query {
            Some(q) => q,
            None => &self.query,
        }
    }
}

/// Options governing a [`EventStore::stream`] call.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    after_position: GlobalPosition,
    batch_size: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            after_position: GlobalPosition::BEFORE_FIRST,
            batch_size: 100,
        }
    }
}

impl StreamOptions {
    /// Default options: start from the beginning of the log, page size 100.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start streaming strictly after this position rather than from the beginning.
    #[must_use]
    pub const fn after_position(mut self, position: GlobalPosition) -> Self {
        self.after_position = position;
        self
    }

    /// Rows fetched per underlying page. Does not bound the stream's total length.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// The configured starting position.
    #[must_use]
    pub const fn get_after_position(&self) -> GlobalPosition {
        self.after_position
    }

    /// The configured page size.
    #[must_use]
    pub const fn get_batch_size(&self) -> u32 {
        self.batch_size
    }
}

/// The result of [`EventStore::load`]: the matching events and the boundary's version.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadResult {
    /// Matching events in ascending `global_position` order.
    pub events: Vec<StoredEvent>,
    /// The greatest `global_position` among `events`, or `GlobalPosition::BEFORE_FIRST` if
    /// empty.
    pub version: GlobalPosition,
}

/// The event store abstraction: append-only storage for events selected by query.
///
/// # Dyn Compatibility
///
/// This trait uses `Pin<Box<dyn Future>>` returns instead of `async fn` to remain
/// dyn-compatible, so projection loops and application code can hold `Arc<dyn EventStore>`
/// without committing to a concrete backend at compile time.
pub trait EventStore: Send + Sync {
    /// Load every event matching `query`, in ascending `global_position` order, along with
    /// the boundary's current version.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::InvalidQuery` if `query` is empty, or
    /// `EventStoreError::Database` on a storage failure.
    fn load(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<LoadResult, EventStoreError>> + Send + '_>>;

    /// Append `events`, optionally enforcing a consistency boundary via `options`.
    ///
    /// Without `options`, the append is unconditional. With `options`, the append succeeds
    /// only if `options.concurrency_query()`'s boundary is currently at
    /// `options.expected_version()`; see the module docs on [`AppendOptions`].
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Concurrency` if the boundary has moved, or
    /// `EventStoreError::Database` on a storage failure.
    fn append(
        &self,
        events: Vec<NewEvent>,
        options: Option<AppendOptions>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Stream every event matching `query` strictly after `options.after_position()`, in
    /// ascending order, using keyset pagination (no server-side cursor is held).
    ///
    /// Dropping the stream before it's exhausted leaves no dangling state.
    fn stream<'a>(
        &'a self,
        query: Query,
        options: StreamOptions,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>>;

    /// Idempotently create the store's schema (tables, indexes, notification trigger).
    ///
    /// Safe to call repeatedly, including concurrently from multiple processes at startup.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::Database` if the DDL cannot be applied.
    fn initialize_schema(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Release any resources held by this store (connection pools and similar).
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_error_display() {
        let err = ConcurrencyError {
            expected_version: GlobalPosition::new(5),
            actual_version: GlobalPosition::new(7),
        };
        let display = format!("{err}");
        assert!(display.contains("expected version 5"));
        assert!(display.contains("found 7"));
    }

    #[test]
    fn append_options_defaults_concurrency_query_to_query() {
        let query = Query::new().events_of_type("OrderPlaced");
        let options = AppendOptions::new(query.clone(), GlobalPosition::new(0));
        assert_eq!(options.concurrency_query(), &query);
    }

    #[test]
    fn append_options_concurrency_query_override() {
        let query = Query::new().events_of_type("OrderPlaced");
        let wider = Query::new()
            .events_of_type("OrderPlaced")
            .events_of_type("OrderCancelled");
        let options =
            AppendOptions::new(query, GlobalPosition::new(0)).with_concurrency_query(wider.clone());
        assert_eq!(options.concurrency_query(), &wider);
    }

    #[test]
    fn stream_options_default_starts_at_beginning() {
        let options = StreamOptions::default();
        assert_eq!(options.get_after_position(), GlobalPosition::BEFORE_FIRST);
        assert_eq!(options.get_batch_size(), 100);
    }

    #[test]
    fn stream_options_builders_override_defaults() {
        let options = StreamOptions::new()
            .after_position(GlobalPosition::new(10))
            .batch_size(25);
        assert_eq!(options.get_after_position(), GlobalPosition::new(10));
        assert_eq!(options.get_batch_size(), 25);
    }
}
