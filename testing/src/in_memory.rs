//! An in-memory [`EventStore`] implementation for fast, deterministic tests.
//!
//! [`InMemoryEventStore`] implements the same trait `composable-rust-postgres`'s
//! `PostgresEventStore` does, backed by a `Mutex<Vec<StoredEvent>>` instead of a database.
//! It reuses [`Query::matches`] — the same predicate the Postgres compiler translates to
//! SQL — so query semantics can never drift between the fake and the real backend. Useful
//! for exercising query/append/stream logic (ordering, concurrency conflicts, canonical-key
//! collisions) without Docker or a running Postgres.
//!
//! Concurrency control is a single `tokio::sync::Mutex` guarding the whole store rather
//! than a per-boundary advisory lock: correct for a single-process fake, where there is
//! only ever one lock holder to contend with anyway.

use composable_rust_core::event::{NewEvent, StoredEvent};
use composable_rust_core::event_store::{
    AppendOptions, ConcurrencyError, EventStore, EventStoreError, LoadResult, StreamOptions,
};
use composable_rust_core::position::GlobalPosition;
use composable_rust_core::query::Query;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An in-memory, single-process stand-in for `PostgresEventStore`.
///
/// # Example
///
/// ```
/// use composable_rust_core::event::NewEvent;
/// use composable_rust_core::event_store::EventStore;
/// use composable_rust_core::query::Query;
/// use composable_rust_testing::InMemoryEventStore;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// store
///     .append(vec![NewEvent::new("OrderPlaced", json!({ "order_id": "o-1" }))], None)
///     .await?;
///
/// let result = store.load(Query::new().events_of_type("OrderPlaced")).await?;
/// assert_eq!(result.events.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<Mutex<Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of events currently held, regardless of query.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether the store currently holds no events.
    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

fn version_of(events: &[StoredEvent], query: &Query) -> GlobalPosition {
    events
        .iter()
        .filter(|event| query.matches(&event.event_type, &event.payload))
        .map(|event| event.global_position)
        .max()
        .unwrap_or(GlobalPosition::BEFORE_FIRST)
}

impl EventStore for InMemoryEventStore {
    fn load(
        &self,
        query: Query,
    ) -> Pin<Box<dyn Future<Output = Result<LoadResult, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            query.validate()?;
            let events = self.events.lock().await;
            let matching: Vec<StoredEvent> = events
                .iter()
                .filter(|event| query.matches(&event.event_type, &event.payload))
                .cloned()
                .collect();
            let version = matching
                .last()
                .map_or(GlobalPosition::BEFORE_FIRST, |e| e.global_position);
            Ok(LoadResult {
                events: matching,
                version,
            })
        })
    }

    fn append(
        &self,
        new_events: Vec<NewEvent>,
        options: Option<AppendOptions>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if new_events.is_empty() {
                return Ok(Vec::new());
            }

            let mut events = self.events.lock().await;

            if let Some(options) = &options {
                let actual_version = version_of(&events, options.concurrency_query());
                if actual_version != options.expected_version() {
                    return Err(ConcurrencyError {
                        expected_version: options.expected_version(),
                        actual_version,
                    }
                    .into());
                }
            }

            let mut next_position = events
                .last()
                .map_or(1, |e| e.global_position.value() + 1);

            let mut stored = Vec::with_capacity(new_events.len());
            for event in new_events {
                let record = StoredEvent {
                    global_position: GlobalPosition::new(next_position),
                    event_id: event.event_id,
                    event_type: event.event_type,
                    payload: event.payload,
                    metadata: event.metadata,
                    occurred_at: chrono::Utc::now(),
                };
                next_position += 1;
                events.push(record.clone());
                stored.push(record);
            }

            Ok(stored)
        })
    }

    fn stream<'a>(
        &'a self,
        query: Query,
        options: StreamOptions,
    ) -> BoxStream<'a, Result<StoredEvent, EventStoreError>> {
        let store = self.clone();
        Box::pin(async_stream::stream! {
            if let Err(error) = query.validate() {
                yield Err(EventStoreError::from(error));
                return;
            }

            let mut after = options.get_after_position();
            let batch_size = options.get_batch_size() as usize;

            loop {
                let page: Vec<StoredEvent> = {
                    let events = store.events.lock().await;
                    events
                        .iter()
                        .filter(|event| {
                            event.global_position > after
                                && query.matches(&event.event_type, &event.payload)
                        })
                        .take(batch_size)
                        .cloned()
                        .collect()
                };

                let page_len = page.len();
                for event in &page {
                    after = event.global_position;
                    yield Ok(event.clone());
                }

                if page_len < batch_size {
                    break;
                }
            }
        })
    }

    fn initialize_schema(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use composable_rust_core::query::key;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_strictly_increasing_positions() {
        let store = InMemoryEventStore::new();
        let stored = store
            .append(
                vec![
                    NewEvent::new("A", json!({ "n": 1 })),
                    NewEvent::new("A", json!({ "n": 2 })),
                ],
                None,
            )
            .await
            .expect("append should succeed");
        assert!(stored[0].global_position < stored[1].global_position);
    }

    #[tokio::test]
    async fn load_matches_appended_events_by_type_and_filter() {
        let store = InMemoryEventStore::new();
        store
            .append(
                vec![
                    NewEvent::new("A", json!({ "n": 1 })),
                    NewEvent::new("A", json!({ "n": 2 })),
                ],
                None,
            )
            .await
            .expect("append should succeed");

        let result = store
            .load(Query::new().events_of_type("A").where_(key("n").equals(json!(1))))
            .await
            .expect("load should succeed");
        assert_eq!(result.events.len(), 1);
    }

    #[tokio::test]
    async fn conditional_append_detects_stale_version() {
        let store = InMemoryEventStore::new();
        let query = Query::new().events_of_type("O");

        store
            .append(
                vec![NewEvent::new("O", json!({}))],
                Some(AppendOptions::new(query.clone(), GlobalPosition::BEFORE_FIRST)),
            )
            .await
            .expect("first conditional append should succeed");

        let err = store
            .append(
                vec![NewEvent::new("O", json!({}))],
                Some(AppendOptions::new(query.clone(), GlobalPosition::BEFORE_FIRST)),
            )
            .await
            .expect_err("second append at stale version should fail");

        match err {
            EventStoreError::Concurrency(conflict) => {
                assert_eq!(conflict.actual_version, GlobalPosition::new(1));
            }
            other => panic!("expected ConcurrencyError, got {other:?}"),
        }

        let result = store.load(query).await.expect("load should succeed");
        assert_eq!(result.events.len(), 1, "the failed append must persist no events");
    }

    #[tokio::test]
    async fn stream_matches_load_in_same_order() {
        let store = InMemoryEventStore::new();
        for n in 0..10 {
            store
                .append(vec![NewEvent::new("S", json!({ "n": n }))], None)
                .await
                .expect("append should succeed");
        }

        let loaded = store
            .load(Query::new().events_of_type("S"))
            .await
            .expect("load should succeed")
            .events;

        let streamed: Vec<_> = store
            .stream(Query::new().events_of_type("S"), StreamOptions::new().batch_size(3))
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await;

        assert_eq!(loaded, streamed);
    }

    #[tokio::test]
    async fn stream_resumes_after_position() {
        let store = InMemoryEventStore::new();
        let stored = store
            .append(
                vec![
                    NewEvent::new("P", json!({ "n": 1 })),
                    NewEvent::new("P", json!({ "n": 2 })),
                ],
                None,
            )
            .await
            .expect("append should succeed");

        let remaining: Vec<_> = store
            .stream(
                Query::new().events_of_type("P"),
                StreamOptions::new().after_position(stored[0].global_position),
            )
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await;

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].global_position, stored[1].global_position);
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let store = InMemoryEventStore::new();
        let stored = store.append(Vec::new(), None).await.expect("append should succeed");
        assert!(stored.is_empty());
        assert!(store.is_empty().await);
    }
}
