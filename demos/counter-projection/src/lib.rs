//! A minimal DCB boundary: named counters incremented and decremented independently,
//! projected into a `counter_totals` read model.
//!
//! Demonstrates the full loop a real application drives: append events scoped to a
//! per-counter boundary with optimistic concurrency, then let
//! [`composable_rust_projections::ProjectionManager`] replay them into a queryable table.

use composable_rust_core::event::StoredEvent;
use composable_rust_core::query::{key, Query};
use composable_rust_projections::{HandlerError, ProjectionDefinition, SetupFn};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;

/// The two event types this demo's counters emit.
pub const INCREMENTED: &str = "CounterIncremented";
/// See [`INCREMENTED`].
pub const DECREMENTED: &str = "CounterDecremented";

/// The DCB boundary for a single counter: every event — of either type — carrying this
/// `counter_id`. Used both to scope a conditional append's concurrency check and, by the
/// projection, to select every counter's events.
#[must_use]
pub fn counter_boundary(counter_id: &str) -> Query {
    Query::new()
        .events_of_type(INCREMENTED)
        .where_(key("counter_id").equals(Value::String(counter_id.to_string())))
        .events_of_type(DECREMENTED)
        .where_(key("counter_id").equals(Value::String(counter_id.to_string())))
}

/// Every counter event, regardless of `counter_id` — what the `counter-totals` projection
/// replays.
#[must_use]
pub fn all_counter_events() -> Query {
    Query::new().events_of_type(INCREMENTED).events_of_type(DECREMENTED)
}

fn counter_id_of(event: &StoredEvent) -> Option<&str> {
    event.payload.get("counter_id").and_then(Value::as_str)
}

fn amount_of(event: &StoredEvent) -> i64 {
    event.payload.get("amount").and_then(Value::as_i64).unwrap_or(1)
}

/// The `counter-totals` projection's idempotent DDL, run once at
/// [`composable_rust_projections::ProjectionManager::initialize`].
#[must_use]
pub fn setup() -> SetupFn {
    Arc::new(|pool: &PgPool| {
        let pool = pool.clone();
        Box::pin(async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS counter_totals (
                     counter_id TEXT PRIMARY KEY,
                     total BIGINT NOT NULL DEFAULT 0
                 )",
            )
            .execute(&pool)
            .await
            .map_err(|error| -> HandlerError { Box::new(error) })?;
            Ok(())
        })
    })
}

fn handler() -> composable_rust_projections::Handler {
    Arc::new(|event, conn| {
        let event = event.clone();
        Box::pin(async move {
            let Some(counter_id) = counter_id_of(&event) else {
                tracing::warn!(event_type = %event.event_type, "counter event missing counter_id, skipping");
                return Ok(());
            };
            let delta = match event.event_type.as_str() {
                t if t == INCREMENTED => amount_of(&event),
                t if t == DECREMENTED => -amount_of(&event),
                other => {
                    tracing::warn!(event_type = other, "unexpected event type for counter-totals, skipping");
                    return Ok(());
                }
            };

            sqlx::query(
                "INSERT INTO counter_totals (counter_id, total) VALUES ($1, $2) \
                 ON CONFLICT (counter_id) DO UPDATE SET total = counter_totals.total + $2",
            )
            .bind(counter_id)
            .bind(delta)
            .execute(&mut *conn)
            .await
            .map_err(|error| -> HandlerError { Box::new(error) })?;

            Ok(())
        })
    })
}

/// Build the `counter-totals` [`ProjectionDefinition`]: replays every counter event and
/// keeps `counter_totals.total` in sync with the net of its increments and decrements.
///
/// # Errors
///
/// Returns an error if the definition's name or query fails validation (neither can happen
/// with the fixed name and query this function uses, but the constructor is fallible).
pub fn definition() -> Result<ProjectionDefinition, composable_rust_projections::ProjectionError> {
    ProjectionDefinition::new("counter-totals", all_counter_events(), handler()).map(|d| d.with_setup(setup()))
}

/// Read the current total for a single counter, if it has ever been touched.
///
/// # Errors
///
/// Returns the underlying `sqlx::Error` if the query fails.
pub async fn read_total(pool: &PgPool, counter_id: &str) -> Result<Option<i64>, sqlx::Error> {
    use sqlx::Row;
    sqlx::query("SELECT total FROM counter_totals WHERE counter_id = $1")
        .bind(counter_id)
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get("total"))
        .transpose()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counter_boundary_is_a_two_clause_or_query() {
        let boundary = counter_boundary("counter-a");
        assert_eq!(boundary.clauses().len(), 2);
        assert!(boundary.matches(INCREMENTED, &json!({ "counter_id": "counter-a", "amount": 1 })));
        assert!(boundary.matches(DECREMENTED, &json!({ "counter_id": "counter-a", "amount": 1 })));
        assert!(!boundary.matches(INCREMENTED, &json!({ "counter_id": "counter-b", "amount": 1 })));
    }

    #[test]
    fn definition_is_named_counter_totals() {
        let definition = definition().expect("definition should be valid");
        assert_eq!(definition.name(), "counter-totals");
    }
}
