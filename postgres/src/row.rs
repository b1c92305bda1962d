//! Maps a raw `events` row to [`StoredEvent`].

use composable_rust_core::event::StoredEvent;
use composable_rust_core::position::GlobalPosition;
use sqlx::Row;
use sqlx::postgres::PgRow;

/// Read one row of the `events` table's standard column set
/// (`global_position, event_id, type, payload, metadata, occurred_at`) into a
/// [`StoredEvent`].
///
/// # Errors
///
/// Returns the underlying `sqlx::Error` if a column is missing or has an unexpected type —
/// this indicates the row did not come from the `events` table's column layout.
#[allow(clippy::cast_sign_loss)] // global_position is BIGSERIAL, always non-negative in practice
pub fn row_to_stored_event(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    let global_position: i64 = row.try_get("global_position")?;
    Ok(StoredEvent {
        global_position: GlobalPosition::new(global_position as u64),
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("type")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}
