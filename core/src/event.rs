//! Event types exchanged with the store.
//!
//! Unlike the binary, type-erased `Event` trait this module used to define, a DCB store
//! has no notion of a typed event enum at the storage boundary: the query language filters
//! on `type` and JSON payload containment, so events are stored and returned as plain JSON
//! documents. [`NewEvent`] is what a caller constructs to append; [`StoredEvent`] is what
//! the store returns, carrying the fields the database assigned (`global_position`,
//! `occurred_at`).
//!
//! # Example
//!
//! ```
//! use composable_rust_core::event::NewEvent;
//! use serde_json::json;
//!
//! let event = NewEvent::new("OrderPlaced", json!({ "order_id": "order-123", "total": 42 }))
//!     .with_metadata(json!({ "correlation_id": "corr-456" }));
//!
//! assert_eq!(event.event_type, "OrderPlaced");
//! ```

use crate::position::GlobalPosition;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An event a caller is about to append.
///
/// `event_id` defaults to a fresh random UUID; callers that need a deterministic or
/// externally-sourced id can override it with [`NewEvent::with_event_id`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    /// Unique identifier for this event, generated client-side.
    pub event_id: Uuid,
    /// The event type, matched by query clauses' `type` filter.
    pub event_type: String,
    /// The event's JSON payload, matched by query clauses' attribute filters.
    pub payload: serde_json::Value,
    /// Optional JSON metadata (correlation ids, causation ids, actor identity, and
    /// similar). Never matched by queries; purely descriptive.
    pub metadata: Option<serde_json::Value>,
}

impl NewEvent {
    /// Construct an event with a fresh random `event_id` and no metadata.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }

    /// Attach metadata, replacing any previously set.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the generated `event_id`.
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }
}

/// An event as returned by the store: a [`NewEvent`] plus the fields the database assigned
/// on commit.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    /// This event's position in the global, cross-stream ordering of the log.
    pub global_position: GlobalPosition,
    /// Unique identifier for this event (echoes the id supplied at append time).
    pub event_id: Uuid,
    /// The event type.
    pub event_type: String,
    /// The event's JSON payload.
    pub payload: serde_json::Value,
    /// Optional JSON metadata.
    pub metadata: Option<serde_json::Value>,
    /// When the database committed this event.
    pub occurred_at: DateTime<Utc>,
}

impl std::fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StoredEvent {{ position: {}, type: {}, id: {} }}",
            self.global_position, self.event_type, self.event_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_event_defaults_have_no_metadata() {
        let event = NewEvent::new("OrderPlaced", json!({ "order_id": "o-1" }));
        assert_eq!(event.event_type, "OrderPlaced");
        assert!(event.metadata.is_none());
    }

    #[test]
    fn with_metadata_sets_metadata() {
        let event = NewEvent::new("OrderPlaced", json!({})).with_metadata(json!({ "a": 1 }));
        assert_eq!(event.metadata, Some(json!({ "a": 1 })));
    }

    #[test]
    fn with_event_id_overrides_generated_id() {
        let id = Uuid::new_v4();
        let event = NewEvent::new("OrderPlaced", json!({})).with_event_id(id);
        assert_eq!(event.event_id, id);
    }

    #[test]
    fn stored_event_display_contains_position_and_type() {
        let event = StoredEvent {
            global_position: GlobalPosition::new(7),
            event_id: Uuid::nil(),
            event_type: "OrderPlaced".to_string(),
            payload: json!({}),
            metadata: None,
            occurred_at: Utc::now(),
        };
        let display = format!("{event}");
        assert!(display.contains("position: 7"));
        assert!(display.contains("OrderPlaced"));
    }
}
