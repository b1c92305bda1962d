//! Projection registration: [`ProjectionDefinition`] and [`event_dispatcher`].

use crate::error::HandlerError;
use composable_rust_core::event::StoredEvent;
use composable_rust_core::projection::validate_projection_name;
use composable_rust_core::query::Query;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A projection's per-event handler: invoked with the matching event and a connection
/// already inside the transaction that will also carry the checkpoint update.
///
/// The handler must not commit, roll back, or otherwise end the transaction — the loop
/// owns that lifecycle (see `composable-rust-projections::loop_runner`).
pub type Handler = Arc<
    dyn for<'c> Fn(
            &'c StoredEvent,
            &'c mut PgConnection,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'c>>
        + Send
        + Sync,
>;

/// An idempotent read-model DDL callback, run once at [`crate::manager::ProjectionManager::initialize`].
pub type SetupFn = Arc<
    dyn Fn(&sqlx::PgPool) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>
        + Send
        + Sync,
>;

/// A registered projection: a stable name, the query selecting its events, an optional
/// setup callback, and the handler invoked per matching event.
///
/// Constructed with [`ProjectionDefinition::new`]; `name` becomes the projection's
/// checkpoint key and must match `^[a-zA-Z][a-zA-Z0-9\-_]{0,127}$`.
#[derive(Clone)]
pub struct ProjectionDefinition {
    name: String,
    query: Query,
    setup: Option<SetupFn>,
    handler: Handler,
}

impl ProjectionDefinition {
    /// Validate and construct a new projection definition.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` fails [`validate_projection_name`] or `query` is empty.
    pub fn new(
        name: impl Into<String>,
        query: Query,
        handler: Handler,
    ) -> Result<Self, crate::error::ProjectionError> {
        let name = name.into();
        validate_projection_name(&name)?;
        query.validate()?;
        Ok(Self {
            name,
            query,
            setup: None,
            handler,
        })
    }

    /// Attach an idempotent read-model `setup` callback, run once at manager
    /// initialization under the manager's `setup_timeout`.
    #[must_use]
    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = Some(setup);
        self
    }

    /// This projection's stable name (its checkpoint key).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The query selecting this projection's events.
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// The registered `setup` callback, if any.
    #[must_use]
    pub fn setup(&self) -> Option<&SetupFn> {
        self.setup.as_ref()
    }

    /// The per-event handler.
    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Build a [`Handler`] that routes by event type to one of `routes`, ignoring events whose
/// type has no registered route.
///
/// # Example
///
/// ```ignore
/// let handler = event_dispatcher(vec![
///     ("OrderPlaced".to_string(), handle_order_placed),
///     ("OrderCancelled".to_string(), handle_order_cancelled),
/// ]);
/// ```
#[must_use]
pub fn event_dispatcher(routes: Vec<(String, Handler)>) -> Handler {
    let routes: HashMap<String, Handler> = routes.into_iter().collect();
    Arc::new(move |event, conn| {
        let route = routes.get(&event.event_type).cloned();
        Box::pin(async move {
            match route {
                Some(handler) => handler(event, conn).await,
                None => Ok(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use composable_rust_core::query::Query as Q;

    fn noop_handler() -> Handler {
        Arc::new(|_event, _conn| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn new_rejects_invalid_name() {
        let result = ProjectionDefinition::new(
            "1bad",
            Q::new().events_of_type("A"),
            noop_handler(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn new_rejects_empty_query() {
        let result = ProjectionDefinition::new("orders", Q::new(), noop_handler());
        assert!(result.is_err());
    }

    #[test]
    fn new_accepts_valid_definition() {
        let result = ProjectionDefinition::new(
            "orders",
            Q::new().events_of_type("OrderPlaced"),
            noop_handler(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn dispatcher_routes_are_keyed_by_event_type() {
        // The dispatcher's routing decision (known vs. unknown event type) only needs a
        // connection when a route actually matches; exercising the connection-carrying
        // path itself is covered by the testcontainers-backed integration tests, where a
        // real `PgConnection` is available.
        let routes = vec![("Known".to_string(), noop_handler())];
        let dispatcher = event_dispatcher(routes);
        // A dispatcher is just an `Arc<dyn Fn>`; constructing one from an empty and a
        // non-empty route list should both succeed without panicking.
        drop(dispatcher);
        drop(event_dispatcher(Vec::new()));
    }
}
