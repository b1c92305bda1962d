//! Errors produced by the projection runtime.

use composable_rust_core::event_store::EventStoreError;
use composable_rust_core::projection::InvalidProjectionName;
use composable_rust_core::query::QueryError;
use thiserror::Error;

/// An opaque error from a projection handler, `setup`, or user callback.
///
/// The runtime never inspects these beyond counting attempts and passing them to
/// `on_retry`/`on_error`; callers construct them from whatever error type their handler
/// logic produces.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`crate::manager::ProjectionManager`] and
/// [`crate::definition::ProjectionDefinition`].
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// A projection definition's name or query failed validation.
    #[error("invalid projection definition: {0}")]
    InvalidDefinition(String),

    /// The boundary store returned an error while streaming or checking a query.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A database error local to the projection runtime (checkpoint reads/writes,
    /// advisory lock acquisition, `setup` DDL).
    #[error("projection database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A registered `setup` callback did not complete within `setup_timeout`.
    #[error("setup for projection {name:?} did not complete within the configured timeout")]
    SetupTimeout {
        /// The projection whose setup timed out.
        name: String,
    },

    /// A handler exhausted its retries; carries the last error observed.
    #[error("projection {name:?} exhausted retries: {source}")]
    HandlerFailed {
        /// The projection that failed.
        name: String,
        /// The handler's last error.
        #[source]
        source: HandlerError,
    },

    /// `restart` was called on a projection not currently in the `error` state.
    #[error("projection {0:?} is not in the error state")]
    NotInErrorState(String),

    /// `wait_until_live` or `wait_for_position` did not resolve before its deadline.
    #[error("timed out waiting for projection {0:?}")]
    Timeout(String),

    /// The named projection has no registered definition.
    #[error("no projection registered with name {0:?}")]
    UnknownProjection(String),
}

impl From<InvalidProjectionName> for ProjectionError {
    fn from(err: InvalidProjectionName) -> Self {
        Self::InvalidDefinition(err.to_string())
    }
}

impl From<QueryError> for ProjectionError {
    fn from(err: QueryError) -> Self {
        Self::InvalidDefinition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_in_error_state_message_names_projection() {
        let err = ProjectionError::NotInErrorState("orders".to_string());
        assert!(err.to_string().contains("orders"));
    }
}
