//! Postgres-backed Dynamic Consistency Boundary event store.
//!
//! [`PostgresEventStore`] implements `composable_rust_core::event_store::EventStore` on top
//! of a `sqlx::PgPool`: [`schema`] provisions the `events` table, its indexes, and the
//! notification trigger; [`row`] maps raw rows back to `StoredEvent`; [`listener`] provides
//! a reconnecting `LISTEN`/`NOTIFY` client projections use to wake up between polls.
//!
//! # Example
//!
//! ```ignore
//! use composable_rust_postgres::PostgresEventStore;
//! use sqlx::postgres::PgPoolOptions;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPoolOptions::new().connect("postgres://localhost/mydb").await?;
//!     let store = PostgresEventStore::new(pool);
//!     store.initialize_schema().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod listener;
pub mod row;
pub mod schema;
pub mod store;

pub use listener::{Callback, CallbackId, NotificationListener};
pub use store::PostgresEventStore;
