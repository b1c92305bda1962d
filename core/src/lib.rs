//! # Composable Rust Core
//!
//! Query AST, SQL compiler, and store/projection traits for a Dynamic Consistency
//! Boundary (DCB) event store: an append-only event log where the unit of optimistic
//! concurrency control is a compositional query rather than a fixed aggregate stream.
//!
//! ## Core Concepts
//!
//! - [`query`]: an immutable, functional builder for selecting events by type and JSON
//!   attribute, combined with OR across clauses and AND/OR within a clause's filter.
//! - [`compiler`]: translates a [`query::Query`] into parameterised SQL for loading,
//!   version-checking, and keyset-paginated streaming — database-agnostic in its output.
//! - [`position`]: the arbitrary-precision, JSON-safe global ordering key assigned to
//!   every event.
//! - [`event`]: the event types exchanged with the store ([`event::NewEvent`] in,
//!   [`event::StoredEvent`] out).
//! - [`event_store`]: the [`event_store::EventStore`] trait implemented by
//!   `composable-rust-postgres::PostgresEventStore` (production) and
//!   `composable-rust-testing::InMemoryEventStore` (tests).
//! - [`projection`]: the projection lifecycle state machine and name validation shared
//!   with `composable-rust-projections`.
//!
//! This crate has no database driver dependency: it defines the vocabulary every other
//! crate in the workspace implements against.

pub mod compiler;
pub mod event;
pub mod event_store;
pub mod position;
pub mod projection;
pub mod query;

pub use chrono::{DateTime, Utc};
pub use serde_json::Value as JsonValue;
