//! # Composable Rust DCB Testing
//!
//! Test tooling for the Composable Rust Dynamic Consistency Boundary event store:
//!
//! - [`InMemoryEventStore`]: a `Mutex`-backed `EventStore` implementation for fast,
//!   deterministic tests of query/append/stream logic without Docker or a database.
//!
//! Full projection-runtime behavior (catch-up/live transitions, retries, checkpoint
//! atomicity) requires a real Postgres connection — the handler signature in
//! `composable-rust-projections` is transactional over `sqlx::PgConnection` by design, so
//! those properties are exercised by that crate's `testcontainers`-backed integration
//! tests instead of here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod in_memory;

pub use in_memory::InMemoryEventStore;
