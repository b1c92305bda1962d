//! Catch-up/live projection runtime for the Composable Rust Dynamic Consistency Boundary
//! event store.
//!
//! # Overview
//!
//! A projection is a named, durable read model built by replaying events matching a
//! [`Query`](composable_rust_core::query::Query) through a handler. This crate provides:
//! - [`ProjectionDefinition`] / [`event_dispatcher`]: registering a projection and routing
//!   its events by type.
//! - [`loop_runner`]: the per-projection catch-up/live state machine, atomic per-event
//!   processing, and linear-backoff retries.
//! - [`ProjectionManager`]: owning the projection set, the notification listener, and the
//!   spawned task per running loop.
//!
//! # Example
//!
//! ```ignore
//! use composable_rust_core::query::Query;
//! use composable_rust_projections::{ProjectionDefinition, ProjectionManager, ManagerConfig};
//! use std::sync::Arc;
//!
//! let definition = ProjectionDefinition::new(
//!     "order-totals",
//!     Query::new().events_of_type("OrderPlaced"),
//!     Arc::new(|event, conn| Box::pin(async move { Ok(()) })),
//! )?;
//!
//! let manager = ProjectionManager::new(pool, store, vec![definition], ManagerConfig::default(), Default::default());
//! manager.initialize().await?;
//! manager.start().await;
//! manager.wait_until_live(std::time::Duration::from_secs(60)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod definition;
pub mod error;
pub mod loop_runner;
pub mod manager;

pub use definition::{event_dispatcher, Handler, ProjectionDefinition, SetupFn};
pub use error::{HandlerError, ProjectionError};
pub use loop_runner::{LoopCallbacks, LoopConfig, LoopHandle};
pub use manager::{ManagerConfig, ProjectionManager};
