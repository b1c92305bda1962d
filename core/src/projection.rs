//! Projection status and naming shared between the store and the projection runtime.
//!
//! The bulk of the projection runtime (the catch-up/live loop, the manager, retry and
//! checkpoint handling) lives in `composable-rust-projections`, which depends on `sqlx` to
//! run handlers inside the same transaction as a checkpoint update. This module holds the
//! pieces that are storage-agnostic and shared by both sides: the lifecycle state machine
//! and the name validation a [`composable_rust_projections::ProjectionDefinition`] (see
//! that crate) enforces at construction.

use std::fmt;
use thiserror::Error;

/// A projection's lifecycle state.
///
/// ```text
/// pending ──start──▶ catching-up ──drained──▶ live ──error──▶ error
///                          │                    │
///                          └────── stop ────────┴─▶ stopped
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectionStatus {
    /// Registered but not yet started.
    Pending,
    /// Replaying history from the last checkpoint.
    CatchingUp,
    /// Caught up; now following new events as they arrive.
    Live,
    /// Stopped after exhausting retries on some event; requires [`ProjectionStatus::Error`]
    /// to transition out via an explicit restart.
    Error,
    /// Stopped cooperatively by the manager; will not resume without a fresh start.
    Stopped,
}

impl ProjectionStatus {
    /// Whether this status represents a loop that is no longer processing events and
    /// will not resume on its own (used by `wait_until_live` to know when to stop
    /// polling a projection that will never reach `Live`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::CatchingUp => "catching-up",
            Self::Live => "live",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Error returned when a projection name fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid projection name {0:?}: must match ^[a-zA-Z][a-zA-Z0-9-_]{{0,127}}$")]
pub struct InvalidProjectionName(String);

/// Validate a projection name against `^[a-zA-Z][a-zA-Z0-9\-_]{0,127}$`.
///
/// The name becomes the projection's checkpoint key, so it must be stable and safe to use
/// as an identifier across processes and deployments.
///
/// # Errors
///
/// Returns [`InvalidProjectionName`] if `name` is empty, exceeds 128 characters, starts
/// with anything but an ASCII letter, or contains a character outside
/// `[a-zA-Z0-9\-_]`.
pub fn validate_projection_name(name: &str) -> Result<(), InvalidProjectionName> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(InvalidProjectionName(name.to_string()));
    };
    if !first.is_ascii_alphabetic() {
        return Err(InvalidProjectionName(name.to_string()));
    }
    if name.len() > 128 {
        return Err(InvalidProjectionName(name.to_string()));
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_')) {
        return Err(InvalidProjectionName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_spec_labels() {
        assert_eq!(ProjectionStatus::Pending.to_string(), "pending");
        assert_eq!(ProjectionStatus::CatchingUp.to_string(), "catching-up");
        assert_eq!(ProjectionStatus::Live.to_string(), "live");
        assert_eq!(ProjectionStatus::Error.to_string(), "error");
        assert_eq!(ProjectionStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ProjectionStatus::Pending.is_terminal());
        assert!(!ProjectionStatus::CatchingUp.is_terminal());
        assert!(!ProjectionStatus::Live.is_terminal());
        assert!(ProjectionStatus::Error.is_terminal());
        assert!(ProjectionStatus::Stopped.is_terminal());
    }

    #[test]
    fn valid_names() {
        assert!(validate_projection_name("orders").is_ok());
        assert!(validate_projection_name("order-totals_v2").is_ok());
        assert!(validate_projection_name("A1").is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(validate_projection_name("").is_err());
    }

    #[test]
    fn rejects_leading_digit() {
        assert!(validate_projection_name("1orders").is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(validate_projection_name("orders.totals").is_err());
        assert!(validate_projection_name("orders totals").is_err());
    }

    #[test]
    fn rejects_overly_long_name() {
        let name = format!("a{}", "b".repeat(128));
        assert!(validate_projection_name(&name).is_err());
    }
}
