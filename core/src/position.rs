//! Global position tracking for the event log.
//!
//! This module defines [`GlobalPosition`], the append-only ordering key assigned by the
//! store to every event across the entire log (not per-stream). Positions are strictly
//! increasing but not necessarily contiguous: a rolled-back transaction consumes a gap in
//! the underlying sequence that is never filled in.
//!
//! # Design
//!
//! `GlobalPosition` wraps a `u64`. Values are never routed through `f64`: JavaScript-style
//! event stores that serialize positions as JSON numbers silently corrupt any value above
//! 2^53, and a long-lived log will eventually exceed that. Every JSON boundary in this
//! crate and its sibling crates serializes `GlobalPosition` as a decimal string instead of
//! a bare number.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string cannot be parsed as a [`GlobalPosition`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid global position: {0}")]
pub struct ParsePositionError(String);

/// An event's position in the global, cross-stream ordering of the log.
///
/// Positions start at 1 for the first committed event; 0 is reserved to mean "before
/// anything has been written" (see [`GlobalPosition::BEFORE_FIRST`]).
///
/// # Serialization
///
/// Serializes as a decimal string, not a JSON number, so that values beyond 2^53 survive
/// a round trip through any JSON consumer that treats numbers as IEEE-754 doubles.
///
/// # Examples
///
/// ```
/// use composable_rust_core::position::GlobalPosition;
///
/// let p = GlobalPosition::new(42);
/// assert_eq!(p.value(), 42);
/// assert_eq!(serde_json::to_string(&p).unwrap(), "\"42\"");
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// The position value meaning "no events have been observed yet".
    pub const BEFORE_FIRST: Self = Self(0);

    /// Construct a position from its raw integer value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw integer value of this position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this is [`GlobalPosition::BEFORE_FIRST`].
    #[must_use]
    pub const fn is_before_first(self) -> bool {
        self.0 == 0
    }

    /// Convert to the signed representation `bigint`/`bigserial` columns use on the wire.
    ///
    /// # Errors
    ///
    /// Returns `ParsePositionError` if the value does not fit in an `i64`, which cannot
    /// happen for positions actually produced by a `bigserial` sequence but is checked
    /// defensively for positions constructed from untrusted input.
    pub fn try_into_i64(self) -> Result<i64, ParsePositionError> {
        i64::try_from(self.0).map_err(|_| ParsePositionError(self.0.to_string()))
    }

    /// Build a position from the signed representation returned by the database driver.
    ///
    /// # Errors
    ///
    /// Returns `ParsePositionError` if `value` is negative.
    pub fn try_from_i64(value: i64) -> Result<Self, ParsePositionError> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| ParsePositionError(value.to_string()))
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GlobalPosition {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| ParsePositionError(s.to_string()))
    }
}

impl From<u64> for GlobalPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GlobalPosition> for u64 {
    fn from(position: GlobalPosition) -> Self {
        position.0
    }
}

impl Serialize for GlobalPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for GlobalPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>()
            .map(Self)
            .map_err(|_| DeError::custom(format!("invalid global position: {raw}")))
    }
}
