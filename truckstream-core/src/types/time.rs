//! Types and helpers for time keeping.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
///
/// Signed so that window and slide bounds reaching below zero stay well defined.
pub type EventTime = i64;

/// Convert a duration to whole milliseconds, saturating at [EventTime::MAX]
pub fn duration_millis(duration: &Duration) -> EventTime {
    EventTime::try_from(duration.as_millis()).unwrap_or(EventTime::MAX)
}

/// Identifies a tumbling window as `floor(timestamp / window_duration)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WindowId(pub i64);

impl WindowId {
    /// Window containing the given timestamp. `duration` must be positive.
    pub fn of(timestamp: EventTime, duration: EventTime) -> Self {
        Self(timestamp.div_euclid(duration))
    }

    /// First timestamp belonging to this window (inclusive)
    pub fn start(&self, duration: EventTime) -> EventTime {
        self.0.saturating_mul(duration)
    }

    /// First timestamp after this window (exclusive)
    pub fn end(&self, duration: EventTime) -> EventTime {
        self.0.saturating_add(1).saturating_mul(duration)
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}
